//! Advertise command - Make this host discoverable on the local network

use anyhow::Result;
use colored::Colorize;
use taplink_core::discovery::{get_hostname, ServiceAdvertiser};

use super::{info, success};
use crate::config::Config;

pub async fn run(port: u16, name: Option<String>) -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let device_name = name
        .or(config.device_name)
        .unwrap_or_else(get_hostname);

    let mut advertiser = ServiceAdvertiser::new()?;
    advertiser.advertise(&device_name, port)?;

    success(&format!(
        "Advertising as {} on port {}",
        device_name.cyan().bold(),
        port
    ));
    info("Clients on this network can now discover this host");
    println!();
    println!("{}", "Press Ctrl-C to stop.".dimmed());

    tokio::signal::ctrl_c().await?;

    advertiser.stop()?;
    println!();
    info("Stopped advertising");
    Ok(())
}
