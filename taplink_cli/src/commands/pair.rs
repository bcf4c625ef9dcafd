//! Pair command - Show a QR pairing code for this host

use anyhow::{anyhow, Result};
use colored::Colorize;
use std::time::Duration;
use taplink_core::discovery::get_local_addresses;
use taplink_core::pairing::{render_qr, TokenIssuer};

use super::{info, success};

pub fn run(port: u16, expiry_hours: u64) -> Result<()> {
    let host = get_local_addresses()
        .into_iter()
        .find(|a| a.is_ipv4())
        .ok_or_else(|| anyhow!("No local IPv4 address found; is the network up?"))?;

    let issuer = TokenIssuer::new();
    let issued = issuer.issue(
        &host.to_string(),
        port,
        Duration::from_secs(expiry_hours * 3600),
    )?;

    println!();
    println!("{}", render_qr(&issued.uri)?);
    println!();
    success(&format!(
        "Scan this code to pair with {}:{}",
        host.to_string().cyan().bold(),
        port
    ));
    info(&format!("The code expires in {} hour(s)", expiry_hours));
    println!();
    println!("{}", "Or enter the link manually:".dimmed());
    println!("  {}", issued.uri.dimmed());
    println!();

    Ok(())
}
