//! Scan command - Discover Taplink hosts on the local network

use anyhow::Result;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use taplink_core::discovery::{DiscoveredService, ServiceBrowser};

use super::{info, success};

pub async fn run(timeout: u64) -> Result<()> {
    println!();
    println!("{}", "  TAPLINK SCANNER  ".on_bright_cyan().white().bold());
    println!();

    info("Scanning for hosts...");
    println!();

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
            .template("{spinner:.cyan} {msg}")
            .unwrap(),
    );
    spinner.set_message("Searching via mDNS...");
    spinner.enable_steady_tick(Duration::from_millis(80));

    let browser = ServiceBrowser::new()?;
    let services = browser
        .scan_for_duration(Duration::from_secs(timeout))
        .await?;

    spinner.finish_and_clear();

    if services.is_empty() {
        println!("{}", "No hosts found.".yellow());
        println!();
        println!("{}", "Make sure:".dimmed());
        println!(
            "  {} The host is running 'taplink advertise'",
            "•".dimmed()
        );
        println!(
            "  {} Your firewall allows mDNS and port {}",
            "•".dimmed(),
            taplink_core::DEFAULT_PORT
        );
        println!();
        return Ok(());
    }

    success(&format!("Found {} host(s):", services.len()));
    println!();

    display_services(&services);

    println!();
    println!(
        "{}",
        format!("Pair with a host by scanning its code: {}", "taplink pair".cyan()).dimmed()
    );
    println!();

    Ok(())
}

fn display_services(services: &[DiscoveredService]) {
    for (i, service) in services.iter().enumerate() {
        let num = format!("[{}]", i).green().bold();
        let name = extract_friendly_name(&service.instance_name);

        print!("{} {} ", num, name.cyan().bold());

        if let Some(addr) = service.primary_address() {
            print!("({}:{})", addr.to_string().yellow(), service.port);
        }

        println!();

        // Show additional addresses if any
        if service.addresses.len() > 1 {
            for addr in &service.addresses {
                if Some(*addr) != service.primary_address() {
                    println!("    {} {}", "└".dimmed(), addr.to_string().dimmed());
                }
            }
        }
    }
}

/// Extract a friendly name from the full service name
fn extract_friendly_name(full_name: &str) -> String {
    // Service name format: "Device Name (hostname)._taplink._tcp.local."
    full_name
        .split("._taplink")
        .next()
        .unwrap_or(full_name)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_friendly_name() {
        let full = "My Desktop (hostname)._taplink._tcp.local.";
        assert_eq!(extract_friendly_name(full), "My Desktop (hostname)");

        let simple = "Test";
        assert_eq!(extract_friendly_name(simple), "Test");
    }
}
