//! Taplink CLI - keep a touch-control client connected to this host
//!
//! Usage:
//!   taplink advertise  - Advertise this host on the local network
//!   taplink scan       - Scan for Taplink hosts
//!   taplink usb        - Watch for USB devices and forward ports
//!   taplink pair       - Show a QR pairing code

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Taplink - resilient pairing between a touch client and this host
#[derive(Parser)]
#[command(name = "taplink")]
#[command(author = "Taplink Team")]
#[command(version)]
#[command(about = "Discover, pair, and stay connected to Taplink clients")]
#[command(long_about = r#"
Taplink keeps a touch-control client reliably connected to this host.

On the host machine:
  $ taplink advertise
  $ taplink pair

On a machine looking for hosts:
  $ taplink scan

With a phone on a USB cable:
  $ taplink usb
"#)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Advertise this host on the local network (run on the host machine)
    Advertise {
        /// Port to advertise
        #[arg(short, long, default_value_t = taplink_core::DEFAULT_PORT)]
        port: u16,

        /// Custom device name (defaults to hostname)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Scan the local network for Taplink hosts
    Scan {
        /// How long to scan in seconds
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,
    },

    /// Watch for USB devices and forward ports over the debug bridge
    Usb {
        /// Run a single scan and exit instead of watching
        #[arg(long)]
        once: bool,
    },

    /// Show a QR pairing code for this host
    Pair {
        /// Port the client should connect to
        #[arg(short, long, default_value_t = taplink_core::DEFAULT_PORT)]
        port: u16,

        /// Token lifetime in hours
        #[arg(short, long, default_value_t = 1)]
        expiry_hours: u64,
    },

    /// Manage configuration (adb path, device name, etc.)
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Set the path to the adb binary
    SetAdbPath {
        /// Path to adb
        path: String,
    },
    /// Set the advertised device name
    SetName {
        /// Device name
        name: String,
    },
    /// List current configuration
    List,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .without_time()
        .with_target(false)
        .init();

    match cli.command {
        Commands::Advertise { port, name } => commands::advertise::run(port, name).await,
        Commands::Scan { timeout } => commands::scan::run(timeout).await,
        Commands::Usb { once } => commands::usb::run(once).await,
        Commands::Pair { port, expiry_hours } => commands::pair::run(port, expiry_hours),
        Commands::Config { action } => run_config(action),
    }
}

fn run_config(action: ConfigAction) -> Result<()> {
    use colored::Colorize;

    match action {
        ConfigAction::SetAdbPath { path } => {
            let mut cfg = config::Config::load()?;
            cfg.adb_path = Some(path.clone());
            cfg.save()?;
            println!("{} adb path set to: {}", "✓".green(), path.cyan());
        }
        ConfigAction::SetName { name } => {
            let mut cfg = config::Config::load()?;
            cfg.device_name = Some(name.clone());
            cfg.save()?;
            println!("{} Device name set to: {}", "✓".green(), name.cyan());
        }
        ConfigAction::List => {
            let cfg = config::Config::load()?;
            println!("{}", "Configuration:".bold());
            println!(
                "  {} adb path: {}",
                "•".cyan(),
                cfg.adb_path.as_deref().unwrap_or("adb (default)")
            );
            println!(
                "  {} device name: {}",
                "•".cyan(),
                cfg.device_name
                    .as_deref()
                    .unwrap_or("hostname (default)")
            );
            println!(
                "  {} usb scan interval: {}s",
                "•".cyan(),
                cfg.usb_scan_interval_secs
            );
        }
        ConfigAction::Path => {
            let path = config::Config::path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_advertise_defaults() {
        let cli = Cli::try_parse_from(["taplink", "advertise"]).unwrap();
        match cli.command {
            Commands::Advertise { port, name } => {
                assert_eq!(port, taplink_core::DEFAULT_PORT);
                assert!(name.is_none());
            }
            _ => panic!("Expected Advertise command"),
        }
    }

    #[test]
    fn test_scan_defaults() {
        let cli = Cli::try_parse_from(["taplink", "scan"]).unwrap();
        match cli.command {
            Commands::Scan { timeout } => {
                assert_eq!(timeout, 5);
            }
            _ => panic!("Expected Scan command"),
        }
    }

    #[test]
    fn test_usb_once_flag() {
        let cli = Cli::try_parse_from(["taplink", "usb", "--once"]).unwrap();
        match cli.command {
            Commands::Usb { once } => assert!(once),
            _ => panic!("Expected Usb command"),
        }
    }

    #[test]
    fn test_pair_defaults() {
        let cli = Cli::try_parse_from(["taplink", "pair"]).unwrap();
        match cli.command {
            Commands::Pair { port, expiry_hours } => {
                assert_eq!(port, taplink_core::DEFAULT_PORT);
                assert_eq!(expiry_hours, 1);
            }
            _ => panic!("Expected Pair command"),
        }
    }

    #[test]
    fn test_pair_custom_expiry() {
        let cli = Cli::try_parse_from(["taplink", "pair", "--expiry-hours", "5"]).unwrap();
        match cli.command {
            Commands::Pair { expiry_hours, .. } => assert_eq!(expiry_hours, 5),
            _ => panic!("Expected Pair command"),
        }
    }

    #[test]
    fn test_verbose_flag() {
        let cli = Cli::try_parse_from(["taplink", "-v", "scan"]).unwrap();
        assert!(cli.verbose);
    }
}
