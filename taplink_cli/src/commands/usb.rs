//! Usb command - Watch the debug bridge and forward ports automatically

use anyhow::Result;
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use taplink_core::usb::{
    AdbBridgeClient, AuthorizationState, UsbEvent, UsbWatcher, UsbWatcherConfig,
};
use tokio::sync::watch;

use super::{info, success, warn};
use crate::config::Config;

pub async fn run(once: bool) -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let adb_path = config.adb_path.as_deref().unwrap_or("adb");
    let client = Arc::new(AdbBridgeClient::new(adb_path, Duration::from_secs(3)));

    let watcher_config = UsbWatcherConfig {
        scan_interval: Duration::from_secs(config.usb_scan_interval_secs.max(1)),
        ..Default::default()
    };
    let (watcher, mut events) = UsbWatcher::new(client, watcher_config);

    if once {
        watcher.scan_once().await;
        print_status(&watcher);
        return Ok(());
    }

    info("Watching for USB devices...");
    println!("{}", "Press Ctrl-C to stop.".dimmed());
    println!();

    let watcher = Arc::new(watcher);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_handle = {
        let watcher = Arc::clone(&watcher);
        tokio::spawn(async move { watcher.run(shutdown_rx).await })
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
        }
    }

    let _ = shutdown_tx.send(true);
    run_handle.await?;
    println!();
    info("Stopped watching");
    Ok(())
}

fn print_event(event: &UsbEvent) {
    match event {
        UsbEvent::DeviceAttached { serial, model } => {
            let label = model.as_deref().unwrap_or("unknown model");
            info(&format!("Device attached: {} ({})", serial.cyan(), label));
        }
        UsbEvent::DeviceRequiresAuthorization { serial } => {
            warn(&format!(
                "Device {} needs authorization; accept the prompt on the device",
                serial.cyan()
            ));
        }
        UsbEvent::PortForwardingEstablished { serial, local_port } => {
            success(&format!(
                "Forwarding ready: {} -> localhost:{}",
                serial.cyan(),
                local_port.to_string().yellow()
            ));
        }
        UsbEvent::DeviceDetached { serial } => {
            info(&format!("Device detached: {}", serial.cyan()));
        }
    }
}

fn print_status(watcher: &UsbWatcher) {
    let status = watcher.status();
    if status.is_empty() {
        println!("{}", "No USB devices found.".yellow());
        println!();
        println!("{}", "Make sure:".dimmed());
        println!("  {} The device is connected by cable", "•".dimmed());
        println!("  {} USB debugging is enabled on the device", "•".dimmed());
        return;
    }

    success(&format!("Found {} device(s):", status.len()));
    println!();
    for device in &status {
        let auth = match device.authorization {
            AuthorizationState::Authorized => "authorized".green(),
            AuthorizationState::PendingUserApproval => "pending approval".yellow(),
            AuthorizationState::Unauthorized => "unauthorized".red(),
        };
        print!("  {} {} [{}]", "•".cyan(), device.serial.cyan().bold(), auth);
        if let Some(port) = device.forwarded_port {
            print!(" localhost:{}", port.to_string().yellow());
        }
        println!();
    }
}
