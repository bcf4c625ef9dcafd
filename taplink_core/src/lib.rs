//! Taplink Core Library
//!
//! This crate provides the core functionality for the Taplink application:
//! keeping a touch-control client and its host reliably connected. It
//! watches connection health, plans reconnections when a link drops, and
//! discovers the ways a client can reach the host over USB or the local
//! network.
//!
//! # Architecture
//!
//! The library is organized into five main modules:
//!
//! - [`health`]: per-connection latency/error tracking and stability prediction
//! - [`reconnect`]: disconnect-cause analysis and reconnection strategy planning
//! - [`usb`]: debug-bridge device discovery with automatic port forwarding
//! - [`discovery`]: mDNS-based host discovery and connection-method ranking
//! - [`pairing`]: signed single-use pairing tokens rendered as QR codes
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use taplink_core::{
//!     discovery::{ServiceAdvertiser, ServiceBrowser, DEFAULT_PORT},
//!     health::{ClientInfo, HealthMonitor, MonitorConfig},
//!     pairing::{render_qr, TokenIssuer, DEFAULT_TOKEN_TTL},
//!     reconnect::ReconnectionManager,
//! };
//!
//! // Host side: advertise the service and show a pairing code
//! fn run_host() -> taplink_core::Result<()> {
//!     let mut advertiser = ServiceAdvertiser::new()?;
//!     advertiser.advertise("my-desktop", DEFAULT_PORT)?;
//!     let issuer = TokenIssuer::new();
//!     let issued = issuer.issue("192.168.1.10", DEFAULT_PORT, DEFAULT_TOKEN_TTL)?;
//!     println!("{}", render_qr(&issued.uri)?);
//!     Ok(())
//! }
//!
//! // Track a connection and plan a reconnection after it drops
//! async fn run_monitor() -> taplink_core::Result<()> {
//!     let (monitor, _events) = HealthMonitor::new(MonitorConfig::default());
//!     let client = ClientInfo {
//!         platform: "android".to_string(),
//!         transport: "websocket".to_string(),
//!         remote_addr: "192.168.1.23:41200".to_string(),
//!         user_agent: "taplink-touch/1.0".to_string(),
//!     };
//!     monitor.track_connection("conn-1", client);
//!     monitor.record_latency("conn-1", 42.0);
//!
//!     if let Some(record) = monitor.end_connection("conn-1", "transport close") {
//!         let manager = ReconnectionManager::default();
//!         let plan = manager.plan_for(&record, "transport close");
//!         println!("retry with {:?}", plan.strategy);
//!     }
//!     Ok(())
//! }
//! ```

pub mod discovery;
pub mod error;
pub mod health;
pub mod pairing;
pub mod reconnect;
pub mod usb;

// Re-export commonly used types
pub use discovery::{
    recommend_methods, ClientHints, ConnectionMethod, DiscoveredService, DiscoveryEvent,
    ServiceAdvertiser, ServiceBrowser, DEFAULT_PORT, SERVICE_TYPE,
};
pub use error::{Result, TaplinkError};
pub use health::{
    ClientInfo, ConnectionRecord, ConnectionState, HealthMonitor, HealthPrediction, MonitorConfig,
    MonitorEvent, Stability,
};
pub use pairing::{render_qr, render_qr_sized, IssuedToken, PairingPayload, TokenIssuer};
pub use reconnect::{
    DisconnectCause, DisconnectionAnalysis, ReconnectionManager, ReconnectionPlan, StrategyKind,
};
pub use usb::{AdbBridgeClient, BridgeClient, BridgeDevice, UsbEvent, UsbWatcher, UsbWatcherConfig};

/// Get the version of the taplink_core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Get the hostname of this device
pub fn hostname() -> String {
    discovery::get_hostname()
}
