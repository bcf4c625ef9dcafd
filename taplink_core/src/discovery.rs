//! mDNS-based host discovery
//!
//! Advertises this host on the local multicast-DNS domain, browses for other
//! instances, and ranks candidate connection methods for a client. Presence
//! is debounced: a service must stay gone for a configurable number of cycles
//! before it is reported lost, so transient mDNS flicker never flaps the set.

use crate::error::{Result, TaplinkError};
use crate::usb::{AuthorizationState, UsbDeviceStatus};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// The mDNS service type for Taplink hosts
pub const SERVICE_TYPE: &str = "_taplink._tcp.local.";
/// Default port for the Taplink host service
pub const DEFAULT_PORT: u16 = 7905;
/// Default debounce: consecutive missed cycles before a service is dropped
pub const DEFAULT_MISS_THRESHOLD: u32 = 2;
/// Default length of one presence cycle
pub const DEFAULT_CYCLE: Duration = Duration::from_secs(3);

/// A host discovered on the local network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredService {
    pub instance_name: String,
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    /// Unix timestamp (ms) of the most recent announcement
    pub last_seen: u64,
}

impl DiscoveredService {
    /// Get the primary IP address (prefers IPv4)
    pub fn primary_address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|addr| addr.is_ipv4())
            .or(self.addresses.first())
            .copied()
    }

    /// Format as a connection string
    pub fn connection_string(&self) -> Option<String> {
        self.primary_address()
            .map(|addr| format!("{}:{}", addr, self.port))
    }
}

/// Events emitted during discovery
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    ServiceFound(DiscoveredService),
    ServiceLost(String), // instance name
    SearchStarted,
    SearchStopped,
}

/// Service advertiser for making this host discoverable
pub struct ServiceAdvertiser {
    daemon: ServiceDaemon,
    service_fullname: Option<String>,
}

impl ServiceAdvertiser {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| TaplinkError::Discovery(format!("Failed to create mDNS daemon: {}", e)))?;

        Ok(Self {
            daemon,
            service_fullname: None,
        })
    }

    /// Start advertising this host
    pub fn advertise(&mut self, device_name: &str, port: u16) -> Result<()> {
        let hostname = get_hostname();
        let service_hostname = format!("{}.local.", hostname);
        let instance_name = format!("{} ({})", device_name, hostname);

        let mut txt = HashMap::new();
        txt.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        txt.insert("platform".to_string(), std::env::consts::OS.to_string());

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &service_hostname,
            "",
            port,
            Some(txt),
        )
        .map_err(|e| TaplinkError::Discovery(format!("Failed to create service info: {}", e)))?;

        let fullname = service_info.get_fullname().to_string();

        self.daemon
            .register(service_info)
            .map_err(|e| TaplinkError::Discovery(format!("Failed to register service: {}", e)))?;

        self.service_fullname = Some(fullname.clone());
        info!("Advertising service: {}", fullname);

        Ok(())
    }

    /// Stop advertising
    pub fn stop(&mut self) -> Result<()> {
        if let Some(fullname) = self.service_fullname.take() {
            self.daemon
                .unregister(&fullname)
                .map_err(|e| TaplinkError::Discovery(format!("Failed to unregister: {}", e)))?;
            info!("Stopped advertising service");
        }
        Ok(())
    }
}

impl Drop for ServiceAdvertiser {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

struct TrackedService {
    service: DiscoveredService,
    missed: u32,
}

/// Debounced presence set.
///
/// A removal announcement counts as the first miss; each subsequent cycle
/// without a re-announce counts another. Only `miss_threshold` consecutive
/// misses confirm the loss, and any re-announce cancels the countdown.
pub struct PresenceTracker {
    services: HashMap<String, TrackedService>,
    miss_threshold: u32,
}

impl PresenceTracker {
    pub fn new(miss_threshold: u32) -> Self {
        Self {
            services: HashMap::new(),
            miss_threshold: miss_threshold.max(1),
        }
    }

    /// Record a (re-)announcement; returns true if the service is new
    pub fn observe(&mut self, mut service: DiscoveredService) -> bool {
        service.last_seen = unix_now_ms();
        let name = service.instance_name.clone();
        match self.services.get_mut(&name) {
            Some(tracked) => {
                tracked.missed = 0;
                tracked.service = service;
                false
            }
            None => {
                self.services.insert(name, TrackedService { service, missed: 0 });
                true
            }
        }
    }

    /// Record a removal announcement; returns true only if the loss is
    /// already confirmed (threshold of 1)
    pub fn mark_missing(&mut self, instance_name: &str) -> bool {
        if let Some(tracked) = self.services.get_mut(instance_name) {
            tracked.missed += 1;
            if tracked.missed >= self.miss_threshold {
                self.services.remove(instance_name);
                return true;
            }
        }
        false
    }

    /// Advance one cycle; returns services whose loss is now confirmed
    pub fn sweep(&mut self) -> Vec<String> {
        let mut confirmed = Vec::new();
        for (name, tracked) in self.services.iter_mut() {
            if tracked.missed > 0 {
                tracked.missed += 1;
                if tracked.missed >= self.miss_threshold {
                    confirmed.push(name.clone());
                }
            }
        }
        for name in &confirmed {
            self.services.remove(name);
        }
        confirmed
    }

    pub fn services(&self) -> Vec<DiscoveredService> {
        self.services.values().map(|t| t.service.clone()).collect()
    }
}

/// Service browser for discovering other Taplink hosts
pub struct ServiceBrowser {
    daemon: ServiceDaemon,
    tracker: Arc<Mutex<PresenceTracker>>,
    cycle: Duration,
}

impl ServiceBrowser {
    pub fn new() -> Result<Self> {
        Self::with_debounce(DEFAULT_MISS_THRESHOLD, DEFAULT_CYCLE)
    }

    pub fn with_debounce(miss_threshold: u32, cycle: Duration) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| TaplinkError::Discovery(format!("Failed to create mDNS daemon: {}", e)))?;

        Ok(Self {
            daemon,
            tracker: Arc::new(Mutex::new(PresenceTracker::new(miss_threshold))),
            cycle,
        })
    }

    /// Start browsing for hosts
    pub fn browse(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| TaplinkError::Discovery(format!("Failed to browse: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Arc::clone(&self.tracker);
        let cycle = self.cycle;

        std::thread::spawn(move || loop {
            match receiver.recv_timeout(cycle) {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    let service = DiscoveredService {
                        instance_name: info.get_fullname().to_string(),
                        hostname: info.get_hostname().to_string(),
                        addresses: info.get_addresses().iter().copied().collect(),
                        port: info.get_port(),
                        last_seen: unix_now_ms(),
                    };
                    debug!("Discovered service: {:?}", service);

                    let is_new = tracker.lock().unwrap().observe(service.clone());
                    if is_new {
                        let _ = tx.send(DiscoveryEvent::ServiceFound(service));
                    }
                }
                Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                    let confirmed = tracker.lock().unwrap().mark_missing(&fullname);
                    if confirmed {
                        let _ = tx.send(DiscoveryEvent::ServiceLost(fullname));
                    }
                }
                Ok(ServiceEvent::SearchStarted(_)) => {
                    debug!("mDNS search started");
                    let _ = tx.send(DiscoveryEvent::SearchStarted);
                }
                Ok(ServiceEvent::SearchStopped(_)) => {
                    debug!("mDNS search stopped");
                    let _ = tx.send(DiscoveryEvent::SearchStopped);
                    break;
                }
                Ok(_) => {}
                Err(flume::RecvTimeoutError::Timeout) => {
                    for lost in tracker.lock().unwrap().sweep() {
                        let _ = tx.send(DiscoveryEvent::ServiceLost(lost));
                    }
                }
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        });

        Ok(rx)
    }

    /// Get currently discovered services
    pub fn services(&self) -> Vec<DiscoveredService> {
        self.tracker.lock().unwrap().services()
    }

    /// Browse for a fixed duration and return what was found
    pub async fn scan_for_duration(&self, duration: Duration) -> Result<Vec<DiscoveredService>> {
        let mut rx = self.browse()?;

        let timeout = tokio::time::sleep(duration);
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                _ = &mut timeout => {
                    break;
                }
                event = rx.recv() => {
                    match event {
                        Some(DiscoveryEvent::ServiceFound(service)) => {
                            debug!("Found service during scan: {}", service.instance_name);
                        }
                        Some(DiscoveryEvent::SearchStopped) => {
                            break;
                        }
                        None => break,
                        _ => {}
                    }
                }
            }
        }

        Ok(self.services())
    }
}

/// What the client tells us about itself when asking how to connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHints {
    pub platform: String,
    pub usb_debugging: bool,
    pub current_transport: Option<String>,
}

/// A ranked candidate connection method
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionMethod {
    UsbCable {
        serial: String,
        local_port: u16,
    },
    NetworkService {
        instance_name: String,
        address: IpAddr,
        port: u16,
    },
    ManualEntry,
}

/// Rank connection methods for a client: an authorized, forwarded cable
/// beats everything; advertised services on a local subnet beat the rest;
/// manual entry is always the last resort.
pub fn recommend_methods(
    hints: &ClientHints,
    usb_devices: &[UsbDeviceStatus],
    services: &[DiscoveredService],
    local_addresses: &[IpAddr],
) -> Vec<ConnectionMethod> {
    let mut methods = Vec::new();

    if hints.usb_debugging {
        for device in usb_devices {
            if device.authorization == AuthorizationState::Authorized {
                if let Some(local_port) = device.forwarded_port {
                    methods.push(ConnectionMethod::UsbCable {
                        serial: device.serial.clone(),
                        local_port,
                    });
                }
            }
        }
    }

    let (same_subnet, other): (Vec<_>, Vec<_>) = services
        .iter()
        .filter_map(|s| s.primary_address().map(|addr| (s, addr)))
        .partition(|(_, addr)| local_addresses.iter().any(|l| same_subnet(*l, *addr)));

    for (service, address) in same_subnet.into_iter().chain(other) {
        methods.push(ConnectionMethod::NetworkService {
            instance_name: service.instance_name.clone(),
            address,
            port: service.port,
        });
    }

    methods.push(ConnectionMethod::ManualEntry);
    methods
}

/// /24 heuristic for IPv4; IPv6 compares the first four segments
fn same_subnet(a: IpAddr, b: IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..3] == b.octets()[..3],
        (IpAddr::V6(a), IpAddr::V6(b)) => a.segments()[..4] == b.segments()[..4],
        _ => false,
    }
}

fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Get the current hostname
pub fn get_hostname() -> String {
    hostname::get()
        .map(|h: std::ffi::OsString| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Get local IP addresses
pub fn get_local_addresses() -> Vec<IpAddr> {
    let mut addresses = Vec::new();

    if let Ok(ifaces) = local_ip_address::list_afinet_netifas() {
        for (_, ip) in ifaces {
            if !ip.is_loopback() {
                addresses.push(ip);
            }
        }
    }

    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, addr: &str) -> DiscoveredService {
        DiscoveredService {
            instance_name: name.to_string(),
            hostname: "host.local.".to_string(),
            addresses: vec![addr.parse().unwrap()],
            port: DEFAULT_PORT,
            last_seen: 0,
        }
    }

    #[test]
    fn test_service_type_constant() {
        assert_eq!(SERVICE_TYPE, "_taplink._tcp.local.");
    }

    #[test]
    fn test_primary_address_prefers_ipv4() {
        let svc = DiscoveredService {
            instance_name: "test".to_string(),
            hostname: "test.local.".to_string(),
            addresses: vec![
                "::1".parse().unwrap(),
                "192.168.1.100".parse().unwrap(),
            ],
            port: DEFAULT_PORT,
            last_seen: 0,
        };
        let primary = svc.primary_address().unwrap();
        assert!(primary.is_ipv4());
    }

    #[test]
    fn test_connection_string() {
        let svc = service("test", "192.168.1.100");
        assert_eq!(
            svc.connection_string(),
            Some(format!("192.168.1.100:{}", DEFAULT_PORT))
        );
    }

    #[test]
    fn test_connection_string_empty_addresses() {
        let svc = DiscoveredService {
            instance_name: "test".to_string(),
            hostname: "test.local.".to_string(),
            addresses: vec![],
            port: DEFAULT_PORT,
            last_seen: 0,
        };
        assert_eq!(svc.connection_string(), None);
    }

    #[test]
    fn test_presence_flap_is_not_lost() {
        let mut tracker = PresenceTracker::new(2);
        assert!(tracker.observe(service("a", "192.168.1.10")));

        // Removal announcement, then re-announce before the next sweep
        assert!(!tracker.mark_missing("a"));
        assert!(!tracker.observe(service("a", "192.168.1.10")));
        assert!(tracker.sweep().is_empty());
        assert_eq!(tracker.services().len(), 1);
    }

    #[test]
    fn test_presence_confirmed_loss() {
        let mut tracker = PresenceTracker::new(2);
        tracker.observe(service("a", "192.168.1.10"));

        assert!(!tracker.mark_missing("a")); // miss 1
        let confirmed = tracker.sweep(); // miss 2: confirmed
        assert_eq!(confirmed, vec!["a".to_string()]);
        assert!(tracker.services().is_empty());

        // Already gone: further sweeps report nothing
        assert!(tracker.sweep().is_empty());
    }

    #[test]
    fn test_presence_threshold_one_is_immediate() {
        let mut tracker = PresenceTracker::new(1);
        tracker.observe(service("a", "192.168.1.10"));
        assert!(tracker.mark_missing("a"));
        assert!(tracker.services().is_empty());
    }

    #[test]
    fn test_presence_unknown_name_ignored() {
        let mut tracker = PresenceTracker::new(2);
        assert!(!tracker.mark_missing("ghost"));
        assert!(tracker.sweep().is_empty());
    }

    #[test]
    fn test_observe_updates_existing() {
        let mut tracker = PresenceTracker::new(2);
        tracker.observe(service("a", "192.168.1.10"));
        assert!(!tracker.observe(service("a", "192.168.1.20")));
        assert_eq!(
            tracker.services()[0].addresses[0],
            "192.168.1.20".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_observe_stamps_last_seen() {
        let mut tracker = PresenceTracker::new(2);
        tracker.observe(service("a", "192.168.1.10"));

        let first = tracker.services()[0].last_seen;
        assert!(first > 0);

        tracker.observe(service("a", "192.168.1.10"));
        let second = tracker.services()[0].last_seen;
        assert!(second >= first);

        // A miss alone does not refresh the timestamp
        tracker.mark_missing("a");
        assert_eq!(tracker.services()[0].last_seen, second);
    }

    #[test]
    fn test_same_subnet() {
        let a: IpAddr = "192.168.1.10".parse().unwrap();
        let b: IpAddr = "192.168.1.200".parse().unwrap();
        let c: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(same_subnet(a, b));
        assert!(!same_subnet(a, c));
    }

    fn usb_status(serial: &str, authorized: bool, port: Option<u16>) -> UsbDeviceStatus {
        UsbDeviceStatus {
            serial: serial.to_string(),
            authorization: if authorized {
                AuthorizationState::Authorized
            } else {
                AuthorizationState::PendingUserApproval
            },
            forwarded_port: port,
            missed_scans: 0,
            last_seen: 0,
        }
    }

    fn hints(usb_debugging: bool) -> ClientHints {
        ClientHints {
            platform: "android".to_string(),
            usb_debugging,
            current_transport: None,
        }
    }

    #[test]
    fn test_recommend_prefers_forwarded_cable() {
        let usb = [usb_status("A1", true, Some(7910))];
        let services = [service("net-host", "192.168.1.20")];
        let local = ["192.168.1.10".parse().unwrap()];

        let methods = recommend_methods(&hints(true), &usb, &services, &local);
        assert!(matches!(
            methods[0],
            ConnectionMethod::UsbCable { ref serial, local_port: 7910 } if serial == "A1"
        ));
        assert!(matches!(methods[1], ConnectionMethod::NetworkService { .. }));
        assert_eq!(*methods.last().unwrap(), ConnectionMethod::ManualEntry);
    }

    #[test]
    fn test_recommend_skips_unauthorized_cable() {
        let usb = [usb_status("A1", false, None)];
        let methods = recommend_methods(&hints(true), &usb, &[], &[]);
        assert_eq!(methods, vec![ConnectionMethod::ManualEntry]);
    }

    #[test]
    fn test_recommend_ignores_cable_without_usb_debugging() {
        let usb = [usb_status("A1", true, Some(7910))];
        let methods = recommend_methods(&hints(false), &usb, &[], &[]);
        assert_eq!(methods, vec![ConnectionMethod::ManualEntry]);
    }

    #[test]
    fn test_recommend_ranks_same_subnet_first() {
        let services = [
            service("far-host", "10.0.0.20"),
            service("near-host", "192.168.1.20"),
        ];
        let local = ["192.168.1.10".parse().unwrap()];

        let methods = recommend_methods(&hints(false), &[], &services, &local);
        assert!(matches!(
            &methods[0],
            ConnectionMethod::NetworkService { instance_name, .. } if instance_name == "near-host"
        ));
        assert!(matches!(
            &methods[1],
            ConnectionMethod::NetworkService { instance_name, .. } if instance_name == "far-host"
        ));
    }

    #[test]
    fn test_recommend_always_ends_with_manual_entry() {
        let methods = recommend_methods(&hints(false), &[], &[], &[]);
        assert_eq!(methods, vec![ConnectionMethod::ManualEntry]);
    }

    #[test]
    fn test_discovered_service_serialization() {
        let svc = service("test", "192.168.1.100");
        let json = serde_json::to_string(&svc).unwrap();
        let back: DiscoveredService = serde_json::from_str(&json).unwrap();
        assert_eq!(svc, back);
    }

    #[test]
    fn test_get_hostname() {
        assert!(!get_hostname().is_empty());
    }

    // Integration tests - require network access
    #[tokio::test]
    #[ignore] // Run manually with: cargo test -- --ignored
    async fn test_service_advertiser_creation() {
        let advertiser = ServiceAdvertiser::new();
        assert!(advertiser.is_ok());
    }

    #[tokio::test]
    #[ignore] // Run manually with: cargo test -- --ignored
    async fn test_service_browser_creation() {
        let browser = ServiceBrowser::new();
        assert!(browser.is_ok());
    }
}
