//! USB bridge device discovery and automatic port forwarding
//!
//! Polls the debug bridge (`adb`) for attached devices, tracks their
//! authorization state, and binds a local TCP port to each authorized device
//! so the client can connect over the cable without an IP address.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default interval between bridge scans
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(3);
/// Consecutive missed scans before a device is considered detached
pub const DEFAULT_MISS_THRESHOLD: u32 = 2;

/// Authorization state of a bridge device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationState {
    Authorized,
    PendingUserApproval,
    Unauthorized,
}

/// One device as reported by the bridge tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeDevice {
    pub serial: String,
    pub state: AuthorizationState,
    pub model: Option<String>,
}

/// Client for the debug-bridge protocol.
///
/// Implementations fail soft: transient unavailability is reported as
/// `false`/empty rather than an error, and the next scan cycle retries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BridgeClient: Send + Sync {
    /// Whether the bridge tool is reachable at all
    async fn check_available(&self) -> bool;
    /// Currently attached devices
    async fn list_devices(&self) -> Vec<BridgeDevice>;
    /// Bind `local_port` to `remote_port` on the device; true on success
    async fn forward(&self, local_port: u16, serial: &str, remote_port: u16) -> bool;
}

/// Bridge client backed by the `adb` command-line tool
pub struct AdbBridgeClient {
    adb_path: String,
    command_timeout: Duration,
}

impl Default for AdbBridgeClient {
    fn default() -> Self {
        Self::new("adb", Duration::from_secs(3))
    }
}

impl AdbBridgeClient {
    pub fn new(adb_path: &str, command_timeout: Duration) -> Self {
        Self {
            adb_path: adb_path.to_string(),
            command_timeout,
        }
    }

    /// Run adb with a bounded timeout; None on failure of any kind
    async fn run(&self, args: &[&str]) -> Option<String> {
        let result = timeout(
            self.command_timeout,
            Command::new(&self.adb_path).args(args).output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).to_string())
            }
            Ok(Ok(output)) => {
                debug!(
                    "adb {:?} exited with {}: {}",
                    args,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
            Ok(Err(e)) => {
                debug!("adb {:?} failed to spawn: {}", args, e);
                None
            }
            Err(_) => {
                warn!("adb {:?} timed out after {:?}", args, self.command_timeout);
                None
            }
        }
    }
}

#[async_trait]
impl BridgeClient for AdbBridgeClient {
    async fn check_available(&self) -> bool {
        self.run(&["version"]).await.is_some()
    }

    async fn list_devices(&self) -> Vec<BridgeDevice> {
        match self.run(&["devices", "-l"]).await {
            Some(output) => parse_devices_output(&output),
            None => Vec::new(),
        }
    }

    async fn forward(&self, local_port: u16, serial: &str, remote_port: u16) -> bool {
        let local = format!("tcp:{}", local_port);
        let remote = format!("tcp:{}", remote_port);
        self.run(&["-s", serial, "forward", &local, &remote])
            .await
            .is_some()
    }
}

/// Parse `adb devices -l` output into device entries
fn parse_devices_output(output: &str) -> Vec<BridgeDevice> {
    output
        .lines()
        .skip(1) // "List of devices attached" header
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?.to_string();
            let state = match parts.next()? {
                "device" => AuthorizationState::Authorized,
                "unauthorized" => AuthorizationState::PendingUserApproval,
                _ => AuthorizationState::Unauthorized,
            };
            let model = parts
                .find(|p| p.starts_with("model:"))
                .map(|p| p.trim_start_matches("model:").to_string());
            Some(BridgeDevice { serial, state, model })
        })
        .collect()
}

/// Events emitted by the watcher
#[derive(Debug, Clone)]
pub enum UsbEvent {
    DeviceAttached {
        serial: String,
        model: Option<String>,
    },
    DeviceRequiresAuthorization {
        serial: String,
    },
    PortForwardingEstablished {
        serial: String,
        local_port: u16,
    },
    DeviceDetached {
        serial: String,
    },
}

/// Snapshot of one tracked device
#[derive(Debug, Clone, Serialize)]
pub struct UsbDeviceStatus {
    pub serial: String,
    pub authorization: AuthorizationState,
    pub forwarded_port: Option<u16>,
    pub missed_scans: u32,
    /// Unix timestamp (ms) of the last scan that listed this device
    pub last_seen: u64,
}

/// Tuning for the watcher
#[derive(Debug, Clone)]
pub struct UsbWatcherConfig {
    pub scan_interval: Duration,
    /// Consecutive missed scans before a detach is confirmed
    pub miss_threshold: u32,
    /// First local port handed out for forwarding
    pub local_port_base: u16,
    /// Port the client app listens on inside the device
    pub remote_port: u16,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for UsbWatcherConfig {
    fn default() -> Self {
        Self {
            scan_interval: DEFAULT_SCAN_INTERVAL,
            miss_threshold: DEFAULT_MISS_THRESHOLD,
            local_port_base: 7910,
            remote_port: 7910,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

struct TrackedDevice {
    auth: AuthorizationState,
    model: Option<String>,
    local_port: u16,
    forwarded: bool,
    missed: u32,
    last_seen: u64,
    backoff: Duration,
    next_forward_at: Instant,
}

struct WatcherState {
    devices: HashMap<String, TrackedDevice>,
    next_local_port: u16,
}

/// Periodic USB scan loop with debounced detach detection.
///
/// A device missing from one scan is kept (enumeration glitches are common);
/// only `miss_threshold` consecutive misses confirm a detach. Established
/// forwarding is never torn down on a transient miss.
pub struct UsbWatcher {
    client: Arc<dyn BridgeClient>,
    config: UsbWatcherConfig,
    state: Mutex<WatcherState>,
    event_tx: mpsc::UnboundedSender<UsbEvent>,
    force: Notify,
}

impl UsbWatcher {
    pub fn new(
        client: Arc<dyn BridgeClient>,
        config: UsbWatcherConfig,
    ) -> (Self, mpsc::UnboundedReceiver<UsbEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let next_local_port = config.local_port_base;
        let watcher = Self {
            client,
            config,
            state: Mutex::new(WatcherState {
                devices: HashMap::new(),
                next_local_port,
            }),
            event_tx,
            force: Notify::new(),
        };
        (watcher, event_rx)
    }

    /// Run the scan loop until `shutdown` flips to true or its sender drops
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("usb watcher started ({:?} interval)", self.config.scan_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.scan_once().await,
                _ = self.force.notified() => self.scan_once().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("usb watcher stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Trigger an immediate out-of-cycle scan
    pub fn force_scan(&self) {
        self.force.notify_one();
    }

    /// Snapshot of the current device set
    pub fn status(&self) -> Vec<UsbDeviceStatus> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .iter()
            .map(|(serial, d)| UsbDeviceStatus {
                serial: serial.clone(),
                authorization: d.auth,
                forwarded_port: if d.forwarded { Some(d.local_port) } else { None },
                missed_scans: d.missed,
                last_seen: d.last_seen,
            })
            .collect()
    }

    /// One scan cycle: refresh presence, then attempt due forwards.
    ///
    /// The forwarding calls run outside the state lock so a slow bridge
    /// command never blocks `status()` queries.
    pub async fn scan_once(&self) {
        if !self.client.check_available().await {
            debug!("bridge tool unavailable, skipping scan");
            return;
        }
        let listed = self.client.list_devices().await;
        let now = Instant::now();

        let due = self.apply_presence(&listed, now);

        for (serial, local_port) in due {
            let ok = self
                .client
                .forward(local_port, &serial, self.config.remote_port)
                .await;
            self.apply_forward_result(&serial, local_port, ok, Instant::now());
        }
    }

    /// Update the tracked set from one scan listing; returns forwards due
    fn apply_presence(&self, listed: &[BridgeDevice], now: Instant) -> Vec<(String, u16)> {
        let mut state = self.state.lock().unwrap();
        let mut due = Vec::new();

        for device in listed {
            match state.devices.get_mut(&device.serial) {
                Some(tracked) => {
                    let was_pending = tracked.auth == AuthorizationState::PendingUserApproval;
                    tracked.missed = 0;
                    tracked.last_seen = unix_now_ms();
                    tracked.model = device.model.clone();
                    tracked.auth = device.state;
                    if device.state == AuthorizationState::PendingUserApproval && !was_pending {
                        let _ = self.event_tx.send(UsbEvent::DeviceRequiresAuthorization {
                            serial: device.serial.clone(),
                        });
                    }
                }
                None => {
                    let local_port = state.next_local_port;
                    state.next_local_port = state.next_local_port.wrapping_add(1);
                    state.devices.insert(
                        device.serial.clone(),
                        TrackedDevice {
                            auth: device.state,
                            model: device.model.clone(),
                            local_port,
                            forwarded: false,
                            missed: 0,
                            last_seen: unix_now_ms(),
                            backoff: self.config.initial_backoff,
                            next_forward_at: now,
                        },
                    );
                    info!("device attached: {}", device.serial);
                    let _ = self.event_tx.send(UsbEvent::DeviceAttached {
                        serial: device.serial.clone(),
                        model: device.model.clone(),
                    });
                    if device.state == AuthorizationState::PendingUserApproval {
                        let _ = self.event_tx.send(UsbEvent::DeviceRequiresAuthorization {
                            serial: device.serial.clone(),
                        });
                    }
                }
            }
        }

        // Debounced detach: count a miss for every tracked device absent
        // from this listing
        let mut gone = Vec::new();
        for (serial, tracked) in state.devices.iter_mut() {
            if !listed.iter().any(|d| &d.serial == serial) {
                tracked.missed += 1;
                if tracked.missed >= self.config.miss_threshold {
                    gone.push(serial.clone());
                }
            }
        }
        for serial in gone {
            state.devices.remove(&serial);
            info!("device detached: {}", serial);
            let _ = self.event_tx.send(UsbEvent::DeviceDetached { serial });
        }

        for (serial, tracked) in state.devices.iter() {
            if tracked.auth == AuthorizationState::Authorized
                && !tracked.forwarded
                && tracked.missed == 0
                && now >= tracked.next_forward_at
            {
                due.push((serial.clone(), tracked.local_port));
            }
        }
        due
    }

    fn apply_forward_result(&self, serial: &str, local_port: u16, ok: bool, now: Instant) {
        let mut state = self.state.lock().unwrap();
        let Some(tracked) = state.devices.get_mut(serial) else {
            return;
        };
        if ok {
            info!("port forwarding established: {} -> tcp:{}", serial, local_port);
            tracked.forwarded = true;
            tracked.backoff = self.config.initial_backoff;
            let _ = self.event_tx.send(UsbEvent::PortForwardingEstablished {
                serial: serial.to_string(),
                local_port,
            });
        } else {
            warn!(
                "port forwarding failed for {}, retrying in {:?}",
                serial, tracked.backoff
            );
            tracked.next_forward_at = now + tracked.backoff;
            tracked.backoff = (tracked.backoff * 2).min(self.config.max_backoff);
        }
    }
}

fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
