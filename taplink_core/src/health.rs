//! Connection health monitoring
//!
//! Tracks per-connection latency, error, and transport-upgrade history and
//! turns it into a rolling stability prediction the orchestrator can act on.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Immutable description of the client behind a connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub platform: String,
    pub transport: String,
    pub remote_addr: String,
    pub user_agent: String,
}

/// Lifecycle state of a tracked connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Active,
    Degraded,
    Ended,
}

/// One round-trip latency measurement
#[derive(Debug, Clone)]
pub struct PingSample {
    pub at: Instant,
    pub latency_ms: f64,
}

/// One transport-level error observed on a connection
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub at: Instant,
    pub kind: String,
    pub message: String,
}

/// A transport upgrade (e.g. polling -> websocket)
#[derive(Debug, Clone)]
pub struct TransportUpgrade {
    pub from: String,
    pub to: String,
    pub at: Instant,
}

/// Predicted short-horizon stability, worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stability {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl Stability {
    /// One step worse, saturating at `Poor`
    fn downgrade(self) -> Self {
        match self {
            Stability::Excellent => Stability::Good,
            Stability::Good => Stability::Fair,
            Stability::Fair | Stability::Poor => Stability::Poor,
        }
    }
}

/// Conditions flagged by the prediction pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskFactor {
    HighLatency,
    HighJitter,
    RisingLatency,
    ErrorBurst,
}

/// Derived health signal, recomputed on each new sample.
///
/// A prediction is a pure function of the owning record's current history;
/// it never feeds back into the record itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPrediction {
    pub average_latency_ms: f64,
    pub jitter_ms: f64,
    pub stability: Stability,
    pub risk_factors: Vec<RiskFactor>,
    pub recommendations: Vec<String>,
}

impl Default for HealthPrediction {
    fn default() -> Self {
        Self {
            average_latency_ms: 0.0,
            jitter_ms: 0.0,
            stability: Stability::Excellent,
            risk_factors: Vec::new(),
            recommendations: Vec::new(),
        }
    }
}

/// One tracked connection and its full in-window history
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: String,
    pub client_info: ClientInfo,
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
    pub ping_history: VecDeque<PingSample>,
    pub errors: Vec<ErrorEntry>,
    pub upgrades: Vec<TransportUpgrade>,
    pub state: ConnectionState,
    pub end_reason: Option<String>,
    pub prediction: HealthPrediction,
}

impl ConnectionRecord {
    fn new(id: String, client_info: ClientInfo, now: Instant) -> Self {
        Self {
            id,
            client_info,
            started_at: now,
            ended_at: None,
            ping_history: VecDeque::new(),
            errors: Vec::new(),
            upgrades: Vec::new(),
            state: ConnectionState::Active,
            end_reason: None,
            prediction: HealthPrediction::default(),
        }
    }

    /// Connection lifetime so far (or total lifetime once ended)
    pub fn uptime(&self, now: Instant) -> Duration {
        self.ended_at.unwrap_or(now).duration_since(self.started_at)
    }

    fn recent_error_count(&self, window: Duration, now: Instant) -> usize {
        self.errors
            .iter()
            .filter(|e| now.duration_since(e.at) <= window)
            .count()
    }
}

/// Tuning knobs for the monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Maximum retained ping samples per connection
    pub max_samples: usize,
    /// Samples older than this are evicted
    pub sample_max_age: Duration,
    /// Sliding window for error-burst detection
    pub error_window: Duration,
    /// Errors within the window at or above this count flag a burst
    pub error_burst_threshold: usize,
    /// Jitter flag fires when stddev exceeds this fraction of the average
    pub jitter_ratio: f64,
    /// Rising-trend flag fires when the recent half exceeds the older half
    /// by this factor
    pub rising_ratio: f64,
    /// Maximum archived (ended) records kept for analytics
    pub archive_limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_samples: 120,
            sample_max_age: Duration::from_secs(300),
            error_window: Duration::from_secs(60),
            error_burst_threshold: 3,
            jitter_ratio: 0.5,
            rising_ratio: 1.5,
            archive_limit: 64,
        }
    }
}

/// Events emitted by the monitor
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// New prediction after a latency sample
    HealthPrediction {
        id: String,
        prediction: HealthPrediction,
    },
    /// Error rate crossed the burst threshold; connection is now Degraded
    ConnectionDegraded {
        id: String,
        kind: String,
        message: String,
    },
}

/// Summary statistics over the retained ping window
#[derive(Debug, Clone, Serialize)]
pub struct PingSummary {
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p95_ms: f64,
}

/// Read-only snapshot for one connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionAnalytics {
    pub id: String,
    pub state: ConnectionState,
    pub prediction: HealthPrediction,
    pub ping: Option<PingSummary>,
    pub error_count: usize,
    pub transport_upgrades: usize,
    pub uptime_ms: u64,
}

/// Fleet-wide counters
#[derive(Debug, Clone, Serialize)]
pub struct GlobalAnalytics {
    pub total_tracked: u64,
    pub active: usize,
    pub degraded: usize,
    pub average_latency_ms: f64,
}

struct MonitorState {
    active: HashMap<String, ConnectionRecord>,
    archive: VecDeque<ConnectionRecord>,
    total_tracked: u64,
}

/// Tracks every live connection and scores its health in real time.
///
/// All operations are no-ops on unknown ids: late events racing with a
/// connection that just ended are expected and harmless. Queries copy
/// snapshots out under the lock so they never block event ingestion for
/// longer than a clone.
pub struct HealthMonitor {
    config: MonitorConfig,
    inner: Arc<Mutex<MonitorState>>,
    event_tx: mpsc::UnboundedSender<MonitorEvent>,
}

impl HealthMonitor {
    /// Create a monitor and the event stream the orchestrator polls
    pub fn new(config: MonitorConfig) -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let monitor = Self {
            config,
            inner: Arc::new(Mutex::new(MonitorState {
                active: HashMap::new(),
                archive: VecDeque::new(),
                total_tracked: 0,
            })),
            event_tx,
        };
        (monitor, event_rx)
    }

    /// Begin tracking a connection. Idempotent: an already-tracked id is
    /// left untouched.
    pub fn track_connection(&self, id: &str, client_info: ClientInfo) {
        let now = Instant::now();
        let mut state = self.inner.lock().unwrap();
        if state.active.contains_key(id) {
            debug!("connection {} already tracked", id);
            return;
        }
        info!("tracking connection {} ({})", id, client_info.transport);
        state
            .active
            .insert(id.to_string(), ConnectionRecord::new(id.to_string(), client_info, now));
        state.total_tracked += 1;
    }

    /// Record a round-trip latency sample and recompute the prediction
    pub fn record_latency(&self, id: &str, latency_ms: f64) {
        let now = Instant::now();
        let mut state = self.inner.lock().unwrap();
        let Some(record) = state.active.get_mut(id) else {
            debug!("latency sample for unknown connection {}", id);
            return;
        };

        record.ping_history.push_back(PingSample { at: now, latency_ms });
        evict_samples(&mut record.ping_history, &self.config, now);
        record.prediction = compute_prediction(record, &self.config, now);

        let event = MonitorEvent::HealthPrediction {
            id: record.id.clone(),
            prediction: record.prediction.clone(),
        };
        let _ = self.event_tx.send(event);
    }

    /// Record a transport upgrade. Does not change connection state.
    pub fn record_transport_upgrade(&self, id: &str, from: &str, to: &str) {
        let now = Instant::now();
        let mut state = self.inner.lock().unwrap();
        let Some(record) = state.active.get_mut(id) else {
            return;
        };
        debug!("connection {} upgraded {} -> {}", id, from, to);
        record.upgrades.push(TransportUpgrade {
            from: from.to_string(),
            to: to.to_string(),
            at: now,
        });
    }

    /// Record an error. Crossing the burst threshold inside the sliding
    /// window transitions the connection to `Degraded` and emits an event.
    pub fn record_error(&self, id: &str, kind: &str, message: &str) {
        let now = Instant::now();
        let mut state = self.inner.lock().unwrap();
        let Some(record) = state.active.get_mut(id) else {
            debug!("error for unknown connection {}", id);
            return;
        };

        record.errors.push(ErrorEntry {
            at: now,
            kind: kind.to_string(),
            message: message.to_string(),
        });
        record.prediction = compute_prediction(record, &self.config, now);

        let burst = record.recent_error_count(self.config.error_window, now)
            >= self.config.error_burst_threshold;
        if burst && record.state == ConnectionState::Active {
            warn!("connection {} degraded after error burst ({})", id, kind);
            record.state = ConnectionState::Degraded;
            let event = MonitorEvent::ConnectionDegraded {
                id: record.id.clone(),
                kind: kind.to_string(),
                message: message.to_string(),
            };
            let _ = self.event_tx.send(event);
        }
    }

    /// End a connection and archive its record.
    ///
    /// The first call sets the terminal reason and returns the final record
    /// for disconnect analysis; any later call is a no-op returning `None`.
    pub fn end_connection(&self, id: &str, reason: &str) -> Option<ConnectionRecord> {
        let now = Instant::now();
        let mut state = self.inner.lock().unwrap();
        let mut record = state.active.remove(id)?;

        info!("connection {} ended: {}", id, reason);
        record.state = ConnectionState::Ended;
        record.end_reason = Some(reason.to_string());
        record.ended_at = Some(now);

        state.archive.push_back(record.clone());
        let limit = self.config.archive_limit;
        while state.archive.len() > limit {
            state.archive.pop_front();
        }
        Some(record)
    }

    /// Snapshot analytics for one connection, active or archived
    pub fn connection_analytics(&self, id: &str) -> Option<ConnectionAnalytics> {
        let now = Instant::now();
        let state = self.inner.lock().unwrap();
        let record = state
            .active
            .get(id)
            .or_else(|| state.archive.iter().rev().find(|r| r.id == id))?;

        Some(ConnectionAnalytics {
            id: record.id.clone(),
            state: record.state,
            prediction: record.prediction.clone(),
            ping: ping_summary(&record.ping_history),
            error_count: record.errors.len(),
            transport_upgrades: record.upgrades.len(),
            uptime_ms: record.uptime(now).as_millis() as u64,
        })
    }

    /// Fleet-wide counters across all active connections
    pub fn global_analytics(&self) -> GlobalAnalytics {
        let state = self.inner.lock().unwrap();
        let active = state.active.len();
        let degraded = state
            .active
            .values()
            .filter(|r| r.state == ConnectionState::Degraded)
            .count();

        let (sum, count) = state
            .active
            .values()
            .flat_map(|r| r.ping_history.iter())
            .fold((0.0, 0usize), |(s, c), p| (s + p.latency_ms, c + 1));
        let average_latency_ms = if count > 0 { sum / count as f64 } else { 0.0 };

        GlobalAnalytics {
            total_tracked: state.total_tracked,
            active,
            degraded,
            average_latency_ms,
        }
    }
}

fn evict_samples(history: &mut VecDeque<PingSample>, config: &MonitorConfig, now: Instant) {
    while history.len() > config.max_samples {
        history.pop_front();
    }
    while let Some(front) = history.front() {
        if now.duration_since(front.at) > config.sample_max_age {
            history.pop_front();
        } else {
            break;
        }
    }
}

/// Score a record's current history into a prediction.
///
/// Stability starts from the average-latency band and each risk flag
/// downgrades it one step; flags never improve the rating.
fn compute_prediction(
    record: &ConnectionRecord,
    config: &MonitorConfig,
    now: Instant,
) -> HealthPrediction {
    let samples: Vec<f64> = record.ping_history.iter().map(|p| p.latency_ms).collect();
    if samples.is_empty() {
        let mut prediction = HealthPrediction::default();
        if record.recent_error_count(config.error_window, now) >= config.error_burst_threshold {
            prediction.risk_factors.push(RiskFactor::ErrorBurst);
            prediction.stability = prediction.stability.downgrade();
            prediction
                .recommendations
                .push(recommendation_for(RiskFactor::ErrorBurst).to_string());
        }
        return prediction;
    }

    let avg = samples.iter().sum::<f64>() / samples.len() as f64;
    let variance =
        samples.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / samples.len() as f64;
    let jitter = variance.sqrt();

    let mut stability = if avg < 50.0 {
        Stability::Excellent
    } else if avg < 100.0 {
        Stability::Good
    } else if avg < 200.0 {
        Stability::Fair
    } else {
        Stability::Poor
    };

    let mut risk_factors = Vec::new();
    if avg >= 200.0 {
        risk_factors.push(RiskFactor::HighLatency);
    }
    if samples.len() >= 4 && jitter > f64::max(20.0, avg * config.jitter_ratio) {
        risk_factors.push(RiskFactor::HighJitter);
        stability = stability.downgrade();
    }
    if samples.len() >= 4 {
        let mid = samples.len() / 2;
        let older = samples[..mid].iter().sum::<f64>() / mid as f64;
        let recent = samples[mid..].iter().sum::<f64>() / (samples.len() - mid) as f64;
        if recent > older * config.rising_ratio && recent - older > 20.0 {
            risk_factors.push(RiskFactor::RisingLatency);
            stability = stability.downgrade();
        }
    }
    if record.recent_error_count(config.error_window, now) >= config.error_burst_threshold {
        risk_factors.push(RiskFactor::ErrorBurst);
        stability = stability.downgrade();
    }

    let recommendations = risk_factors
        .iter()
        .map(|f| recommendation_for(*f).to_string())
        .collect();

    HealthPrediction {
        average_latency_ms: avg,
        jitter_ms: jitter,
        stability,
        risk_factors,
        recommendations,
    }
}

/// Advisory text per flag. Table-driven so policy wording can change
/// without touching the scoring mechanics.
fn recommendation_for(factor: RiskFactor) -> &'static str {
    match factor {
        RiskFactor::HighLatency => "Latency is high; move closer to the host or switch networks",
        RiskFactor::HighJitter => "Connection is unstable; prefer a wired/USB transport",
        RiskFactor::RisingLatency => "Latency is trending up; check for network congestion",
        RiskFactor::ErrorBurst => "Repeated errors detected; a reconnect may be imminent",
    }
}

fn ping_summary(history: &VecDeque<PingSample>) -> Option<PingSummary> {
    if history.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = history.iter().map(|p| p.latency_ms).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let count = sorted.len();
    let avg = sorted.iter().sum::<f64>() / count as f64;
    let p95_idx = ((count as f64 * 0.95).ceil() as usize).clamp(1, count) - 1;

    Some(PingSummary {
        count,
        min_ms: sorted[0],
        max_ms: sorted[count - 1],
        avg_ms: avg,
        p95_ms: sorted[p95_idx],
    })
}
