//! Smart reconnection planning
//!
//! Classifies why a connection dropped and recommends a recovery strategy
//! matched to the failure mode, so a device-authorization failure is not
//! retried every second the way a transient network blip is.

use crate::health::ConnectionRecord;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Probable root cause of a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectCause {
    NetworkLoss,
    ServerRestart,
    ClientTimeout,
    TransportError,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recoverability {
    /// Safe to retry right away
    Immediate,
    /// Retry with backoff
    Delayed,
    /// User intervention required (e.g. re-authorize the device)
    Manual,
}

/// Classification of one disconnect event.
///
/// Derived entirely from the ended record and the reported reason; identical
/// inputs always produce an identical analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectionAnalysis {
    pub cause: DisconnectCause,
    pub severity: Severity,
    pub recoverability: Recoverability,
}

/// Named recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    ImmediateRetry,
    ExponentialBackoff,
    TransportFallback,
    ManualIntervention,
}

/// Actionable recovery recommendation handed to the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectionPlan {
    pub strategy: StrategyKind,
    pub estimated_delay_ms: u64,
    pub max_attempts: u32,
    pub tips: Vec<String>,
}

/// Per-strategy outcome counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StrategyStats {
    pub issued: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Aggregate reconnection statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconnectionStats {
    pub plans_issued: u64,
    pub by_strategy: HashMap<StrategyKind, StrategyStats>,
}

/// Connections shorter than this bias toward transport-level causes
const SHORT_LIVED: Duration = Duration::from_secs(10);
/// Connections at least this long that end abruptly bias toward network loss
const LONG_LIVED: Duration = Duration::from_secs(60);
/// Upgrade churn at or above this count suggests an unstable network
const UPGRADE_CHURN: usize = 3;
/// Error rate (errors per minute of uptime) considered high
const HIGH_ERROR_RATE: f64 = 3.0;

/// Classify a disconnect from the ended record and the transport's reported
/// reason. Pure function: no hidden state, no I/O.
pub fn analyze_disconnection(
    record: &ConnectionRecord,
    reported_reason: &str,
) -> DisconnectionAnalysis {
    let reason = reported_reason.to_lowercase();
    let now = record.ended_at.unwrap_or_else(Instant::now);
    let uptime = record.uptime(now);
    let minutes = (uptime.as_secs_f64() / 60.0).max(1.0 / 60.0);
    let error_rate = record.errors.len() as f64 / minutes;

    // Reason keywords take priority over history heuristics
    if reason.contains("unauthorized") || reason.contains("auth") {
        return DisconnectionAnalysis {
            cause: DisconnectCause::TransportError,
            severity: Severity::High,
            recoverability: Recoverability::Manual,
        };
    }
    if reason.contains("restart") || reason.contains("shutdown") {
        return DisconnectionAnalysis {
            cause: DisconnectCause::ServerRestart,
            severity: Severity::Medium,
            recoverability: Recoverability::Delayed,
        };
    }
    if reason.contains("timeout") || reason.contains("ping") {
        return DisconnectionAnalysis {
            cause: DisconnectCause::ClientTimeout,
            severity: if error_rate >= HIGH_ERROR_RATE {
                Severity::High
            } else {
                Severity::Medium
            },
            recoverability: Recoverability::Delayed,
        };
    }

    // Frequent transport upgrades right before failure point at an
    // unstable network rather than any single cause.
    if record.upgrades.len() >= UPGRADE_CHURN {
        return DisconnectionAnalysis {
            cause: DisconnectCause::Unknown,
            severity: Severity::Medium,
            recoverability: Recoverability::Delayed,
        };
    }

    if uptime < SHORT_LIVED {
        return DisconnectionAnalysis {
            cause: DisconnectCause::TransportError,
            severity: if error_rate >= HIGH_ERROR_RATE {
                Severity::High
            } else {
                Severity::Medium
            },
            recoverability: Recoverability::Delayed,
        };
    }

    if uptime >= LONG_LIVED
        && (reason.contains("close") || reason.contains("reset") || reason.contains("network"))
    {
        // A long, clean connection that ends abruptly looks like the
        // network went away underneath it.
        return DisconnectionAnalysis {
            cause: DisconnectCause::NetworkLoss,
            severity: if error_rate >= HIGH_ERROR_RATE {
                Severity::Medium
            } else {
                Severity::Low
            },
            recoverability: Recoverability::Immediate,
        };
    }

    // Insufficient evidence: safe defaults so a plan can still be produced
    DisconnectionAnalysis {
        cause: DisconnectCause::Unknown,
        severity: Severity::Medium,
        recoverability: Recoverability::Delayed,
    }
}

const FAST_RETRY_DELAY_MS: u64 = 500;
const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 30_000;
const BACKOFF_JITTER_MS: u64 = 250;

/// Map an analysis to a concrete plan.
///
/// Backoff delays carry random jitter so a fleet of clients dropped by the
/// same outage does not reconnect in lockstep.
pub fn recommend_strategy(analysis: &DisconnectionAnalysis) -> ReconnectionPlan {
    match (analysis.recoverability, analysis.severity) {
        (Recoverability::Manual, _) => ReconnectionPlan {
            strategy: StrategyKind::ManualIntervention,
            estimated_delay_ms: 0,
            max_attempts: 0,
            tips: vec![
                "Authorization failed; accept the pairing prompt on the host or re-pair"
                    .to_string(),
            ],
        },
        (Recoverability::Immediate, Severity::Low | Severity::Medium) => ReconnectionPlan {
            strategy: StrategyKind::ImmediateRetry,
            estimated_delay_ms: FAST_RETRY_DELAY_MS,
            max_attempts: 3,
            tips: vec!["Connection should recover on its own".to_string()],
        },
        (_, Severity::High) => ReconnectionPlan {
            strategy: StrategyKind::TransportFallback,
            estimated_delay_ms: with_jitter(BACKOFF_BASE_MS * 2),
            max_attempts: 4,
            tips: vec![
                "Current transport keeps failing; try the USB cable or another network"
                    .to_string(),
            ],
        },
        (Recoverability::Delayed, _) => ReconnectionPlan {
            strategy: StrategyKind::ExponentialBackoff,
            estimated_delay_ms: with_jitter(BACKOFF_BASE_MS),
            max_attempts: 6,
            tips: vec!["Retrying with increasing delays".to_string()],
        },
    }
}

/// Delay for attempt `n` (0-based) of an exponential-backoff plan
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(with_jitter(exp.min(BACKOFF_CAP_MS)))
}

fn with_jitter(delay_ms: u64) -> u64 {
    delay_ms + rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS)
}

struct ReconnectState {
    plans: VecDeque<(StrategyKind, DisconnectionAnalysis)>,
    stats: ReconnectionStats,
}

/// Issues reconnection plans and keeps bounded statistics about them.
///
/// Holds no per-connection state: every plan is recomputed from the record
/// handed in, so the manager can never disagree with the monitor's history.
pub struct ReconnectionManager {
    inner: Mutex<ReconnectState>,
    log_limit: usize,
}

impl Default for ReconnectionManager {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ReconnectionManager {
    pub fn new(log_limit: usize) -> Self {
        Self {
            inner: Mutex::new(ReconnectState {
                plans: VecDeque::new(),
                stats: ReconnectionStats::default(),
            }),
            log_limit,
        }
    }

    /// Analyze a disconnect and produce a plan, recording it for stats
    pub fn plan_for(&self, record: &ConnectionRecord, reported_reason: &str) -> ReconnectionPlan {
        let analysis = analyze_disconnection(record, reported_reason);
        let plan = recommend_strategy(&analysis);
        debug!(
            "connection {}: {:?} -> {:?}",
            record.id, analysis.cause, plan.strategy
        );

        let mut state = self.inner.lock().unwrap();
        state.stats.plans_issued += 1;
        state
            .stats
            .by_strategy
            .entry(plan.strategy)
            .or_default()
            .issued += 1;
        state.plans.push_back((plan.strategy, analysis));
        while state.plans.len() > self.log_limit {
            state.plans.pop_front();
        }
        plan
    }

    /// Optional feedback path: the orchestrator reports whether a recommended
    /// strategy actually reconnected the client.
    pub fn record_outcome(&self, strategy: StrategyKind, success: bool) {
        let mut state = self.inner.lock().unwrap();
        let entry = state.stats.by_strategy.entry(strategy).or_default();
        if success {
            entry.succeeded += 1;
        } else {
            entry.failed += 1;
        }
    }

    /// Snapshot of issued/outcome counters per strategy
    pub fn stats(&self) -> ReconnectionStats {
        self.inner.lock().unwrap().stats.clone()
    }
}
