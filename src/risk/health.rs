//! Operational health and degraded-mode alerts.
//!
//! Tracks conditions that need an operator's attention without stopping the
//! engine:
//! - API error rate spikes
//! - Slots stuck after exhausted retries or exchange rejections
//! - Failed spot/earn transfers
//! - Orphaned or mismatched exchange orders
//! - Position drift against exchange balances
//! - Missing S1 history
//!
//! Alerts are emitted as structured `RISK_ALERT` log lines and kept for the
//! dashboard snapshot.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, error, info, warn};

use crate::exchange::Side;

const MAX_ALERTS: usize = 100;

/// Kinds of degraded conditions.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum AlertKind {
    /// Gateway error rate exceeded threshold
    ApiErrorSpike { error_count: u32, window_minutes: u32 },
    /// Slot could not be placed after exhausting retries
    SlotDegraded { slot: i64, side: Side, attempts: u32 },
    /// Exchange refused an order
    OrderRejected { slot: i64, code: i64 },
    /// Transfer between spot and earn kept failing
    TransferFailed { asset: String, amount: Decimal },
    /// Exchange order not recognized by the ladder
    ReconciliationConflict { order_id: i64, client_order_id: String },
    /// Tracked position differs from exchange balances
    PositionDrift { tracked: Decimal, exchange: Decimal },
    /// S1 window too short, fallback scale in use
    InsufficientHistory { have: usize, need: usize },
    /// A whole decision cycle was skipped
    CycleFailure { consecutive: u32 },
}

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    /// Get display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub suggested_action: String,
}

impl HealthAlert {
    /// Emit alert as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(target: "risk_alert", "RISK_ALERT: {}", json)
            }
        }
    }
}

pub struct HealthMonitor {
    max_errors_per_window: u32,
    error_window_minutes: u32,
    /// Recent gateway errors with timestamps
    error_history: VecDeque<DateTime<Utc>>,
    consecutive_cycle_failures: u32,
    alerts: VecDeque<HealthAlert>,
    /// Conditions currently degraded, keyed by a stable label
    degraded: BTreeSet<String>,
    sequence: u64,
}

impl HealthMonitor {
    pub fn new(max_errors_per_window: u32, error_window_minutes: u32) -> Self {
        Self {
            max_errors_per_window,
            error_window_minutes,
            error_history: VecDeque::new(),
            consecutive_cycle_failures: 0,
            alerts: VecDeque::new(),
            degraded: BTreeSet::new(),
            sequence: 0,
        }
    }

    /// Record and emit an alert.
    pub fn raise(
        &mut self,
        kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
        suggested_action: impl Into<String>,
    ) -> HealthAlert {
        self.sequence += 1;
        let timestamp = Utc::now();
        let alert = HealthAlert {
            alert_id: format!("health-{}-{}", timestamp.timestamp(), self.sequence),
            timestamp,
            kind,
            severity,
            message: message.into(),
            suggested_action: suggested_action.into(),
        };

        alert.emit();
        self.alerts.push_back(alert.clone());
        while self.alerts.len() > MAX_ALERTS {
            self.alerts.pop_front();
        }
        alert
    }

    /// Record a gateway error; alerts once the window threshold is reached.
    pub fn record_error(&mut self, error: &str) -> Option<HealthAlert> {
        let now = Utc::now();
        self.error_history.push_back(now);

        let window_start = now - Duration::minutes(self.error_window_minutes as i64);
        while let Some(timestamp) = self.error_history.front() {
            if *timestamp < window_start {
                self.error_history.pop_front();
            } else {
                break;
            }
        }

        debug!(error = %error, error_count = self.error_history.len(), "Recorded error");

        let error_count = self.error_history.len() as u32;
        if error_count == self.max_errors_per_window {
            return Some(self.raise(
                AlertKind::ApiErrorSpike {
                    error_count,
                    window_minutes: self.error_window_minutes,
                },
                AlertSeverity::Error,
                format!(
                    "{} errors in {} minutes - API may be unstable",
                    error_count, self.error_window_minutes
                ),
                "Check connectivity and rate limits",
            ));
        }
        None
    }

    /// Cycle completed; resets the skipped-cycle streak.
    pub fn record_cycle_success(&mut self) {
        if self.consecutive_cycle_failures > 0 {
            info!(
                previous_failures = self.consecutive_cycle_failures,
                "Cycle succeeded after failures"
            );
        }
        self.consecutive_cycle_failures = 0;
    }

    /// Cycle skipped. Alerts on the first failure and then every 10th.
    pub fn record_cycle_failure(&mut self, reason: &str) -> Option<HealthAlert> {
        self.consecutive_cycle_failures += 1;
        let consecutive = self.consecutive_cycle_failures;
        if consecutive == 1 || consecutive % 10 == 0 {
            let severity = if consecutive >= 10 {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            return Some(self.raise(
                AlertKind::CycleFailure { consecutive },
                severity,
                format!("Cycle skipped ({} in a row): {}", consecutive, reason),
                "Check exchange connectivity",
            ));
        }
        None
    }

    /// Mark a condition degraded. Returns true when it was not already.
    pub fn set_degraded(&mut self, key: &str) -> bool {
        self.degraded.insert(key.to_string())
    }

    /// Clear a degraded condition. Returns true when it was set.
    pub fn clear_degraded(&mut self, key: &str) -> bool {
        let cleared = self.degraded.remove(key);
        if cleared {
            info!(condition = key, "Degraded condition cleared");
        }
        cleared
    }

    pub fn is_degraded(&self, key: &str) -> bool {
        self.degraded.contains(key)
    }

    pub fn degraded(&self) -> Vec<String> {
        self.degraded.iter().cloned().collect()
    }

    pub fn alerts(&self) -> impl Iterator<Item = &HealthAlert> {
        self.alerts.iter()
    }

    /// Most recent `n` alerts, oldest first.
    pub fn recent_alerts(&self, n: usize) -> Vec<HealthAlert> {
        let skip = self.alerts.len().saturating_sub(n);
        self.alerts.iter().skip(skip).cloned().collect()
    }

    pub fn recent_error_count(&self) -> usize {
        self.error_history.len()
    }

    pub fn consecutive_cycle_failures(&self) -> u32 {
        self.consecutive_cycle_failures
    }

    /// Adopt reloaded thresholds.
    pub fn set_thresholds(&mut self, max_errors_per_window: u32, error_window_minutes: u32) {
        self.max_errors_per_window = max_errors_per_window;
        self.error_window_minutes = error_window_minutes;
    }
}
