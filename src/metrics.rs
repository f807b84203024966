//! Pool and warmup telemetry.
//!
//! Tracks warmup verdicts, recycle counts by type, engine escalations and
//! lease outcomes. Everything sits behind one mutex; callers get clones.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub started_at: DateTime<Utc>,
    pub warmups_ready: u64,
    pub warmups_degraded: u64,
    pub warmups_failed: u64,
    pub soft_recycles: u64,
    pub hard_recycles: u64,
    pub escalations: u64,
    pub leases_granted: u64,
    pub leases_denied: u64,
    pub leases_expired: u64,
    pub quarantine_rejections: u64,
}

impl PoolMetrics {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            warmups_ready: 0,
            warmups_degraded: 0,
            warmups_failed: 0,
            soft_recycles: 0,
            hard_recycles: 0,
            escalations: 0,
            leases_granted: 0,
            leases_denied: 0,
            leases_expired: 0,
            quarantine_rejections: 0,
        }
    }

    /// Share of warmups that produced a usable (ready or degraded) session.
    pub fn warmup_success_rate(&self) -> f64 {
        let total = self.warmups_ready + self.warmups_degraded + self.warmups_failed;
        if total == 0 {
            0.0
        } else {
            (self.warmups_ready + self.warmups_degraded) as f64 / total as f64
        }
    }

    pub fn lease_success_rate(&self) -> f64 {
        let total = self.leases_granted + self.leases_denied;
        if total == 0 {
            0.0
        } else {
            self.leases_granted as f64 / total as f64
        }
    }
}

pub struct MetricsTracker {
    inner: Mutex<PoolMetrics>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolMetrics::new()),
        }
    }

    pub fn record_warmup_ready(&self) {
        self.inner.lock().unwrap().warmups_ready += 1;
    }

    pub fn record_warmup_degraded(&self) {
        self.inner.lock().unwrap().warmups_degraded += 1;
    }

    pub fn record_warmup_failed(&self) {
        let mut m = self.inner.lock().unwrap();
        m.warmups_failed += 1;
        log::warn!(
            "warmup failed (success rate now {:.1}%)",
            m.warmup_success_rate() * 100.0
        );
    }

    pub fn record_soft_recycle(&self) {
        self.inner.lock().unwrap().soft_recycles += 1;
    }

    pub fn record_hard_recycle(&self) {
        self.inner.lock().unwrap().hard_recycles += 1;
    }

    pub fn record_escalation(&self) {
        self.inner.lock().unwrap().escalations += 1;
    }

    pub fn record_lease_granted(&self) {
        self.inner.lock().unwrap().leases_granted += 1;
    }

    pub fn record_lease_denied(&self, reason: &str) {
        let mut m = self.inner.lock().unwrap();
        m.leases_denied += 1;
        if reason == "quarantined" {
            m.quarantine_rejections += 1;
        }
        log::debug!("lease denied: {}", reason);
    }

    pub fn record_lease_expired(&self) {
        self.inner.lock().unwrap().leases_expired += 1;
    }

    pub fn snapshot(&self) -> PoolMetrics {
        self.inner.lock().unwrap().clone()
    }

    /// One-line operator summary.
    pub fn summary(&self) -> String {
        let m = self.inner.lock().unwrap();
        format!(
            "warmups {}/{}/{} (ready/degraded/failed, {:.1}% usable) | \
             recycles {} soft / {} hard | escalations {} | \
             leases {} granted / {} denied / {} expired ({:.1}% granted)",
            m.warmups_ready,
            m.warmups_degraded,
            m.warmups_failed,
            m.warmup_success_rate() * 100.0,
            m.soft_recycles,
            m.hard_recycles,
            m.escalations,
            m.leases_granted,
            m.leases_denied,
            m.leases_expired,
            m.lease_success_rate() * 100.0,
        )
    }

    pub fn export_json(&self) -> String {
        let m = self.inner.lock().unwrap();
        serde_json::to_string_pretty(&*m).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}
