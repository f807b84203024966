//! Domain quarantine: a circuit breaker that marks a domain temporarily
//! unusable after repeated failures. The pool consults this before issuing
//! any work; expired entries are pruned lazily on read.

use crate::domains::normalize_domain;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Why a domain was quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QuarantineReason {
    /// Repeated HTTP 403 responses.
    RepeatedForbidden,
    /// HTTP 429.
    RateLimited,
    /// CAPTCHA or anti-bot challenge detected.
    CaptchaDetected,
    /// Repeated 5xx responses.
    RepeatedServerError,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuarantineEntry {
    pub domain: String,
    pub reason: QuarantineReason,
    pub expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct DomainQuarantine {
    entries: Mutex<HashMap<String, QuarantineEntry>>,
}

impl DomainQuarantine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban a domain for `duration_minutes`. A later call overwrites any
    /// existing entry, extending or shortening the ban.
    pub fn quarantine_domain(&self, domain: &str, reason: QuarantineReason, duration_minutes: i64) {
        let domain = normalize_domain(domain);
        let entry = QuarantineEntry {
            domain: domain.clone(),
            reason,
            expires_at: Utc::now() + ChronoDuration::minutes(duration_minutes),
        };
        log::warn!(
            "quarantining {} for {}min ({:?})",
            domain,
            duration_minutes,
            reason
        );
        self.entries.lock().unwrap().insert(domain, entry);
    }

    pub fn is_quarantined(&self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&domain) {
            Some(entry) if entry.expires_at > Utc::now() => true,
            Some(_) => {
                entries.remove(&domain);
                false
            }
            None => false,
        }
    }

    pub fn get_quarantine_entry(&self, domain: &str) -> Option<QuarantineEntry> {
        let domain = normalize_domain(domain);
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&domain) {
            Some(entry) if entry.expires_at > Utc::now() => Some(entry.clone()),
            Some(_) => {
                entries.remove(&domain);
                None
            }
            None => None,
        }
    }

    /// Currently active entries, for status reporting.
    pub fn active_entries(&self) -> Vec<QuarantineEntry> {
        let now = Utc::now();
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.expires_at > now)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quarantine_blocks_domain() {
        let quarantine = DomainQuarantine::new();
        assert!(!quarantine.is_quarantined("bad.com"));

        quarantine.quarantine_domain("bad.com", QuarantineReason::CaptchaDetected, 10);
        assert!(quarantine.is_quarantined("bad.com"));
        assert!(quarantine.is_quarantined("https://www.bad.com/page"));

        let entry = quarantine.get_quarantine_entry("bad.com").unwrap();
        assert_eq!(entry.reason, QuarantineReason::CaptchaDetected);
    }

    #[test]
    fn test_expired_entry_is_pruned() {
        let quarantine = DomainQuarantine::new();
        quarantine.quarantine_domain("stale.com", QuarantineReason::RateLimited, -1);

        assert!(!quarantine.is_quarantined("stale.com"));
        assert!(quarantine.get_quarantine_entry("stale.com").is_none());
        assert!(quarantine.active_entries().is_empty());
    }

    #[test]
    fn test_unrelated_domain_untouched() {
        let quarantine = DomainQuarantine::new();
        quarantine.quarantine_domain("bad.com", QuarantineReason::RepeatedForbidden, 10);
        assert!(!quarantine.is_quarantined("good.com"));
    }
}
