//! Outbound request admission control.
//!
//! Two independent ceilings compose with a tiered spacing policy:
//!
//! * a global semaphore caps concurrent fetches across all domains,
//! * a per-domain capacity-1 semaphore serializes same-domain fetches,
//! * `acquire()` enforces each tier's minimum spacing since the domain's
//!   last request.
//!
//! A caller must hold a [`ConcurrencySlot`] *and* satisfy spacing before
//! issuing a request. Both slots are acquired as a unit: if only one is
//! obtained before the timeout it is released before returning, so no
//! partial hold ever survives a failed acquisition.

use crate::config::{LimiterConfig, SpacingConfig};
use crate::domains::normalize_domain;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Request-rate tier for a domain. Tier A is the most permissive
/// (3-5 s spacing, roughly 12-20 req/min), tier B is a fixed 10 s
/// (6 req/min), tiers C-G sit around 10-12 req/min.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateTier {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
}

impl RateTier {
    pub fn all() -> [RateTier; 7] {
        [
            RateTier::A,
            RateTier::B,
            RateTier::C,
            RateTier::D,
            RateTier::E,
            RateTier::F,
            RateTier::G,
        ]
    }
}

/// Tier applied to domains with no explicit assignment.
pub const DEFAULT_TIER: RateTier = RateTier::C;

struct DomainState {
    tier: RateTier,
    last_request: Option<Instant>,
    slot: Arc<Semaphore>,
}

struct LimiterState {
    domains: HashMap<String, DomainState>,
    rng: StdRng,
}

/// RAII grant of one global and one per-domain concurrency slot.
///
/// Dropping the slot releases both permits; there is no separate release
/// call to forget.
pub struct ConcurrencySlot {
    domain: String,
    _global: OwnedSemaphorePermit,
    _domain: OwnedSemaphorePermit,
}

impl ConcurrencySlot {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

pub struct RateLimiter {
    global: Arc<Semaphore>,
    per_domain_capacity: usize,
    spacing: SpacingConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self::with_seed(config, rand::random())
    }

    /// Seeded variant for reproducible spacing in tests.
    pub fn with_seed(config: LimiterConfig, seed: u64) -> Self {
        let mut domains = HashMap::new();
        for (domain, tier) in &config.domain_tiers {
            domains.insert(
                normalize_domain(domain),
                DomainState {
                    tier: *tier,
                    last_request: None,
                    slot: Arc::new(Semaphore::new(config.max_per_domain_concurrency)),
                },
            );
        }
        Self {
            global: Arc::new(Semaphore::new(config.max_global_concurrency)),
            per_domain_capacity: config.max_per_domain_concurrency,
            spacing: config.spacing,
            state: Mutex::new(LimiterState {
                domains,
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    /// Acquire the global and per-domain concurrency slots as a unit,
    /// blocking up to `timeout`. Returns `None` on timeout with nothing
    /// held.
    pub async fn acquire_concurrency(
        &self,
        domain: &str,
        timeout: Duration,
    ) -> Option<ConcurrencySlot> {
        let domain = normalize_domain(domain);
        let deadline = Instant::now() + timeout;

        let global = match tokio::time::timeout_at(deadline, self.global.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            _ => {
                log::debug!("global concurrency slot not available for {}", domain);
                return None;
            }
        };

        let domain_sem = self.domain_slot(&domain);
        match tokio::time::timeout_at(deadline, domain_sem.acquire_owned()).await {
            Ok(Ok(permit)) => Some(ConcurrencySlot {
                domain,
                _global: global,
                _domain: permit,
            }),
            _ => {
                // Give the global slot back before reporting failure.
                drop(global);
                log::debug!("per-domain slot not available for {}", domain);
                None
            }
        }
    }

    /// Block until the domain's tier spacing since its last request is
    /// satisfied, then record the request. With `wait = false` this fails
    /// immediately instead of sleeping; with `wait = true` it gives up
    /// once the remaining spacing would exceed `max_wait`.
    pub async fn acquire(&self, domain: &str, wait: bool, max_wait: Duration) -> bool {
        let domain = normalize_domain(domain);
        let deadline = Instant::now() + max_wait;

        loop {
            let wait_for = {
                let mut st = self.state.lock().unwrap();
                let LimiterState { domains, rng } = &mut *st;
                let entry = domains
                    .entry(domain.clone())
                    .or_insert_with(|| DomainState {
                        tier: DEFAULT_TIER,
                        last_request: None,
                        slot: Arc::new(Semaphore::new(self.per_domain_capacity)),
                    });

                let (lo, hi) = self.spacing.range(entry.tier);
                let spacing_secs = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
                let spacing = Duration::from_secs_f64(spacing_secs);

                match entry.last_request {
                    None => {
                        entry.last_request = Some(Instant::now());
                        None
                    }
                    Some(last) => {
                        let elapsed = last.elapsed();
                        if elapsed >= spacing {
                            entry.last_request = Some(Instant::now());
                            None
                        } else {
                            Some(spacing - elapsed)
                        }
                    }
                }
            };

            match wait_for {
                None => return true,
                Some(delay) => {
                    if !wait {
                        return false;
                    }
                    if Instant::now() + delay > deadline {
                        log::debug!(
                            "spacing wait of {:.1}s for {} exceeds max_wait",
                            delay.as_secs_f64(),
                            domain
                        );
                        return false;
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Assign (or reassign) a domain's rate tier.
    pub fn set_domain_tier(&self, domain: &str, tier: RateTier) {
        let domain = normalize_domain(domain);
        let mut st = self.state.lock().unwrap();
        let cap = self.per_domain_capacity;
        st.domains
            .entry(domain.clone())
            .and_modify(|d| d.tier = tier)
            .or_insert_with(|| DomainState {
                tier,
                last_request: None,
                slot: Arc::new(Semaphore::new(cap)),
            });
        log::info!("domain {} assigned rate tier {:?}", domain, tier);
    }

    pub fn tier_for(&self, domain: &str) -> RateTier {
        let domain = normalize_domain(domain);
        self.state
            .lock()
            .unwrap()
            .domains
            .get(&domain)
            .map(|d| d.tier)
            .unwrap_or(DEFAULT_TIER)
    }

    /// Free global slots right now; held slots are the configured max minus
    /// this value.
    pub fn available_global_slots(&self) -> usize {
        self.global.available_permits()
    }

    fn domain_slot(&self, domain: &str) -> Arc<Semaphore> {
        let mut st = self.state.lock().unwrap();
        let cap = self.per_domain_capacity;
        st.domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainState {
                tier: DEFAULT_TIER,
                last_request: None,
                slot: Arc::new(Semaphore::new(cap)),
            })
            .slot
            .clone()
    }
}
