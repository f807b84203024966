//! Configuration loaded from `config.toml`, with sensible defaults for
//! every field so an empty or missing file still yields a working setup.
//!
//! Operational thresholds (dirty-release limit, escalation threshold, lease
//! TTL) live here rather than as constants in the code, and are validated
//! once at startup.

use crate::domains::TargetGroup;
use crate::rate_limiter::RateTier;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub groups: GroupsConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub warmup: WarmupConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

/// Session pool behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Lease TTL in seconds; leases not heartbeated within this window are
    /// reclaimed by the reaper.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// Default timeout for `browser_lease` acquisition.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// How often the reaper scans for expired leases and stale sessions.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,

    /// Consecutive dirty releases before a session is hard-recycled.
    #[serde(default = "default_three")]
    pub max_dirty_releases: u32,

    /// Consecutive warmup failures on one engine before escalating to the
    /// next engine in the fallback chain.
    #[serde(default = "default_three")]
    pub escalation_failure_threshold: u32,
}

/// Sizing and lifecycle policy for one target group.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    #[serde(default = "default_min_sessions")]
    pub min_sessions: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Maximum session age in seconds before hard recycle.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// Navigations a session may serve before hard recycle.
    #[serde(default = "default_navigation_cap")]
    pub navigation_cap: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupsConfig {
    #[serde(default = "default_search_group")]
    pub search_engines: GroupConfig,
    #[serde(default = "default_directory_group")]
    pub directories: GroupConfig,
    #[serde(default = "default_general_group")]
    pub general: GroupConfig,
}

impl GroupsConfig {
    pub fn for_group(&self, group: TargetGroup) -> &GroupConfig {
        match group {
            TargetGroup::SearchEngines => &self.search_engines,
            TargetGroup::Directories => &self.directories,
            TargetGroup::General => &self.general,
        }
    }
}

/// Rate limiter ceilings and per-tier spacing ranges (seconds).
#[derive(Debug, Clone, Deserialize)]
pub struct LimiterConfig {
    /// Global concurrent fetch ceiling across all domains.
    #[serde(default = "default_global_concurrency")]
    pub max_global_concurrency: usize,

    /// Concurrent fetches allowed against a single domain.
    #[serde(default = "default_one")]
    pub max_per_domain_concurrency: usize,

    #[serde(default)]
    pub spacing: SpacingConfig,

    /// Static tier assignments; anything absent falls back to tier C.
    #[serde(default)]
    pub domain_tiers: HashMap<String, RateTier>,
}

/// Min/max inter-request spacing per tier, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SpacingConfig {
    #[serde(default = "default_spacing_a")]
    pub a: [f64; 2],
    #[serde(default = "default_spacing_b")]
    pub b: [f64; 2],
    #[serde(default = "default_spacing_cg")]
    pub c: [f64; 2],
    #[serde(default = "default_spacing_cg")]
    pub d: [f64; 2],
    #[serde(default = "default_spacing_cg")]
    pub e: [f64; 2],
    #[serde(default = "default_spacing_cg")]
    pub f: [f64; 2],
    #[serde(default = "default_spacing_cg")]
    pub g: [f64; 2],
}

impl SpacingConfig {
    pub fn range(&self, tier: RateTier) -> (f64, f64) {
        let r = match tier {
            RateTier::A => self.a,
            RateTier::B => self.b,
            RateTier::C => self.c,
            RateTier::D => self.d,
            RateTier::E => self.e,
            RateTier::F => self.f,
            RateTier::G => self.g,
        };
        (r[0], r[1])
    }
}

/// Warmup plan generation and execution knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct WarmupConfig {
    /// Overall step count bounds for a generated plan.
    #[serde(default = "default_min_urls")]
    pub min_urls: usize,
    #[serde(default = "default_max_urls")]
    pub max_urls: usize,

    /// Probability that a fresh plan keeps its Tier-C steps at all.
    #[serde(default = "default_tier_c_probability")]
    pub tier_c_probability: f64,

    /// Probability of attempting cookie-consent dismissal after a
    /// successful navigation.
    #[serde(default = "default_consent_probability")]
    pub consent_probability: f64,

    /// Dwell-time multiplier for re-warm plans.
    #[serde(default = "default_rewarm_dwell_scale")]
    pub rewarm_dwell_scale: f64,

    /// Global dwell/pause multiplier. Tests set this to 0.0.
    #[serde(default = "default_one_f64")]
    pub dwell_scale: f64,

    /// Random pause between steps, in seconds.
    #[serde(default = "default_step_jitter")]
    pub step_jitter_secs: [f64; 2],
}

/// Display-server watchdog (headed engines only).
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default)]
    pub enabled: bool,
    /// X display backing headed browsers, e.g. ":99".
    #[serde(default = "default_display")]
    pub display: String,
    #[serde(default = "default_watchdog_interval")]
    pub interval_secs: u64,
    /// Consecutive probe failures before recovery is attempted.
    #[serde(default = "default_three")]
    pub failure_threshold: u32,
}

fn default_lease_ttl() -> u64 {
    90
}
fn default_acquire_timeout() -> u64 {
    30
}
fn default_reaper_interval() -> u64 {
    10
}
fn default_three() -> u32 {
    3
}
fn default_one() -> usize {
    1
}
fn default_one_f64() -> f64 {
    1.0
}
fn default_min_sessions() -> usize {
    1
}
fn default_max_sessions() -> usize {
    3
}
fn default_session_ttl() -> u64 {
    3600
}
fn default_navigation_cap() -> u64 {
    60
}
fn default_global_concurrency() -> usize {
    5
}
fn default_spacing_a() -> [f64; 2] {
    [3.0, 5.0]
}
fn default_spacing_b() -> [f64; 2] {
    [10.0, 10.0]
}
fn default_spacing_cg() -> [f64; 2] {
    [5.0, 6.0]
}
fn default_min_urls() -> usize {
    3
}
fn default_max_urls() -> usize {
    8
}
fn default_tier_c_probability() -> f64 {
    0.35
}
fn default_consent_probability() -> f64 {
    0.7
}
fn default_rewarm_dwell_scale() -> f64 {
    0.6
}
fn default_step_jitter() -> [f64; 2] {
    [0.5, 2.0]
}
fn default_display() -> String {
    ":99".to_string()
}
fn default_watchdog_interval() -> u64 {
    30
}

fn default_search_group() -> GroupConfig {
    GroupConfig {
        min_sessions: 1,
        max_sessions: 2,
        session_ttl_secs: 1800,
        navigation_cap: 40,
    }
}
fn default_directory_group() -> GroupConfig {
    GroupConfig {
        min_sessions: 1,
        max_sessions: 3,
        session_ttl_secs: 3600,
        navigation_cap: 80,
    }
}
fn default_general_group() -> GroupConfig {
    GroupConfig {
        min_sessions: 1,
        max_sessions: 4,
        session_ttl_secs: 2700,
        navigation_cap: 60,
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl(),
            acquire_timeout_secs: default_acquire_timeout(),
            reaper_interval_secs: default_reaper_interval(),
            max_dirty_releases: default_three(),
            escalation_failure_threshold: default_three(),
        }
    }
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            search_engines: default_search_group(),
            directories: default_directory_group(),
            general: default_general_group(),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_global_concurrency: default_global_concurrency(),
            max_per_domain_concurrency: default_one(),
            spacing: SpacingConfig::default(),
            domain_tiers: HashMap::new(),
        }
    }
}

impl Default for SpacingConfig {
    fn default() -> Self {
        Self {
            a: default_spacing_a(),
            b: default_spacing_b(),
            c: default_spacing_cg(),
            d: default_spacing_cg(),
            e: default_spacing_cg(),
            f: default_spacing_cg(),
            g: default_spacing_cg(),
        }
    }
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            min_urls: default_min_urls(),
            max_urls: default_max_urls(),
            tier_c_probability: default_tier_c_probability(),
            consent_probability: default_consent_probability(),
            rewarm_dwell_scale: default_rewarm_dwell_scale(),
            dwell_scale: default_one_f64(),
            step_jitter_secs: default_step_jitter(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            display: default_display(),
            interval_secs: default_watchdog_interval(),
            failure_threshold: default_three(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(String);

impl Config {
    /// Load from `config.toml` in the working directory, falling back to
    /// defaults if the file is missing or unparsable.
    pub fn load() -> Self {
        let path = Path::new("config.toml");
        if path.exists() {
            if let Ok(content) = fs::read_to_string(path) {
                match toml::from_str::<Config>(&content) {
                    Ok(cfg) => return cfg,
                    Err(e) => log::warn!("config.toml invalid, using defaults: {}", e),
                }
            }
        }
        Self::default()
    }

    /// Reject inconsistent settings before any service is constructed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limiter.max_global_concurrency == 0 {
            return Err(ConfigError("max_global_concurrency must be >= 1".into()));
        }
        if self.limiter.max_per_domain_concurrency == 0 {
            return Err(ConfigError(
                "max_per_domain_concurrency must be >= 1".into(),
            ));
        }
        for tier in RateTier::all() {
            let (lo, hi) = self.limiter.spacing.range(tier);
            if lo < 0.0 || lo > hi {
                return Err(ConfigError(format!(
                    "spacing range for tier {:?} must satisfy 0 <= min <= max",
                    tier
                )));
            }
        }
        if self.warmup.min_urls == 0 || self.warmup.min_urls > self.warmup.max_urls {
            return Err(ConfigError(
                "warmup url bounds must satisfy 1 <= min_urls <= max_urls".into(),
            ));
        }
        for p in [
            self.warmup.tier_c_probability,
            self.warmup.consent_probability,
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError("probabilities must be within [0, 1]".into()));
            }
        }
        if self.warmup.step_jitter_secs[0] > self.warmup.step_jitter_secs[1]
            || self.warmup.step_jitter_secs[0] < 0.0
        {
            return Err(ConfigError("step jitter range is inverted".into()));
        }
        if self.warmup.dwell_scale < 0.0 || self.warmup.rewarm_dwell_scale < 0.0 {
            return Err(ConfigError("dwell scales must be >= 0".into()));
        }
        for group in TargetGroup::all() {
            let g = self.groups.for_group(group);
            if g.max_sessions == 0 || g.min_sessions > g.max_sessions {
                return Err(ConfigError(format!(
                    "group {} session bounds must satisfy min <= max, max >= 1",
                    group.name()
                )));
            }
        }
        if self.pool.max_dirty_releases == 0 || self.pool.escalation_failure_threshold == 0 {
            return Err(ConfigError(
                "dirty-release and escalation thresholds must be >= 1".into(),
            ));
        }
        if self.watchdog.failure_threshold == 0 || self.watchdog.interval_secs == 0 {
            return Err(ConfigError(
                "watchdog interval and threshold must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
