//! Built-in decoy-site catalog and per-tier behavior profiles.
//!
//! Tier timeouts follow risk: tier S is strict (it gates the verdict),
//! tier B sites are slow and get the longest budget, tier C is throwaway
//! filler with the shortest. Only tier A earns a retry.

use super::SiteTier;

/// Static behavior envelope for one tier. Probabilities are per-step;
/// dwell and depth are sampled uniformly from the given ranges.
#[derive(Debug, Clone)]
pub struct TierProfile {
    /// URL count bounds when the tier is sampled for a fresh plan.
    pub min_urls: usize,
    pub max_urls: usize,
    /// Hard cap on steps this tier may contribute to one plan.
    pub session_cap: usize,
    /// Probability the tier is used at all when it appears in a blueprint.
    pub usage_probability: f64,
    /// Seconds spent on the page.
    pub dwell_secs: (f64, f64),
    pub scroll_probability: f64,
    pub scroll_depth: (f64, f64),
    pub click_probability: f64,
    pub nav_timeout_secs: u64,
    /// Timeout retries allowed for this tier.
    pub retry_budget: u32,
}

static TIER_S: TierProfile = TierProfile {
    min_urls: 1,
    max_urls: 1,
    session_cap: 1,
    usage_probability: 1.0,
    dwell_secs: (2.0, 5.0),
    scroll_probability: 0.3,
    scroll_depth: (0.2, 0.4),
    click_probability: 0.0,
    nav_timeout_secs: 8,
    retry_budget: 0,
};

static TIER_A: TierProfile = TierProfile {
    min_urls: 1,
    max_urls: 3,
    session_cap: 4,
    usage_probability: 0.9,
    dwell_secs: (4.0, 10.0),
    scroll_probability: 0.8,
    scroll_depth: (0.3, 0.8),
    click_probability: 0.3,
    nav_timeout_secs: 15,
    retry_budget: 1,
};

static TIER_B: TierProfile = TierProfile {
    min_urls: 1,
    max_urls: 2,
    session_cap: 3,
    usage_probability: 0.7,
    dwell_secs: (5.0, 12.0),
    scroll_probability: 0.7,
    scroll_depth: (0.3, 0.9),
    click_probability: 0.25,
    nav_timeout_secs: 20,
    retry_budget: 0,
};

static TIER_C: TierProfile = TierProfile {
    min_urls: 1,
    max_urls: 2,
    session_cap: 2,
    usage_probability: 0.5,
    dwell_secs: (2.0, 6.0),
    scroll_probability: 0.5,
    scroll_depth: (0.2, 0.5),
    click_probability: 0.1,
    nav_timeout_secs: 6,
    retry_budget: 0,
};

pub fn profile(tier: SiteTier) -> &'static TierProfile {
    match tier {
        SiteTier::S => &TIER_S,
        SiteTier::A => &TIER_A,
        SiteTier::B => &TIER_B,
        SiteTier::C => &TIER_C,
    }
}

const SITES_S: &[&str] = &[
    "https://www.google.com",
    "https://www.bing.com",
    "https://duckduckgo.com",
];

const SITES_A: &[&str] = &[
    "https://en.wikipedia.org",
    "https://www.reddit.com",
    "https://news.ycombinator.com",
    "https://www.bbc.com",
    "https://www.nytimes.com",
    "https://www.theguardian.com",
    "https://www.cnn.com",
];

const SITES_B: &[&str] = &[
    "https://www.amazon.com",
    "https://www.ebay.com",
    "https://www.imdb.com",
    "https://stackoverflow.com",
    "https://github.com",
    "https://www.etsy.com",
];

const SITES_C: &[&str] = &[
    "https://www.weather.com",
    "https://www.espn.com",
    "https://www.quora.com",
    "https://www.twitch.tv",
    "https://www.pinterest.com",
];

/// Decoy URL pool for a tier. Each entry is a distinct registrable domain.
pub fn sites(tier: SiteTier) -> &'static [&'static str] {
    match tier {
        SiteTier::S => SITES_S,
        SiteTier::A => SITES_A,
        SiteTier::B => SITES_B,
        SiteTier::C => SITES_C,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::normalize_domain;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_domains_are_unique_within_tier() {
        for tier in [SiteTier::S, SiteTier::A, SiteTier::B, SiteTier::C] {
            let pool = sites(tier);
            let domains: HashSet<String> =
                pool.iter().map(|u| normalize_domain(u)).collect();
            assert_eq!(
                domains.len(),
                pool.len(),
                "tier {:?} pool has duplicate domains",
                tier
            );
        }
    }

    #[test]
    fn test_profiles_are_internally_consistent() {
        for tier in [SiteTier::S, SiteTier::A, SiteTier::B, SiteTier::C] {
            let p = profile(tier);
            assert!(p.min_urls >= 1 && p.min_urls <= p.max_urls);
            assert!(p.max_urls <= p.session_cap);
            assert!(p.dwell_secs.0 <= p.dwell_secs.1);
            assert!((0.0..=1.0).contains(&p.usage_probability));
            assert!(p.max_urls <= sites(tier).len());
        }
    }

    #[test]
    fn test_tier_s_is_single_strict_visit() {
        let p = profile(SiteTier::S);
        assert_eq!(p.session_cap, 1);
        assert_eq!(p.retry_budget, 0);
        assert_eq!(p.click_probability, 0.0);
    }
}
