//! Randomized warmup plan generation.
//!
//! Plans are built from weighted blueprints (ordered tier letters), sampled
//! against the decoy catalog without domain reuse, padded with tier-A filler
//! to the configured minimum, and shuffled to avoid a fixed tier-ordering
//! fingerprint. All randomness flows through one seedable generator so plan
//! generation is reproducible under test.

use super::{catalog, SiteTier, WarmupPlan, WarmupStep};
use crate::config::WarmupConfig;
use crate::domains::normalize_domain;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Blueprints for fresh sessions, with selection weights.
const FRESH_BLUEPRINTS: &[(&str, f64)] = &[
    ("SAB", 3.0),
    ("SABC", 2.0),
    ("SAAB", 1.5),
    ("SBAC", 1.0),
    ("ASB", 1.0),
];

/// Shorter catalog for re-warming a session that has already browsed.
/// Never includes tier C.
const REWARM_BLUEPRINTS: &[(&str, f64)] = &[("SA", 2.0), ("AB", 1.5), ("A", 1.0)];

pub struct WarmupPlanFactory {
    config: WarmupConfig,
    rng: Mutex<StdRng>,
}

impl WarmupPlanFactory {
    pub fn new(config: WarmupConfig) -> Self {
        Self::with_seed(config, rand::random())
    }

    /// Seeded variant for reproducible plans in tests.
    pub fn with_seed(config: WarmupConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Plan for a fresh session.
    pub fn create_plan(&self) -> WarmupPlan {
        self.build(false)
    }

    /// Shorter plan for re-warming a previously used session.
    pub fn create_rewarm_plan(&self) -> WarmupPlan {
        self.build(true)
    }

    fn build(&self, rewarm: bool) -> WarmupPlan {
        let mut rng = self.rng.lock().unwrap();

        let blueprints = if rewarm {
            REWARM_BLUEPRINTS
        } else {
            FRESH_BLUEPRINTS
        };
        let blueprint = blueprints
            .choose_weighted(&mut *rng, |item| item.1)
            .map(|item| item.0)
            .unwrap_or(blueprints[0].0);

        let keep_tier_c = !rewarm && rng.gen::<f64>() < self.config.tier_c_probability;
        let tiers: Vec<SiteTier> = blueprint
            .chars()
            .filter_map(SiteTier::from_letter)
            .filter(|t| *t != SiteTier::C || keep_tier_c)
            .collect();

        let mut used: HashSet<String> = HashSet::new();
        let mut tier_counts: HashMap<SiteTier, usize> = HashMap::new();
        let mut steps: Vec<WarmupStep> = Vec::new();

        for tier in tiers {
            let profile = catalog::profile(tier);
            if rng.gen::<f64>() >= profile.usage_probability {
                continue;
            }
            let taken = tier_counts.get(&tier).copied().unwrap_or(0);
            let cap_left = profile.session_cap.saturating_sub(taken);
            if cap_left == 0 {
                continue;
            }
            let want = if rewarm {
                rng.gen_range(1..=2usize)
            } else {
                rng.gen_range(profile.min_urls..=profile.max_urls)
            }
            .min(cap_left);

            for url in sample_urls(&mut rng, tier, want, &used) {
                used.insert(normalize_domain(&url));
                steps.push(make_step(&self.config, &mut rng, tier, url, rewarm));
                *tier_counts.entry(tier).or_insert(0) += 1;
            }
        }

        // Pad with tier-A filler up to the minimum. Re-warm plans stay
        // short by design but still need at least one step.
        let min_steps = if rewarm { 1 } else { self.config.min_urls };
        while steps.len() < min_steps {
            match sample_urls(&mut rng, SiteTier::A, 1, &used).into_iter().next() {
                Some(url) => {
                    used.insert(normalize_domain(&url));
                    steps.push(make_step(&self.config, &mut rng, SiteTier::A, url, rewarm));
                }
                None => {
                    log::warn!("tier A pool exhausted, plan stays below min_urls");
                    break;
                }
            }
        }
        if steps.len() > self.config.max_urls {
            steps.truncate(self.config.max_urls);
        }

        // Shuffle away the blueprint's tier ordering; a leading tier-S
        // step stays first.
        if steps.first().map(|s| s.tier) == Some(SiteTier::S) {
            steps[1..].shuffle(&mut *rng);
        } else {
            steps.shuffle(&mut *rng);
        }

        let domains: HashSet<String> =
            steps.iter().map(|s| normalize_domain(&s.url)).collect();
        let total_dwell = steps.iter().map(|s| s.dwell).sum();

        let plan = WarmupPlan {
            id: Uuid::new_v4().to_string(),
            blueprint: blueprint.to_string(),
            steps,
            rewarm,
            domains,
            total_dwell,
        };
        log::debug!(
            "built {} plan {} ({} steps, blueprint {})",
            if rewarm { "rewarm" } else { "fresh" },
            plan.id,
            plan.steps.len(),
            plan.blueprint
        );
        plan
    }
}

/// Draw up to `count` URLs from the tier's pool, excluding domains already
/// used by this plan. An exhausted pool yields fewer (possibly zero) URLs.
fn sample_urls(
    rng: &mut StdRng,
    tier: SiteTier,
    count: usize,
    used: &HashSet<String>,
) -> Vec<String> {
    let mut pool: Vec<&str> = catalog::sites(tier)
        .iter()
        .copied()
        .filter(|u| !used.contains(&normalize_domain(u)))
        .collect();
    pool.shuffle(rng);
    pool.into_iter().take(count).map(|s| s.to_string()).collect()
}

fn make_step(
    config: &WarmupConfig,
    rng: &mut StdRng,
    tier: SiteTier,
    url: String,
    rewarm: bool,
) -> WarmupStep {
    let p = catalog::profile(tier);
    let scroll = rng.gen::<f64>() < p.scroll_probability;
    let scroll_depth = if scroll {
        rng.gen_range(p.scroll_depth.0..=p.scroll_depth.1)
    } else {
        0.0
    };
    let click = rng.gen::<f64>() < p.click_probability;

    // dwell_scale is the executor's concern; plans carry unscaled dwell.
    let mut dwell = rng.gen_range(p.dwell_secs.0..=p.dwell_secs.1);
    if rewarm {
        dwell *= config.rewarm_dwell_scale;
    }

    WarmupStep {
        url,
        tier,
        scroll,
        scroll_depth,
        click,
        dwell: Duration::from_secs_f64(dwell),
    }
}
