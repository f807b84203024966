//! Session warmup: randomized decoy browsing that makes a fresh browser
//! session look organically used before it is trusted with real traffic.
//!
//! A [`WarmupPlanFactory`] builds a randomized, non-repeating sequence of
//! decoy-site visits; a [`WarmupPlanExecutor`] runs the plan against a live
//! driver, detects blocks, simulates human behavior and scores the session's
//! viability.

pub mod catalog;
pub mod executor;
pub mod factory;

pub use catalog::TierProfile;
pub use executor::{assess_viability, WarmupPlanExecutor, WarmupProgress};
pub use factory::WarmupPlanFactory;

use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;

/// Decoy-site risk/importance class. Tier S sites (search engines) are
/// critical: a single tier-S failure fails the whole plan. Tiers A-C are
/// progressively less important filler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SiteTier {
    S,
    A,
    B,
    C,
}

impl SiteTier {
    pub fn letter(self) -> char {
        match self {
            SiteTier::S => 'S',
            SiteTier::A => 'A',
            SiteTier::B => 'B',
            SiteTier::C => 'C',
        }
    }

    pub fn from_letter(c: char) -> Option<SiteTier> {
        match c {
            'S' => Some(SiteTier::S),
            'A' => Some(SiteTier::A),
            'B' => Some(SiteTier::B),
            'C' => Some(SiteTier::C),
            _ => None,
        }
    }

    pub fn profile(self) -> &'static TierProfile {
        catalog::profile(self)
    }
}

/// One decoy visit with its randomized behavior parameters.
#[derive(Debug, Clone, Serialize)]
pub struct WarmupStep {
    pub url: String,
    pub tier: SiteTier,
    pub scroll: bool,
    /// Fraction of the page to scroll through when `scroll` is set.
    pub scroll_depth: f64,
    pub click: bool,
    pub dwell: Duration,
}

/// An ordered decoy-browsing sequence for one session.
#[derive(Debug, Clone)]
pub struct WarmupPlan {
    pub id: String,
    /// Tier letters of the chosen blueprint, e.g. "SAB".
    pub blueprint: String,
    pub steps: Vec<WarmupStep>,
    pub rewarm: bool,
    /// Normalized domains visited by this plan.
    pub domains: HashSet<String>,
    pub total_dwell: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepOutcome {
    Success,
    Timeout,
    Blocked,
    Error,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct StepExecutionResult {
    pub step: WarmupStep,
    pub outcome: StepOutcome,
    pub duration: Duration,
    pub error: Option<String>,
    /// Net new cookies observed across the step.
    pub new_cookies: i64,
}

/// Executor verdict on whether the warmed session is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Viability {
    Ready,
    Degraded,
    Failed,
}

#[derive(Debug)]
pub struct WarmupExecutionResult {
    pub plan_id: String,
    pub results: Vec<StepExecutionResult>,
    pub viability: Viability,
    pub total_duration: Duration,
    pub total_new_cookies: i64,
}

impl WarmupExecutionResult {
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        let successes = self
            .results
            .iter()
            .filter(|r| r.outcome == StepOutcome::Success)
            .count();
        successes as f64 / self.results.len() as f64
    }
}
