//! Warmup plan execution against a live driver.
//!
//! Steps run strictly in order with randomized pauses between them. Every
//! failure mode is folded into the step's [`StepOutcome`]; the executor
//! itself never returns an error. After the last step the session gets a
//! viability verdict from [`assess_viability`].

use super::{
    SiteTier, StepExecutionResult, StepOutcome, Viability, WarmupExecutionResult, WarmupPlan,
    WarmupStep,
};
use crate::config::WarmupConfig;
use crate::driver::{BrowserDriver, DriverError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

/// Lowercased page-text fragments that mark a block or challenge page.
const BLOCK_KEYWORDS: &[&str] = &[
    "access denied",
    "verify you are human",
    "unusual traffic",
    "are you a robot",
    "attention required",
    "checking your browser",
    "request blocked",
    "rate limited",
];

/// Selectors for challenge widgets that may render with innocuous text.
const CAPTCHA_SELECTORS: &[&str] = &[
    "iframe[src*='recaptcha']",
    "iframe[src*='hcaptcha']",
    "iframe[src*='turnstile']",
    "#cf-challenge-running",
    ".cf-browser-verification",
];

/// Common cookie-consent accept buttons, tried in order.
const CONSENT_SELECTORS: &[&str] = &[
    "#onetrust-accept-btn-handler",
    "button[id*='accept-all']",
    "button[aria-label*='Accept']",
    "#L2AGLb",
    ".fc-cta-consent",
];

/// Step-by-step progress events, delivered best-effort to an optional
/// channel. A dropped receiver never affects execution.
#[derive(Debug, Clone)]
pub struct WarmupProgress {
    pub plan_id: String,
    pub step_index: usize,
    pub total_steps: usize,
    pub url: String,
    pub outcome: StepOutcome,
}

pub struct WarmupPlanExecutor {
    config: WarmupConfig,
    rng: Mutex<StdRng>,
    progress: Option<UnboundedSender<WarmupProgress>>,
}

impl WarmupPlanExecutor {
    pub fn new(config: WarmupConfig) -> Self {
        Self::with_seed(config, rand::random())
    }

    pub fn with_seed(config: WarmupConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            progress: None,
        }
    }

    /// Attach a progress channel. Send failures are ignored.
    pub fn with_progress(mut self, tx: UnboundedSender<WarmupProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Run every step of the plan against the driver. Individual step
    /// failures are recorded, never propagated.
    pub async fn execute(
        &self,
        plan: &WarmupPlan,
        driver: &Arc<dyn BrowserDriver>,
    ) -> WarmupExecutionResult {
        let started = Instant::now();
        let total = plan.steps.len();
        let mut results = Vec::with_capacity(total);

        log::info!(
            "executing {} plan {} ({} steps)",
            if plan.rewarm { "rewarm" } else { "warmup" },
            plan.id,
            total
        );

        let mut aborted = false;
        for (index, step) in plan.steps.iter().enumerate() {
            // A failed tier-S step already decides the verdict; the rest
            // of the plan is skipped rather than browsed for nothing.
            let result = if aborted {
                StepExecutionResult {
                    step: step.clone(),
                    outcome: StepOutcome::Skipped,
                    duration: Duration::ZERO,
                    error: None,
                    new_cookies: 0,
                }
            } else {
                if index > 0 {
                    let jitter = self.sample(|rng| {
                        rng.gen_range(
                            self.config.step_jitter_secs[0]..=self.config.step_jitter_secs[1],
                        )
                    });
                    self.pause(jitter).await;
                }
                self.run_step(step, driver).await
            };
            if !aborted
                && step.tier == SiteTier::S
                && result.outcome != StepOutcome::Success
            {
                log::warn!(
                    "critical step {} failed ({:?}), skipping the rest of plan {}",
                    step.url,
                    result.outcome,
                    plan.id
                );
                aborted = true;
            }
            log::debug!(
                "step {}/{} {} -> {:?} ({:.1}s)",
                index + 1,
                total,
                step.url,
                result.outcome,
                result.duration.as_secs_f64()
            );
            if let Some(tx) = &self.progress {
                let _ = tx.send(WarmupProgress {
                    plan_id: plan.id.clone(),
                    step_index: index,
                    total_steps: total,
                    url: step.url.clone(),
                    outcome: result.outcome,
                });
            }
            results.push(result);
        }

        let viability = assess_viability(&results);
        let total_new_cookies = results.iter().map(|r| r.new_cookies).sum();
        log::info!(
            "plan {} finished: {:?} ({:.0}% steps ok, {} new cookies)",
            plan.id,
            viability,
            results
                .iter()
                .filter(|r| r.outcome == StepOutcome::Success)
                .count() as f64
                / total.max(1) as f64
                * 100.0,
            total_new_cookies
        );

        WarmupExecutionResult {
            plan_id: plan.id.clone(),
            results,
            viability,
            total_duration: started.elapsed(),
            total_new_cookies,
        }
    }

    async fn run_step(
        &self,
        step: &WarmupStep,
        driver: &Arc<dyn BrowserDriver>,
    ) -> StepExecutionResult {
        let started = Instant::now();
        let cookies_before = driver.cookie_count().await.unwrap_or(0) as i64;
        let profile = step.tier.profile();
        let nav_timeout = Duration::from_secs(profile.nav_timeout_secs);

        let mut attempt = 0u32;
        let nav_error: Option<(StepOutcome, String)> = loop {
            match driver.navigate(&step.url, nav_timeout).await {
                Ok(()) => break None,
                Err(DriverError::Timeout(msg)) if attempt < profile.retry_budget => {
                    attempt += 1;
                    log::debug!("retrying {} after timeout ({})", step.url, msg);
                }
                Err(DriverError::Timeout(msg)) => break Some((StepOutcome::Timeout, msg)),
                Err(e) => break Some((StepOutcome::Error, e.to_string())),
            }
        };
        if let Some((outcome, error)) = nav_error {
            return self.finish_step(step, outcome, started, Some(error), driver, cookies_before)
                .await;
        }

        if self.detect_block(driver).await {
            log::warn!("block page detected on {}", step.url);
            return self
                .finish_step(step, StepOutcome::Blocked, started, None, driver, cookies_before)
                .await;
        }

        let try_consent =
            self.sample(|rng| rng.gen::<f64>() < self.config.consent_probability);
        if try_consent {
            self.dismiss_consent(driver).await;
        }

        if step.scroll {
            self.scroll_page(driver, step.scroll_depth).await;
        }
        if step.click {
            self.follow_internal_link(driver).await;
        }

        if let Ok(title) = driver.title().await {
            log::trace!("visited {} ({})", step.url, title);
        }

        // Remaining dwell after the interaction time already spent.
        let spent = started.elapsed();
        let dwell = step.dwell.mul_f64(self.config.dwell_scale.max(0.0));
        if dwell > spent {
            tokio::time::sleep(dwell - spent).await;
        }

        self.finish_step(step, StepOutcome::Success, started, None, driver, cookies_before)
            .await
    }

    async fn finish_step(
        &self,
        step: &WarmupStep,
        outcome: StepOutcome,
        started: Instant,
        error: Option<String>,
        driver: &Arc<dyn BrowserDriver>,
        cookies_before: i64,
    ) -> StepExecutionResult {
        let cookies_after = driver.cookie_count().await.unwrap_or(0) as i64;
        StepExecutionResult {
            step: step.clone(),
            outcome,
            duration: started.elapsed(),
            error,
            new_cookies: (cookies_after - cookies_before).max(0),
        }
    }

    /// Keyword scan of the visible text plus challenge-widget probes.
    async fn detect_block(&self, driver: &Arc<dyn BrowserDriver>) -> bool {
        if let Ok(text) = driver.visible_text().await {
            let text = text.to_lowercase();
            if BLOCK_KEYWORDS.iter().any(|kw| text.contains(kw)) {
                return true;
            }
        }
        for selector in CAPTCHA_SELECTORS {
            if driver.has_selector(selector).await.unwrap_or(false) {
                return true;
            }
        }
        false
    }

    /// Click the first consent button that exists. Absence is the normal
    /// case and not an error.
    async fn dismiss_consent(&self, driver: &Arc<dyn BrowserDriver>) {
        for selector in CONSENT_SELECTORS {
            if driver.has_selector(selector).await.unwrap_or(false) {
                if driver.click(selector).await.is_ok() {
                    log::debug!("dismissed consent via {}", selector);
                    self.pause(self.sample(|rng| rng.gen_range(0.3..=0.8))).await;
                }
                return;
            }
        }
    }

    /// Scroll down in human-sized increments with short pauses, sometimes
    /// scrolling partway back up.
    async fn scroll_page(&self, driver: &Arc<dyn BrowserDriver>, depth: f64) {
        let total_pixels = (depth.clamp(0.0, 1.0) * 2400.0) as i64;
        let mut scrolled = 0i64;
        while scrolled < total_pixels {
            let increment = self.sample(|rng| rng.gen_range(250..=600));
            if driver.scroll_by(increment).await.is_err() {
                return;
            }
            scrolled += increment;
            self.pause(self.sample(|rng| rng.gen_range(0.2..=0.7))).await;
        }
        let scroll_back = self.sample(|rng| rng.gen::<f64>() < 0.2);
        if scroll_back {
            let _ = driver.scroll_by(-(total_pixels / 3)).await;
        }
    }

    /// Visit one same-origin link and come back.
    async fn follow_internal_link(&self, driver: &Arc<dyn BrowserDriver>) {
        let links = match driver.internal_links().await {
            Ok(links) if !links.is_empty() => links,
            _ => return,
        };
        let href = self.sample(|rng| links.choose(rng).cloned());
        let Some(href) = href else { return };

        let selector = format!("a[href=\"{}\"]", href);
        if driver.click(&selector).await.is_ok() {
            self.pause(self.sample(|rng| rng.gen_range(1.0..=3.0))).await;
            if driver.go_back().await.is_ok() {
                self.pause(self.sample(|rng| rng.gen_range(0.5..=1.5))).await;
            }
        }
    }

    async fn pause(&self, secs: f64) {
        let scaled = secs * self.config.dwell_scale;
        if scaled > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(scaled)).await;
        }
    }

    fn sample<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap();
        f(&mut rng)
    }
}

/// Session verdict from the step results.
///
/// A tier-S failure of any kind fails the plan outright. Otherwise the plan
/// is ready at >= 80% step success, degraded at >= 50% with at most one
/// tier-A failure, and failed below that. Skipped steps count against the
/// rate.
pub fn assess_viability(results: &[StepExecutionResult]) -> Viability {
    if results.is_empty() {
        return Viability::Failed;
    }
    let tier_s_failed = results
        .iter()
        .any(|r| r.step.tier == SiteTier::S && r.outcome != StepOutcome::Success);
    if tier_s_failed {
        return Viability::Failed;
    }

    let successes = results
        .iter()
        .filter(|r| r.outcome == StepOutcome::Success)
        .count();
    let rate = successes as f64 / results.len() as f64;
    let tier_a_failures = results
        .iter()
        .filter(|r| r.step.tier == SiteTier::A && r.outcome != StepOutcome::Success)
        .count();

    if rate >= 0.8 {
        Viability::Ready
    } else if rate >= 0.5 && tier_a_failures <= 1 {
        Viability::Degraded
    } else {
        Viability::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Driver whose behavior is keyed on URL substrings: "slow" times out,
    /// "broken" errors, "challenge" serves a block page, anything else
    /// succeeds and sets a cookie.
    struct MockDriver {
        current: Mutex<String>,
        cookies: AtomicUsize,
        navigations: AtomicUsize,
    }

    impl MockDriver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                current: Mutex::new(String::new()),
                cookies: AtomicUsize::new(0),
                navigations: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BrowserDriver for MockDriver {
        async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), DriverError> {
            self.navigations.fetch_add(1, Ordering::SeqCst);
            if url.contains("slow") {
                return Err(DriverError::Timeout(url.to_string()));
            }
            if url.contains("broken") {
                return Err(DriverError::Navigation("connection refused".into()));
            }
            *self.current.lock().unwrap() = url.to_string();
            self.cookies.fetch_add(2, Ordering::SeqCst);
            Ok(())
        }

        async fn title(&self) -> Result<String, DriverError> {
            Ok("mock".into())
        }

        async fn visible_text(&self) -> Result<String, DriverError> {
            let current = self.current.lock().unwrap().clone();
            if current.contains("challenge") {
                Ok("Attention Required! One more step: verify you are human".into())
            } else {
                Ok("Welcome to the mock page with plenty of content".into())
            }
        }

        async fn has_selector(&self, _selector: &str) -> Result<bool, DriverError> {
            Ok(false)
        }

        async fn click(&self, _selector: &str) -> Result<(), DriverError> {
            Ok(())
        }

        async fn internal_links(&self) -> Result<Vec<String>, DriverError> {
            Ok(vec![])
        }

        async fn go_back(&self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn scroll_by(&self, _pixels: i64) -> Result<(), DriverError> {
            Ok(())
        }

        async fn cookie_count(&self) -> Result<usize, DriverError> {
            Ok(self.cookies.load(Ordering::SeqCst))
        }

        async fn close(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    fn instant_config() -> WarmupConfig {
        WarmupConfig {
            dwell_scale: 0.0,
            step_jitter_secs: [0.0, 0.0],
            ..WarmupConfig::default()
        }
    }

    fn step(url: &str, tier: SiteTier) -> WarmupStep {
        WarmupStep {
            url: url.to_string(),
            tier,
            scroll: false,
            scroll_depth: 0.0,
            click: false,
            dwell: Duration::from_secs(5),
        }
    }

    fn plan(steps: Vec<WarmupStep>) -> WarmupPlan {
        let domains = steps
            .iter()
            .map(|s| crate::domains::normalize_domain(&s.url))
            .collect();
        let total_dwell = steps.iter().map(|s| s.dwell).sum();
        WarmupPlan {
            id: "test-plan".into(),
            blueprint: "SA".into(),
            steps,
            rewarm: false,
            domains,
            total_dwell,
        }
    }

    fn result(tier: SiteTier, outcome: StepOutcome) -> StepExecutionResult {
        StepExecutionResult {
            step: step("https://example.com", tier),
            outcome,
            duration: Duration::from_secs(1),
            error: None,
            new_cookies: 0,
        }
    }

    #[tokio::test]
    async fn test_all_good_steps_yield_ready() {
        let executor = WarmupPlanExecutor::with_seed(instant_config(), 1);
        let driver: Arc<dyn BrowserDriver> = MockDriver::new();
        let plan = plan(vec![
            step("https://www.google.com", SiteTier::S),
            step("https://en.wikipedia.org", SiteTier::A),
            step("https://www.bbc.com", SiteTier::A),
        ]);

        let result = executor.execute(&plan, &driver).await;
        assert_eq!(result.viability, Viability::Ready);
        assert!(result.results.iter().all(|r| r.outcome == StepOutcome::Success));
        assert!(result.total_new_cookies > 0);
    }

    #[tokio::test]
    async fn test_block_page_marks_step_blocked() {
        let executor = WarmupPlanExecutor::with_seed(instant_config(), 2);
        let driver: Arc<dyn BrowserDriver> = MockDriver::new();
        let plan = plan(vec![step("https://challenge.example.com", SiteTier::A)]);

        let result = executor.execute(&plan, &driver).await;
        assert_eq!(result.results[0].outcome, StepOutcome::Blocked);
    }

    #[tokio::test]
    async fn test_tier_s_timeout_fails_plan() {
        let executor = WarmupPlanExecutor::with_seed(instant_config(), 3);
        let driver: Arc<dyn BrowserDriver> = MockDriver::new();
        let plan = plan(vec![
            step("https://slow.example.com", SiteTier::S),
            step("https://en.wikipedia.org", SiteTier::A),
            step("https://www.bbc.com", SiteTier::A),
        ]);

        let result = executor.execute(&plan, &driver).await;
        assert_eq!(result.results[0].outcome, StepOutcome::Timeout);
        assert_eq!(result.viability, Viability::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dwell_scale_is_applied_exactly_once() {
        // An 8s-dwell step at scale 0.5 must dwell ~4s, not 2s.
        let config = WarmupConfig {
            dwell_scale: 0.5,
            step_jitter_secs: [0.0, 0.0],
            consent_probability: 0.0,
            ..WarmupConfig::default()
        };
        let executor = WarmupPlanExecutor::with_seed(config, 9);
        let driver: Arc<dyn BrowserDriver> = MockDriver::new();
        let mut long_step = step("https://en.wikipedia.org", SiteTier::A);
        long_step.dwell = Duration::from_secs(8);
        let plan = plan(vec![long_step]);

        let result = executor.execute(&plan, &driver).await;
        let dwelled = result.results[0].duration;
        assert!(
            dwelled >= Duration::from_secs(4) && dwelled < Duration::from_secs(5),
            "8s step at scale 0.5 should dwell ~4s, got {:.2}s",
            dwelled.as_secs_f64()
        );
    }

    #[tokio::test]
    async fn test_tier_s_failure_skips_remaining_steps() {
        let executor = WarmupPlanExecutor::with_seed(instant_config(), 8);
        let mock = MockDriver::new();
        let driver: Arc<dyn BrowserDriver> = mock.clone();
        let plan = plan(vec![
            step("https://slow.google.com", SiteTier::S),
            step("https://en.wikipedia.org", SiteTier::A),
            step("https://www.bbc.com", SiteTier::A),
        ]);

        let result = executor.execute(&plan, &driver).await;
        assert_eq!(result.results[0].outcome, StepOutcome::Timeout);
        assert_eq!(result.results[1].outcome, StepOutcome::Skipped);
        assert_eq!(result.results[2].outcome, StepOutcome::Skipped);
        assert_eq!(result.viability, Viability::Failed);
        // Only the critical step touched the browser.
        assert_eq!(mock.navigations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_navigation_error_recorded_not_propagated() {
        let executor = WarmupPlanExecutor::with_seed(instant_config(), 4);
        let driver: Arc<dyn BrowserDriver> = MockDriver::new();
        let plan = plan(vec![
            step("https://www.google.com", SiteTier::S),
            step("https://broken.example.com", SiteTier::B),
            step("https://en.wikipedia.org", SiteTier::A),
            step("https://www.bbc.com", SiteTier::A),
            step("https://news.ycombinator.com", SiteTier::A),
        ]);

        let result = executor.execute(&plan, &driver).await;
        assert_eq!(result.results[1].outcome, StepOutcome::Error);
        assert!(result.results[1].error.is_some());
        // 4/5 success keeps the session ready.
        assert_eq!(result.viability, Viability::Ready);
    }

    #[tokio::test]
    async fn test_tier_a_timeout_gets_one_retry() {
        let executor = WarmupPlanExecutor::with_seed(instant_config(), 5);
        let mock = MockDriver::new();
        let driver: Arc<dyn BrowserDriver> = mock.clone();
        let plan = plan(vec![step("https://slow.example.com", SiteTier::A)]);

        let result = executor.execute(&plan, &driver).await;
        assert_eq!(result.results[0].outcome, StepOutcome::Timeout);
        // Initial attempt plus the tier-A retry.
        assert_eq!(mock.navigations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_progress_events_cover_every_step() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let executor = WarmupPlanExecutor::with_seed(instant_config(), 6).with_progress(tx);
        let driver: Arc<dyn BrowserDriver> = MockDriver::new();
        let plan = plan(vec![
            step("https://www.google.com", SiteTier::S),
            step("https://en.wikipedia.org", SiteTier::A),
        ]);

        let _ = executor.execute(&plan, &driver).await;

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].step_index, 0);
        assert_eq!(events[1].step_index, 1);
        assert!(events.iter().all(|e| e.total_steps == 2));
    }

    #[test]
    fn test_viability_empty_results_fail() {
        assert_eq!(assess_viability(&[]), Viability::Failed);
    }

    #[test]
    fn test_viability_all_blocked_fails() {
        let results: Vec<_> = (0..5)
            .map(|_| result(SiteTier::A, StepOutcome::Blocked))
            .collect();
        assert_eq!(assess_viability(&results), Viability::Failed);
    }

    #[test]
    fn test_viability_high_rate_is_ready() {
        let mut results: Vec<_> = (0..9)
            .map(|_| result(SiteTier::B, StepOutcome::Success))
            .collect();
        results.push(result(SiteTier::A, StepOutcome::Timeout));
        assert_eq!(assess_viability(&results), Viability::Ready);
    }

    #[test]
    fn test_viability_middling_rate_is_degraded() {
        let results = vec![
            result(SiteTier::S, StepOutcome::Success),
            result(SiteTier::A, StepOutcome::Success),
            result(SiteTier::B, StepOutcome::Timeout),
            result(SiteTier::A, StepOutcome::Error),
        ];
        assert_eq!(assess_viability(&results), Viability::Degraded);
    }

    #[test]
    fn test_viability_two_tier_a_failures_fail_a_middling_plan() {
        let results = vec![
            result(SiteTier::S, StepOutcome::Success),
            result(SiteTier::B, StepOutcome::Success),
            result(SiteTier::A, StepOutcome::Timeout),
            result(SiteTier::A, StepOutcome::Error),
        ];
        assert_eq!(assess_viability(&results), Viability::Failed);
    }

    #[test]
    fn test_viability_skipped_steps_count_against_rate() {
        let results = vec![
            result(SiteTier::A, StepOutcome::Success),
            result(SiteTier::B, StepOutcome::Skipped),
            result(SiteTier::B, StepOutcome::Skipped),
        ];
        // 1/3 success rate.
        assert_eq!(assess_viability(&results), Viability::Failed);
    }
}
