use log::{error, info};
use std::sync::Arc;
use stealth_fetcher::config::Config;
use stealth_fetcher::driver::ChromeDriverFactory;
use stealth_fetcher::metrics::MetricsTracker;
use stealth_fetcher::pool::SessionPool;
use stealth_fetcher::quarantine::DomainQuarantine;
use stealth_fetcher::rate_limiter::RateLimiter;
use stealth_fetcher::warmup::{WarmupPlanExecutor, WarmupPlanFactory};
use stealth_fetcher::watchdog::{DisplayWatchdog, XvfbProbe};

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = Config::load();
    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    let quarantine = Arc::new(DomainQuarantine::new());
    let metrics = Arc::new(MetricsTracker::new());
    let limiter = Arc::new(RateLimiter::new(config.limiter.clone()));
    let plan_factory = Arc::new(WarmupPlanFactory::new(config.warmup.clone()));
    let executor = Arc::new(WarmupPlanExecutor::new(config.warmup.clone()));
    let driver_factory = Arc::new(ChromeDriverFactory::new());

    let pool = SessionPool::new(
        config.clone(),
        driver_factory,
        plan_factory,
        executor,
        quarantine,
        metrics,
    );
    pool.start();
    info!(
        "pool online ({} global fetch slots, {} rate tiers configured)",
        limiter.available_global_slots(),
        config.limiter.domain_tiers.len()
    );

    let watchdog = if config.watchdog.enabled {
        let probe = Arc::new(XvfbProbe::new(&config.watchdog.display));
        let watchdog = DisplayWatchdog::new(config.watchdog.clone(), probe);
        let pool_for_hook = pool.clone();
        watchdog.set_recovery_hook(move || pool_for_hook.invalidate_headed_sessions());
        watchdog.start();
        Some(watchdog)
    } else {
        None
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
    }
    info!("shutting down");
    if let Some(watchdog) = &watchdog {
        watchdog.shutdown();
    }
    pool.shutdown();
    info!("{}", pool.get_metrics_summary());
}
