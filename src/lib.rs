// Library interface for stealth_fetcher
// This allows integration tests and external crates to use the pool components

pub mod config;
pub mod domains;
pub mod driver;
pub mod metrics;
pub mod pool;
pub mod quarantine;
pub mod rate_limiter;
pub mod warmup;
pub mod watchdog;

pub use config::Config;
pub use domains::{normalize_domain, TargetGroup};
pub use driver::{BrowserDriver, ChromeDriverFactory, DriverError, DriverFactory, EngineType};
pub use metrics::MetricsTracker;
pub use pool::{BrowserLease, Lease, SessionPool};
pub use quarantine::{DomainQuarantine, QuarantineReason};
pub use rate_limiter::{RateLimiter, RateTier};
pub use warmup::{WarmupPlanExecutor, WarmupPlanFactory};
pub use watchdog::{DisplayWatchdog, XvfbProbe};
