//! Display-server watchdog for headed browser engines.
//!
//! Headed Chrome needs a live X display (Xvfb in production). The watchdog
//! probes it on an interval; after enough consecutive failures it tries a
//! managed restart, then a direct start that clears stale lock state. On
//! recovery it fires a hook so the pool can invalidate headed sessions,
//! whose browsers died with the old display.

use crate::config::WatchdogConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Notify;

/// Probe and recovery actions for one display. Implemented by [`XvfbProbe`]
/// in production and by scripted mocks in tests.
#[async_trait]
pub trait DisplayProbe: Send + Sync {
    /// True when the display answers.
    async fn check(&self) -> bool;
    /// Restart through the process supervisor.
    async fn restart_managed(&self) -> bool;
    /// Last resort: clear stale lock state and start the server directly.
    async fn start_direct(&self) -> bool;
}

/// Xvfb probe using `xdpyinfo` for health and `pkill`/`Xvfb` for recovery.
pub struct XvfbProbe {
    display: String,
}

impl XvfbProbe {
    pub fn new(display: &str) -> Self {
        Self {
            display: display.to_string(),
        }
    }

    /// Stale lock file Xvfb refuses to start over, e.g. `/tmp/.X99-lock`.
    fn lock_path(&self) -> String {
        format!("/tmp/.X{}-lock", self.display.trim_start_matches(':'))
    }

    async fn spawn_server(&self) -> bool {
        let spawned = Command::new("Xvfb")
            .arg(&self.display)
            .arg("-screen")
            .arg("0")
            .arg("1920x1080x24")
            .spawn();
        match spawned {
            Ok(_) => {
                tokio::time::sleep(Duration::from_secs(2)).await;
                true
            }
            Err(e) => {
                log::error!("failed to spawn Xvfb on {}: {}", self.display, e);
                false
            }
        }
    }
}

#[async_trait]
impl DisplayProbe for XvfbProbe {
    async fn check(&self) -> bool {
        Command::new("xdpyinfo")
            .env("DISPLAY", &self.display)
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    async fn restart_managed(&self) -> bool {
        let killed = Command::new("pkill")
            .arg("-f")
            .arg(format!("Xvfb {}", self.display))
            .status()
            .await
            .is_ok();
        if killed {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        self.spawn_server().await
    }

    async fn start_direct(&self) -> bool {
        if let Err(e) = tokio::fs::remove_file(self.lock_path()).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("could not clear {}: {}", self.lock_path(), e);
            }
        }
        self.spawn_server().await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStatus {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub total_recoveries: u64,
}

type RecoveryHook = Box<dyn Fn() + Send + Sync>;

pub struct DisplayWatchdog {
    config: WatchdogConfig,
    probe: Arc<dyn DisplayProbe>,
    status: Mutex<WatchdogStatus>,
    recovery_hook: Mutex<Option<RecoveryHook>>,
    shutdown_notify: Notify,
}

impl DisplayWatchdog {
    pub fn new(config: WatchdogConfig, probe: Arc<dyn DisplayProbe>) -> Arc<Self> {
        Arc::new(Self {
            config,
            probe,
            status: Mutex::new(WatchdogStatus {
                healthy: true,
                consecutive_failures: 0,
                total_recoveries: 0,
            }),
            recovery_hook: Mutex::new(None),
            shutdown_notify: Notify::new(),
        })
    }

    /// Hook invoked after a successful recovery. Used by the pool to
    /// invalidate headed sessions.
    pub fn set_recovery_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.recovery_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn status(&self) -> WatchdogStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn start(self: &Arc<Self>) {
        let watchdog = self.clone();
        tokio::spawn(async move { watchdog.run().await });
        log::info!(
            "display watchdog started for {} ({}s interval)",
            self.config.display,
            self.config.interval_secs
        );
    }

    pub fn shutdown(&self) {
        self.shutdown_notify.notify_waiters();
    }

    async fn run(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.interval_secs);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown_notify.notified() => return,
            }
            self.tick().await;
        }
    }

    /// One probe round, escalating into recovery at the failure threshold.
    pub async fn tick(&self) {
        if self.probe.check().await {
            let mut status = self.status.lock().unwrap();
            status.healthy = true;
            status.consecutive_failures = 0;
            return;
        }

        let failures = {
            let mut status = self.status.lock().unwrap();
            status.healthy = false;
            status.consecutive_failures += 1;
            status.consecutive_failures
        };
        log::warn!(
            "display {} probe failed ({}/{})",
            self.config.display,
            failures,
            self.config.failure_threshold
        );
        if failures < self.config.failure_threshold {
            return;
        }

        if self.recover().await {
            {
                let mut status = self.status.lock().unwrap();
                status.healthy = true;
                status.consecutive_failures = 0;
                status.total_recoveries += 1;
            }
            log::warn!("display {} recovered", self.config.display);
            if let Some(hook) = self.recovery_hook.lock().unwrap().as_ref() {
                hook();
            }
        } else {
            log::error!(
                "display {} recovery exhausted, headed sessions unusable",
                self.config.display
            );
        }
    }

    async fn recover(&self) -> bool {
        log::warn!("attempting managed restart of {}", self.config.display);
        if self.probe.restart_managed().await && self.probe.check().await {
            return true;
        }
        log::warn!("managed restart failed, starting {} directly", self.config.display);
        self.probe.start_direct().await && self.probe.check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Probe that fails its first `failures_before_recovery` checks, then
    /// succeeds once a restart has been attempted.
    struct ScriptedProbe {
        checks: AtomicUsize,
        restarted: AtomicBool,
        managed_restart_works: bool,
        direct_start_works: bool,
    }

    impl ScriptedProbe {
        fn new(managed: bool, direct: bool) -> Arc<Self> {
            Arc::new(Self {
                checks: AtomicUsize::new(0),
                restarted: AtomicBool::new(false),
                managed_restart_works: managed,
                direct_start_works: direct,
            })
        }
    }

    #[async_trait]
    impl DisplayProbe for ScriptedProbe {
        async fn check(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.restarted.load(Ordering::SeqCst)
        }

        async fn restart_managed(&self) -> bool {
            if self.managed_restart_works {
                self.restarted.store(true, Ordering::SeqCst);
            }
            self.managed_restart_works
        }

        async fn start_direct(&self) -> bool {
            if self.direct_start_works {
                self.restarted.store(true, Ordering::SeqCst);
            }
            self.direct_start_works
        }
    }

    fn config(threshold: u32) -> WatchdogConfig {
        WatchdogConfig {
            enabled: true,
            display: ":99".into(),
            interval_secs: 30,
            failure_threshold: threshold,
        }
    }

    #[tokio::test]
    async fn test_recovery_after_threshold_fires_hook() {
        let probe = ScriptedProbe::new(true, false);
        let watchdog = DisplayWatchdog::new(config(3), probe);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        watchdog.set_recovery_hook(move || flag.store(true, Ordering::SeqCst));

        watchdog.tick().await;
        watchdog.tick().await;
        assert!(!fired.load(Ordering::SeqCst), "recovered before threshold");
        assert_eq!(watchdog.status().consecutive_failures, 2);

        watchdog.tick().await;
        assert!(fired.load(Ordering::SeqCst));
        let status = watchdog.status();
        assert!(status.healthy);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.total_recoveries, 1);
    }

    #[tokio::test]
    async fn test_direct_start_is_the_fallback() {
        let probe = ScriptedProbe::new(false, true);
        let watchdog = DisplayWatchdog::new(config(1), probe);

        watchdog.tick().await;
        let status = watchdog.status();
        assert!(status.healthy);
        assert_eq!(status.total_recoveries, 1);
    }

    #[tokio::test]
    async fn test_exhausted_recovery_leaves_unhealthy() {
        let probe = ScriptedProbe::new(false, false);
        let watchdog = DisplayWatchdog::new(config(1), probe);

        watchdog.tick().await;
        let status = watchdog.status();
        assert!(!status.healthy);
        assert_eq!(status.total_recoveries, 0);
    }

    #[tokio::test]
    async fn test_healthy_display_resets_failure_streak() {
        let probe = ScriptedProbe::new(true, false);
        let watchdog = DisplayWatchdog::new(config(5), probe.clone());

        watchdog.tick().await;
        watchdog.tick().await;
        assert_eq!(watchdog.status().consecutive_failures, 2);

        probe.restarted.store(true, Ordering::SeqCst);
        watchdog.tick().await;
        let status = watchdog.status();
        assert!(status.healthy);
        assert_eq!(status.consecutive_failures, 0);
    }
}
