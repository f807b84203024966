//! Browser session pool: lifecycle, leasing, target-group routing,
//! recycling and engine escalation.
//!
//! Sessions are warmed before their first lease and re-warmed after dirty
//! releases. A session carries at most one active lease; lease holders must
//! heartbeat or the reaper reclaims the lease unilaterally. Pool operations
//! fail soft (`None`/`false`) so callers own their retry policy.

use crate::config::Config;
use crate::domains::{normalize_domain, TargetGroup};
use crate::driver::{BrowserDriver, DriverFactory, EngineType};
use crate::metrics::MetricsTracker;
use crate::quarantine::DomainQuarantine;
use crate::warmup::{Viability, WarmupPlanExecutor, WarmupPlanFactory};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Warming,
    Ready,
    Leased,
    Recycling,
    Dead,
}

struct Session {
    id: String,
    engine: EngineType,
    state: SessionState,
    group: TargetGroup,
    created_at: Instant,
    navigations: u64,
    dirty_streak: u32,
    // None while the browser is still launching.
    driver: Option<Arc<dyn BrowserDriver>>,
}

/// Handle for one granted session. The holder must heartbeat within the
/// lease TTL or the reaper reclaims the session.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: String,
    pub session_id: String,
    pub domain: String,
    pub group: TargetGroup,
    pub requester: String,
    pub engine: EngineType,
    pub expires_at: Instant,
}

/// Point-in-time pool snapshot for operators.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub sessions_total: usize,
    pub sessions_warming: usize,
    pub sessions_ready: usize,
    pub sessions_leased: usize,
    pub active_leases: usize,
    pub group_engines: HashMap<String, String>,
}

struct EngineTrack {
    engine: EngineType,
    consecutive_failures: u32,
}

struct PoolState {
    sessions: HashMap<String, Session>,
    leases: HashMap<String, Lease>,
    engines: HashMap<TargetGroup, EngineTrack>,
    shutting_down: bool,
}

pub struct SessionPool {
    config: Config,
    factory: Arc<dyn DriverFactory>,
    plan_factory: Arc<WarmupPlanFactory>,
    executor: Arc<WarmupPlanExecutor>,
    quarantine: Arc<DomainQuarantine>,
    metrics: Arc<MetricsTracker>,
    state: Mutex<PoolState>,
    ready_notify: Notify,
    shutdown_notify: Notify,
}

impl SessionPool {
    pub fn new(
        config: Config,
        factory: Arc<dyn DriverFactory>,
        plan_factory: Arc<WarmupPlanFactory>,
        executor: Arc<WarmupPlanExecutor>,
        quarantine: Arc<DomainQuarantine>,
        metrics: Arc<MetricsTracker>,
    ) -> Arc<Self> {
        let mut engines = HashMap::new();
        for group in TargetGroup::all() {
            engines.insert(
                group,
                EngineTrack {
                    engine: EngineType::HeadlessChrome,
                    consecutive_failures: 0,
                },
            );
        }
        Arc::new(Self {
            config,
            factory,
            plan_factory,
            executor,
            quarantine,
            metrics,
            state: Mutex::new(PoolState {
                sessions: HashMap::new(),
                leases: HashMap::new(),
                engines,
                shutting_down: false,
            }),
            ready_notify: Notify::new(),
            shutdown_notify: Notify::new(),
        })
    }

    /// Pre-warm each group to its minimum and start the reaper.
    pub fn start(self: &Arc<Self>) {
        for group in TargetGroup::all() {
            let min = self.config.groups.for_group(group).min_sessions;
            for _ in 0..min {
                self.spawn_fresh_session(group);
            }
        }
        let pool = self.clone();
        tokio::spawn(async move { pool.run_reaper().await });
        log::info!("session pool started");
    }

    /// Stop background work and close every browser.
    pub fn shutdown(self: &Arc<Self>) {
        let drivers: Vec<Arc<dyn BrowserDriver>> = {
            let mut st = self.state.lock().unwrap();
            st.shutting_down = true;
            st.leases.clear();
            st.sessions
                .drain()
                .filter_map(|(_, s)| s.driver)
                .collect()
        };
        self.shutdown_notify.notify_waiters();
        self.ready_notify.notify_waiters();
        if let Ok(handle) = Handle::try_current() {
            for driver in drivers {
                handle.spawn(async move {
                    let _ = driver.close().await;
                });
            }
        }
        log::info!("session pool shut down");
    }

    /// Lease a ready session from the domain's target group, waiting up to
    /// `timeout` for one to warm up. Returns `None` on timeout or when the
    /// domain is quarantined.
    pub async fn acquire_session(
        self: &Arc<Self>,
        domain: &str,
        requester: &str,
        timeout: Duration,
    ) -> Option<Lease> {
        let domain = normalize_domain(domain);
        if self.quarantine.is_quarantined(&domain) {
            self.metrics.record_lease_denied("quarantined");
            return None;
        }
        let group = TargetGroup::for_domain(&domain);
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.ready_notify.notified();

            if let Some(lease) = self.try_lease(group, &domain, requester) {
                log::debug!(
                    "lease {} granted on session {} for {}",
                    lease.id,
                    lease.session_id,
                    domain
                );
                return Some(lease);
            }
            self.grow_if_below_max(group);

            if Instant::now() >= deadline {
                self.metrics.record_lease_denied("timeout");
                return None;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    self.metrics.record_lease_denied("timeout");
                    return None;
                }
            }
        }
    }

    fn try_lease(&self, group: TargetGroup, domain: &str, requester: &str) -> Option<Lease> {
        let mut st = self.state.lock().unwrap();
        if st.shutting_down {
            return None;
        }
        let session = st
            .sessions
            .values_mut()
            .find(|s| s.group == group && s.state == SessionState::Ready)?;
        session.state = SessionState::Leased;

        let lease = Lease {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            domain: domain.to_string(),
            group,
            requester: requester.to_string(),
            engine: session.engine,
            expires_at: Instant::now() + Duration::from_secs(self.config.pool.lease_ttl_secs),
        };
        st.leases.insert(lease.id.clone(), lease.clone());
        drop(st);

        self.metrics.record_lease_granted();
        Some(lease)
    }

    /// Driver behind a lease; `None` once the lease expired or was
    /// reclaimed.
    pub fn get_driver(&self, lease: &Lease) -> Option<Arc<dyn BrowserDriver>> {
        let st = self.state.lock().unwrap();
        let current = st.leases.get(&lease.id)?;
        if current.expires_at <= Instant::now() {
            return None;
        }
        st.sessions.get(&lease.session_id)?.driver.clone()
    }

    /// Extend the lease TTL. Returns false for unknown or reclaimed leases.
    pub fn heartbeat(&self, lease: &Lease) -> bool {
        let mut st = self.state.lock().unwrap();
        match st.leases.get_mut(&lease.id) {
            Some(current) => {
                current.expires_at =
                    Instant::now() + Duration::from_secs(self.config.pool.lease_ttl_secs);
                true
            }
            None => false,
        }
    }

    /// Count one navigation against the leased session's cap.
    pub fn record_navigation(&self, lease: &Lease) {
        let mut st = self.state.lock().unwrap();
        if let Some(session) = st.sessions.get_mut(&lease.session_id) {
            session.navigations += 1;
        }
    }

    /// Return the session. A dirty release soft-recycles the session; the
    /// configured number of consecutive dirty releases hard-recycles it.
    pub fn release_session(self: &Arc<Self>, lease: &Lease, dirty: bool) {
        let mut st = self.state.lock().unwrap();
        if st.leases.remove(&lease.id).is_none() {
            // Already reclaimed by the reaper.
            return;
        }
        let Some(session) = st.sessions.get_mut(&lease.session_id) else {
            return;
        };
        let session_id = session.id.clone();
        let group = session.group;

        if dirty {
            session.dirty_streak += 1;
            let streak = session.dirty_streak;
            if streak >= self.config.pool.max_dirty_releases {
                log::warn!(
                    "session {} hit {} consecutive dirty releases, hard recycling",
                    session_id,
                    streak
                );
                drop(st);
                self.hard_recycle(&session_id, group, true);
            } else {
                session.state = SessionState::Warming;
                drop(st);
                self.metrics.record_soft_recycle();
                self.spawn_rewarm(&session_id, group);
            }
            return;
        }

        session.dirty_streak = 0;
        let over_cap = session.navigations
            >= self.config.groups.for_group(group).navigation_cap
            || session.created_at.elapsed()
                >= Duration::from_secs(self.config.groups.for_group(group).session_ttl_secs);
        if over_cap {
            drop(st);
            self.hard_recycle(&session_id, group, true);
        } else {
            session.state = SessionState::Ready;
            drop(st);
            self.ready_notify.notify_waiters();
        }
    }

    /// Scoped acquisition with the configured default timeout. The guard
    /// releases the lease on drop, on every exit path.
    pub async fn browser_lease(
        self: &Arc<Self>,
        domain: &str,
        requester: &str,
    ) -> Option<BrowserLease> {
        let timeout = Duration::from_secs(self.config.pool.acquire_timeout_secs);
        let lease = self.acquire_session(domain, requester, timeout).await?;
        let driver = self.get_driver(&lease)?;
        Some(BrowserLease {
            pool: self.clone(),
            lease,
            driver,
            dirty: false,
            released: false,
        })
    }

    /// Hard-recycle every headed session. Wired to the display watchdog's
    /// recovery callback: a restarted display orphans headed browsers.
    pub fn invalidate_headed_sessions(self: &Arc<Self>) {
        let targets: Vec<(String, TargetGroup)> = {
            let st = self.state.lock().unwrap();
            st.sessions
                .values()
                .filter(|s| s.engine.is_headed() && s.state != SessionState::Dead)
                .map(|s| (s.id.clone(), s.group))
                .collect()
        };
        if !targets.is_empty() {
            log::warn!(
                "display recovered, invalidating {} headed session(s)",
                targets.len()
            );
        }
        for (id, group) in targets {
            self.hard_recycle(&id, group, true);
        }
    }

    pub fn get_stats(&self) -> PoolStats {
        let st = self.state.lock().unwrap();
        let count = |state: SessionState| {
            st.sessions.values().filter(|s| s.state == state).count()
        };
        PoolStats {
            sessions_total: st.sessions.len(),
            sessions_warming: count(SessionState::Warming),
            sessions_ready: count(SessionState::Ready),
            sessions_leased: count(SessionState::Leased),
            active_leases: st.leases.len(),
            group_engines: st
                .engines
                .iter()
                .map(|(g, t)| (g.name().to_string(), t.engine.name().to_string()))
                .collect(),
        }
    }

    pub fn get_metrics_summary(&self) -> String {
        self.metrics.summary()
    }

    // ---- internals ----

    fn grow_if_below_max(self: &Arc<Self>, group: TargetGroup) {
        let should_grow = {
            let st = self.state.lock().unwrap();
            if st.shutting_down {
                false
            } else {
                let alive = st
                    .sessions
                    .values()
                    .filter(|s| s.group == group && s.state != SessionState::Dead)
                    .count();
                alive < self.config.groups.for_group(group).max_sessions
            }
        };
        if should_grow {
            self.spawn_fresh_session(group);
        }
    }

    /// Destroy a session and, when asked, spawn its replacement.
    fn hard_recycle(self: &Arc<Self>, session_id: &str, group: TargetGroup, replace: bool) {
        let driver = {
            let mut st = self.state.lock().unwrap();
            match st.sessions.remove(session_id) {
                Some(session) => session.driver,
                None => return,
            }
        };
        self.metrics.record_hard_recycle();
        if let (Some(driver), Ok(handle)) = (driver, Handle::try_current()) {
            handle.spawn(async move {
                let _ = driver.close().await;
            });
        }
        if replace {
            self.maybe_replace(group);
        }
    }

    fn maybe_replace(self: &Arc<Self>, group: TargetGroup) {
        let below_min = {
            let st = self.state.lock().unwrap();
            if st.shutting_down {
                return;
            }
            let alive = st
                .sessions
                .values()
                .filter(|s| s.group == group && s.state != SessionState::Dead)
                .count();
            alive < self.config.groups.for_group(group).min_sessions
        };
        if below_min {
            self.spawn_fresh_session(group);
        }
    }

    /// Launch a browser on the group's current engine and warm it with a
    /// fresh plan.
    fn spawn_fresh_session(self: &Arc<Self>, group: TargetGroup) {
        let (session_id, engine) = {
            let mut st = self.state.lock().unwrap();
            if st.shutting_down {
                return;
            }
            let engine = st
                .engines
                .get(&group)
                .map(|t| t.engine)
                .unwrap_or(EngineType::HeadlessChrome);
            let id = Uuid::new_v4().to_string();
            st.sessions.insert(
                id.clone(),
                Session {
                    id: id.clone(),
                    engine,
                    state: SessionState::Warming,
                    group,
                    created_at: Instant::now(),
                    navigations: 0,
                    dirty_streak: 0,
                    driver: None,
                },
            );
            (id, engine)
        };

        let Ok(handle) = Handle::try_current() else {
            self.state.lock().unwrap().sessions.remove(&session_id);
            return;
        };
        let pool = self.clone();
        handle.spawn(async move {
            let driver = match pool.factory.launch(engine).await {
                Ok(driver) => driver,
                Err(e) => {
                    log::error!("{} launch failed for {}: {}", engine.name(), group.name(), e);
                    pool.state.lock().unwrap().sessions.remove(&session_id);
                    pool.note_engine_failure(group);
                    return;
                }
            };

            let plan = pool.plan_factory.create_plan();
            let result = pool.executor.execute(&plan, &driver).await;
            match result.viability {
                Viability::Ready | Viability::Degraded => {
                    if result.viability == Viability::Ready {
                        pool.metrics.record_warmup_ready();
                    } else {
                        pool.metrics.record_warmup_degraded();
                    }
                    pool.promote(&session_id, driver, group);
                }
                Viability::Failed => {
                    pool.metrics.record_warmup_failed();
                    let _ = driver.close().await;
                    pool.state.lock().unwrap().sessions.remove(&session_id);
                    pool.note_engine_failure(group);
                }
            }
        });
    }

    /// Re-warm an existing session after a dirty release. A failed re-warm
    /// hard-recycles the session.
    fn spawn_rewarm(self: &Arc<Self>, session_id: &str, group: TargetGroup) {
        let driver = {
            let st = self.state.lock().unwrap();
            st.sessions.get(session_id).and_then(|s| s.driver.clone())
        };
        let Some(driver) = driver else {
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let session_id = session_id.to_string();
        let pool = self.clone();
        handle.spawn(async move {
            let plan = pool.plan_factory.create_rewarm_plan();
            let result = pool.executor.execute(&plan, &driver).await;
            match result.viability {
                Viability::Ready | Viability::Degraded => {
                    pool.promote(&session_id, driver, group);
                }
                Viability::Failed => {
                    log::warn!("rewarm failed for session {}", session_id);
                    pool.metrics.record_warmup_failed();
                    pool.hard_recycle(&session_id, group, true);
                }
            }
        });
    }

    fn promote(&self, session_id: &str, driver: Arc<dyn BrowserDriver>, group: TargetGroup) {
        {
            let mut st = self.state.lock().unwrap();
            let Some(session) = st.sessions.get_mut(session_id) else {
                return;
            };
            session.driver = Some(driver);
            session.state = SessionState::Ready;
            if let Some(track) = st.engines.get_mut(&group) {
                track.consecutive_failures = 0;
            }
        }
        self.ready_notify.notify_waiters();
    }

    /// Bump the group's failure streak and escalate its engine once the
    /// threshold is hit.
    fn note_engine_failure(&self, group: TargetGroup) {
        let mut st = self.state.lock().unwrap();
        let Some(track) = st.engines.get_mut(&group) else {
            return;
        };
        track.consecutive_failures += 1;
        if track.consecutive_failures >= self.config.pool.escalation_failure_threshold {
            let failures = track.consecutive_failures;
            track.consecutive_failures = 0;
            let next = track.engine.fallback();
            if next != track.engine {
                log::warn!(
                    "escalating {} engine {} -> {} after {} consecutive failures",
                    group.name(),
                    track.engine.name(),
                    next.name(),
                    failures
                );
                track.engine = next;
                drop(st);
                self.metrics.record_escalation();
            }
        }
    }

    async fn run_reaper(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.pool.reaper_interval_secs);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown_notify.notified() => return,
            }
            self.reap_expired_leases();
            self.reap_stale_sessions();
            for group in TargetGroup::all() {
                self.maybe_replace(group);
            }
        }
    }

    /// Reclaim leases whose holders stopped heartbeating. The abandoned
    /// session is treated like a dirty release.
    fn reap_expired_leases(self: &Arc<Self>) {
        let now = Instant::now();
        let expired: Vec<Lease> = {
            let mut st = self.state.lock().unwrap();
            let ids: Vec<String> = st
                .leases
                .values()
                .filter(|l| l.expires_at <= now)
                .map(|l| l.id.clone())
                .collect();
            ids.iter().filter_map(|id| st.leases.remove(id)).collect()
        };
        for lease in expired {
            log::warn!(
                "lease {} on session {} expired without heartbeat, reclaiming",
                lease.id,
                lease.session_id
            );
            self.metrics.record_lease_expired();
            let streak = {
                let mut st = self.state.lock().unwrap();
                st.sessions.get_mut(&lease.session_id).map(|s| {
                    s.dirty_streak += 1;
                    s.state = SessionState::Warming;
                    s.dirty_streak
                })
            };
            match streak {
                Some(streak) if streak >= self.config.pool.max_dirty_releases => {
                    self.hard_recycle(&lease.session_id, lease.group, true);
                }
                Some(_) => {
                    self.metrics.record_soft_recycle();
                    self.spawn_rewarm(&lease.session_id, lease.group);
                }
                None => {}
            }
        }
    }

    /// Hard-recycle idle sessions past their group TTL or navigation cap.
    fn reap_stale_sessions(self: &Arc<Self>) {
        let stale: Vec<(String, TargetGroup)> = {
            let st = self.state.lock().unwrap();
            st.sessions
                .values()
                .filter(|s| {
                    s.state == SessionState::Ready && {
                        let g = self.config.groups.for_group(s.group);
                        s.navigations >= g.navigation_cap
                            || s.created_at.elapsed()
                                >= Duration::from_secs(g.session_ttl_secs)
                    }
                })
                .map(|s| (s.id.clone(), s.group))
                .collect()
        };
        for (id, group) in stale {
            log::info!("session {} aged out, hard recycling", id);
            self.hard_recycle(&id, group, true);
        }
    }
}

/// RAII lease guard from [`SessionPool::browser_lease`]. Dropping the guard
/// releases the session; call [`BrowserLease::mark_dirty`] first when the
/// work ended badly.
pub struct BrowserLease {
    pool: Arc<SessionPool>,
    lease: Lease,
    driver: Arc<dyn BrowserDriver>,
    dirty: bool,
    released: bool,
}

impl BrowserLease {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn driver(&self) -> &Arc<dyn BrowserDriver> {
        &self.driver
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn heartbeat(&self) -> bool {
        self.pool.heartbeat(&self.lease)
    }

    pub fn record_navigation(&self) {
        self.pool.record_navigation(&self.lease);
    }

    /// Release explicitly instead of at drop.
    pub fn release(mut self, dirty: bool) {
        self.dirty = self.dirty || dirty;
        self.released = true;
        self.pool.release_session(&self.lease, self.dirty);
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release_session(&self.lease, self.dirty);
        }
    }
}
