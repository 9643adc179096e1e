//! Backend pool: live targets per named backend, with round-robin selection.
//!
//! Each backend gets a background task that re-resolves its targets and
//! swaps in a new live list. Readers take a snapshot (`Arc` clone) of the
//! list, so a refresh is either fully visible or not visible at all.
//! Targets that survive a refresh keep their handle; handles of removed
//! targets are dropped from the list and close once the last in-flight
//! request holding a clone finishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kedge_config::{BackendConfig, PoolConfig};

use crate::error::{PoolError, PoolResult, ResolveResult};
use crate::resolver::{self, Resolver, Target};
use crate::upstream::{Connector, Dialer};

/// Refresh timing bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub min_refresh: Duration,
    pub max_refresh: Duration,
    pub error_backoff_max: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for PoolOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            min_refresh: config.min_refresh,
            max_refresh: config.max_refresh,
            error_backoff_max: config.error_backoff_max,
        }
    }
}

struct LiveTarget<H> {
    address: String,
    deadline: Instant,
    handle: H,
}

/// Runtime state of one backend.
struct PoolEntry<C: Connector> {
    name: String,
    resolver: Arc<dyn Resolver>,
    dialer: Arc<Dialer>,
    live: RwLock<Arc<Vec<LiveTarget<C::Handle>>>>,
    cursor: AtomicUsize,
    /// Serializes refreshes so only one writer builds the next list.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl<C: Connector> PoolEntry<C> {
    fn snapshot(&self) -> Arc<Vec<LiveTarget<C::Handle>>> {
        Arc::clone(&self.live.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn select(&self) -> PoolResult<C::Handle> {
        let live = self.snapshot();
        if live.is_empty() {
            return Err(PoolError::NoLiveTargets(self.name.clone()));
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % live.len();
        Ok(live[idx].handle.clone())
    }

    /// Resolve and swap in the new live list. Returns the earliest deadline.
    async fn refresh(&self, connector: &C) -> ResolveResult<Option<Instant>> {
        let _guard = self.refresh_lock.lock().await;
        let resolved = self.resolver.resolve().await?;
        Ok(self.reconcile(connector, resolved))
    }

    fn reconcile(&self, connector: &C, resolved: Vec<Target>) -> Option<Instant> {
        let current = self.snapshot();
        let mut next = Vec::with_capacity(resolved.len());
        let mut added = 0usize;

        for target in resolved {
            let handle = match current.iter().find(|t| t.address == target.address) {
                Some(existing) => existing.handle.clone(),
                None => match connector.connect(&self.name, &target.address, &self.dialer) {
                    Ok(handle) => {
                        added += 1;
                        debug!(backend = %self.name, address = %target.address, "target added");
                        handle
                    }
                    Err(e) => {
                        warn!(backend = %self.name, address = %target.address, error = %e, "skipping target");
                        continue;
                    }
                },
            };
            next.push(LiveTarget {
                address: target.address,
                deadline: target.deadline,
                handle,
            });
        }

        for old in current.iter() {
            if !next.iter().any(|t| t.address == old.address) {
                debug!(backend = %self.name, address = %old.address, "target removed");
            }
        }

        let earliest = next.iter().map(|t| t.deadline).min();
        if added > 0 || next.len() != current.len() {
            info!(backend = %self.name, live = next.len(), "backend targets updated");
        }
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        earliest
    }
}

/// Wait computation for a refresh loop.
///
/// After a success the next refresh happens when the earliest target
/// expires, clamped to the configured bounds. After a failure the wait
/// doubles from `min_refresh` up to `error_backoff_max`.
#[derive(Debug)]
struct RefreshSchedule {
    options: PoolOptions,
    current_backoff: Duration,
}

impl RefreshSchedule {
    fn new(options: PoolOptions) -> Self {
        Self {
            options,
            current_backoff: options.min_refresh,
        }
    }

    fn on_success(&mut self, earliest: Option<Instant>, now: Instant) -> Duration {
        self.current_backoff = self.options.min_refresh;
        let wait = match earliest {
            Some(deadline) => deadline.saturating_duration_since(now),
            None => self.options.min_refresh,
        };
        wait.min(self.options.max_refresh).max(self.options.min_refresh)
    }

    fn on_failure(&mut self) -> Duration {
        let wait = self.current_backoff;
        self.current_backoff = (self.current_backoff * 2)
            .min(self.options.error_backoff_max)
            .max(self.options.min_refresh);
        wait
    }
}

/// Pooled targets for every configured backend of one protocol.
pub struct BackendPool<C: Connector> {
    entries: HashMap<String, Arc<PoolEntry<C>>>,
    connector: Arc<C>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Connector> BackendPool<C> {
    /// Build resolvers from configuration, resolve each backend once and
    /// start the refresh tasks.
    pub async fn start(
        backends: &[BackendConfig],
        connector: C,
        options: PoolOptions,
    ) -> PoolResult<Self> {
        let mut with_resolvers = Vec::with_capacity(backends.len());
        for backend in backends {
            let resolver = resolver::from_config(backend).map_err(|source| PoolError::Resolver {
                backend: backend.name.clone(),
                source,
            })?;
            with_resolvers.push((backend.clone(), resolver));
        }
        Self::with_resolvers(with_resolvers, connector, options).await
    }

    /// Like [`start`](Self::start) with caller-provided resolvers.
    pub async fn with_resolvers(
        backends: Vec<(BackendConfig, Arc<dyn Resolver>)>,
        connector: C,
        options: PoolOptions,
    ) -> PoolResult<Self> {
        let connector = Arc::new(connector);
        let mut entries: HashMap<String, Arc<PoolEntry<C>>> =
            HashMap::with_capacity(backends.len());

        for (backend, resolver) in backends {
            let dialer = connector
                .dialer(&backend)
                .map_err(|source| PoolError::Upstream {
                    backend: backend.name.clone(),
                    source,
                })?;
            if !backend.middleware.is_empty() {
                debug!(backend = %backend.name, count = backend.middleware.len(), "middleware configured but not applied");
            }
            let entry = Arc::new(PoolEntry {
                name: backend.name.clone(),
                resolver,
                dialer: Arc::new(dialer),
                live: RwLock::new(Arc::new(Vec::new())),
                cursor: AtomicUsize::new(0),
                refresh_lock: tokio::sync::Mutex::new(()),
            });
            entries.insert(backend.name, entry);
        }

        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks = Vec::with_capacity(entries.len());
        for entry in entries.values() {
            let mut schedule = RefreshSchedule::new(options);
            let first_wait = match entry.refresh(connector.as_ref()).await {
                Ok(earliest) => schedule.on_success(earliest, Instant::now()),
                Err(e) => {
                    warn!(backend = %entry.name, error = %e, "initial resolution failed");
                    schedule.on_failure()
                }
            };

            let entry = Arc::clone(entry);
            let connector = Arc::clone(&connector);
            let shutdown_rx = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                run_refresh_loop(entry, connector, schedule, first_wait, shutdown_rx).await;
            }));
        }

        info!(backends = entries.len(), "backend pool started");
        Ok(Self {
            entries,
            connector,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    /// Next handle for `name`, round-robin over its live targets.
    pub fn get(&self, name: &str) -> PoolResult<C::Handle> {
        self.entries
            .get(name)
            .ok_or_else(|| PoolError::UnknownBackend(name.to_string()))?
            .select()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Force one resolution of `name` now. Returns the live target count.
    pub async fn refresh(&self, name: &str) -> PoolResult<usize> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| PoolError::UnknownBackend(name.to_string()))?;
        entry
            .refresh(self.connector.as_ref())
            .await
            .map_err(|source| PoolError::Resolver {
                backend: name.to_string(),
                source,
            })?;
        Ok(entry.snapshot().len())
    }

    /// Addresses currently live for `name`, in selection order.
    pub fn targets(&self, name: &str) -> Option<Vec<String>> {
        self.entries
            .get(name)
            .map(|e| e.snapshot().iter().map(|t| t.address.clone()).collect())
    }

    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop all refresh tasks. Live targets stay usable.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl<C: Connector> Drop for BackendPool<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_refresh_loop<C: Connector>(
    entry: Arc<PoolEntry<C>>,
    connector: Arc<C>,
    mut schedule: RefreshSchedule,
    first_wait: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut wait = first_wait;
    debug!(backend = %entry.name, ?wait, "refresh loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                wait = match entry.refresh(connector.as_ref()).await {
                    Ok(earliest) => schedule.on_success(earliest, Instant::now()),
                    Err(e) => {
                        let wait = schedule.on_failure();
                        warn!(backend = %entry.name, error = %e, retry_in = ?wait, "resolution failed, keeping previous targets");
                        wait
                    }
                };
            }
            _ = shutdown.changed() => {
                debug!(backend = %entry.name, "refresh loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kedge_config::{Balancer, ResolverConfig};
    use std::io;

    use crate::error::{ResolveError, UpstreamError};

    /// Resolver whose answer the test changes between refreshes.
    struct ScriptedResolver {
        answer: Mutex<Result<Vec<String>, String>>,
        ttl: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedResolver {
        fn new(addresses: &[&str]) -> Arc<Self> {
            Self::with_ttl(addresses, Duration::from_secs(30))
        }

        fn with_ttl(addresses: &[&str], ttl: Duration) -> Arc<Self> {
            Arc::new(Self {
                answer: Mutex::new(Ok(addresses.iter().map(|a| a.to_string()).collect())),
                ttl,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set(&self, addresses: &[&str]) {
            *self.answer.lock().unwrap() = Ok(addresses.iter().map(|a| a.to_string()).collect());
        }

        fn fail(&self) {
            *self.answer.lock().unwrap() = Err("resolver down".into());
        }
    }

    #[async_trait]
    impl Resolver for ScriptedResolver {
        async fn resolve(&self) -> ResolveResult<Vec<Target>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let deadline = Instant::now() + self.ttl;
            match &*self.answer.lock().unwrap() {
                Ok(addresses) => Ok(addresses
                    .iter()
                    .map(|a| Target::new(a.clone(), deadline))
                    .collect()),
                Err(msg) => Err(ResolveError::Lookup {
                    name: "scripted".into(),
                    source: io::Error::other(msg.clone()),
                }),
            }
        }
    }

    /// Hands out the target address itself.
    struct AddressConnector;

    impl Connector for AddressConnector {
        type Handle = String;

        fn dialer(&self, _backend: &BackendConfig) -> Result<Dialer, UpstreamError> {
            Ok(Dialer::plain())
        }

        fn connect(
            &self,
            _backend: &str,
            address: &str,
            _dialer: &Arc<Dialer>,
        ) -> Result<String, UpstreamError> {
            Ok(address.to_string())
        }
    }

    fn make_backend(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            resolver: ResolverConfig::Srv {
                dns_name: format!("_http._tcp.{name}.test.local"),
            },
            balancer: Balancer::RoundRobin,
            security: None,
            middleware: Vec::new(),
        }
    }

    async fn make_pool(
        name: &str,
        resolver: Arc<ScriptedResolver>,
    ) -> BackendPool<AddressConnector> {
        make_pool_with(name, resolver, PoolOptions::default()).await
    }

    async fn make_pool_with(
        name: &str,
        resolver: Arc<ScriptedResolver>,
        options: PoolOptions,
    ) -> BackendPool<AddressConnector> {
        BackendPool::with_resolvers(
            vec![(make_backend(name), resolver as Arc<dyn Resolver>)],
            AddressConnector,
            options,
        )
        .await
        .unwrap()
    }

    fn make_options(min: u64, max: u64, backoff_max: u64) -> PoolOptions {
        PoolOptions {
            min_refresh: Duration::from_secs(min),
            max_refresh: Duration::from_secs(max),
            error_backoff_max: Duration::from_secs(backoff_max),
        }
    }

    #[tokio::test]
    async fn round_robin_gives_each_target_equal_share() {
        let resolver = ScriptedResolver::new(&["a:80", "b:80", "c:80"]);
        let pool = make_pool("api", resolver).await;

        let k = 4;
        let picks: Vec<String> = (0..3 * k).map(|_| pool.get("api").unwrap()).collect();

        for target in ["a:80", "b:80", "c:80"] {
            assert_eq!(picks.iter().filter(|p| *p == target).count(), k);
        }
        assert_eq!(&picks[..3], &["a:80", "b:80", "c:80"]);
        assert_eq!(&picks[3..6], &["a:80", "b:80", "c:80"]);
    }

    #[tokio::test]
    async fn unknown_backend() {
        let pool = make_pool("api", ScriptedResolver::new(&["a:80"])).await;
        assert!(matches!(pool.get("ghost"), Err(PoolError::UnknownBackend(n)) if n == "ghost"));
        assert!(!pool.contains("ghost"));
    }

    #[tokio::test]
    async fn empty_live_set_fails_fast() {
        let pool = make_pool("api", ScriptedResolver::new(&[])).await;
        assert!(matches!(pool.get("api"), Err(PoolError::NoLiveTargets(_))));
    }

    #[tokio::test]
    async fn failed_initial_resolution_starts_empty() {
        let resolver = ScriptedResolver::new(&["a:80"]);
        resolver.fail();
        let pool = make_pool("api", Arc::clone(&resolver)).await;
        assert!(matches!(pool.get("api"), Err(PoolError::NoLiveTargets(_))));

        resolver.set(&["a:80"]);
        assert_eq!(pool.refresh("api").await.unwrap(), 1);
        assert_eq!(pool.get("api").unwrap(), "a:80");
    }

    #[tokio::test]
    async fn refresh_replaces_targets() {
        let resolver = ScriptedResolver::new(&["a:80", "b:80"]);
        let pool = make_pool("api", Arc::clone(&resolver)).await;

        resolver.set(&["b:80", "c:80"]);
        pool.refresh("api").await.unwrap();

        assert_eq!(pool.targets("api").unwrap(), vec!["b:80", "c:80"]);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_targets() {
        let resolver = ScriptedResolver::new(&["a:80", "b:80"]);
        let pool = make_pool("api", Arc::clone(&resolver)).await;

        resolver.fail();
        assert!(matches!(pool.refresh("api").await, Err(PoolError::Resolver { .. })));
        assert_eq!(pool.targets("api").unwrap(), vec!["a:80", "b:80"]);
    }

    #[tokio::test]
    async fn cursor_carries_over_refresh() {
        let resolver = ScriptedResolver::new(&["a:80", "b:80", "c:80"]);
        let pool = make_pool("api", Arc::clone(&resolver)).await;

        assert_eq!(pool.get("api").unwrap(), "a:80");
        assert_eq!(pool.get("api").unwrap(), "b:80");

        resolver.set(&["a:80", "b:80", "c:80", "d:80"]);
        pool.refresh("api").await.unwrap();

        // Cursor is at 2, so selection continues rather than restarting at "a".
        assert_eq!(pool.get("api").unwrap(), "c:80");
        assert_eq!(pool.get("api").unwrap(), "d:80");
        assert_eq!(pool.get("api").unwrap(), "a:80");
    }

    #[tokio::test]
    async fn surviving_targets_keep_their_handle() {
        let resolver = ScriptedResolver::new(&["a:80"]);
        let pool = make_pool("api", Arc::clone(&resolver)).await;
        let before = pool.entries["api"].snapshot();

        resolver.set(&["a:80", "b:80"]);
        pool.refresh("api").await.unwrap();
        let after = pool.entries["api"].snapshot();

        assert_eq!(after.len(), 2);
        assert_eq!(before[0].handle, after[0].handle);
        // The old snapshot is untouched by the swap.
        assert_eq!(before.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_see_mixed_lists() {
        let old = ["old-1:80", "old-2:80", "old-3:80"];
        let new = ["new-1:80", "new-2:80", "new-3:80", "new-4:80"];
        let resolver = ScriptedResolver::new(&old);
        let pool = Arc::new(make_pool("api", Arc::clone(&resolver)).await);

        let mut readers = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            readers.push(tokio::spawn(async move {
                for _ in 0..2_000 {
                    let snapshot = pool.entries["api"].snapshot();
                    let olds = snapshot.iter().filter(|t| t.address.starts_with("old")).count();
                    assert!(olds == 0 || olds == snapshot.len(), "mixed snapshot");
                    tokio::task::yield_now().await;
                }
            }));
        }

        for i in 0..200 {
            let next: &[&str] = if i % 2 == 0 { &new } else { &old };
            resolver.set(next);
            pool.refresh("api").await.unwrap();
        }

        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let pool = make_pool("api", ScriptedResolver::new(&["a:80"])).await;
        pool.shutdown();
        pool.shutdown();
        assert_eq!(pool.get("api").unwrap(), "a:80");
        assert_eq!(pool.backend_names(), vec!["api"]);
    }

    #[test]
    fn schedule_clamps_to_bounds() {
        let options = PoolOptions {
            min_refresh: Duration::from_secs(1),
            max_refresh: Duration::from_secs(30),
            error_backoff_max: Duration::from_secs(8),
        };
        let mut schedule = RefreshSchedule::new(options);
        let now = Instant::now();

        assert_eq!(
            schedule.on_success(Some(now + Duration::from_secs(10)), now),
            Duration::from_secs(10)
        );
        assert_eq!(
            schedule.on_success(Some(now + Duration::from_secs(300)), now),
            Duration::from_secs(30)
        );
        assert_eq!(schedule.on_success(Some(now), now), Duration::from_secs(1));
        assert_eq!(schedule.on_success(None, now), Duration::from_secs(1));
    }

    #[test]
    fn schedule_backs_off_and_resets() {
        let options = PoolOptions {
            min_refresh: Duration::from_secs(1),
            max_refresh: Duration::from_secs(30),
            error_backoff_max: Duration::from_secs(8),
        };
        let mut schedule = RefreshSchedule::new(options);

        let waits: Vec<u64> = (0..6).map(|_| schedule.on_failure().as_secs()).collect();
        assert_eq!(waits, vec![1, 2, 4, 8, 8, 8]);

        schedule.on_success(None, Instant::now());
        assert_eq!(schedule.on_failure(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_follows_target_ttl() {
        let resolver = ScriptedResolver::with_ttl(&["a:80"], Duration::from_secs(5));
        let pool = make_pool_with("api", Arc::clone(&resolver), make_options(1, 30, 8)).await;
        assert_eq!(resolver.calls(), 1);

        resolver.set(&["b:80"]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.targets("api").unwrap(), vec!["a:80"]);

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        assert_eq!(resolver.calls(), 2);
        assert_eq!(pool.targets("api").unwrap(), vec!["b:80"]);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_backs_off_and_keeps_targets() {
        let resolver = ScriptedResolver::with_ttl(&["a:80"], Duration::from_secs(5));
        let pool = make_pool_with("api", Arc::clone(&resolver), make_options(1, 30, 8)).await;
        resolver.fail();

        // Failures at t=5 and t=6, then the wait doubles to 2s.
        tokio::time::sleep(Duration::from_millis(6_500)).await;
        assert_eq!(resolver.calls(), 3);
        assert_eq!(pool.targets("api").unwrap(), vec!["a:80"]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(resolver.calls(), 3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(resolver.calls(), 4);
        assert_eq!(pool.get("api").unwrap(), "a:80");

        // Next attempt is 4s after t=8.
        resolver.set(&["c:80"]);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(resolver.calls(), 5);
        assert_eq!(pool.targets("api").unwrap(), vec!["c:80"]);
    }

    #[test]
    fn schedule_tolerates_inverted_bounds() {
        let mut schedule = RefreshSchedule::new(make_options(60, 5, 2));
        let now = Instant::now();

        assert_eq!(
            schedule.on_success(Some(now + Duration::from_secs(10)), now),
            Duration::from_secs(60)
        );
        assert_eq!(schedule.on_success(None, now), Duration::from_secs(60));
        assert_eq!(schedule.on_failure(), Duration::from_secs(60));
        assert_eq!(schedule.on_failure(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn pool_starts_with_inverted_bounds() {
        let resolver = ScriptedResolver::new(&["a:80"]);
        let pool = make_pool_with("api", resolver, make_options(60, 5, 2)).await;
        assert_eq!(pool.get("api").unwrap(), "a:80");
    }
}
