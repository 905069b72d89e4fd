//! Backend registry: single-flight loading, LRU eviction and teardown.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::handle::{BackendHandle, BackendInfo, BackendState};
use crate::lease::BackendLease;
use crate::options::{BackendKey, LoadOptions};
use crate::spawner::BackendSpawner;

/// Registry limits and timings.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Live plus loading backends, 0 = unlimited.
    pub max_backends: usize,
    pub load_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for RegistrySettings {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            max_backends: cfg.max_backends,
            load_timeout: cfg.load_timeout,
            stop_grace: cfg.stop_grace,
        }
    }
}

type LoadOutcome = Option<Result<Arc<BackendHandle>>>;

/// A load in progress. Every caller waiting on it is counted; when the
/// count drops to zero before an outcome exists the spawn is abandoned.
struct InFlightLoad {
    outcome: watch::Sender<LoadOutcome>,
    waiters: AtomicUsize,
    abort: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    ready: HashMap<BackendKey, Arc<BackendHandle>>,
    inflight: HashMap<BackendKey, Arc<InFlightLoad>>,
    closed: bool,
}

impl RegistryState {
    fn owns_flight(&self, key: &BackendKey, flight: &Arc<InFlightLoad>) -> bool {
        self.inflight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, flight))
    }

    fn owns_handle(&self, handle: &Arc<BackendHandle>) -> bool {
        self.ready
            .get(handle.key())
            .is_some_and(|current| Arc::ptr_eq(current, handle))
    }

    /// Least recently used handle nobody holds a lease on.
    fn eviction_candidate(&self) -> Option<BackendKey> {
        self.ready
            .values()
            .filter(|h| h.in_use() == 0)
            .min_by_key(|h| h.last_used())
            .map(|h| h.key().clone())
    }
}

pub(crate) struct RegistryInner {
    state: Mutex<RegistryState>,
    spawner: Arc<dyn BackendSpawner>,
    settings: RegistrySettings,
    tasks: TaskTracker,
}

impl RegistryInner {
    /// Remove `handle` (if still registered) and kill its process in the
    /// background.
    pub(crate) fn mark_failed(&self, handle: &Arc<BackendHandle>) {
        handle.transition(BackendState::Failed);
        let removed = {
            let mut state = self.state.lock();
            if state.owns_handle(handle) {
                state.ready.remove(handle.key());
                true
            } else {
                false
            }
        };
        if removed {
            tracing::warn!(
                key = %handle.key(),
                pid = ?handle.pid(),
                endpoint = %handle.endpoint(),
                "backend marked failed and removed"
            );
        }
        let handle = Arc::clone(handle);
        self.tasks.spawn(async move { handle.kill().await });
    }
}

/// Decrements the waiter count when a caller stops waiting, abandoning the
/// load if it was the last one.
struct WaiterGuard {
    inner: Arc<RegistryInner>,
    key: BackendKey,
    flight: Arc<InFlightLoad>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        let remaining = self.flight.waiters.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.flight.outcome.borrow().is_none() {
            self.flight.abort.cancel();
            if state.owns_flight(&self.key, &self.flight) {
                state.inflight.remove(&self.key);
            }
            tracing::debug!(key = %self.key, "every caller gave up; load abandoned");
        }
    }
}

enum Admission {
    Ready(BackendLease),
    Wait(WaiterGuard),
}

/// Owns every backend this process knows about.
///
/// Cloning is cheap and shares the same state.
#[derive(Clone)]
pub struct BackendRegistry {
    inner: Arc<RegistryInner>,
}

impl BackendRegistry {
    pub fn new(spawner: Arc<dyn BackendSpawner>, settings: RegistrySettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::default()),
                spawner,
                settings,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    /// Return a lease on the backend for `key`, starting it if necessary.
    /// Concurrent callers for the same key share one spawn and its outcome.
    pub async fn load(&self, key: &BackendKey, options: LoadOptions) -> Result<BackendLease> {
        loop {
            let guard = match self.admit(key, &options)? {
                Admission::Ready(lease) => return Ok(lease),
                Admission::Wait(guard) => guard,
            };
            let handle = wait_outcome(&guard).await?;
            drop(guard);
            if let Some(lease) = self.lease_if_registered(&handle) {
                return Ok(lease);
            }
            // Evicted or failed between install and lease; start over.
            tracing::debug!(%key, "loaded backend vanished before it was leased, retrying");
        }
    }

    /// Like [`load`](Self::load) but gives up waiting after `deadline`.
    /// The spawn itself keeps going as long as another caller still waits.
    pub async fn load_with_deadline(
        &self,
        key: &BackendKey,
        options: LoadOptions,
        deadline: Duration,
    ) -> Result<BackendLease> {
        tokio::time::timeout(deadline, self.load(key, options))
            .await
            .map_err(|_| OrchestratorError::LoadTimeout {
                key: key.to_string(),
                timeout: deadline,
            })?
    }

    fn admit(&self, key: &BackendKey, options: &LoadOptions) -> Result<Admission> {
        let (flight, victim) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(OrchestratorError::ShuttingDown);
            }
            if let Some(handle) = state.ready.get(key) {
                return Ok(Admission::Ready(BackendLease::new(
                    Arc::clone(handle),
                    Arc::clone(&self.inner),
                )));
            }
            if let Some(flight) = state.inflight.get(key) {
                flight.waiters.fetch_add(1, Ordering::AcqRel);
                return Ok(Admission::Wait(WaiterGuard {
                    inner: Arc::clone(&self.inner),
                    key: key.clone(),
                    flight: Arc::clone(flight),
                }));
            }

            let max = self.inner.settings.max_backends;
            let victim = if max > 0 && state.ready.len() + state.inflight.len() >= max {
                let candidate = state
                    .eviction_candidate()
                    .ok_or(OrchestratorError::CapacityExceeded { max })?;
                state.ready.remove(&candidate)
            } else {
                None
            };

            let (outcome, _) = watch::channel(None);
            let flight = Arc::new(InFlightLoad {
                outcome,
                waiters: AtomicUsize::new(1),
                abort: CancellationToken::new(),
            });
            state.inflight.insert(key.clone(), Arc::clone(&flight));
            (flight, victim)
        };

        if let Some(victim) = &victim {
            tracing::info!(
                evicted = %victim.key(),
                %key,
                "capacity reached, evicting least recently used backend"
            );
        }

        tracing::debug!(%key, "starting backend load");
        self.inner.tasks.spawn(run_load(
            Arc::clone(&self.inner),
            key.clone(),
            options.clone(),
            Arc::clone(&flight),
            victim,
        ));

        Ok(Admission::Wait(WaiterGuard {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            flight,
        }))
    }

    fn lease_if_registered(&self, handle: &Arc<BackendHandle>) -> Option<BackendLease> {
        let state = self.inner.state.lock();
        state
            .owns_handle(handle)
            .then(|| BackendLease::new(Arc::clone(handle), Arc::clone(&self.inner)))
    }

    /// Remove and stop the backend for `key`. Loads in flight are not
    /// affected.
    pub async fn unload(&self, key: &BackendKey) -> Result<()> {
        let handle = self
            .inner
            .state
            .lock()
            .ready
            .remove(key)
            .ok_or_else(|| OrchestratorError::BackendNotFound(key.to_string()))?;
        tracing::info!(%key, pid = ?handle.pid(), "unloading backend");
        handle.stop(self.inner.settings.stop_grace).await;
        Ok(())
    }

    /// Refuse new loads, abandon loads in flight and stop every backend.
    pub async fn shutdown(&self) {
        let (handles, flights) = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let handles: Vec<_> = state.ready.drain().map(|(_, h)| h).collect();
            let flights: Vec<_> = state.inflight.drain().map(|(_, f)| f).collect();
            (handles, flights)
        };

        tracing::info!(
            backends = handles.len(),
            loading = flights.len(),
            "shutting down backend registry"
        );

        for flight in flights {
            flight.abort.cancel();
            flight.outcome.send_if_modified(|outcome| {
                if outcome.is_some() {
                    return false;
                }
                *outcome = Some(Err(OrchestratorError::ShuttingDown));
                true
            });
        }

        let grace = self.inner.settings.stop_grace;
        futures::future::join_all(handles.iter().map(|h| h.stop(grace))).await;

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Snapshot of every ready backend.
    pub fn loaded(&self) -> Vec<BackendInfo> {
        let state = self.inner.state.lock();
        let mut infos: Vec<_> = state.ready.values().map(|h| h.info()).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// `Loading` while a load is in flight, the handle state once ready,
    /// `None` when unknown.
    pub fn state(&self, key: &BackendKey) -> Option<BackendState> {
        let state = self.inner.state.lock();
        if let Some(handle) = state.ready.get(key) {
            return Some(handle.state());
        }
        state.inflight.contains_key(key).then_some(BackendState::Loading)
    }

    /// Pid of the local process serving `key`.
    pub fn pid_of(&self, key: &BackendKey) -> Result<u32> {
        self.inner
            .state
            .lock()
            .ready
            .get(key)
            .and_then(|h| h.pid())
            .ok_or_else(|| OrchestratorError::BackendNotFound(key.to_string()))
    }

    /// Drop `handle` from the registry and kill it; used when a caller sees
    /// the backend misbehave outside of a lease RPC.
    pub fn mark_failed(&self, handle: &Arc<BackendHandle>) {
        self.inner.mark_failed(handle);
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn wait_outcome(guard: &WaiterGuard) -> Result<Arc<BackendHandle>> {
    let mut rx = guard.flight.outcome.subscribe();
    let outcome = rx
        .wait_for(Option::is_some)
        .await
        .map(|outcome| (*outcome).clone())
        .map_err(|_| OrchestratorError::spawn_failed(&guard.key, "load task ended without a result"))?;
    outcome.unwrap_or_else(|| {
        Err(OrchestratorError::spawn_failed(&guard.key, "load finished without an outcome"))
    })
}

/// Body of the detached load task. Owns the spawn so a caller dropping its
/// future does not cancel it; only `abort` does.
async fn run_load(
    inner: Arc<RegistryInner>,
    key: BackendKey,
    options: LoadOptions,
    flight: Arc<InFlightLoad>,
    victim: Option<Arc<BackendHandle>>,
) {
    let grace = inner.settings.stop_grace;
    if let Some(victim) = victim {
        victim.stop(grace).await;
    }

    let timeout = inner.settings.load_timeout;
    let spawned = tokio::select! {
        _ = flight.abort.cancelled() => return,
        result = tokio::time::timeout(timeout, inner.spawner.spawn(&key, &options)) => {
            result.unwrap_or_else(|_| {
                Err(OrchestratorError::LoadTimeout {
                    key: key.to_string(),
                    timeout,
                })
            })
        }
    };

    match spawned {
        Ok(spawned) => {
            let handle = Arc::new(BackendHandle::new(key.clone(), spawned));
            let installed = {
                let mut state = inner.state.lock();
                if !state.closed && state.owns_flight(&key, &flight) {
                    state.inflight.remove(&key);
                    state.ready.insert(key.clone(), Arc::clone(&handle));
                    flight.outcome.send_replace(Some(Ok(Arc::clone(&handle))));
                    true
                } else {
                    false
                }
            };

            if installed {
                tracing::info!(
                    %key,
                    kind = %handle.kind(),
                    pid = ?handle.pid(),
                    endpoint = %handle.endpoint(),
                    "backend ready"
                );
            } else {
                tracing::debug!(%key, "load completed after it was abandoned, stopping backend");
                flight.outcome.send_if_modified(|outcome| {
                    if outcome.is_some() {
                        return false;
                    }
                    *outcome = Some(Err(OrchestratorError::ShuttingDown));
                    true
                });
                handle.stop(grace).await;
            }
        }
        Err(e) => {
            tracing::warn!(%key, error = %e, "backend load failed");
            {
                let mut state = inner.state.lock();
                if state.owns_flight(&key, &flight) {
                    state.inflight.remove(&key);
                }
            }
            flight.outcome.send_replace(Some(Err(e)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{
        BackendClient, BackendStatus, ClientError, ClientResult, Endpoint, ModelOptions,
        PredictRequest, Prediction, RemoteState, TokenStream, Tokenization,
    };
    use crate::spawner::SpawnedBackend;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct MockClient {
        broken: AtomicBool,
    }

    impl MockClient {
        fn check(&self) -> ClientResult<()> {
            if self.broken.load(Ordering::SeqCst) {
                Err(ClientError::Unavailable("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl BackendClient for MockClient {
        async fn status(&self) -> ClientResult<BackendStatus> {
            self.check()?;
            Ok(BackendStatus {
                state: RemoteState::Ready,
                message: String::new(),
            })
        }

        async fn load(&self, _: &ModelOptions) -> ClientResult<()> {
            self.check()
        }

        async fn predict(&self, request: &PredictRequest) -> ClientResult<Prediction> {
            self.check()?;
            Ok(Prediction {
                message: request.prompt.clone().into_bytes(),
                tokens: 1,
                prompt_tokens: 1,
            })
        }

        async fn predict_stream(&self, request: &PredictRequest) -> ClientResult<TokenStream> {
            self.check()?;
            let words: Vec<_> = request
                .prompt
                .split_whitespace()
                .map(|w| {
                    Ok(Prediction {
                        message: w.as_bytes().to_vec(),
                        tokens: 1,
                        prompt_tokens: 0,
                    })
                })
                .collect();
            Ok(TokenStream::new(futures::stream::iter(words)))
        }

        async fn tokenize_string(&self, request: &PredictRequest) -> ClientResult<Tokenization> {
            self.check()?;
            Ok(Tokenization {
                tokens: (0..request.prompt.split_whitespace().count() as i32).collect(),
            })
        }
    }

    /// Counts spawns; each spawn sleeps for `delay` and fails while
    /// `failures_left > 0`.
    struct MockSpawner {
        delay: Duration,
        spawns: AtomicUsize,
        failures_left: AtomicUsize,
        clients: Mutex<Vec<Arc<MockClient>>>,
    }

    impl MockSpawner {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                spawns: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(0),
                clients: Mutex::new(Vec::new()),
            })
        }

        fn spawns(&self) -> usize {
            self.spawns.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendSpawner for MockSpawner {
        async fn spawn(&self, key: &BackendKey, _: &LoadOptions) -> Result<SpawnedBackend> {
            let n = self.spawns.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| f.checked_sub(1))
                .is_ok()
            {
                return Err(OrchestratorError::spawn_failed(key, "model file is corrupt"));
            }
            let client = Arc::new(MockClient::default());
            self.clients.lock().push(Arc::clone(&client));
            Ok(SpawnedBackend {
                kind: "mock".into(),
                endpoint: Endpoint::tcp("127.0.0.1", 40000 + n as u16),
                client,
                process: None,
            })
        }
    }

    fn registry(spawner: &Arc<MockSpawner>, max_backends: usize) -> BackendRegistry {
        BackendRegistry::new(
            Arc::clone(spawner) as Arc<dyn BackendSpawner>,
            RegistrySettings {
                max_backends,
                load_timeout: Duration::from_secs(5),
                stop_grace: Duration::from_millis(100),
            },
        )
    }

    fn key(name: &str) -> BackendKey {
        BackendKey::new(name).unwrap()
    }

    fn opts(name: &str) -> LoadOptions {
        LoadOptions::new(name)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_loads_share_one_spawn() {
        let spawner = MockSpawner::new(Duration::from_millis(100));
        let registry = registry(&spawner, 0);
        let k = key("llama.gguf");

        let loads = (0..16).map(|_| {
            let registry = registry.clone();
            let k = k.clone();
            tokio::spawn(async move { registry.load(&k, opts("llama.gguf")).await })
        });
        let leases: Vec<_> = futures::future::join_all(loads)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(spawner.spawns(), 1);
        let first = leases[0].handle();
        assert!(leases.iter().all(|l| Arc::ptr_eq(l.handle(), first)));
        assert_eq!(first.in_use(), 16);
        drop(leases);
        assert_eq!(registry.state(&k), Some(BackendState::Ready));
        assert_eq!(registry.loaded()[0].in_use, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_loads_share_one_failure_and_it_is_not_cached() {
        let spawner = MockSpawner::new(Duration::from_millis(50));
        spawner.failures_left.store(1, Ordering::SeqCst);
        let registry = registry(&spawner, 0);
        let k = key("broken.gguf");

        let (a, b) = tokio::join!(
            registry.load(&k, opts("broken.gguf")),
            registry.load(&k, opts("broken.gguf"))
        );
        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        assert!(matches!(a, OrchestratorError::SpawnFailed { .. }));
        assert_eq!(a, b);
        assert_eq!(spawner.spawns(), 1);
        assert_eq!(registry.state(&k), None);

        registry.load(&k, opts("broken.gguf")).await.unwrap();
        assert_eq!(spawner.spawns(), 2);
    }

    #[tokio::test]
    async fn ready_backend_is_reused() {
        let spawner = MockSpawner::new(Duration::ZERO);
        let registry = registry(&spawner, 0);
        let k = key("a.gguf");

        let first = registry.load(&k, opts("a.gguf")).await.unwrap();
        let second = registry.load(&k, opts("a.gguf")).await.unwrap();

        assert!(Arc::ptr_eq(first.handle(), second.handle()));
        assert_eq!(spawner.spawns(), 1);
    }

    #[tokio::test]
    async fn unload_then_load_spawns_a_new_backend() {
        let spawner = MockSpawner::new(Duration::ZERO);
        let registry = registry(&spawner, 0);
        let k = key("a.gguf");

        let first = registry.load(&k, opts("a.gguf")).await.unwrap().handle().clone();
        registry.unload(&k).await.unwrap();
        assert_eq!(first.state(), BackendState::Stopped);
        assert_eq!(registry.state(&k), None);

        let second = registry.load(&k, opts("a.gguf")).await.unwrap();
        assert_eq!(spawner.spawns(), 2);
        assert_ne!(first.instance_id(), second.handle().instance_id());

        assert!(matches!(
            registry.unload(&key("missing.gguf")).await,
            Err(OrchestratorError::BackendNotFound(_))
        ));
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used_idle_backend() {
        let spawner = MockSpawner::new(Duration::ZERO);
        let registry = registry(&spawner, 2);

        let a = registry.load(&key("a"), opts("a.gguf")).await.unwrap().handle().clone();
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(registry.load(&key("b"), opts("b.gguf")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Touch `a` so `b` becomes the oldest.
        drop(registry.load(&key("a"), opts("a.gguf")).await.unwrap());

        registry.load(&key("c"), opts("c.gguf")).await.unwrap();

        assert_eq!(spawner.spawns(), 3);
        assert_eq!(registry.state(&key("b")), None);
        assert_eq!(registry.state(&key("a")), Some(BackendState::Ready));
        assert_eq!(a.state(), BackendState::Ready);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn leased_backends_are_never_evicted() {
        let spawner = MockSpawner::new(Duration::ZERO);
        let registry = registry(&spawner, 1);

        let held = registry.load(&key("a"), opts("a.gguf")).await.unwrap();
        let err = registry.load(&key("b"), opts("b.gguf")).await.unwrap_err();
        assert_eq!(err, OrchestratorError::CapacityExceeded { max: 1 });
        assert_eq!(held.handle().state(), BackendState::Ready);

        drop(held);
        registry.load(&key("b"), opts("b.gguf")).await.unwrap();
        assert_eq!(registry.state(&key("a")), None);
        assert_eq!(spawner.spawns(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn short_deadline_times_out_while_patient_caller_succeeds() {
        let spawner = MockSpawner::new(Duration::from_millis(300));
        let registry = registry(&spawner, 0);
        let k = key("slow.gguf");

        let (patient, hasty) = tokio::join!(
            registry.load(&k, opts("slow.gguf")),
            registry.load_with_deadline(&k, opts("slow.gguf"), Duration::from_millis(50)),
        );

        assert!(matches!(hasty, Err(OrchestratorError::LoadTimeout { .. })));
        assert!(patient.is_ok());
        assert_eq!(spawner.spawns(), 1);
    }

    #[tokio::test]
    async fn load_is_abandoned_when_every_caller_gives_up() {
        let spawner = MockSpawner::new(Duration::from_secs(30));
        let registry = registry(&spawner, 0);
        let k = key("slow.gguf");

        let err = registry
            .load_with_deadline(&k, opts("slow.gguf"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::LoadTimeout { .. }));
        assert_eq!(registry.state(&k), None);

        // A fresh caller starts over rather than joining the dead load.
        let _ = registry
            .load_with_deadline(&k, opts("slow.gguf"), Duration::from_millis(20))
            .await;
        assert_eq!(spawner.spawns(), 2);
    }

    #[tokio::test]
    async fn registry_load_timeout_reaches_every_waiter() {
        let spawner = MockSpawner::new(Duration::from_secs(30));
        let registry = BackendRegistry::new(
            Arc::clone(&spawner) as Arc<dyn BackendSpawner>,
            RegistrySettings {
                load_timeout: Duration::from_millis(50),
                ..RegistrySettings::default()
            },
        );
        let k = key("slow.gguf");

        let (a, b) = tokio::join!(
            registry.load(&k, opts("slow.gguf")),
            registry.load(&k, opts("slow.gguf"))
        );
        for err in [a.unwrap_err(), b.unwrap_err()] {
            assert_eq!(
                err,
                OrchestratorError::LoadTimeout {
                    key: "slow.gguf".into(),
                    timeout: Duration::from_millis(50)
                }
            );
        }
        assert_eq!(registry.state(&k), None);
    }

    #[tokio::test]
    async fn transport_failure_marks_backend_failed() {
        let spawner = MockSpawner::new(Duration::ZERO);
        let registry = registry(&spawner, 0);
        let k = key("a.gguf");

        let lease = registry.load(&k, opts("a.gguf")).await.unwrap();
        assert_eq!(
            lease.predict(&PredictRequest::new("hi")).await.unwrap().text(),
            "hi"
        );

        spawner.clients.lock()[0].broken.store(true, Ordering::SeqCst);
        let err = lease.predict(&PredictRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::RpcFailure { .. }));
        assert_eq!(lease.handle().state(), BackendState::Failed);
        assert_eq!(registry.state(&k), None);

        let fresh = registry.load(&k, opts("a.gguf")).await.unwrap();
        assert_eq!(spawner.spawns(), 2);
        assert_eq!(fresh.handle().state(), BackendState::Ready);
    }

    #[tokio::test]
    async fn lease_streams_and_tokenizes() {
        let spawner = MockSpawner::new(Duration::ZERO);
        let registry = registry(&spawner, 0);

        let lease = registry.load(&key("a.gguf"), opts("a.gguf")).await.unwrap();
        let words: Vec<_> = lease
            .predict_stream(&PredictRequest::new("one two three"))
            .await
            .unwrap()
            .map(|chunk| chunk.unwrap().text())
            .collect()
            .await;
        assert_eq!(words, ["one", "two", "three"]);

        let tokens = lease.tokenize(&PredictRequest::new("a b")).await.unwrap();
        assert_eq!(tokens.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_everything_and_refuses_new_loads() {
        let spawner = MockSpawner::new(Duration::ZERO);
        let registry = registry(&spawner, 0);

        let a = registry.load(&key("a"), opts("a.gguf")).await.unwrap().handle().clone();
        let b = registry.load(&key("b"), opts("b.gguf")).await.unwrap().handle().clone();

        registry.shutdown().await;

        assert_eq!(a.state(), BackendState::Stopped);
        assert_eq!(b.state(), BackendState::Stopped);
        assert!(registry.is_empty());
        assert!(matches!(
            registry.load(&key("a"), opts("a.gguf")).await,
            Err(OrchestratorError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn shutdown_releases_waiters_of_inflight_loads() {
        let spawner = MockSpawner::new(Duration::from_secs(30));
        let registry = registry(&spawner, 0);

        let waiting = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.load(&key("slow"), opts("slow.gguf")).await })
        };
        while registry.state(&key("slow")).is_none() {
            tokio::task::yield_now().await;
        }

        tokio::time::timeout(Duration::from_secs(5), registry.shutdown())
            .await
            .expect("shutdown must not wait for the slow spawn");
        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(OrchestratorError::ShuttingDown)));
    }

    #[tokio::test]
    async fn attached_backends_have_no_pid() {
        let spawner = MockSpawner::new(Duration::ZERO);
        let registry = registry(&spawner, 0);
        let k = key("a.gguf");
        registry.load(&k, opts("a.gguf")).await.unwrap();

        // Mock backends have no process.
        assert!(matches!(
            registry.pid_of(&k),
            Err(OrchestratorError::BackendNotFound(_))
        ));
    }
}
