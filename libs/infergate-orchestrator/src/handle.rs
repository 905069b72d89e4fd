//! A live backend as tracked by the registry.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::client::{BackendClient, Endpoint};
use crate::options::BackendKey;
use crate::spawner::{BackendProcess, SpawnedBackend};

/// Lifecycle of a backend. `Failed` and `Stopped` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendState {
    Uninitialized,
    Loading,
    Ready,
    Failed,
    Stopped,
}

impl BackendState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BackendState::Failed | BackendState::Stopped)
    }
}

/// Point-in-time view of a loaded backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendInfo {
    pub key: BackendKey,
    pub kind: String,
    pub state: BackendState,
    pub pid: Option<u32>,
    pub endpoint: Endpoint,
    pub in_use: usize,
}

pub struct BackendHandle {
    key: BackendKey,
    instance_id: String,
    kind: String,
    endpoint: Endpoint,
    pid: Option<u32>,
    client: Arc<dyn BackendClient>,
    process: tokio::sync::Mutex<Option<BackendProcess>>,
    state: RwLock<BackendState>,
    last_used: Mutex<Instant>,
    in_use: AtomicUsize,
    created_at: Instant,
}

impl BackendHandle {
    pub(crate) fn new(key: BackendKey, spawned: SpawnedBackend) -> Self {
        let now = Instant::now();
        Self {
            key,
            instance_id: Uuid::now_v7().to_string(),
            kind: spawned.kind,
            endpoint: spawned.endpoint,
            pid: spawned.process.as_ref().and_then(BackendProcess::pid),
            client: spawned.client,
            process: tokio::sync::Mutex::new(spawned.process),
            state: RwLock::new(BackendState::Ready),
            last_used: Mutex::new(now),
            in_use: AtomicUsize::new(0),
            created_at: now,
        }
    }

    pub fn key(&self) -> &BackendKey {
        &self.key
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// `None` for attached backends.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn client(&self) -> &Arc<dyn BackendClient> {
        &self.client
    }

    pub fn state(&self) -> BackendState {
        *self.state.read()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// Number of live leases.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn info(&self) -> BackendInfo {
        BackendInfo {
            key: self.key.clone(),
            kind: self.kind.clone(),
            state: self.state(),
            pid: self.pid,
            endpoint: self.endpoint.clone(),
            in_use: self.in_use(),
        }
    }

    /// Move to `next` unless already terminal. Returns whether it changed.
    pub(crate) fn transition(&self, next: BackendState) -> bool {
        let mut state = self.state.write();
        if state.is_terminal() || *state == next {
            return false;
        }
        *state = next;
        true
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub(crate) fn acquire(&self) {
        self.in_use.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    pub(crate) fn release(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.touch();
    }

    /// Whether the owned process has exited. Attached backends, and a
    /// process that is being stopped right now, report `false`.
    pub(crate) fn process_exited(&self) -> bool {
        match self.process.try_lock() {
            Ok(mut process) => process.as_mut().is_some_and(BackendProcess::has_exited),
            Err(_) => false,
        }
    }

    /// Mark `Stopped` and shut the process down gracefully.
    pub(crate) async fn stop(&self, grace: Duration) {
        self.transition(BackendState::Stopped);
        let process = self.process.lock().await.take();
        if let Some(mut process) = process {
            tracing::info!(key = %self.key, pid = ?process.pid(), "stopping backend");
            process.terminate(grace).await;
        }
    }

    /// Kill the process without a grace period.
    pub(crate) async fn kill(&self) {
        let process = self.process.lock().await.take();
        if let Some(mut process) = process {
            tracing::debug!(key = %self.key, pid = ?process.pid(), "killing backend");
            process.kill().await;
        }
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("key", &self.key)
            .field("instance_id", &self.instance_id)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("in_use", &self.in_use())
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}
