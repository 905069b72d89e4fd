//! Fan-in over channels: merge, reduce or transform the streams produced by
//! several concurrently running backends.
//!
//! Every helper spawns one reader task per input and returns a [`FanIn`]
//! that tracks them. Readers stop when their input closes, when the
//! consumer drops the output, or on [`FanIn::cancel`].

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Completion handle for a set of reader tasks.
#[derive(Debug, Clone)]
pub struct FanIn {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl FanIn {
    fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn sealed(self) -> Self {
        self.tracker.close();
        self
    }

    /// Resolves once every reader (and the final send, for reduce) is done.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Stop all readers; values not yet forwarded are dropped.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.tracker.is_closed() && self.tracker.is_empty()
    }
}

/// Relay every value from every input into `output`. Per-input order is
/// kept; `output` closes once all inputs have closed.
pub fn raw_merge<T>(inputs: Vec<mpsc::Receiver<T>>, output: mpsc::Sender<T>) -> FanIn
where
    T: Send + 'static,
{
    let fan_in = FanIn::new();
    for mut input in inputs {
        let output = output.clone();
        let cancel = fan_in.cancel.clone();
        fan_in.tracker.spawn(async move {
            loop {
                let value = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = output.closed() => break,
                    value = input.recv() => match value {
                        Some(value) => value,
                        None => break,
                    },
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = output.send(value) => if sent.is_err() { break },
                }
            }
        });
    }
    fan_in.sealed()
}

/// Fold every value from every input into one accumulator, in arrival
/// order, and send the result once after all inputs have closed. Nothing is
/// sent when cancelled. Results are deterministic only for commutative folds.
pub fn reduce_merge<T, A, F>(
    inputs: Vec<mpsc::Receiver<T>>,
    output: mpsc::Sender<A>,
    init: A,
    fold: F,
) -> FanIn
where
    T: Send + 'static,
    A: Send + 'static,
    F: Fn(A, T) -> A + Send + Sync + 'static,
{
    let fan_in = FanIn::new();
    let readers = TaskTracker::new();
    let acc = Arc::new(Mutex::new(Some(init)));
    let fold = Arc::new(fold);

    for mut input in inputs {
        let acc = Arc::clone(&acc);
        let fold = Arc::clone(&fold);
        let cancel = fan_in.cancel.clone();
        let output = output.clone();
        readers.spawn(async move {
            loop {
                let value = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = output.closed() => break,
                    value = input.recv() => match value {
                        Some(value) => value,
                        None => break,
                    },
                };
                let mut slot = acc.lock();
                if let Some(current) = slot.take() {
                    *slot = Some(fold(current, value));
                }
            }
        });
    }
    readers.close();

    let cancel = fan_in.cancel.clone();
    fan_in.tracker.spawn(async move {
        readers.wait().await;
        if cancel.is_cancelled() {
            return;
        }
        let result = acc.lock().take();
        if let Some(result) = result {
            let _ = output.send(result).await;
        }
    });
    fan_in.sealed()
}

/// Apply `map` to every value. Output `i` carries input `i`'s values and
/// closes when input `i` closes.
pub fn transform<T, U, F>(
    inputs: Vec<mpsc::Receiver<T>>,
    map: F,
    buffer: usize,
) -> (Vec<mpsc::Receiver<U>>, FanIn)
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    let fan_in = FanIn::new();
    let map = Arc::new(map);
    let mut outputs = Vec::with_capacity(inputs.len());

    for mut input in inputs {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        outputs.push(rx);
        let map = Arc::clone(&map);
        let cancel = fan_in.cancel.clone();
        fan_in.tracker.spawn(async move {
            loop {
                let value = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    value = input.recv() => match value {
                        Some(value) => value,
                        None => break,
                    },
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(map(value)) => if sent.is_err() { break },
                }
            }
        });
    }
    (outputs, fan_in.sealed())
}
