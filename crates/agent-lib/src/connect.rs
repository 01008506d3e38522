//! Background connection establishment
//!
//! Opening a stream blocks until the engine answers with a response head,
//! which can take a while for a busy daemon. Connects are therefore handed
//! to a pool with a single permit and polled from the reactor loop without
//! ever waiting on them.

use crate::engine::{Engine, EngineError, StreamHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

/// Number of connects allowed in flight at once
pub const CONNECT_WORKERS: usize = 1;

/// Default bound on one open, queueing time excluded
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of polling a [`PendingConnect`]
#[derive(Debug)]
pub enum ConnectPoll {
    Pending,
    Ready(Result<StreamHandle, EngineError>),
    /// The worker went away without an answer
    Lost,
}

/// A connect submitted to the pool
#[derive(Debug)]
pub struct PendingConnect {
    path: String,
    task: JoinHandle<()>,
    rx: oneshot::Receiver<Result<StreamHandle, EngineError>>,
}

impl PendingConnect {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Non-blocking check for the connect's outcome
    pub fn poll_ready(&mut self) -> ConnectPoll {
        match self.rx.try_recv() {
            Ok(result) => ConnectPoll::Ready(result),
            Err(oneshot::error::TryRecvError::Empty) => ConnectPoll::Pending,
            Err(oneshot::error::TryRecvError::Closed) => ConnectPoll::Lost,
        }
    }

    /// Abandon the connect. A stream that was already opened is dropped,
    /// which closes its connection.
    pub fn cancel(mut self) {
        self.task.abort();
        if let Ok(Ok(handle)) = self.rx.try_recv() {
            debug!(path = %self.path, "Dropping stream opened for a cancelled connect");
            drop(handle);
        }
    }
}

/// Runs connects in the background, at most [`CONNECT_WORKERS`] at a time
pub struct ConnectPool {
    engine: Arc<dyn Engine>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl ConnectPool {
    /// An open that gets no response head within `timeout` fails with
    /// [`EngineError::Timeout`] and frees the worker.
    pub fn new(engine: Arc<dyn Engine>, timeout: Duration) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(CONNECT_WORKERS)),
            timeout,
        }
    }

    /// Queue a streaming GET for `path`
    pub fn submit(&self, path: String) -> PendingConnect {
        let (tx, rx) = oneshot::channel();
        let engine = Arc::clone(&self.engine);
        let permits = Arc::clone(&self.permits);
        let task_path = path.clone();
        let timeout = self.timeout;

        let task = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let result = tokio::time::timeout(timeout, engine.open_stream(&task_path))
                .await
                .unwrap_or_else(|_| {
                    Err(EngineError::Timeout {
                        path: task_path.clone(),
                        after: timeout,
                    })
                });
            // Receiver gone means the connect was cancelled; the stream is
            // dropped with the unsent result.
            let _ = tx.send(result);
        });

        PendingConnect { path, task, rx }
    }
}
