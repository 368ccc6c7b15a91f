//! Background build queue.
//!
//! Cross-package subtasks discovered during rewriting land on a bounded
//! process-wide FIFO drained by a pool of builder workers. Submission is
//! non-blocking; the emitted URL is valid as soon as the queued task
//! completes, and the artifact store deduplicates across requests.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::build::{BuildTask, Engine};

pub struct BuildQueue {
    tx: mpsc::Sender<BuildTask>,
    rx: Mutex<Option<mpsc::Receiver<BuildTask>>>,
}

impl BuildQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Push a task without waiting. A full queue drops the task; the
    /// front-end will trigger the build again on first fetch.
    pub fn submit(&self, task: BuildTask) -> bool {
        match self.tx.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!("build queue full, dropping {}", task.id());
                false
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                warn!("build queue closed, dropping {}", task.id());
                false
            }
        }
    }

    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<BuildTask>> {
        self.rx.lock().take()
    }
}

/// Spawn `count` workers draining the engine's queue. Callable once per
/// engine; later calls find the receiver already taken and do nothing.
pub fn start_workers(engine: Arc<Engine>, count: usize) {
    let Some(receiver) = engine.queue.take_receiver() else {
        warn!("build workers already started");
        return;
    };
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

    for worker in 0..count.max(1) {
        let engine = engine.clone();
        let receiver = receiver.clone();
        tokio::spawn(async move {
            loop {
                let task = { receiver.lock().await.recv().await };
                let Some(task) = task else { break };
                let id = task.id();
                debug!("worker {} building {}", worker, id);
                if let Err(e) = engine.build(&task).await {
                    error!("build {}: {}", id, e);
                }
            }
        });
    }
}
