//! Bounded FIFO of admitted job ids.
//!
//! Admission reserves a slot before committing the job row, so a full
//! queue refuses synchronously and a sent id always refers to a
//! committed row. Workers share one receiver: any worker may pick any
//! job, in submission order.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue is full (capacity {0})")]
    Overloaded(usize),

    #[error("job queue is shut down")]
    Closed,
}

/// Producer half, held by admission.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Uuid>,
    capacity: usize,
}

/// Consumer half, shared by the worker pool.
#[derive(Clone)]
pub struct JobReceiver {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Uuid>>>,
}

pub fn channel(capacity: usize) -> (JobQueue, JobReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        JobQueue { tx, capacity },
        JobReceiver {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        },
    )
}

/// A reserved queue slot. Send after the row is committed; dropping it
/// releases the slot.
pub struct QueueSlot<'a> {
    permit: mpsc::Permit<'a, Uuid>,
}

impl QueueSlot<'_> {
    pub fn send(self, job_id: Uuid) {
        debug!(%job_id, "job enqueued");
        self.permit.send(job_id);
    }
}

impl JobQueue {
    /// Reserve a slot without sending. Full queue -> `Overloaded`.
    pub fn try_reserve(&self) -> Result<QueueSlot<'_>, QueueError> {
        match self.tx.try_reserve() {
            Ok(permit) => Ok(QueueSlot { permit }),
            Err(TrySendError::Full(())) => Err(QueueError::Overloaded(self.capacity)),
            Err(TrySendError::Closed(())) => Err(QueueError::Closed),
        }
    }

    /// Blocking enqueue, used when re-queueing recovered jobs at startup.
    pub async fn send(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.tx.send(job_id).await.map_err(|_| QueueError::Closed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl JobReceiver {
    /// Pop the next job id; `None` when the queue is shut down.
    pub async fn recv(&self) -> Option<Uuid> {
        self.rx.lock().await.recv().await
    }
}
