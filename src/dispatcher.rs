//! At-least-once task dispatch.
//!
//! [`LocalDispatcher`] is the in-process dispatcher: a flume MPMC channel
//! feeding a pool of tokio workers. Each worker pulls a stage task, hands it
//! to [`Pipeline::handle_task`], and reacts to the outcome:
//!
//! - `Advanced`: the follow-up task is enqueued immediately;
//! - `Completed` / `Discarded`: nothing further;
//! - `Err`: classified via [`IngestError::class`]: transient errors are
//!   re-dispatched after backoff until the retry budget runs out, fatal
//!   errors (including an exhausted budget) move the generation to `Failed`,
//!   and stale errors are dropped.
//!
//! Delivery is deliberately at-least-once: a task may be enqueued twice and
//! the stage handlers are built to tolerate it. Swapping this module for a
//! durable queue only requires another [`TaskDispatcher`] implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::errors::{ErrorClass, IngestError};
use crate::pipeline::{Pipeline, StageOutcome, Submission};
use crate::types::{DocumentId, TaskPayload};

/// Hands stage tasks to workers for execution.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, task: TaskPayload) -> Result<(), IngestError>;
}

enum Envelope {
    Task { task: TaskPayload, attempt: u32 },
    Shutdown,
}

struct Inner {
    pipeline: Arc<Pipeline>,
    tx: flume::Sender<Envelope>,
    /// Tasks enqueued or executing, including scheduled retries.
    inflight: AtomicUsize,
}

/// In-process dispatcher backed by a worker pool.
pub struct LocalDispatcher {
    inner: Arc<Inner>,
    worker_count: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalDispatcher {
    /// Spawn `worker_count` workers draining the task channel.
    pub fn new(pipeline: Arc<Pipeline>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (tx, rx) = flume::unbounded();
        let inner = Arc::new(Inner {
            pipeline,
            tx,
            inflight: AtomicUsize::new(0),
        });
        let handles = (0..worker_count)
            .map(|id| {
                let inner = Arc::clone(&inner);
                let rx = rx.clone();
                tokio::spawn(async move { worker_loop(id, inner, rx).await })
            })
            .collect();
        Self {
            inner,
            worker_count,
            handles: Mutex::new(handles),
        }
    }

    /// Submit a document and dispatch its first stage task.
    pub async fn submit(
        &self,
        document_id: &DocumentId,
        content_ref: &str,
    ) -> Result<Submission, IngestError> {
        let submission = self.inner.pipeline.submit(document_id, content_ref).await?;
        self.dispatch(submission.task.clone()).await?;
        Ok(submission)
    }

    /// Block until no task is queued, executing, or awaiting a retry, or
    /// until `timeout` elapses. Returns `true` when idle was reached.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.inner.inflight.load(Ordering::SeqCst) != 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Stop the workers after the channel drains of already-queued tasks.
    pub async fn shutdown(&self) {
        for _ in 0..self.worker_count {
            let _ = self.inner.tx.send_async(Envelope::Shutdown).await;
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl TaskDispatcher for LocalDispatcher {
    async fn dispatch(&self, task: TaskPayload) -> Result<(), IngestError> {
        enqueue(&self.inner, task, 1).await
    }
}

async fn enqueue(inner: &Inner, task: TaskPayload, attempt: u32) -> Result<(), IngestError> {
    inner.inflight.fetch_add(1, Ordering::SeqCst);
    if inner
        .tx
        .send_async(Envelope::Task { task, attempt })
        .await
        .is_err()
    {
        inner.inflight.fetch_sub(1, Ordering::SeqCst);
        return Err(IngestError::store("task dispatcher is shut down"));
    }
    Ok(())
}

async fn worker_loop(id: usize, inner: Arc<Inner>, rx: flume::Receiver<Envelope>) {
    debug!(worker = id, "dispatcher worker started");
    while let Ok(envelope) = rx.recv_async().await {
        match envelope {
            Envelope::Shutdown => break,
            Envelope::Task { task, attempt } => {
                process(&inner, task, attempt).await;
                inner.inflight.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
    debug!(worker = id, "dispatcher worker stopped");
}

#[instrument(skip(inner), fields(task = %task, attempt))]
async fn process(inner: &Arc<Inner>, task: TaskPayload, attempt: u32) {
    match inner.pipeline.handle_task(&task).await {
        Ok(StageOutcome::Advanced { next }) => {
            if let Err(err) = enqueue(inner, next, 1).await {
                error!(%err, "failed to enqueue follow-up task");
            }
        }
        Ok(StageOutcome::Completed) => {
            debug!(task = %task, "generation ready");
        }
        Ok(StageOutcome::Discarded) => {}
        Err(err) => match err.class() {
            ErrorClass::Stale => {
                debug!(task = %task, %err, "stale task result dropped");
            }
            ErrorClass::Transient => {
                let policy = inner.pipeline.config().retry.clone();
                if policy.allows(attempt) {
                    let delay = policy.delay_for(attempt);
                    warn!(task = %task, attempt, delay_ms = delay.as_millis() as u64, %err,
                        "transient stage failure, re-dispatching after backoff");
                    let inner = Arc::clone(inner);
                    inner.inflight.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if inner
                            .tx
                            .send_async(Envelope::Task {
                                task,
                                attempt: attempt + 1,
                            })
                            .await
                            .is_err()
                        {
                            inner.inflight.fetch_sub(1, Ordering::SeqCst);
                        }
                    });
                } else {
                    let exhausted = IngestError::RetriesExhausted {
                        stage: task.stage,
                        attempts: attempt,
                        last: err.to_string(),
                    };
                    fail(inner, &task, &exhausted).await;
                }
            }
            ErrorClass::Fatal => fail(inner, &task, &err).await,
        },
    }
}

async fn fail(inner: &Inner, task: &TaskPayload, err: &IngestError) {
    error!(task = %task, %err, "stage failed terminally");
    if let Err(store_err) = inner
        .pipeline
        .fail(&task.document_id, task.generation, err)
        .await
    {
        error!(task = %task, %store_err, "could not record terminal failure");
    }
}
