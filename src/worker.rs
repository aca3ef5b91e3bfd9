use crate::error::{StoreError, WorkerError};
use crate::store::JobStore;
use crate::transcode::Transcoder;
use crate::{JobUpdate, MAX_DIMENSION, MIN_DIMENSION};
use async_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Published after each drained id. Observability only: nothing in the
/// pipeline waits on these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkEvent {
    JobCompleted(Uuid),
    JobFailed(Uuid, String),
    StoreFailed(Uuid, String),
}

/// What a single drain step did with a dequeued id.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed(String),
    Missing,
    AlreadyTerminal,
}

/// Handle to the single worker. Cloning it shares the same queue.
#[derive(Clone)]
pub struct JobQueue {
    send_to_worker: Sender<Uuid>,
    events: broadcast::Sender<WorkEvent>,
    busy: Arc<AtomicBool>,
}

impl JobQueue {
    /// Append an id to the tail of the queue. Duplicates are allowed; a
    /// dequeued id whose job is already terminal is skipped.
    pub fn enqueue(&self, job_id: Uuid) -> Result<(), WorkerError> {
        self.send_to_worker
            .try_send(job_id)
            .map_err(|_| WorkerError::QueueClosed)?;
        trace!(job_id = %job_id, backlog = self.send_to_worker.len(), "Enqueued job");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkEvent> {
        self.events.subscribe()
    }

    /// True while the worker is draining.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Ids waiting behind the in-flight one.
    pub fn backlog(&self) -> usize {
        self.send_to_worker.len()
    }
}

/// Start the worker on its own task. It runs until `cancel_token` fires or
/// every `JobQueue` handle is dropped; a job already in flight always runs to
/// completion first.
pub fn start(
    cancel_token: CancellationToken,
    store: Arc<dyn JobStore>,
    transcoder: Arc<dyn Transcoder>,
) -> (JobQueue, JoinHandle<()>) {
    let (send_to_worker, recv_from_queue) = async_channel::unbounded::<Uuid>();
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let busy = Arc::new(AtomicBool::new(false));

    let worker = Worker {
        store,
        transcoder,
        events: events.clone(),
        busy: busy.clone(),
    };
    let join_handle = tokio::spawn(
        worker
            .run(cancel_token, recv_from_queue)
            .instrument(info_span!("worker")),
    );

    let queue = JobQueue {
        send_to_worker,
        events,
        busy,
    };
    (queue, join_handle)
}

struct Worker {
    store: Arc<dyn JobStore>,
    transcoder: Arc<dyn Transcoder>,
    events: broadcast::Sender<WorkEvent>,
    busy: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self, cancel_token: CancellationToken, recv_from_queue: Receiver<Uuid>) {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Worker Cancelled");
                    break;
                },
                job_id = recv_from_queue.recv() => {
                    let Ok(job_id) = job_id else {
                        debug!("Job queue closed, exiting");
                        break;
                    };
                    self.busy.store(true, Ordering::SeqCst);
                    self.drain_one(job_id).await;
                    // Let submissions and status reads run before the next job.
                    tokio::task::yield_now().await;
                    if recv_from_queue.is_empty() {
                        self.busy.store(false, Ordering::SeqCst);
                    }
                }
            }
        }
        self.busy.store(false, Ordering::SeqCst);
        info!("Worker stopped.");
    }

    async fn drain_one(&self, job_id: Uuid) {
        let event = match self.process(job_id).await {
            Ok(Outcome::Completed) => WorkEvent::JobCompleted(job_id),
            Ok(Outcome::Failed(msg)) => WorkEvent::JobFailed(job_id, msg),
            Ok(Outcome::Missing) => {
                debug!(job_id = %job_id, "Job no longer exists, skipping");
                return;
            }
            Ok(Outcome::AlreadyTerminal) => {
                debug!(job_id = %job_id, "Job already finished, skipping");
                return;
            }
            Err(err) => {
                error!(job_id = %job_id, error = %err, "Job store failed while processing");
                WorkEvent::StoreFailed(job_id, err.to_string())
            }
        };
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    #[instrument(skip_all, fields(job_id = %job_id))]
    async fn process(&self, job_id: Uuid) -> Result<Outcome, StoreError> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(Outcome::Missing);
        };
        if job.status.is_terminal() {
            return Ok(Outcome::AlreadyTerminal);
        }

        self.store
            .update_job(job_id, &JobUpdate::processing())
            .await?;

        let dimension = job.target_dimension.clamp(MIN_DIMENSION, MAX_DIMENSION) as u32;
        match self
            .transcoder
            .transcode(job_id, &job.original_path, dimension)
            .await
        {
            Ok(output) => {
                self.store
                    .update_job(
                        job_id,
                        &JobUpdate::completed(output.output_path, output.output_size_bytes),
                    )
                    .await?;
                Ok(Outcome::Completed)
            }
            Err(err) => {
                let msg = err.to_string();
                warn!(error = %msg, "Transcode failed");
                self.store
                    .update_job(job_id, &JobUpdate::failed(msg.clone()))
                    .await?;
                Ok(Outcome::Failed(msg))
            }
        }
    }
}
