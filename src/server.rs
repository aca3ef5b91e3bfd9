use crate::error::SubmissionError;
use crate::recovery;
use crate::storage::Storage;
use crate::store::JobStore;
use crate::submit::{self, Upload, UploadLimits};
use crate::transcode::Transcoder;
use crate::worker::{self, JobQueue, WorkEvent};
use crate::ImageJob;
use anyhow::Error;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Debug)]
pub enum ClientRequest {
    Submit(Upload),
}

#[derive(Debug)]
pub enum ServerMessage {
    Accepted(ImageJob),
    Rejected(Upload, String),
    Recovered(usize),
    JobCompleted(Uuid),
    JobFailed(Uuid, String),
    DatabaseQueueError(Uuid, String),
}

/// Collaborators the pipeline runs against.
#[derive(Clone)]
pub struct ServerContext {
    pub store: Arc<dyn JobStore>,
    pub transcoder: Arc<dyn Transcoder>,
    pub storage: Storage,
    pub limits: UploadLimits,
}

/// Start the worker, run the recovery scan, then accept submissions until
/// `cancel_token` fires or the client hangs up. Recovered ids are enqueued
/// before the first client request is read.
pub async fn serve(
    cancel_token: CancellationToken,
    ctx: ServerContext,
    mut recv_from_client: mpsc::UnboundedReceiver<ClientRequest>,
    send_to_client: mpsc::UnboundedSender<ServerMessage>,
) -> Result<(), Error> {
    ctx.storage.ensure_dirs().await?;

    let (queue, worker_handle) = worker::start(
        cancel_token.clone(),
        ctx.store.clone(),
        ctx.transcoder.clone(),
    );

    let observer_handle = {
        let events = queue.subscribe();
        let send_to_client = send_to_client.clone();
        tokio::spawn(
            observe(events, send_to_client, cancel_token.clone()).instrument(info_span!("observer")),
        )
    };

    let recovered = recovery::requeue_stalled(ctx.store.as_ref(), &queue).await?;
    if send_to_client.send(ServerMessage::Recovered(recovered)).is_err() {
        debug!("Client went away before recovery finished");
    }

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            chan_msg = recv_from_client.recv() => {
                match chan_msg {
                    None => {
                        debug!("Client channel closed, exiting");
                        break;
                    },
                    Some(ClientRequest::Submit(upload)) => {
                        debug!(message = "Requested job", upload = ?upload);
                        let result = accept(&ctx, &queue, &upload).await;
                        let response = match result {
                            Ok(created) => ServerMessage::Accepted(created),
                            Err(err) => {
                                warn!(error = %err, "Rejected submission");
                                ServerMessage::Rejected(upload, err.to_string())
                            }
                        };
                        if let Err(err) = send_to_client.send(response) {
                            error!(message = "Failed to send response to client", error = ?err);
                            break;
                        }
                    }
                }
            }
        }
    }

    // Stops the worker once its in-flight job is done, and the observer with it.
    cancel_token.cancel();
    futures::future::join_all([worker_handle, observer_handle])
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}

async fn accept(
    ctx: &ServerContext,
    queue: &JobQueue,
    upload: &Upload,
) -> Result<ImageJob, SubmissionError> {
    let job = submit::stage_upload(&ctx.storage, &ctx.limits, upload).await?;
    submit::submit(ctx.store.as_ref(), queue, &job).await
}

/// Log worker events and forward them to the client, off the worker's path.
async fn observe(
    mut events: broadcast::Receiver<WorkEvent>,
    send_to_client: mpsc::UnboundedSender<ServerMessage>,
    cancel_token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel_token.cancelled() => break,
            event = events.recv() => event,
        };
        let msg = match event {
            Ok(WorkEvent::JobCompleted(job_id)) => {
                info!(job_id = %job_id, "Job completed");
                ServerMessage::JobCompleted(job_id)
            }
            Ok(WorkEvent::JobFailed(job_id, error_msg)) => {
                warn!(job_id = %job_id, error = %error_msg, "Job failed");
                ServerMessage::JobFailed(job_id, error_msg)
            }
            Ok(WorkEvent::StoreFailed(job_id, error_msg)) => {
                error!(job_id = %job_id, error = %error_msg, "Job left inconsistent, next recovery scan will retry");
                ServerMessage::DatabaseQueueError(job_id, error_msg)
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Observer lagged, {} events dropped", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if send_to_client.send(msg).is_err() {
            debug!("Client channel closed, observer exiting");
            break;
        }
    }
}
