use crate::store::JobStore;
use crate::worker::JobQueue;
use anyhow::Error;
use tracing::{info, instrument};

/// Re-enqueue every job a previous process left `pending` or `processing`,
/// oldest `updated_at` first. Run once, before any new submission is enqueued.
/// An interrupted `processing` job restarts from scratch.
#[instrument(name = "recovery", skip_all)]
pub async fn requeue_stalled(store: &dyn JobStore, queue: &JobQueue) -> Result<usize, Error> {
    let stalled = store.find_requeue_candidates().await?;
    for job_id in &stalled {
        queue.enqueue(*job_id)?;
    }
    if !stalled.is_empty() {
        info!("Requeued {} stalled jobs", stalled.len());
    }
    Ok(stalled.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transcode::{TranscodeOutput, Transcoder};
    use crate::worker;
    use crate::{ImageJob, JobStatus};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[derive(Default)]
    struct OrderRecorder {
        seen: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl Transcoder for OrderRecorder {
        async fn transcode(
            &self,
            job_id: Uuid,
            _source_path: &str,
            _target_dimension: u32,
        ) -> Result<TranscodeOutput, crate::error::TransformError> {
            self.seen.lock().unwrap().push(job_id);
            Ok(TranscodeOutput {
                output_path: format!("processed/{}.jpg", job_id),
                output_size_bytes: 1,
            })
        }
    }

    fn stored(status: JobStatus, minutes_ago: i64) -> ImageJob {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        ImageJob {
            id: Uuid::new_v4(),
            original_filename: None,
            status,
            original_path: "uploads/x.png".into(),
            processed_path: None,
            target_dimension: 1024,
            original_size_bytes: None,
            processed_size_bytes: None,
            error: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn requeues_oldest_stalled_first() {
        let newer = stored(JobStatus::Pending, 1);
        let older = stored(JobStatus::Processing, 30);
        let mut done = stored(JobStatus::Completed, 60);
        done.processed_path = Some("processed/done.jpg".into());
        let store = Arc::new(MemoryStore::with_jobs([newer.clone(), older.clone(), done]));

        let recorder = Arc::new(OrderRecorder::default());
        let cancel_token = CancellationToken::new();
        let (queue, handle) = worker::start(cancel_token.clone(), store.clone(), recorder.clone());
        let mut events = queue.subscribe();

        let requeued = requeue_stalled(&*store, &queue).await.unwrap();
        assert_eq!(requeued, 2);

        for _ in 0..2 {
            events.recv().await.unwrap();
        }
        assert_eq!(*recorder.seen.lock().unwrap(), vec![older.id, newer.id]);

        cancel_token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn nothing_to_recover() {
        let store = MemoryStore::new();
        let cancel_token = CancellationToken::new();
        let (queue, handle) = worker::start(
            cancel_token.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(OrderRecorder::default()),
        );
        assert_eq!(requeue_stalled(&store, &queue).await.unwrap(), 0);
        assert_eq!(queue.backlog(), 0);
        cancel_token.cancel();
        handle.await.unwrap();
    }
}
