use crate::error::StoreError;
use crate::{ImageJob, JobStatus, JobUpdate, NewJob};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Durable record of image jobs. The worker is the only writer of job status;
/// everything else reads.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job in `pending`. Fails with `Duplicate` if the id exists.
    async fn create_job(&self, job: &NewJob) -> Result<ImageJob, StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<ImageJob>, StoreError>;

    /// Merge `update` into the job and refresh `updated_at`.
    async fn update_job(&self, id: Uuid, update: &JobUpdate) -> Result<ImageJob, StoreError>;

    /// Newest `created_at` first.
    async fn list_jobs(&self, limit: i64) -> Result<Vec<ImageJob>, StoreError>;

    /// Ids of `pending` and `processing` jobs, oldest `updated_at` first.
    async fn find_requeue_candidates(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// Next `updated_at` for a row last touched at `previous`: now, but never
/// earlier than one microsecond past the previous value.
pub(crate) fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous + Duration::microseconds(1))
}

/// Process-local store, for tests and for running without a database.
#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<Uuid, ImageJob>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with fully-formed records, e.g. rows left by a previous process.
    pub fn with_jobs(jobs: impl IntoIterator<Item = ImageJob>) -> Self {
        MemoryStore {
            jobs: Mutex::new(jobs.into_iter().map(|job| (job.id, job)).collect()),
        }
    }

    /// Remove a record out-of-band.
    pub fn remove(&self, id: Uuid) -> Option<ImageJob> {
        self.lock().remove(&id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ImageJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &NewJob) -> Result<ImageJob, StoreError> {
        let mut jobs = self.lock();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        let now = Utc::now();
        let record = ImageJob {
            id: job.id,
            original_filename: job.original_filename.clone(),
            status: JobStatus::Pending,
            original_path: job.original_path.clone(),
            processed_path: None,
            target_dimension: job.target_dimension,
            original_size_bytes: job.original_size_bytes,
            processed_size_bytes: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        jobs.insert(job.id, record.clone());
        Ok(record)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ImageJob>, StoreError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn update_job(&self, id: Uuid, update: &JobUpdate) -> Result<ImageJob, StoreError> {
        let mut jobs = self.lock();
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        update.apply(job);
        job.updated_at = next_timestamp(job.updated_at);
        Ok(job.clone())
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<ImageJob>, StoreError> {
        let mut jobs: Vec<ImageJob> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn find_requeue_candidates(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut stalled: Vec<(DateTime<Utc>, Uuid)> = self
            .lock()
            .values()
            .filter(|job| !job.status.is_terminal())
            .map(|job| (job.updated_at, job.id))
            .collect();
        stalled.sort();
        Ok(stalled.into_iter().map(|(_, id)| id).collect())
    }
}
