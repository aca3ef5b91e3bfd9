use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub mod config;
pub mod db;
pub mod error;
pub mod recovery;
pub mod server;
pub mod storage;
pub mod store;
pub mod submit;
pub mod telemetry;
pub mod transcode;
pub mod worker;

/// Smallest accepted target edge, in pixels.
pub const MIN_DIMENSION: i32 = 256;
/// Largest accepted target edge, in pixels.
pub const MAX_DIMENSION: i32 = 4096;

/// Clamp a requested target edge into `[MIN_DIMENSION, MAX_DIMENSION]`.
pub fn clamp_dimension(requested: i64) -> i32 {
    requested.clamp(MIN_DIMENSION as i64, MAX_DIMENSION as i64) as i32
}

/// Everything the submission path knows about a job before it is persisted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub original_filename: Option<String>,
    pub original_path: String,
    pub target_dimension: i32,
    pub original_size_bytes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ImageJob {
    pub id: Uuid,
    pub original_filename: Option<String>,
    pub status: JobStatus,
    pub original_path: String,
    pub processed_path: Option<String>,
    pub target_dimension: i32,
    pub original_size_bytes: Option<i64>,
    pub processed_size_bytes: Option<i64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageJob {
    /// A terminal job carries exactly one of `processed_path` and `error`,
    /// a live one carries neither.
    pub fn is_consistent(&self) -> bool {
        if self.status.is_terminal() {
            self.processed_path.is_some() != self.error.is_some()
        } else {
            self.processed_path.is_none() && self.error.is_none()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(type_name = "image_job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A partial update merged into a stored job. `None` leaves a field untouched;
/// for nullable columns `Some(None)` clears it. `updated_at` is always refreshed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub processed_path: Option<Option<String>>,
    pub processed_size_bytes: Option<Option<i64>>,
    pub error: Option<Option<String>>,
}

impl JobUpdate {
    pub fn processing() -> Self {
        JobUpdate {
            status: Some(JobStatus::Processing),
            processed_path: Some(None),
            processed_size_bytes: Some(None),
            error: Some(None),
        }
    }

    pub fn completed(processed_path: String, processed_size_bytes: i64) -> Self {
        JobUpdate {
            status: Some(JobStatus::Completed),
            processed_path: Some(Some(processed_path)),
            processed_size_bytes: Some(Some(processed_size_bytes)),
            error: Some(None),
        }
    }

    pub fn failed(error: String) -> Self {
        JobUpdate {
            status: Some(JobStatus::Failed),
            processed_path: Some(None),
            processed_size_bytes: Some(None),
            error: Some(Some(error)),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == JobUpdate::default()
    }

    /// Merge into an in-memory record. Timestamps are the caller's business.
    pub fn apply(&self, job: &mut ImageJob) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(path) = &self.processed_path {
            job.processed_path = path.clone();
        }
        if let Some(size) = self.processed_size_bytes {
            job.processed_size_bytes = size;
        }
        if let Some(error) = &self.error {
            job.error = error.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus) -> ImageJob {
        let now = Utc::now();
        ImageJob {
            id: Uuid::new_v4(),
            original_filename: Some("cat.png".into()),
            status,
            original_path: "uploads/cat.png".into(),
            processed_path: None,
            target_dimension: 512,
            original_size_bytes: Some(10),
            processed_size_bytes: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn clamps_dimension_into_bounds() {
        assert_eq!(clamp_dimension(10), MIN_DIMENSION);
        assert_eq!(clamp_dimension(1024), 1024);
        assert_eq!(clamp_dimension(1 << 40), MAX_DIMENSION);
        assert_eq!(clamp_dimension(-5), MIN_DIMENSION);
    }

    #[test]
    fn failure_after_success_keeps_one_outcome() {
        let mut j = job(JobStatus::Processing);
        JobUpdate::completed("processed/x.jpg".into(), 42).apply(&mut j);
        assert!(j.is_consistent());

        JobUpdate::processing().apply(&mut j);
        assert_eq!(j.status, JobStatus::Processing);
        assert!(j.is_consistent());

        JobUpdate::failed("boom".into()).apply(&mut j);
        assert_eq!(j.processed_path, None);
        assert_eq!(j.processed_size_bytes, None);
        assert_eq!(j.error.as_deref(), Some("boom"));
        assert!(j.is_consistent());
    }

    #[test]
    fn empty_update_leaves_fields_alone() {
        let mut j = job(JobStatus::Pending);
        let before = j.clone();
        let update = JobUpdate::default();
        assert!(update.is_empty());
        update.apply(&mut j);
        assert_eq!(j, before);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert_eq!(JobStatus::Processing.to_string(), "processing");
    }
}
