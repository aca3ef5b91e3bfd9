//! Submission side of the pipeline: stage the upload under the storage root,
//! persist a `pending` job, and only then hand its id to the worker.

use crate::error::SubmissionError;
use crate::storage::Storage;
use crate::store::JobStore;
use crate::worker::JobQueue;
use crate::{clamp_dimension, ImageJob, NewJob};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};
use uuid::Uuid;

/// A file offered for processing.
#[derive(Debug, Clone)]
pub struct Upload {
    pub source: PathBuf,
    /// Requested longest edge; out-of-range values are clamped, `None` uses the default.
    pub requested_size: Option<i64>,
}

impl Upload {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Upload {
            source: source.into(),
            requested_size: None,
        }
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.requested_size = Some(size);
        self
    }
}

#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_upload_bytes: u64,
    pub default_dimension: i64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        UploadLimits {
            max_upload_bytes: 15 * 1024 * 1024,
            default_dimension: 1024,
        }
    }
}

/// Copy the upload into `uploads/` under a fresh job id and describe the job.
pub async fn stage_upload(
    storage: &Storage,
    limits: &UploadLimits,
    upload: &Upload,
) -> Result<NewJob, SubmissionError> {
    let source = &upload.source;
    let metadata = match tokio::fs::metadata(source).await {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => return Err(SubmissionError::MissingFile(source.clone())),
    };

    let mime = mime_guess::from_path(source).first_or_octet_stream();
    if mime.type_() != mime_guess::mime::IMAGE {
        return Err(SubmissionError::NotAnImage {
            path: source.clone(),
            mime: mime.to_string(),
        });
    }

    if metadata.len() > limits.max_upload_bytes {
        return Err(SubmissionError::TooLarge {
            size: metadata.len(),
            limit: limits.max_upload_bytes,
        });
    }

    let id = Uuid::new_v4();
    let extension = source.extension().and_then(|ext| ext.to_str());
    let original_path = Storage::upload_path(id, extension);
    let target = storage.resolve(&original_path);
    let copied = tokio::fs::copy(source, &target)
        .await
        .map_err(|err| SubmissionError::Staging {
            path: target.clone(),
            source: err,
        })?;

    let target_dimension = clamp_dimension(upload.requested_size.unwrap_or(limits.default_dimension));
    debug!(job_id = %id, path = %original_path, target_dimension, "Staged upload");

    Ok(NewJob {
        id,
        original_filename: file_name(source),
        original_path,
        target_dimension,
        original_size_bytes: Some(copied as i64),
    })
}

/// Persist then enqueue. The id reaches the worker only after the row exists.
#[instrument(skip_all, fields(job_id = %job.id))]
pub async fn submit(
    store: &dyn JobStore,
    queue: &JobQueue,
    job: &NewJob,
) -> Result<ImageJob, SubmissionError> {
    let created = store.create_job(job).await?;
    queue.enqueue(created.id)?;
    Ok(created)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}
