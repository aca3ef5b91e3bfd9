use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("File is required: '{0}' does not exist")]
    MissingFile(PathBuf),

    #[error("Only image uploads are allowed, got '{mime}' for '{path}'")]
    NotAnImage { path: PathBuf, mime: String },

    #[error("File is too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("Failed to stage upload '{path}': {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to persist job: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to enqueue job: {0}")]
    Queue(#[from] WorkerError),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {0} already exists")]
    Duplicate(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("I/O error for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Transcode task aborted: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Job queue is closed")]
    QueueClosed,
}
