use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const UPLOADS_DIR: &str = "uploads";
pub const PROCESSED_DIR: &str = "processed";

/// On-disk layout under the storage root. Job records only ever hold paths
/// relative to the root, always `/`-separated.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Storage { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [UPLOADS_DIR, PROCESSED_DIR] {
            tokio::fs::create_dir_all(self.root.join(dir)).await?;
        }
        Ok(())
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    /// `uploads/<id><ext>`, defaulting the extension to `.png` like the upload form does.
    pub fn upload_path(id: Uuid, extension: Option<&str>) -> String {
        let ext = extension.filter(|ext| !ext.is_empty()).unwrap_or("png");
        format!("{}/{}.{}", UPLOADS_DIR, id, ext)
    }

    pub fn processed_path(id: Uuid) -> String {
        format!("{}/{}.jpg", PROCESSED_DIR, id)
    }

    /// URL under which the media of a relative path is served.
    pub fn media_url(relative: &str) -> String {
        format!("/media/{}", relative)
    }
}
