use crate::error::TransformError;
use crate::storage::Storage;
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageReader};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeOutput {
    /// Relative to the storage root.
    pub output_path: String,
    pub output_size_bytes: i64,
}

/// Decode, resize and re-encode one image. Implementations must be safe to
/// call again for the same job: a rerun overwrites the previous output.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        job_id: Uuid,
        source_path: &str,
        target_dimension: u32,
    ) -> Result<TranscodeOutput, TransformError>;
}

/// Reorients from EXIF, fits the image inside a `target × target` box and
/// writes it as JPEG to `processed/<job id>.jpg`.
#[derive(Debug, Clone)]
pub struct ImageTranscoder {
    storage: Storage,
    quality: u8,
}

impl ImageTranscoder {
    pub fn new(storage: Storage, quality: u8) -> Self {
        ImageTranscoder {
            storage,
            quality: quality.clamp(1, 100),
        }
    }
}

#[async_trait]
impl Transcoder for ImageTranscoder {
    #[instrument(skip(self), fields(quality = self.quality))]
    async fn transcode(
        &self,
        job_id: Uuid,
        source_path: &str,
        target_dimension: u32,
    ) -> Result<TranscodeOutput, TransformError> {
        let output_path = Storage::processed_path(job_id);
        let source = self.storage.resolve(source_path);
        let target = self.storage.resolve(&output_path);
        let quality = self.quality;

        let size = tokio::task::spawn_blocking(move || {
            encode_jpeg(&source, &target, target_dimension, quality)
        })
        .await
        .map_err(|err| TransformError::Task(err.to_string()))??;

        debug!(output = %output_path, bytes = size, "Transcoded image");
        Ok(TranscodeOutput {
            output_path,
            output_size_bytes: size as i64,
        })
    }
}

fn encode_jpeg(
    source: &Path,
    target: &Path,
    dimension: u32,
    quality: u8,
) -> Result<u64, TransformError> {
    let mut decoder = ImageReader::open(source)
        .map_err(io_error(source))?
        .with_guessed_format()
        .map_err(io_error(source))?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);

    let resized = image.resize(dimension, dimension, FilterType::Lanczos3);
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());

    let file = File::create(target).map_err(io_error(target))?;
    let mut writer = BufWriter::new(file);
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut writer, quality))?;
    writer.flush().map_err(io_error(target))?;

    Ok(std::fs::metadata(target).map_err(io_error(target))?.len())
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TransformError {
    let path = path.to_path_buf();
    move |source| TransformError::Io { path, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};
    use tempfile::TempDir;

    async fn storage(temp_dir: &TempDir) -> Storage {
        let storage = Storage::new(temp_dir.path());
        storage.ensure_dirs().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn fits_inside_target_box() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;
        let source = storage.resolve("uploads/wide.png");
        RgbImage::from_pixel(800, 400, Rgb([200, 10, 10]))
            .save(&source)
            .unwrap();

        let transcoder = ImageTranscoder::new(storage.clone(), 72);
        let id = Uuid::new_v4();
        let output = transcoder
            .transcode(id, "uploads/wide.png", 512)
            .await
            .unwrap();

        assert_eq!(output.output_path, Storage::processed_path(id));
        let written = storage.resolve(&output.output_path);
        assert_eq!(
            std::fs::metadata(&written).unwrap().len() as i64,
            output.output_size_bytes
        );
        let decoded = image::open(&written).unwrap();
        assert_eq!(decoded.dimensions(), (512, 256));
    }

    #[tokio::test]
    async fn rerun_overwrites_previous_output() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;
        RgbImage::from_pixel(300, 300, Rgb([0, 0, 255]))
            .save(storage.resolve("uploads/square.png"))
            .unwrap();
        let id = Uuid::new_v4();
        std::fs::write(storage.resolve(&Storage::processed_path(id)), b"partial").unwrap();

        let transcoder = ImageTranscoder::new(storage.clone(), 72);
        let output = transcoder
            .transcode(id, "uploads/square.png", 256)
            .await
            .unwrap();
        let decoded = image::open(storage.resolve(&output.output_path)).unwrap();
        assert_eq!(decoded.dimensions(), (256, 256));
    }

    #[tokio::test]
    async fn corrupt_input_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;
        std::fs::write(storage.resolve("uploads/broken.png"), b"definitely not a png").unwrap();

        let transcoder = ImageTranscoder::new(storage, 72);
        let err = transcoder
            .transcode(Uuid::new_v4(), "uploads/broken.png", 512)
            .await
            .unwrap_err();
        assert!(!err.to_string().is_empty());
    }

    #[tokio::test]
    async fn missing_input_is_an_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;
        let transcoder = ImageTranscoder::new(storage, 72);
        let err = transcoder
            .transcode(Uuid::new_v4(), "uploads/nope.png", 512)
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::Io { .. }));
    }
}
