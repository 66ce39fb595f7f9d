use crate::config::ArchiveConfig;
use crate::frame::Frame;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("failed to create archive directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write frame: {0}")]
    Write(#[from] image::ImageError),
    #[error("archive task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Keeps a PNG copy of every accepted frame under one directory.
#[derive(Debug, Clone)]
pub struct FrameArchive {
    directory: PathBuf,
}

impl FrameArchive {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory).map_err(|source| ArchiveError::CreateDir {
            path: directory.clone(),
            source,
        })?;

        Ok(Self { directory })
    }

    /// `None` when archiving is switched off.
    pub fn from_config(config: &ArchiveConfig) -> Result<Option<Self>, ArchiveError> {
        match (&config.enabled, &config.directory) {
            (true, Some(directory)) => Self::new(directory).map(Some),
            _ => Ok(None),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, frame: &Frame) -> PathBuf {
        self.directory.join(format!("{}.png", frame.id))
    }

    pub async fn save(&self, frame: &Frame) -> Result<PathBuf, ArchiveError> {
        let path = self.path_for(frame);
        let image = frame.image.clone();

        let written = path.clone();
        tokio::task::spawn_blocking(move || image.save_with_format(&written, ImageFormat::Png))
            .await??;

        tracing::debug!(frame_id = %frame.id, path = %path.display(), "frame archived");
        Ok(path)
    }

    /// Saves in the background; failures are logged only.
    pub fn spawn_save(&self, frame: &Frame) {
        let archive = self.clone();
        let frame = frame.clone();
        tokio::spawn(async move {
            if let Err(e) = archive.save(&frame).await {
                tracing::warn!(frame_id = %frame.id, "failed to archive frame: {}", e);
            }
        });
    }
}
