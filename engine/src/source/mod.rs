//! Frame sources.
//!
//! A [`FrameSource`] yields decoded frames until the end of its stream and
//! can be rewound to the start. Sessions rewind on every end-of-stream, so an
//! open source is effectively an endless loop over the video: ambient light
//! keeps following the picture for as long as the client wants it. The only
//! way out is the session's cancellation token.

mod ffmpeg;
mod still;

pub use ffmpeg::FfmpegSource;
pub use still::StillImageSource;

use std::path::{Path, PathBuf};

use ambilight_common::frame::Frame;
use async_trait::async_trait;

#[async_trait]
pub trait FrameSource: Send {
    /// Pull the next frame. `Ok(None)` marks the end of the stream.
    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Seek back to the first frame.
    async fn rewind(&mut self) -> Result<(), SourceError>;

    /// Release decoder resources. The source is unusable afterwards.
    async fn close(&mut self);
}

/// Opens a [`FrameSource`] for a local path.
#[async_trait]
pub trait SourceOpener: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, SourceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("video not found: {0}")]
    NotFound(PathBuf),
    #[error("video unreadable: {0}")]
    Unreadable(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("decoder I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Single-frame failures the loop recovers from.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

const STILL_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "webp", "tif", "tiff"];

/// Default opener: still images are decoded in-process, everything else is
/// handed to ffmpeg.
pub struct MediaOpener {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl MediaOpener {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    pub fn is_still_image(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| STILL_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl SourceOpener for MediaOpener {
    async fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, SourceError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(SourceError::NotFound(path.to_path_buf()));
        }
        if Self::is_still_image(path) {
            let source = StillImageSource::open(path).await?;
            Ok(Box::new(source))
        } else {
            let source = FfmpegSource::open(path, &self.ffmpeg_path, &self.ffprobe_path).await?;
            Ok(Box::new(source))
        }
    }
}
