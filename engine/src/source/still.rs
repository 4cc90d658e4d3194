use std::path::{Path, PathBuf};

use ambilight_common::frame::Frame;
use async_trait::async_trait;
use image::ImageReader;
use tracing::debug;

use super::{FrameSource, SourceError};

/// A still image treated as a one-frame video.
///
/// Each pass yields the decoded frame once and then reports end of stream,
/// so the looping session keeps re-emitting the same colors.
pub struct StillImageSource {
    path: PathBuf,
    frame: Option<Frame>,
    served: bool,
}

impl StillImageSource {
    pub async fn open(path: &Path) -> Result<Self, SourceError> {
        let owned = path.to_path_buf();
        let frame = tokio::task::spawn_blocking(move || decode(&owned))
            .await
            .map_err(|e| SourceError::Unreadable(format!("decode task failed: {e}")))??;

        debug!(
            path = path.display().to_string(),
            width = frame.width(),
            height = frame.height(),
            "still image decoded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            frame: Some(frame),
            served: false,
        })
    }
}

fn decode(path: &Path) -> Result<Frame, SourceError> {
    let img = ImageReader::open(path)
        .map_err(|e| SourceError::Unreadable(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| SourceError::Unreadable(e.to_string()))?
        .decode()
        .map_err(|e| SourceError::Unreadable(e.to_string()))?;
    Frame::from_rgb_image(&img.to_rgb8()).map_err(|e| SourceError::Unreadable(e.to_string()))
}

#[async_trait]
impl FrameSource for StillImageSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.served {
            return Ok(None);
        }
        self.served = true;
        Ok(self.frame.clone())
    }

    async fn rewind(&mut self) -> Result<(), SourceError> {
        if self.frame.is_none() {
            return Err(SourceError::Unreadable(format!(
                "{} already closed",
                self.path.display()
            )));
        }
        self.served = false;
        Ok(())
    }

    async fn close(&mut self) {
        self.frame = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(name: &str, rgb: [u8; 3]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{name}_{}.png", std::process::id()));
        image::RgbImage::from_pixel(8, 6, image::Rgb(rgb))
            .save(&path)
            .unwrap();
        path
    }

    #[tokio::test]
    async fn yields_one_frame_per_pass() {
        let path = write_png("still_source_pass", [10, 20, 30]);
        let mut source = StillImageSource::open(&path).await.unwrap();

        let frame = source.next_frame().await.unwrap().unwrap();
        assert_eq!((frame.width(), frame.height()), (8, 6));
        assert_eq!(frame.bgr_at(0, 0), [30, 20, 10]);
        assert!(source.next_frame().await.unwrap().is_none());

        source.rewind().await.unwrap();
        assert!(source.next_frame().await.unwrap().is_some());

        source.close().await;
        assert!(source.rewind().await.is_err());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn garbage_file_is_unreadable() {
        let path = std::env::temp_dir().join(format!("still_garbage_{}.png", std::process::id()));
        std::fs::write(&path, b"definitely not a png").unwrap();
        let err = StillImageSource::open(&path).await.err().unwrap();
        assert!(matches!(err, SourceError::Unreadable(_)));
        let _ = std::fs::remove_file(path);
    }
}
