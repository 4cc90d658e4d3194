use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use ambilight_common::frame::Frame;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::{FrameSource, SourceError};

/// Decodes a video file through an `ffmpeg` child process.
///
/// Dimensions are probed once with `ffprobe`; the decoder then writes raw
/// `bgr24` frames of exactly `width * height * 3` bytes to its stdout.
/// Autorotation is disabled so the decoded size always matches the coded
/// size `ffprobe` reports, including for clips carrying rotation metadata.
/// Rewinding restarts the child from the beginning of the file.
pub struct FfmpegSource {
    path: PathBuf,
    ffmpeg_path: String,
    width: usize,
    height: usize,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    frames_read: u64,
}

impl FfmpegSource {
    pub async fn open(path: &Path, ffmpeg_path: &str, ffprobe_path: &str) -> Result<Self, SourceError> {
        let (width, height) = ffprobe_dimensions(path, ffprobe_path).await?;

        let mut source = Self {
            path: path.to_path_buf(),
            ffmpeg_path: ffmpeg_path.to_string(),
            width,
            height,
            child: None,
            stdout: None,
            frames_read: 0,
        };
        source.spawn_decoder()?;

        info!(
            path = source.path.display().to_string(),
            width, height, "ffmpeg decoder opened"
        );
        Ok(source)
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn spawn_decoder(&mut self) -> Result<(), SourceError> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(decoder_args(&self.path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SourceError::Unreadable(format!("failed to spawn {}: {e}", self.ffmpeg_path)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Unreadable("could not get ffmpeg stdout handle".into()))?;

        self.child = Some(child);
        self.stdout = Some(stdout);
        self.frames_read = 0;
        Ok(())
    }

    async fn stop_decoder(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "ffmpeg already exited");
            }
        }
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        let mut buf = vec![0u8; self.width * self.height * 3];
        match stdout.read_exact(&mut buf).await {
            Ok(_) => {
                self.frames_read += 1;
                Frame::from_bgr(self.width, self.height, buf)
                    .map(Some)
                    .map_err(|e| SourceError::Decode(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(
                    path = self.path.display().to_string(),
                    frames = self.frames_read,
                    "end of stream"
                );
                self.stdout = None;
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, frame = self.frames_read, "failed to read frame from ffmpeg");
                Err(SourceError::Decode(e.to_string()))
            }
        }
    }

    async fn rewind(&mut self) -> Result<(), SourceError> {
        self.stop_decoder().await;
        self.spawn_decoder()
    }

    async fn close(&mut self) {
        self.stop_decoder().await;
        debug!(path = self.path.display().to_string(), "ffmpeg decoder closed");
    }
}

/// Ask ffprobe for the first video stream's dimensions.
fn decoder_args(path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-v", "error", "-nostdin", "-noautorotate", "-i"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(path.as_os_str().to_owned());
    args.extend(
        ["-an", "-f", "rawvideo", "-pix_fmt", "bgr24", "pipe:1"]
            .into_iter()
            .map(OsString::from),
    );
    args
}

async fn ffprobe_dimensions(path: &Path, ffprobe_path: &str) -> Result<(usize, usize), SourceError> {
    let output = Command::new(ffprobe_path)
        .args([
            "-v", "error",
            "-select_streams", "v:0",
            "-show_entries", "stream=width,height",
            "-of", "csv=s=x:p=0",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| SourceError::Unreadable(format!("failed to run {ffprobe_path}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SourceError::Unreadable(stderr.trim().to_string()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_dimensions(&stdout).ok_or_else(|| {
        SourceError::Unreadable(format!("no video stream in {}", path.display()))
    })
}

/// Parse ffprobe's `WIDTHxHEIGHT` output.
fn parse_dimensions(s: &str) -> Option<(usize, usize)> {
    let line = s.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (w, h) = line.split_once('x')?;
    let w: usize = w.trim().parse().ok()?;
    // some containers append a trailing separator
    let h: usize = h.trim().trim_end_matches('x').parse().ok()?;
    (w > 0 && h > 0).then_some((w, h))
}
