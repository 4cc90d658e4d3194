use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    /// Public URL prefix under which uploaded videos are served.
    #[serde(default = "default_uploads_prefix")]
    pub uploads_prefix: String,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Fixed delay between consecutive frame pulls.
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    /// Only every Nth pulled frame is run through the extractor.
    #[serde(default = "default_process_every")]
    pub process_every: u64,
    /// Upper bound on waiting for a retired worker to exit.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    /// Colors events allowed to queue per connection before new ones are
    /// dropped.
    #[serde(default = "default_color_backlog")]
    pub color_backlog: usize,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            uploads_prefix: default_uploads_prefix(),
            database_path: default_database_path(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: default_frame_interval_ms(),
            process_every: default_process_every(),
            join_timeout_ms: default_join_timeout_ms(),
            color_backlog: default_color_backlog(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

impl ProcessingConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    5000
}
fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}
fn default_uploads_prefix() -> String {
    "/uploads/".into()
}
fn default_database_path() -> PathBuf {
    PathBuf::from("instance/ambilight.db")
}
fn default_frame_interval_ms() -> u64 {
    33
}
fn default_process_every() -> u64 {
    3
}
fn default_join_timeout_ms() -> u64 {
    1000
}
fn default_color_backlog() -> usize {
    8
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".into()
}
fn default_ffprobe_path() -> String {
    "ffprobe".into()
}
fn default_log_level() -> String {
    "info".into()
}
