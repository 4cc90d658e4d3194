//! Request handling for one real-time connection.
//!
//! Every client request produces exactly one acknowledgment, emitted from
//! here rather than from the session worker. A `processing_started` ack may
//! therefore reach the client before the worker's first `colors` event.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use ambilight_common::protocol::{ClientEvent, ServerEvent};
use ambilight_common::settings::{Settings, SettingsPatch};
use tracing::{debug, error, info, warn};

use crate::emitter::Emitter;
use crate::error::ProcessingError;
use crate::extractor::ExtractorConfig;
use crate::registry::{ConnectionId, SessionRegistry};
use crate::store::{HistoryRecorder, SettingsProvider};

/// Maps the public video path a client sends to a local file.
///
/// Paths under the uploads prefix are rebased onto the uploads directory;
/// other relative paths are taken relative to it. Absolute paths and
/// parent-directory components are rejected, so every resolved path stays
/// inside the uploads directory.
#[derive(Debug, Clone)]
pub struct PathResolver {
    uploads_prefix: String,
    uploads_dir: PathBuf,
}

impl PathResolver {
    pub fn new(uploads_prefix: impl Into<String>, uploads_dir: impl Into<PathBuf>) -> Self {
        Self {
            uploads_prefix: uploads_prefix.into(),
            uploads_dir: uploads_dir.into(),
        }
    }

    pub fn resolve(&self, public: &str) -> Result<PathBuf, ProcessingError> {
        let public = public.trim();
        if public.is_empty() {
            return Err(ProcessingError::InvalidRequest("video_path is empty".into()));
        }

        let relative = match public.strip_prefix(self.uploads_prefix.as_str()) {
            Some(rest) => rest.trim_start_matches('/'),
            None => public,
        };
        if relative.is_empty() {
            return Err(ProcessingError::InvalidRequest(format!(
                "no file named in {public}"
            )));
        }

        let relative = Path::new(relative);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(ProcessingError::InvalidRequest(format!(
                "video_path must stay inside the uploads directory: {public}"
            )));
        }
        Ok(self.uploads_dir.join(relative))
    }
}

/// Turns client requests into registry calls and acknowledgments.
pub struct ControlPlane {
    registry: SessionRegistry,
    config: Arc<ExtractorConfig>,
    settings: Arc<dyn SettingsProvider>,
    history: Arc<dyn HistoryRecorder>,
    resolver: PathResolver,
}

impl ControlPlane {
    /// Build the control plane and seed the live extractor configuration
    /// from the settings store.
    pub async fn new(
        registry: SessionRegistry,
        history: Arc<dyn HistoryRecorder>,
        resolver: PathResolver,
    ) -> Self {
        let ctx = registry.context();
        let config = Arc::clone(&ctx.config);
        let settings = Arc::clone(&ctx.settings);

        match settings.get().await {
            Ok(stored) => {
                config.apply_settings(&stored);
                info!(settings = ?config.snapshot(), "extractor configuration loaded from store");
            }
            Err(e) => warn!(error = %e, "could not load stored settings, using defaults"),
        }

        Self {
            registry,
            config,
            settings,
            history,
            resolver,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Arc<ExtractorConfig> {
        &self.config
    }

    /// Decode and handle one text message. Undecodable messages are answered
    /// with an `error` event.
    pub async fn handle_text(&self, conn: ConnectionId, text: &str, emitter: Arc<dyn Emitter>) {
        match ClientEvent::parse(text) {
            Ok(event) => self.handle(conn, event, emitter).await,
            Err(e) => {
                warn!(%conn, error = %e, "rejected client message");
                let err = ProcessingError::InvalidRequest(e.to_string());
                send(conn, emitter.as_ref(), ServerEvent::error(err.to_string()));
            }
        }
    }

    pub async fn handle(&self, conn: ConnectionId, event: ClientEvent, emitter: Arc<dyn Emitter>) {
        debug!(%conn, ?event, "client request");
        let reply = match event {
            ClientEvent::StartVideoProcessing { video_path } => {
                match self.start(conn, video_path.as_deref(), Arc::clone(&emitter)).await {
                    Ok(()) => ServerEvent::ProcessingStarted { success: true },
                    Err(e) => ServerEvent::error(e.to_string()),
                }
            }
            ClientEvent::StopVideoProcessing => {
                self.registry.stop(conn).await;
                ServerEvent::ProcessingStopped { success: true }
            }
            ClientEvent::UpdateSettings(patch) => match self.update_settings(&patch).await {
                Ok(()) => ServerEvent::SettingsUpdated { success: true },
                Err(e) => ServerEvent::error(e.to_string()),
            },
        };
        send(conn, emitter.as_ref(), reply);
    }

    async fn start(
        &self,
        conn: ConnectionId,
        video_path: Option<&str>,
        emitter: Arc<dyn Emitter>,
    ) -> Result<(), ProcessingError> {
        let public = video_path
            .ok_or_else(|| ProcessingError::InvalidRequest("video_path is required".into()))?;
        let path = self.resolver.resolve(public)?;

        let filename = file_name(&path);
        if let Err(e) = self
            .history
            .add(&filename, &path.display().to_string())
            .await
        {
            warn!(%conn, error = %e, "could not record playback history");
        }

        self.registry
            .start_or_replace(conn, path, emitter)
            .await
            .map_err(|e| ProcessingError::InvalidRequest(e.to_string()))
    }

    /// Clamp, apply to the live configuration, then persist the provided
    /// fields. The live update stands even if persisting fails.
    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<(), ProcessingError> {
        if patch.is_empty() {
            debug!("empty settings update");
            return Ok(());
        }
        let patch = patch.clamped();
        self.config.apply_patch(&patch);

        self.settings.update(&patch).await.map_err(|e| {
            error!(error = %e, "failed to persist settings");
            ProcessingError::SettingsUpdateFailure(e)
        })
    }

    /// Current persisted settings with the live extractor values on top.
    pub async fn current_settings(&self) -> Settings {
        let mut settings = self.settings.get().await.unwrap_or_else(|e| {
            warn!(error = %e, "could not read stored settings");
            Settings::default()
        });
        let live = self.config.snapshot();
        settings.zones_per_side = live.zones_per_side;
        settings.intensity = live.intensity;
        settings.blur_amount = live.blur_amount;
        settings
    }

    /// The connection is gone: retire its session without acknowledging.
    pub async fn disconnect(&self, conn: ConnectionId) {
        if self.registry.drop_connection(conn).await {
            info!(%conn, "session retired on disconnect");
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn send(conn: ConnectionId, emitter: &dyn Emitter, event: ServerEvent) {
    let name = event.name();
    if let Err(e) = emitter.emit(event) {
        warn!(%conn, event = name, error = %e, "failed to send acknowledgment");
    }
}
