mod connections;
mod db;
mod routes;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use ambilight_common::config::Config;
use ambilight_engine::control::{ControlPlane, PathResolver};
use ambilight_engine::extractor::ExtractorConfig;
use ambilight_engine::registry::SessionRegistry;
use ambilight_engine::session::{Pacing, SessionContext};
use ambilight_engine::source::MediaOpener;
use ambilight_engine::store::{HistoryRecorder, MemoryStore, SettingsProvider};
use connections::ConnectionTable;
use routes::AppState;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        bind = config.server.bind,
        port = config.server.port,
        uploads_dir = config.storage.uploads_dir.display().to_string(),
        database = config.storage.database_path.display().to_string(),
        frame_interval_ms = config.processing.frame_interval_ms,
        process_every = config.processing.process_every,
        color_backlog = config.processing.color_backlog,
        "starting ambilight server"
    );

    if let Err(e) = std::fs::create_dir_all(&config.storage.uploads_dir) {
        warn!(error = %e, "could not create uploads directory");
    }

    let (settings, history) = open_store(&config);

    let ctx = SessionContext {
        config: Arc::new(ExtractorConfig::default()),
        settings,
        opener: Arc::new(MediaOpener::new(
            config.processing.ffmpeg_path.clone(),
            config.processing.ffprobe_path.clone(),
        )),
        pacing: Pacing::from(&config.processing),
    };
    let registry = SessionRegistry::new(ctx, config.processing.join_timeout());
    let control = ControlPlane::new(
        registry,
        Arc::clone(&history),
        PathResolver::new(
            config.storage.uploads_prefix.clone(),
            config.storage.uploads_dir.clone(),
        ),
    )
    .await;

    let state = AppState {
        control: Arc::new(control),
        history,
        connections: Arc::new(ConnectionTable::default()),
        color_backlog: config.processing.color_backlog,
    };
    let app = routes::router(
        state,
        &config.storage.uploads_dir,
        &config.storage.uploads_prefix,
    );

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    info!(addr, "ambilight server listening");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!(error = %e, "server terminated");
        std::process::exit(1);
    }
}

/// Open the SQLite store. Falls back to a volatile in-memory store when the
/// database cannot be opened.
fn open_store(config: &Config) -> (Arc<dyn SettingsProvider>, Arc<dyn HistoryRecorder>) {
    match db::SqliteStore::open(&config.storage.database_path) {
        Ok(store) => {
            let store = Arc::new(store);
            let settings: Arc<dyn SettingsProvider> = store.clone();
            let history: Arc<dyn HistoryRecorder> = store;
            (settings, history)
        }
        Err(e) => {
            error!(
                error = %e,
                path = config.storage.database_path.display().to_string(),
                "failed to open SQLite database; settings and history will not be persisted"
            );
            let store = Arc::new(MemoryStore::default());
            let settings: Arc<dyn SettingsProvider> = store.clone();
            let history: Arc<dyn HistoryRecorder> = store;
            (settings, history)
        }
    }
}
