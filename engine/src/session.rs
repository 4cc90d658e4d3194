use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ambilight_common::config::ProcessingConfig;
use ambilight_common::protocol::ServerEvent;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::emitter::{EmitError, Emitter};
use crate::error::ProcessingError;
use crate::extractor::ExtractorConfig;
use crate::registry::ConnectionId;
use crate::source::{FrameSource, SourceError, SourceOpener};
use crate::store::SettingsProvider;

/// After this many decode failures in a row the source is rewound.
const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 30;

/// Lifecycle of a processing session. Transitions only move forward:
///
///   Idle -> Running -> Stopping -> Retired
///
/// A session that fails to open its source goes straight to Retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Stopping,
    Retired,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Retired,
        }
    }
}

/// Atomic cell holding a [`SessionState`], shared by worker and handle.
#[derive(Debug)]
pub struct SessionStatus(AtomicU8);

impl SessionStatus {
    fn new() -> Self {
        Self(AtomicU8::new(SessionState::Idle as u8))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; no-op if the state has moved on.
    fn advance(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn retire(&self) {
        self.0.store(SessionState::Retired as u8, Ordering::Release);
    }
}

/// Frame pacing for the session loop.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    /// Fixed sleep after every pulled frame.
    pub frame_interval: Duration,
    /// Only frames with `index % process_every == 0` are extracted.
    pub process_every: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(33),
            process_every: 3,
        }
    }
}

impl From<&ProcessingConfig> for Pacing {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            frame_interval: config.frame_interval(),
            process_every: config.process_every.max(1),
        }
    }
}

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<ExtractorConfig>,
    pub settings: Arc<dyn SettingsProvider>,
    pub opener: Arc<dyn SourceOpener>,
    pub pacing: Pacing,
}

/// How a session worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Stopped by its cancellation token.
    Cancelled { frames: u64, emitted: u64 },
    /// Terminated by an error that was reported to the client.
    Failed(String),
}

/// One client's decode, extract, emit loop.
pub struct ProcessingSession {
    conn: ConnectionId,
    path: PathBuf,
    ctx: SessionContext,
    emitter: Arc<dyn Emitter>,
    cancel: CancellationToken,
    status: Arc<SessionStatus>,
}

impl ProcessingSession {
    /// Spawn the worker task and return its handle.
    pub fn spawn(
        conn: ConnectionId,
        path: PathBuf,
        ctx: SessionContext,
        emitter: Arc<dyn Emitter>,
    ) -> SessionHandle {
        let cancel = CancellationToken::new();
        let status = Arc::new(SessionStatus::new());
        let session = Self {
            conn,
            path: path.clone(),
            ctx,
            emitter,
            cancel: cancel.clone(),
            status: Arc::clone(&status),
        };
        let worker = tokio::spawn(session.run());

        SessionHandle {
            conn,
            path,
            cancel,
            status,
            worker,
        }
    }

    async fn run(self) -> SessionOutcome {
        let mut source = match self.ctx.opener.open(&self.path).await {
            Ok(source) => source,
            Err(e) => {
                let outcome = self.fail(ProcessingError::SourceUnreadable(e));
                self.status.retire();
                return outcome;
            }
        };

        match self.ctx.settings.get().await {
            Ok(settings) => self.ctx.config.apply_settings(&settings),
            Err(e) => warn!(conn = %self.conn, error = %e, "could not load settings, keeping current extractor configuration"),
        }

        self.status.advance(SessionState::Idle, SessionState::Running);
        info!(conn = %self.conn, path = self.path.display().to_string(), "session running");

        let outcome = self.frame_loop(source.as_mut()).await;

        source.close().await;
        self.status.retire();
        info!(conn = %self.conn, ?outcome, "session worker exited");
        outcome
    }

    async fn frame_loop(&self, source: &mut dyn FrameSource) -> SessionOutcome {
        let pacing = self.ctx.pacing;
        let process_every = pacing.process_every.max(1);
        let mut index: u64 = 0;
        let mut emitted: u64 = 0;
        let mut yielded_this_pass: u64 = 0;
        let mut decode_errors: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match source.next_frame().await {
                Ok(Some(frame)) => {
                    decode_errors = 0;
                    yielded_this_pass += 1;
                    if index % process_every == 0 {
                        let colors = self.ctx.config.snapshot().extract(&frame);
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        match self.emitter.emit(ServerEvent::Colors(colors)) {
                            Ok(()) => emitted += 1,
                            Err(EmitError::QueueFull) => {
                                debug!(conn = %self.conn, frame = index, "client lagging, colors dropped")
                            }
                            Err(e) => warn!(conn = %self.conn, frame = index, error = %e, "failed to emit colors"),
                        }
                    }
                    index += 1;
                }
                Ok(None) => {
                    if yielded_this_pass == 0 {
                        return self.fail(ProcessingError::SourceUnreadable(
                            SourceError::Unreadable("video has no decodable frames".into()),
                        ));
                    }
                    debug!(conn = %self.conn, frames = index, "end of stream, rewinding");
                    if let Err(e) = source.rewind().await {
                        return self.fail(ProcessingError::SourceUnreadable(e));
                    }
                    yielded_this_pass = 0;
                    continue;
                }
                Err(e) if e.is_transient() => {
                    let err = ProcessingError::FrameDecodeTransient(e);
                    warn!(conn = %self.conn, frame = index, error = %err, "skipping frame");
                    decode_errors += 1;
                    if decode_errors >= MAX_CONSECUTIVE_DECODE_ERRORS {
                        warn!(conn = %self.conn, decode_errors, "too many decode failures, rewinding");
                        if let Err(e) = source.rewind().await {
                            return self.fail(ProcessingError::SourceUnreadable(e));
                        }
                        decode_errors = 0;
                        yielded_this_pass = 0;
                    }
                }
                Err(e) => return self.fail(ProcessingError::SourceUnreadable(e)),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(pacing.frame_interval) => {}
            }
        }

        SessionOutcome::Cancelled {
            frames: index,
            emitted,
        }
    }

    /// Report a terminal failure to the client unless the session was
    /// already cancelled.
    fn fail(&self, err: ProcessingError) -> SessionOutcome {
        let message = err.to_string();
        error!(conn = %self.conn, path = self.path.display().to_string(), error = %message, "session failed");
        if !self.cancel.is_cancelled() {
            if let Err(e) = self.emitter.emit(ServerEvent::error(message.clone())) {
                warn!(conn = %self.conn, error = %e, "failed to emit error event");
            }
        }
        SessionOutcome::Failed(message)
    }
}

/// Control-plane side of a running session.
pub struct SessionHandle {
    conn: ConnectionId,
    path: PathBuf,
    cancel: CancellationToken,
    status: Arc<SessionStatus>,
    worker: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> SessionState {
        self.status.get()
    }

    pub fn status(&self) -> Arc<SessionStatus> {
        Arc::clone(&self.status)
    }

    /// Set the cancellation token. The worker notices at its next loop
    /// boundary.
    pub fn signal_stop(&self) {
        self.status.advance(SessionState::Running, SessionState::Stopping);
        self.status.advance(SessionState::Idle, SessionState::Stopping);
        self.cancel.cancel();
    }

    /// Cancel and wait up to `join_timeout` for the worker to exit.
    ///
    /// Returns `false` if the wait timed out; the worker is detached and is
    /// expected to exit on its own shortly after.
    pub async fn retire(mut self, join_timeout: Duration) -> bool {
        self.signal_stop();
        match tokio::time::timeout(join_timeout, &mut self.worker).await {
            Ok(Ok(outcome)) => {
                debug!(conn = %self.conn, ?outcome, "session joined");
                true
            }
            Ok(Err(e)) => {
                error!(conn = %self.conn, error = %e, "session worker panicked");
                self.status.retire();
                true
            }
            Err(_) => {
                warn!(
                    conn = %self.conn,
                    timeout_ms = join_timeout.as_millis() as u64,
                    "session worker did not exit within join window, abandoning wait"
                );
                false
            }
        }
    }

    /// Wait for the worker without cancelling it.
    pub async fn join(self) -> Option<SessionOutcome> {
        self.worker.await.ok()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::emitter::testing::RecordingEmitter;
    use crate::source::testing::SolidOpener;
    use crate::store::MemoryStore;
    use ambilight_common::settings::Settings;
    use std::time::Instant;

    pub(crate) fn context(opener: Arc<SolidOpener>) -> SessionContext {
        SessionContext {
            config: Arc::new(ExtractorConfig::default()),
            settings: Arc::new(MemoryStore::default()),
            opener,
            pacing: Pacing {
                frame_interval: Duration::from_millis(1),
                process_every: 3,
            },
        }
    }

    pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn emits_every_third_frame_in_order() {
        let opener = Arc::new(SolidOpener::new(&[("red.mp4", [255, 0, 0])]));
        let emitter = Arc::new(RecordingEmitter::default());
        let handle = ProcessingSession::spawn(
            ConnectionId(1),
            PathBuf::from("red.mp4"),
            context(Arc::clone(&opener)),
            emitter.clone(),
        );

        wait_until(|| emitter.colors().len() >= 4).await;
        assert_eq!(handle.state(), SessionState::Running);
        let status = handle.status();

        handle.signal_stop();
        let outcome = handle.join().await.unwrap();
        let SessionOutcome::Cancelled { frames, emitted } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(emitted, (frames + 2) / 3);
        assert_eq!(emitter.colors().len() as u64, emitted);
        assert!(emitter
            .colors()
            .iter()
            .all(|c| c.top.iter().all(|z| *z == [255, 0, 0])));
        assert_eq!(status.get(), SessionState::Retired);
        assert_eq!(opener.closed(), 1);
    }

    #[tokio::test]
    async fn open_failure_reports_error_and_retires() {
        let opener = Arc::new(SolidOpener::new(&[]));
        let emitter = Arc::new(RecordingEmitter::default());
        let handle = ProcessingSession::spawn(
            ConnectionId(2),
            PathBuf::from("missing.mp4"),
            context(Arc::clone(&opener)),
            emitter.clone(),
        );

        let outcome = handle.join().await.unwrap();
        assert!(matches!(outcome, SessionOutcome::Failed(_)));
        assert_eq!(emitter.names(), vec!["error"]);
        assert_eq!(opener.pulls(), 0);
    }

    #[tokio::test]
    async fn stop_before_first_pull_emits_nothing() {
        let opener = Arc::new(SolidOpener::new(&[("a.mp4", [1, 2, 3])]));
        let emitter = Arc::new(RecordingEmitter::default());
        let handle = ProcessingSession::spawn(
            ConnectionId(3),
            PathBuf::from("a.mp4"),
            context(Arc::clone(&opener)),
            emitter.clone(),
        );
        let status = handle.status();

        assert!(handle.retire(Duration::from_secs(1)).await);
        assert!(emitter.events().is_empty());
        assert_eq!(opener.pulls(), 0);
        assert_eq!(status.get(), SessionState::Retired);
    }

    #[tokio::test]
    async fn decode_errors_are_skipped() {
        let mut opener = SolidOpener::new(&[("flaky.mp4", [0, 0, 255])]);
        opener.bad_frames = vec![1, 3];
        let opener = Arc::new(opener);
        let emitter = Arc::new(RecordingEmitter::default());
        let handle = ProcessingSession::spawn(
            ConnectionId(4),
            PathBuf::from("flaky.mp4"),
            context(Arc::clone(&opener)),
            emitter.clone(),
        );

        wait_until(|| emitter.colors().len() >= 5).await;
        assert!(handle.retire(Duration::from_secs(1)).await);
        assert!(emitter.names().iter().all(|n| *n == "colors"));
    }

    #[tokio::test]
    async fn empty_video_is_terminal() {
        let mut opener = SolidOpener::new(&[("empty.mp4", [0, 0, 0])]);
        opener.frames_per_pass = 0;
        let opener = Arc::new(opener);
        let emitter = Arc::new(RecordingEmitter::default());
        let handle = ProcessingSession::spawn(
            ConnectionId(5),
            PathBuf::from("empty.mp4"),
            context(Arc::clone(&opener)),
            emitter.clone(),
        );

        let outcome = handle.join().await.unwrap();
        assert!(matches!(outcome, SessionOutcome::Failed(ref m) if m.contains("no decodable frames")));
        assert_eq!(emitter.names(), vec!["error"]);
        assert_eq!(opener.closed(), 1);
    }

    #[tokio::test]
    async fn settings_snapshot_and_hot_updates_reach_the_loop() {
        let opener = Arc::new(SolidOpener::new(&[("v.mp4", [10, 10, 10])]));
        let emitter = Arc::new(RecordingEmitter::default());
        let mut ctx = context(Arc::clone(&opener));
        ctx.settings = Arc::new(MemoryStore::new(Settings {
            zones_per_side: 4,
            ..Default::default()
        }));
        let config = Arc::clone(&ctx.config);

        let handle = ProcessingSession::spawn(ConnectionId(6), PathBuf::from("v.mp4"), ctx, emitter.clone());

        wait_until(|| !emitter.colors().is_empty()).await;
        assert_eq!(emitter.colors()[0].top.len(), 4);

        config.set_zones_per_side(2);
        wait_until(|| emitter.colors().last().map(|c| c.left.len()) == Some(2)).await;

        assert!(handle.retire(Duration::from_secs(1)).await);
    }

    /// Refuses every colors event as if the client had stopped reading.
    struct StalledEmitter {
        refused: std::sync::atomic::AtomicU64,
    }

    impl Emitter for StalledEmitter {
        fn emit(&self, event: ServerEvent) -> Result<(), EmitError> {
            match event {
                ServerEvent::Colors(_) => {
                    self.refused.fetch_add(1, Ordering::Relaxed);
                    Err(EmitError::QueueFull)
                }
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn full_outbound_queue_keeps_session_running() {
        let opener = Arc::new(SolidOpener::new(&[("v.mp4", [5, 5, 5])]));
        let emitter = Arc::new(StalledEmitter {
            refused: std::sync::atomic::AtomicU64::new(0),
        });
        let handle = ProcessingSession::spawn(
            ConnectionId(8),
            PathBuf::from("v.mp4"),
            context(Arc::clone(&opener)),
            emitter.clone(),
        );

        wait_until(|| emitter.refused.load(Ordering::Relaxed) >= 3).await;
        assert_eq!(handle.state(), SessionState::Running);
        assert!(handle.retire(Duration::from_secs(1)).await);
        assert_eq!(opener.closed(), 1);
    }

    #[tokio::test]
    async fn nothing_is_emitted_after_retire() {
        let opener = Arc::new(SolidOpener::new(&[("v.mp4", [7, 7, 7])]));
        let emitter = Arc::new(RecordingEmitter::default());
        let handle = ProcessingSession::spawn(
            ConnectionId(7),
            PathBuf::from("v.mp4"),
            context(Arc::clone(&opener)),
            emitter.clone(),
        );

        wait_until(|| emitter.colors().len() >= 2).await;
        assert!(handle.retire(Duration::from_secs(1)).await);
        let count = emitter.events().len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(emitter.events().len(), count);
    }
}
