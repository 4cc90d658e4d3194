use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::emitter::Emitter;
use crate::session::{ProcessingSession, SessionContext, SessionHandle, SessionState};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Default)]
struct Slot {
    session: Option<SessionHandle>,
    /// Set once the connection is dropped; the slot is no longer in the map.
    closed: bool,
}

/// Process-wide map from connection to its live session.
///
/// The outer map lock is only held to look up or insert a slot. Each slot
/// has its own async lock, held for the whole cancel/join/install sequence,
/// so operations on one connection are serialized while different
/// connections never wait on each other.
pub struct SessionRegistry {
    slots: Mutex<HashMap<ConnectionId, Arc<tokio::sync::Mutex<Slot>>>>,
    ctx: SessionContext,
    join_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(ctx: SessionContext, join_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ctx,
            join_timeout,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    fn slot(&self, conn: ConnectionId) -> Arc<tokio::sync::Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(conn).or_default())
    }

    fn existing_slot(&self, conn: ConnectionId) -> Option<Arc<tokio::sync::Mutex<Slot>>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(&conn).cloned()
    }

    /// Start processing `path` for `conn`, first retiring any session the
    /// connection already has.
    pub async fn start_or_replace(
        &self,
        conn: ConnectionId,
        path: PathBuf,
        emitter: Arc<dyn Emitter>,
    ) -> Result<(), RegistryError> {
        let slot = self.slot(conn);
        let mut guard = slot.lock().await;
        if guard.closed {
            return Err(RegistryError::ConnectionClosed(conn));
        }

        if let Some(old) = guard.session.take() {
            info!(
                %conn,
                old_path = old.path().display().to_string(),
                new_path = path.display().to_string(),
                "replacing session"
            );
            old.retire(self.join_timeout).await;
        }

        info!(%conn, path = path.display().to_string(), "starting session");
        guard.session = Some(ProcessingSession::spawn(conn, path, self.ctx.clone(), emitter));
        Ok(())
    }

    /// Retire the connection's session. Returns whether one existed.
    pub async fn stop(&self, conn: ConnectionId) -> bool {
        let Some(slot) = self.existing_slot(conn) else {
            return false;
        };
        let mut guard = slot.lock().await;
        match guard.session.take() {
            Some(handle) => {
                info!(%conn, "stopping session");
                handle.retire(self.join_timeout).await;
                true
            }
            None => false,
        }
    }

    /// Retire the session of a lost connection and forget the connection.
    pub async fn drop_connection(&self, conn: ConnectionId) -> bool {
        let Some(slot) = self.existing_slot(conn) else {
            return false;
        };
        let mut guard = slot.lock().await;
        guard.closed = true;
        let had_session = match guard.session.take() {
            Some(handle) => {
                info!(%conn, "connection lost, retiring session");
                handle.retire(self.join_timeout).await;
                true
            }
            None => false,
        };

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(&conn).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
            slots.remove(&conn);
        }
        debug!(%conn, remaining = slots.len(), "connection removed from registry");
        had_session
    }

    /// State of the connection's current session, if any.
    pub async fn state(&self, conn: ConnectionId) -> Option<SessionState> {
        let slot = self.existing_slot(conn)?;
        let guard = slot.lock().await;
        guard.session.as_ref().map(SessionHandle::state)
    }

    /// Number of connections holding a session that has not retired.
    pub async fn active_sessions(&self) -> usize {
        let slots: Vec<_> = {
            let map = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            map.values().cloned().collect()
        };
        let mut active = 0;
        for slot in slots {
            let guard = slot.lock().await;
            if guard
                .session
                .as_ref()
                .is_some_and(|h| h.state() != SessionState::Retired)
            {
                active += 1;
            }
        }
        active
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::emitter::testing::RecordingEmitter;
    use crate::session::tests::{context, wait_until};
    use crate::source::testing::SolidOpener;

    const RED: [u8; 3] = [255, 0, 0];
    const BLUE: [u8; 3] = [0, 0, 255];

    fn registry(opener: Arc<SolidOpener>) -> SessionRegistry {
        SessionRegistry::new(context(opener), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn replacement_retires_old_session_before_new_one_emits() {
        let opener = Arc::new(SolidOpener::new(&[("red.mp4", RED), ("blue.mp4", BLUE)]));
        let reg = registry(Arc::clone(&opener));
        let emitter = Arc::new(RecordingEmitter::default());
        let conn = ConnectionId(10);

        reg.start_or_replace(conn, PathBuf::from("red.mp4"), emitter.clone())
            .await
            .unwrap();
        wait_until(|| emitter.colors().len() >= 3).await;

        reg.start_or_replace(conn, PathBuf::from("blue.mp4"), emitter.clone())
            .await
            .unwrap();
        // the old worker has been joined and its source released
        assert_eq!(opener.closed(), 1);

        wait_until(|| emitter.colors().iter().filter(|c| c.top[0] == BLUE).count() >= 3).await;
        assert!(reg.stop(conn).await);

        let tops: Vec<_> = emitter.colors().iter().map(|c| c.top[0]).collect();
        let first_blue = tops.iter().position(|c| *c == BLUE).unwrap();
        assert!(first_blue > 0);
        assert!(tops[..first_blue].iter().all(|c| *c == RED));
        assert!(tops[first_blue..].iter().all(|c| *c == BLUE));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let opener = Arc::new(SolidOpener::new(&[("a.mp4", RED)]));
        let reg = registry(Arc::clone(&opener));
        let emitter = Arc::new(RecordingEmitter::default());
        let conn = ConnectionId(11);

        assert!(!reg.stop(conn).await);
        reg.start_or_replace(conn, PathBuf::from("a.mp4"), emitter.clone())
            .await
            .unwrap();
        assert!(reg.stop(conn).await);
        assert!(!reg.stop(conn).await);
        assert_eq!(reg.state(conn).await, None);
        assert_eq!(reg.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn dropped_connection_goes_silent() {
        let opener = Arc::new(SolidOpener::new(&[("a.mp4", RED)]));
        let reg = registry(Arc::clone(&opener));
        let emitter = Arc::new(RecordingEmitter::default());
        let conn = ConnectionId(12);

        reg.start_or_replace(conn, PathBuf::from("a.mp4"), emitter.clone())
            .await
            .unwrap();
        wait_until(|| emitter.colors().len() >= 2).await;
        assert_eq!(reg.state(conn).await, Some(SessionState::Running));

        let started = Instant::now();
        assert!(reg.drop_connection(conn).await);
        assert!(started.elapsed() < Duration::from_secs(1));

        let count = emitter.events().len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(emitter.events().len(), count);
        assert_eq!(opener.closed(), 1);
        assert!(!reg.drop_connection(conn).await);
    }

    #[tokio::test]
    async fn connections_are_independent() {
        let opener = Arc::new(SolidOpener::new(&[("red.mp4", RED), ("blue.mp4", BLUE)]));
        let reg = registry(Arc::clone(&opener));
        let first = Arc::new(RecordingEmitter::default());
        let second = Arc::new(RecordingEmitter::default());

        reg.start_or_replace(ConnectionId(20), PathBuf::from("red.mp4"), first.clone())
            .await
            .unwrap();
        reg.start_or_replace(ConnectionId(21), PathBuf::from("blue.mp4"), second.clone())
            .await
            .unwrap();
        assert_eq!(reg.active_sessions().await, 2);

        wait_until(|| !first.colors().is_empty() && !second.colors().is_empty()).await;
        reg.stop(ConnectionId(20)).await;

        let before = second.colors().len();
        wait_until(|| second.colors().len() > before + 2).await;
        assert!(first.colors().iter().all(|c| c.top[0] == RED));
        assert!(second.colors().iter().all(|c| c.top[0] == BLUE));
        assert_eq!(reg.active_sessions().await, 1);

        reg.drop_connection(ConnectionId(21)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_leave_one_session() {
        let opener = Arc::new(SolidOpener::new(&[("a.mp4", RED)]));
        let reg = Arc::new(registry(Arc::clone(&opener)));
        let emitter = Arc::new(RecordingEmitter::default());
        let conn = ConnectionId(30);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let reg = Arc::clone(&reg);
            let emitter = emitter.clone();
            tasks.push(tokio::spawn(async move {
                reg.start_or_replace(conn, PathBuf::from("a.mp4"), emitter)
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(reg.active_sessions().await, 1);
        assert!(reg.stop(conn).await);
        assert_eq!(opener.closed(), opener.opened());
        assert_eq!(opener.opened(), 8);
    }

    #[tokio::test]
    async fn slow_worker_does_not_block_replacement() {
        let mut opener = SolidOpener::new(&[("slow.mp4", RED), ("a.mp4", BLUE)]);
        opener.pull_delay = Duration::from_millis(300);
        let opener = Arc::new(opener);
        let reg = SessionRegistry::new(context(Arc::clone(&opener)), Duration::from_millis(20));
        let emitter = Arc::new(RecordingEmitter::default());
        let conn = ConnectionId(40);

        reg.start_or_replace(conn, PathBuf::from("slow.mp4"), emitter.clone())
            .await
            .unwrap();
        wait_until(|| opener.pulls() >= 1).await;

        let started = Instant::now();
        reg.start_or_replace(conn, PathBuf::from("a.mp4"), emitter.clone())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));

        // the abandoned worker still exits once its pull completes
        wait_until(|| opener.closed() >= 1).await;
        assert!(emitter.colors().iter().all(|c| c.top[0] != RED));
        reg.drop_connection(conn).await;
    }
}
