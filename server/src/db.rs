use async_trait::async_trait;
use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use ambilight_engine::store::{HistoryEntry, HistoryRecorder, SettingsProvider, StoreError};
use ambilight_engine::{Settings, SettingsPatch};

/// SQLite database holding player settings and playback history.
///
/// Schema:
/// - `settings`: exactly one row (id = 1), seeded with defaults on first open.
/// - `history`: one row per distinct path, `last_played` refreshed on replay.
///
/// WAL mode is enabled so HTTP readers never block the socket handlers
/// writing history. Every query runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file. Creates the parent directory if
    /// needed.
    pub fn open(path: &Path) -> SqlResult<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|_e| rusqlite::Error::InvalidPath(dir.into()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::init(conn)?;
        info!(path = path.display().to_string(), "SQLite database opened");
        Ok(store)
    }

    pub fn open_in_memory() -> SqlResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqlResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                id             INTEGER PRIMARY KEY CHECK (id = 1),
                zones_per_side INTEGER NOT NULL,
                intensity      REAL    NOT NULL,
                blur_amount    INTEGER NOT NULL,
                autoplay       INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS history (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                filename    TEXT    NOT NULL,
                path        TEXT    NOT NULL UNIQUE,
                last_played INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_last_played
                ON history(last_played);",
        )?;

        let defaults = Settings::default();
        conn.execute(
            "INSERT OR IGNORE INTO settings (id, zones_per_side, intensity, blur_amount, autoplay)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![
                defaults.zones_per_side,
                defaults.intensity,
                defaults.blur_amount,
                defaults.autoplay
            ],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> SqlResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .map_err(db_err)
    }
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn load_settings(conn: &Connection) -> SqlResult<Settings> {
    conn.query_row(
        "SELECT zones_per_side, intensity, blur_amount, autoplay FROM settings WHERE id = 1",
        [],
        |row| {
            Ok(Settings {
                zones_per_side: row.get(0)?,
                intensity: row.get(1)?,
                blur_amount: row.get(2)?,
                autoplay: row.get(3)?,
            })
        },
    )
}

/// Write only the fields present in `patch`.
fn update_settings(conn: &Connection, patch: &SettingsPatch) -> SqlResult<()> {
    let changed = conn.execute(
        "UPDATE settings SET
            zones_per_side = COALESCE(?1, zones_per_side),
            intensity      = COALESCE(?2, intensity),
            blur_amount    = COALESCE(?3, blur_amount),
            autoplay       = COALESCE(?4, autoplay)
         WHERE id = 1",
        params![
            patch.zones_per_side,
            patch.intensity,
            patch.blur_amount,
            patch.autoplay
        ],
    )?;
    debug!(?patch, changed, "settings updated");
    Ok(())
}

/// Insert a history entry, or refresh `last_played` if the path is known.
fn add_history(conn: &Connection, filename: &str, path: &str) -> SqlResult<i64> {
    let now = chrono::Utc::now().timestamp_millis();
    let id = conn.query_row(
        "INSERT INTO history (filename, path, last_played) VALUES (?1, ?2, ?3)
         ON CONFLICT(path) DO UPDATE SET
            filename = excluded.filename,
            last_played = MAX(excluded.last_played, history.last_played + 1)
         RETURNING id",
        params![filename, path, now],
        |row| row.get(0),
    )?;
    debug!(id, filename, path, "history entry recorded");
    Ok(id)
}

fn recent_history(conn: &Connection, limit: usize) -> SqlResult<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, filename, path, last_played
         FROM history ORDER BY last_played DESC, id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(HistoryEntry {
            id: row.get(0)?,
            filename: row.get(1)?,
            path: row.get(2)?,
            last_played: row.get(3)?,
        })
    })?;
    rows.collect()
}

fn clear_history(conn: &Connection) -> SqlResult<usize> {
    let removed = conn.execute("DELETE FROM history", [])?;
    info!(removed, "history cleared");
    Ok(removed)
}

fn remove_history(conn: &Connection, id: i64) -> SqlResult<bool> {
    let removed = conn.execute("DELETE FROM history WHERE id = ?1", params![id])?;
    Ok(removed > 0)
}

#[async_trait]
impl SettingsProvider for SqliteStore {
    async fn get(&self) -> Result<Settings, StoreError> {
        self.blocking(load_settings).await
    }

    async fn update(&self, patch: &SettingsPatch) -> Result<(), StoreError> {
        let patch = *patch;
        self.blocking(move |conn| update_settings(conn, &patch)).await
    }
}

#[async_trait]
impl HistoryRecorder for SqliteStore {
    async fn add(&self, filename: &str, path: &str) -> Result<(), StoreError> {
        let (filename, path) = (filename.to_string(), path.to_string());
        self.blocking(move |conn| add_history(conn, &filename, &path))
            .await
            .map(|_| ())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        self.blocking(move |conn| recent_history(conn, limit)).await
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        self.blocking(clear_history).await
    }

    async fn remove(&self, id: i64) -> Result<bool, StoreError> {
        self.blocking(move |conn| remove_history(conn, id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_database_has_default_settings() {
        let db = SqliteStore::open_in_memory().unwrap();
        assert_eq!(db.get().await.unwrap(), Settings::default());
    }

    #[tokio::test]
    async fn partial_update_touches_only_given_fields() {
        let db = SqliteStore::open_in_memory().unwrap();
        db.update(&SettingsPatch {
            intensity: Some(0.25),
            autoplay: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();

        let s = db.get().await.unwrap();
        assert_eq!(s.intensity, 0.25);
        assert!(s.autoplay);
        assert_eq!(s.zones_per_side, 10);
        assert_eq!(s.blur_amount, 15);
    }

    #[tokio::test]
    async fn replayed_path_keeps_id_and_moves_to_front() {
        let db = SqliteStore::open_in_memory().unwrap();
        db.add("a.mp4", "/u/a.mp4").await.unwrap();
        db.add("b.mp4", "/u/b.mp4").await.unwrap();
        let first = db.recent(10).await.unwrap();
        let a_id = first[1].id;
        assert_ne!(first[0].id, a_id);

        db.add("a.mp4", "/u/a.mp4").await.unwrap();
        let recent = db.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].path, "/u/a.mp4");
        assert_eq!(recent[0].id, a_id);
        assert_eq!(recent[1].path, "/u/b.mp4");
        assert_eq!(db.recent(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn history_can_be_pruned() {
        let db = SqliteStore::open_in_memory().unwrap();
        db.add("a.mp4", "/u/a.mp4").await.unwrap();
        db.add("b.mp4", "/u/b.mp4").await.unwrap();
        db.add("c.mp4", "/u/c.mp4").await.unwrap();
        let a = db
            .recent(10)
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.path == "/u/a.mp4")
            .unwrap();

        assert!(db.remove(a.id).await.unwrap());
        assert!(!db.remove(a.id).await.unwrap());
        assert!(db
            .recent(10)
            .await
            .unwrap()
            .iter()
            .all(|e| e.path != "/u/a.mp4"));
        assert_eq!(db.clear().await.unwrap(), 2);
        assert!(db.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_writers_share_one_connection() {
        let db = SqliteStore::open_in_memory().unwrap();
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                tokio::spawn(async move {
                    db.add(&format!("{i}.mp4"), &format!("/u/{i}.mp4")).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(db.recent(100).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let path = std::env::temp_dir()
            .join(format!("ambilight_db_{}", std::process::id()))
            .join("store.db");
        {
            let db = SqliteStore::open(&path).unwrap();
            db.update(&SettingsPatch {
                blur_amount: Some(40),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let db = SqliteStore::open(&path).unwrap();
        assert_eq!(db.get().await.unwrap().blur_amount, 40);
        drop(db);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
