use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use ambilight_engine::registry::ConnectionId;
use serde::Serialize;
use tracing::debug;

/// Bookkeeping for one open socket.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    /// Unix millis
    pub connected_at: i64,
    pub remote_addr: String,
    pub user_agent: Option<String>,
    /// Filled in from the session registry when the table is listed.
    pub is_processing: bool,
}

/// Open sockets, keyed by connection id.
#[derive(Default)]
pub struct ConnectionTable {
    records: Mutex<HashMap<ConnectionId, ConnectionRecord>>,
}

impl ConnectionTable {
    pub fn insert(&self, conn: ConnectionId, remote_addr: String, user_agent: Option<String>) {
        let record = ConnectionRecord {
            connection_id: conn,
            connected_at: chrono::Utc::now().timestamp_millis(),
            remote_addr,
            user_agent,
            is_processing: false,
        };
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert(conn, record);
        debug!(%conn, open = records.len(), "connection registered");
    }

    pub fn remove(&self, conn: ConnectionId) -> Option<ConnectionRecord> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.remove(&conn)
    }

    /// Snapshot ordered by connection id.
    pub fn list(&self) -> Vec<ConnectionRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<_> = records.values().cloned().collect();
        list.sort_by_key(|r| r.connection_id);
        list
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_open_connections() {
        let table = ConnectionTable::default();
        table.insert(ConnectionId(2), "10.0.0.2:5000".into(), None);
        table.insert(ConnectionId(1), "10.0.0.1:5000".into(), Some("curl/8".into()));
        assert_eq!(table.len(), 2);

        let list = table.list();
        assert_eq!(list[0].connection_id, ConnectionId(1));
        assert_eq!(list[1].remote_addr, "10.0.0.2:5000");

        let removed = table.remove(ConnectionId(1)).unwrap();
        assert_eq!(removed.user_agent.as_deref(), Some("curl/8"));
        assert!(table.remove(ConnectionId(1)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn removing_unknown_connection_is_a_no_op() {
        let table = ConnectionTable::default();
        assert!(table.remove(ConnectionId(9)).is_none());
        assert!(table.list().is_empty());
    }
}
