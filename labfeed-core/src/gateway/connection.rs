//! WebSocket connection registry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata about a connected push client.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Summary of the registry, as reported by `/health`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub active: usize,
    pub max: usize,
    pub oldest_connected_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Tracks live push connections and enforces the connection limit.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: HashMap<Uuid, ConnectionInfo>,
    max_connections: usize,
}

impl ConnectionManager {
    /// Create a registry accepting at most `max_connections` clients.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_connections,
        }
    }

    /// Register a new connection. Returns `None` if the limit is reached.
    pub fn add_connection(&mut self) -> Option<Uuid> {
        if self.connections.len() >= self.max_connections {
            return None;
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        self.connections.insert(
            id,
            ConnectionInfo {
                connected_at: now,
                last_activity: now,
            },
        );
        Some(id)
    }

    /// Remove a connection.
    pub fn remove_connection(&mut self, id: &Uuid) -> bool {
        self.connections.remove(id).is_some()
    }

    /// Record client activity (a ping or any other frame).
    pub fn touch(&mut self, id: &Uuid) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.last_activity = Utc::now();
        }
    }

    /// Number of active connections.
    pub fn active_count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of the registry.
    pub fn stats(&self) -> ConnectionStats {
        let infos = self.connections.values();
        ConnectionStats {
            active: self.connections.len(),
            max: self.max_connections,
            oldest_connected_at: infos.clone().map(|c| c.connected_at).min(),
            last_activity: infos.map(|c| c.last_activity).max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_limit() {
        let mut mgr = ConnectionManager::new(2);
        assert!(mgr.add_connection().is_some());
        assert!(mgr.add_connection().is_some());
        assert!(mgr.add_connection().is_none());
        assert_eq!(mgr.active_count(), 2);
        assert_eq!(mgr.stats().max, 2);
    }

    #[test]
    fn test_remove_frees_a_slot() {
        let mut mgr = ConnectionManager::new(1);
        let id = mgr.add_connection().unwrap();
        assert!(mgr.add_connection().is_none());

        assert!(mgr.remove_connection(&id));
        assert!(!mgr.remove_connection(&id));
        assert!(mgr.add_connection().is_some());
    }

    #[test]
    fn test_stats_empty() {
        let stats = ConnectionManager::new(3).stats();
        assert_eq!(
            stats,
            ConnectionStats {
                active: 0,
                max: 3,
                oldest_connected_at: None,
                last_activity: None,
            }
        );
    }

    #[test]
    fn test_touch_moves_last_activity() {
        let mut mgr = ConnectionManager::new(10);
        let first = mgr.add_connection().unwrap();
        let before = mgr.stats();
        let oldest = before.oldest_connected_at.unwrap();

        mgr.add_connection().unwrap();
        mgr.touch(&first);
        mgr.touch(&Uuid::new_v4());

        let after = mgr.stats();
        assert_eq!(after.active, 2);
        assert_eq!(after.oldest_connected_at, Some(oldest));
        assert!(after.last_activity.unwrap() >= before.last_activity.unwrap());
    }
}
