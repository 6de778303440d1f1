//! Connection registry with user, room, and subscription indexes.
//!
//! The pool is the single source of truth for "who is connected, in which
//! rooms, subscribed to what". Every mutation runs inside one critical
//! section on a pool-wide lock, so a connection's local sets and the
//! reverse indexes can never diverge.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::{BrokerError, Result};

/// WebSocket close code sent to stale connections.
const CLOSE_GOING_AWAY: u16 = 1001;

struct PoolInner {
    connections: HashMap<String, Arc<Connection>>,
    user_index: HashMap<String, HashSet<String>>,
    room_index: HashMap<String, HashSet<String>>,
    subscription_index: HashMap<String, HashSet<String>>,
    peak_connections: usize,
    total_accepted: u64,
}

impl PoolInner {
    fn detach(&mut self, id: &str, connection: &Connection) {
        if let Some(user_id) = &connection.user_id {
            remove_from_index(&mut self.user_index, user_id, id);
        }
        for room in connection.rooms() {
            remove_from_index(&mut self.room_index, &room, id);
        }
        for event_type in connection.subscriptions() {
            remove_from_index(&mut self.subscription_index, &event_type, id);
        }
    }
}

fn remove_from_index(index: &mut HashMap<String, HashSet<String>>, key: &str, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        let _ = ids.remove(id);
        if ids.is_empty() {
            let _ = index.remove(key);
        }
    }
}

fn collect_ids(inner: &PoolInner, ids: Option<&HashSet<String>>) -> Vec<Arc<Connection>> {
    ids.map_or_else(Vec::new, |ids| {
        ids.iter()
            .filter_map(|id| inner.connections.get(id).cloned())
            .collect()
    })
}

/// Registry of all live connections.
pub struct ConnectionPool {
    inner: RwLock<PoolInner>,
    max_connections: usize,
}

impl ConnectionPool {
    /// Create a pool capped at `max_connections`.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                connections: HashMap::new(),
                user_index: HashMap::new(),
                room_index: HashMap::new(),
                subscription_index: HashMap::new(),
                peak_connections: 0,
                total_accepted: 0,
            }),
            max_connections,
        }
    }

    /// Add a connection.
    ///
    /// Fails with [`BrokerError::ConnectionLimitExceeded`] at capacity. A
    /// connection reusing an existing ID replaces the old entry (and the old
    /// entry's index references are cleared).
    pub fn add(&self, connection: Arc<Connection>) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(previous) = inner.connections.remove(connection.id.as_str()) {
            let id = previous.id.clone();
            inner.detach(&id, &previous);
        } else if inner.connections.len() >= self.max_connections {
            return Err(BrokerError::ConnectionLimitExceeded {
                limit: self.max_connections,
            });
        }

        if let Some(user_id) = &connection.user_id {
            let _ = inner
                .user_index
                .entry(user_id.clone())
                .or_default()
                .insert(connection.id.clone());
        }
        let _ = inner
            .connections
            .insert(connection.id.clone(), connection);
        inner.peak_connections = inner.peak_connections.max(inner.connections.len());
        inner.total_accepted += 1;
        Ok(())
    }

    /// Remove a connection and every index reference to it.
    ///
    /// Returns `false` when the ID was not present (idempotent).
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(connection) = inner.connections.remove(id) else {
            return false;
        };
        inner.detach(id, &connection);
        debug!(conn_id = id, remaining = inner.connections.len(), "connection removed from pool");
        true
    }

    /// Look up a connection by ID.
    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.inner.read().connections.get(id).cloned()
    }

    /// All live connections.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.inner.read().connections.values().cloned().collect()
    }

    /// Members of a room.
    pub fn get_by_room(&self, room: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.read();
        collect_ids(&inner, inner.room_index.get(room))
    }

    /// Subscribers of an event type.
    pub fn get_by_subscription(&self, event_type: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.read();
        collect_ids(&inner, inner.subscription_index.get(event_type))
    }

    /// Connections belonging to a user.
    pub fn get_by_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.read();
        collect_ids(&inner, inner.user_index.get(user_id))
    }

    // ── Room / subscription membership ───────────────────────────────
    //
    // Each mutator updates the connection's local set and the reverse
    // index under one write lock.

    /// Add a connection to a room. Returns `false` when the ID is unknown.
    pub fn add_to_room(&self, id: &str, room: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(connection) = inner.connections.get(id).cloned() else {
            return false;
        };
        connection.join_room(room);
        let _ = inner
            .room_index
            .entry(room.to_owned())
            .or_default()
            .insert(id.to_owned());
        true
    }

    /// Remove a connection from a room. Returns `false` when the ID is
    /// unknown.
    pub fn remove_from_room(&self, id: &str, room: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(connection) = inner.connections.get(id).cloned() else {
            return false;
        };
        connection.leave_room(room);
        remove_from_index(&mut inner.room_index, room, id);
        true
    }

    /// Subscribe a connection to an event type, with optional exact-match
    /// payload filters. Returns `false` when the ID is unknown.
    pub fn add_subscription(
        &self,
        id: &str,
        event_type: &str,
        filters: Option<HashMap<String, Value>>,
    ) -> bool {
        let mut inner = self.inner.write();
        let Some(connection) = inner.connections.get(id).cloned() else {
            return false;
        };
        connection.subscribe(event_type, filters);
        let _ = inner
            .subscription_index
            .entry(event_type.to_owned())
            .or_default()
            .insert(id.to_owned());
        true
    }

    /// Drop a connection's subscription. Returns `false` when the ID is
    /// unknown.
    pub fn remove_subscription(&self, id: &str, event_type: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(connection) = inner.connections.get(id).cloned() else {
            return false;
        };
        connection.unsubscribe(event_type);
        remove_from_index(&mut inner.subscription_index, event_type, id);
        true
    }

    // ── Maintenance ──────────────────────────────────────────────────

    /// Close and remove connections that are dead or older than `max_age`.
    ///
    /// Bounds memory from leaked sockets regardless of whether a close
    /// event was ever received. Returns the removed connection IDs.
    pub fn cleanup_stale(&self, max_age: Duration) -> Vec<String> {
        let stale: Vec<Arc<Connection>> = self
            .all()
            .into_iter()
            .filter(|conn| conn.is_closed() || conn.age() > max_age)
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for conn in stale {
            conn.close(CLOSE_GOING_AWAY, "stale connection");
            if self.remove(&conn.id) {
                removed.push(conn.id.clone());
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "cleaned up stale connections");
        }
        removed
    }

    /// Number of live connections.
    pub fn active_connections(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.active_connections() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Point-in-time snapshot for the stats endpoint.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.read();
        PoolStats {
            active_connections: inner.connections.len(),
            peak_connections: inner.peak_connections,
            total_accepted: inner.total_accepted,
            max_connections: self.max_connections,
            rooms: inner.room_index.len(),
            subscriptions: inner.subscription_index.len(),
            users: inner.user_index.len(),
        }
    }
}

/// Serializable view of pool state.
#[derive(Clone, Debug, Serialize)]
pub struct PoolStats {
    /// Live connections right now.
    pub active_connections: usize,
    /// Highest concurrent connection count seen.
    pub peak_connections: usize,
    /// Connections accepted over the pool's lifetime.
    pub total_accepted: u64,
    /// Configured capacity.
    pub max_connections: usize,
    /// Rooms with at least one member.
    pub rooms: usize,
    /// Event types with at least one subscriber.
    pub subscriptions: usize,
    /// Users with at least one connection.
    pub users: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OutboundFrame;
    use crate::rate_limit::TokenBucket;
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    fn make_connection(id: &str, user: Option<&str>) -> Arc<Connection> {
        let (tx, rx) = mpsc::channel::<OutboundFrame>(32);
        // Keep the writer half alive for the test's duration.
        std::mem::forget(rx);
        Arc::new(Connection::new(
            id.into(),
            user.map(Into::into),
            tx,
            TokenBucket::new(1000, 0.0),
        ))
    }

    fn make_pool(capacity: usize) -> ConnectionPool {
        ConnectionPool::new(capacity)
    }

    #[test]
    fn add_and_get() {
        let pool = make_pool(10);
        pool.add(make_connection("c1", None)).unwrap();
        assert_eq!(pool.active_connections(), 1);
        assert!(pool.get("c1").is_some());
        assert!(pool.get("missing").is_none());
    }

    #[test]
    fn capacity_boundary() {
        let pool = make_pool(2);
        pool.add(make_connection("c1", None)).unwrap();
        pool.add(make_connection("c2", None)).unwrap();

        let result = pool.add(make_connection("c3", None));
        assert_matches!(result, Err(BrokerError::ConnectionLimitExceeded { limit: 2 }));
        assert_eq!(pool.active_connections(), 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let pool = make_pool(10);
        pool.add(make_connection("c1", None)).unwrap();
        assert!(pool.remove("c1"));
        assert!(!pool.remove("c1"));
    }

    #[test]
    fn remove_clears_every_index() {
        let pool = make_pool(10);
        pool.add(make_connection("c1", Some("user_1"))).unwrap();
        assert!(pool.add_to_room("c1", "ops"));
        assert!(pool.add_subscription("c1", "sla.alert", None));

        assert!(pool.remove("c1"));

        assert!(pool.get_by_room("ops").is_empty());
        assert!(pool.get_by_subscription("sla.alert").is_empty());
        assert!(pool.get_by_user("user_1").is_empty());
        // Emptied index entries are dropped entirely
        let stats = pool.stats();
        assert_eq!(stats.rooms, 0);
        assert_eq!(stats.subscriptions, 0);
        assert_eq!(stats.users, 0);
    }

    #[test]
    fn duplicate_id_replaces_previous() {
        let pool = make_pool(10);
        pool.add(make_connection("c1", Some("user_a"))).unwrap();
        assert!(pool.add_to_room("c1", "ops"));

        pool.add(make_connection("c1", Some("user_b"))).unwrap();
        assert_eq!(pool.active_connections(), 1);
        // The replacement has no room membership; the old index entry is gone
        assert!(pool.get_by_room("ops").is_empty());
        assert!(pool.get_by_user("user_a").is_empty());
        assert_eq!(pool.get_by_user("user_b").len(), 1);
    }

    #[test]
    fn room_membership_updates_both_sides() {
        let pool = make_pool(10);
        pool.add(make_connection("c1", None)).unwrap();

        assert!(pool.add_to_room("c1", "ops"));
        assert!(pool.get("c1").unwrap().in_room("ops"));
        assert_eq!(pool.get_by_room("ops").len(), 1);

        assert!(pool.remove_from_room("c1", "ops"));
        assert!(!pool.get("c1").unwrap().in_room("ops"));
        assert!(pool.get_by_room("ops").is_empty());
    }

    #[test]
    fn subscription_updates_both_sides() {
        let pool = make_pool(10);
        pool.add(make_connection("c1", None)).unwrap();

        assert!(pool.add_subscription("c1", "forecast.updated", None));
        assert!(pool.get("c1").unwrap().is_subscribed("forecast.updated"));
        assert_eq!(pool.get_by_subscription("forecast.updated").len(), 1);

        assert!(pool.remove_subscription("c1", "forecast.updated"));
        assert!(pool.get_by_subscription("forecast.updated").is_empty());
    }

    #[test]
    fn membership_ops_on_unknown_id_return_false() {
        let pool = make_pool(10);
        assert!(!pool.add_to_room("ghost", "ops"));
        assert!(!pool.remove_from_room("ghost", "ops"));
        assert!(!pool.add_subscription("ghost", "sla.alert", None));
        assert!(!pool.remove_subscription("ghost", "sla.alert"));
    }

    #[test]
    fn get_by_user_spans_connections() {
        let pool = make_pool(10);
        pool.add(make_connection("c1", Some("user_1"))).unwrap();
        pool.add(make_connection("c2", Some("user_1"))).unwrap();
        pool.add(make_connection("c3", Some("user_2"))).unwrap();

        assert_eq!(pool.get_by_user("user_1").len(), 2);
        assert_eq!(pool.get_by_user("user_2").len(), 1);
    }

    #[test]
    fn cleanup_removes_closed_connections() {
        let pool = make_pool(10);
        let conn = make_connection("c1", None);
        pool.add(conn.clone()).unwrap();
        pool.add(make_connection("c2", None)).unwrap();

        conn.close(1000, "test");
        let removed = pool.cleanup_stale(Duration::from_secs(3600));
        assert_eq!(removed, vec!["c1".to_owned()]);
        assert_eq!(pool.active_connections(), 1);
    }

    #[test]
    fn cleanup_removes_over_age_connections() {
        let pool = make_pool(10);
        pool.add(make_connection("c1", None)).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let removed = pool.cleanup_stale(Duration::from_millis(1));
        assert_eq!(removed.len(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn cleanup_keeps_fresh_connections() {
        let pool = make_pool(10);
        pool.add(make_connection("c1", None)).unwrap();
        let removed = pool.cleanup_stale(Duration::from_secs(3600));
        assert!(removed.is_empty());
        assert_eq!(pool.active_connections(), 1);
    }

    #[test]
    fn stats_track_peak_and_total() {
        let pool = make_pool(10);
        pool.add(make_connection("c1", None)).unwrap();
        pool.add(make_connection("c2", None)).unwrap();
        assert!(pool.remove("c1"));
        pool.add(make_connection("c3", None)).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.peak_connections, 2);
        assert_eq!(stats.total_accepted, 3);
        assert_eq!(stats.max_connections, 10);
    }

    #[test]
    fn stats_serialize() {
        let pool = make_pool(5);
        let json = serde_json::to_value(pool.stats()).unwrap();
        assert_eq!(json["active_connections"], 0);
        assert_eq!(json["max_connections"], 5);
    }
}
