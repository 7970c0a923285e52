//! Three-way indexed connection registry (§4.2).
//!
//! Primary map `id -> Connection` plus two secondary indexes. Grounded in
//! the donor's `stream::stream_manager::StreamManager`, which keeps its
//! WebTransport sessions in a `DashMap<i32, ConnectionEntry>` for the same
//! reason: reads (routing, stats) vastly outnumber writes (connect/
//! disconnect), and `DashMap`'s per-shard locking keeps reads lock-free
//! across shards. The Unleash Edge `stream_broadcast` example shows the
//! same shape one level up, keyed by subscription query instead of id.
//!
//! Index mutation (add/remove) is additionally serialized behind a coarse
//! mutex so the three-way invariant in §3/§8 — a connection id is present
//! in the primary map iff it is present in every non-empty secondary index
//! — never observes a half-updated state. `touch` bypasses the mutex: it
//! only flips an atomic on an already-registered `Connection` and does not
//! touch the indexes.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use ahash::RandomState;
use dashmap::DashMap;

use super::connection::Connection;
use super::selector::Selector;

#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub authenticated_connections: usize,
    pub anonymous_connections: usize,
    pub unique_users: usize,
    pub unique_sessions: usize,
}

pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>, RandomState>,
    by_user: DashMap<String, HashSet<String>, RandomState>,
    by_session: DashMap<String, HashSet<String>, RandomState>,
    mutation_lock: Mutex<()>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::with_hasher(RandomState::new()),
            by_user: DashMap::with_hasher(RandomState::new()),
            by_session: DashMap::with_hasher(RandomState::new()),
            mutation_lock: Mutex::new(()),
        }
    }

    pub fn add(&self, conn: Arc<Connection>) {
        let _guard = self.mutation_lock.lock().unwrap();
        let id = conn.id.clone();
        if let Some(uid) = &conn.user_id {
            self.by_user.entry(uid.clone()).or_default().insert(id.clone());
        }
        if let Some(sid) = &conn.session_id {
            self.by_session
                .entry(sid.clone())
                .or_default()
                .insert(id.clone());
        }
        self.connections.insert(id, conn);
    }

    /// Removes a connection, deregistering it from every index. Idempotent:
    /// returns `None` if `id` is already absent (§3 lifecycle, §7 `CloseRace`
    /// callers rely on this rather than treating a second call as an error).
    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        let _guard = self.mutation_lock.lock().unwrap();
        let (_, conn) = self.connections.remove(id)?;
        if let Some(uid) = &conn.user_id {
            Self::remove_from_index(&self.by_user, uid, id);
        }
        if let Some(sid) = &conn.session_id {
            Self::remove_from_index(&self.by_session, sid, id);
        }
        Some(conn)
    }

    fn remove_from_index(index: &DashMap<String, HashSet<String>, RandomState>, key: &str, id: &str) {
        let Some(mut set) = index.get_mut(key) else {
            return;
        };
        set.remove(id);
        let empty = set.is_empty();
        drop(set);
        if empty {
            index.remove(key);
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| entry.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    pub fn touch(&self, id: &str) {
        if let Some(conn) = self.connections.get(id) {
            conn.touch();
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Implements the §4.2 algorithm verbatim.
    pub fn list(&self, selector: &Selector) -> Vec<Arc<Connection>> {
        if let Some(cid) = &selector.connection_id {
            return self
                .get(cid)
                .filter(|c| c.matches_metadata(&selector.metadata))
                .into_iter()
                .collect();
        }

        let mut id_set: Option<HashSet<String>> = None;

        if let Some(uid) = &selector.user_id {
            let Some(set) = self.by_user.get(uid) else {
                return Vec::new();
            };
            id_set = Some(set.clone());
        }

        if let Some(sid) = &selector.session_id {
            let Some(session_set) = self.by_session.get(sid) else {
                return Vec::new();
            };
            id_set = Some(match id_set {
                Some(existing) => existing.intersection(&session_set).cloned().collect(),
                None => session_set.clone(),
            });
        }

        let ids: Vec<String> = match id_set {
            Some(set) => set.into_iter().collect(),
            None => self.connections.iter().map(|e| e.key().clone()).collect(),
        };

        ids.into_iter()
            .filter_map(|id| self.get(&id))
            .filter(|conn| conn.matches_metadata(&selector.metadata))
            .collect()
    }

    pub fn list_stale(&self, timeout_millis: i64) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|e| e.value().is_stale(timeout_millis))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn snapshot_stats(&self) -> RegistryStats {
        let mut authenticated = 0;
        let mut anonymous = 0;
        for entry in self.connections.iter() {
            if entry.value().is_authenticated() {
                authenticated += 1;
            } else {
                anonymous += 1;
            }
        }
        RegistryStats {
            total_connections: self.connections.len(),
            authenticated_connections: authenticated,
            anonymous_connections: anonymous,
            unique_users: self.by_user.len(),
            unique_sessions: self.by_session.len(),
        }
    }

    pub fn clear(&self) {
        let _guard = self.mutation_lock.lock().unwrap();
        self.connections.clear();
        self.by_user.clear();
        self.by_session.clear();
    }
}
