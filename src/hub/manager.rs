//! The hub: lifecycle, routing, heartbeat loop, reaper (§4.3).
//!
//! The global singleton shape is grounded in the donor's
//! `stream::stream_manager::StreamManager::global()`, which holds a
//! `LazyLock<StreamManager>` behind a `&'static` accessor. That pattern has
//! no reset hook because the donor never tears a `StreamManager` down
//! mid-process; this hub needs one so each `#[tokio::test]` in this crate
//! and its callers can start from an empty hub (§4.3 "a `#[cfg(test)]`-only
//! `reset()` hook"), so the global is a `RwLock<Option<Arc<Hub>>>` instead
//! of a bare `LazyLock`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use salvo::oapi::ToSchema;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{self, Event};
use crate::config::HubConfig;
use crate::error::ApiError;

use super::connection::{self, Connection};
use super::registry::ConnectionRegistry;
use super::selector::Selector;
use super::writer::ChannelWriter;

/// Bounds how many encoded records may sit unread in a connection's
/// channel before its writer starts reporting failure (§5 resource bounds).
const WRITER_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, Default, Serialize, ToSchema)]
pub struct SendResult {
    pub sent: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub total_connections: usize,
    pub authenticated_connections: usize,
    pub anonymous_connections: usize,
    pub unique_users: usize,
    pub unique_sessions: usize,
    pub uptime_ms: u64,
    pub total_events_sent: u64,
    pub heartbeats_sent: u64,
}

type ConnectObserver = Arc<dyn Fn(&Connection) + Send + Sync>;
type DisconnectObserver = Arc<dyn Fn(&str) + Send + Sync>;

pub struct Hub {
    registry: ConnectionRegistry,
    config: HubConfig,
    connection_count: AtomicUsize,
    total_events_sent: AtomicU64,
    heartbeats_sent: AtomicU64,
    started_at_millis: i64,
    shutting_down: AtomicBool,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
    on_connect: Mutex<Option<ConnectObserver>>,
    on_disconnect: Mutex<Option<DisconnectObserver>>,
}

static HUB: RwLock<Option<Arc<Hub>>> = RwLock::new(None);

impl Hub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        let hub = Arc::new(Self {
            registry: ConnectionRegistry::new(),
            config,
            connection_count: AtomicUsize::new(0),
            total_events_sent: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            started_at_millis: connection::now_millis(),
            shutting_down: AtomicBool::new(false),
            heartbeat_handle: Mutex::new(None),
            on_connect: Mutex::new(None),
            on_disconnect: Mutex::new(None),
        });
        hub.spawn_heartbeat();
        hub
    }

    /// Registers an observer invoked with the new [`Connection`] once it has
    /// been admitted and the `connected` frame written (§4.3
    /// `createConnection`). Replaces any previously set observer.
    pub fn set_on_connect(&self, observer: impl Fn(&Connection) + Send + Sync + 'static) {
        *self.on_connect.lock().unwrap() = Some(Arc::new(observer));
    }

    /// Registers an observer invoked with the connection id iff a call to
    /// [`Hub::remove_connection`] actually removed it (§4.3
    /// `removeConnection`). Replaces any previously set observer.
    pub fn set_on_disconnect(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_disconnect.lock().unwrap() = Some(Arc::new(observer));
    }

    /// Process-wide instance, lazily built from the loaded config on first
    /// use (§4.3).
    pub fn global() -> Arc<Hub> {
        if let Some(hub) = HUB.read().unwrap().as_ref() {
            return hub.clone();
        }
        let mut guard = HUB.write().unwrap();
        if let Some(hub) = guard.as_ref() {
            return hub.clone();
        }
        let hub = Hub::new(crate::config::get().hub);
        *guard = Some(hub.clone());
        hub
    }

    /// Substitutes a fresh hub so tests don't leak connections or
    /// heartbeat tasks into each other.
    #[cfg(test)]
    pub fn reset() {
        let mut guard = HUB.write().unwrap();
        if let Some(old) = guard.take() {
            if let Some(handle) = old.heartbeat_handle.lock().unwrap().take() {
                handle.abort();
            }
        }
    }

    fn fresh_id(&self) -> String {
        loop {
            let id = connection::generate_id();
            if !self.registry.contains(&id) {
                return id;
            }
        }
    }

    pub async fn create_connection(
        &self,
        user_id: Option<String>,
        session_id: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Bytes>), ApiError> {
        loop {
            let current = self.connection_count.load(Ordering::Acquire);
            if self.shutting_down.load(Ordering::Acquire) || current >= self.config.max_connections
            {
                return Err(ApiError::CapacityExceeded);
            }
            if self
                .connection_count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let (writer, rx) = ChannelWriter::channel(WRITER_CHANNEL_CAPACITY);
        let id = self.fresh_id();
        let conn = Arc::new(Connection::new(
            id,
            user_id,
            session_id,
            metadata,
            Arc::new(writer),
        ));
        self.registry.add(conn.clone());
        tracing::info!(connection_id = %conn.id, "connection admitted");

        let connected = Event::new(
            codec::EVENT_CONNECTED,
            serde_json::json!({
                "connectionId": conn.id,
                "timestamp": connection::now_millis(),
            }),
        );
        let _ = conn.writer.write(Bytes::from(codec::encode(&connected))).await;

        if let Some(observer) = self.on_connect.lock().unwrap().as_ref() {
            observer(&conn);
        }

        Ok((conn, rx))
    }

    /// Idempotent (§3, §7 `CloseRace`): a second call for the same id is a
    /// no-op that returns `false`.
    pub fn remove_connection(&self, id: &str) -> bool {
        match self.registry.remove(id) {
            Some(conn) => {
                conn.writer.close();
                self.connection_count.fetch_sub(1, Ordering::AcqRel);
                tracing::info!(connection_id = %id, "connection removed");
                if let Some(observer) = self.on_disconnect.lock().unwrap().as_ref() {
                    observer(id);
                }
                true
            }
            None => false,
        }
    }

    /// Encodes `event` once and writes it to every connection the selector
    /// resolves to. A connection whose write fails (errors, exceeds
    /// `writeDeadlineMs`, or reports its buffer full) is evicted; this
    /// never affects delivery to any other connection (§4.3, §7).
    pub async fn send(&self, event: &Event, selector: &Selector) -> SendResult {
        let targets = self.registry.list(selector);
        let encoded = Bytes::from(codec::encode(event));
        let deadline = self.config.write_deadline();

        let mut sent = 0u64;
        let mut failed_ids = Vec::new();

        for conn in targets {
            let ok = tokio::time::timeout(deadline, conn.writer.write(encoded.clone()))
                .await
                .unwrap_or(false);
            if ok {
                sent += 1;
            } else {
                failed_ids.push(conn.id.clone());
            }
        }

        let failed = failed_ids.len() as u64;
        for id in failed_ids {
            self.remove_connection(&id);
        }

        self.total_events_sent.fetch_add(sent, Ordering::Relaxed);
        SendResult { sent, failed }
    }

    pub async fn broadcast(&self, event: &Event) -> SendResult {
        self.send(event, &Selector::all()).await
    }

    pub async fn send_to_user(&self, user_id: &str, event: &Event) -> SendResult {
        self.send(event, &Selector::user(user_id)).await
    }

    pub async fn send_to_session(&self, session_id: &str, event: &Event) -> SendResult {
        self.send(event, &Selector::session(session_id)).await
    }

    pub async fn send_to_connection(&self, connection_id: &str, event: &Event) -> SendResult {
        self.send(event, &Selector::connection(connection_id)).await
    }

    pub fn stats(&self) -> HubStats {
        let reg = self.registry.snapshot_stats();
        HubStats {
            total_connections: reg.total_connections,
            authenticated_connections: reg.authenticated_connections,
            anonymous_connections: reg.anonymous_connections,
            unique_users: reg.unique_users,
            unique_sessions: reg.unique_sessions,
            uptime_ms: (connection::now_millis() - self.started_at_millis).max(0) as u64,
            total_events_sent: self.total_events_sent.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
        }
    }

    pub fn connections(&self, selector: &Selector) -> Vec<Arc<Connection>> {
        self.registry.list(selector)
    }

    /// Cancels the heartbeat ticker, evicts every connection, clears the
    /// registry. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.heartbeat_handle.lock().unwrap().take() {
            handle.abort();
        }
        let ids: Vec<String> = self
            .registry
            .list(&Selector::all())
            .into_iter()
            .map(|c| c.id.clone())
            .collect();
        for id in ids {
            self.remove_connection(&id);
        }
        self.registry.clear();
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        if !self.config.enable_heartbeat {
            return;
        }
        let hub = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.config.heartbeat_interval());
            loop {
                interval.tick().await;
                if hub.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                hub.heartbeat_tick().await;
            }
        });
        *self.heartbeat_handle.lock().unwrap() = Some(handle);
    }

    /// Broadcast the pulse, then touch every surviving connection, then
    /// reap anything stale. This order matters (§4.3): a connection whose
    /// broadcast write just failed is already gone by the time `touch`
    /// runs, and a connection created after the broadcast started is still
    /// safe through this tick because `touch` re-reads the registry fresh.
    async fn heartbeat_tick(&self) {
        let event = Event::new(
            codec::EVENT_HEARTBEAT,
            serde_json::json!({"timestamp": connection::now_millis()}),
        );
        self.broadcast(&event).await;
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);

        for conn in self.registry.list(&Selector::all()) {
            conn.touch();
        }

        let stale = self
            .registry
            .list_stale(self.config.connection_timeout_ms as i64);
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "reaping stale connections");
        }
        for conn in stale {
            self.remove_connection(&conn.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::writer::test_support::{HangingWriter, RecordingWriter};
    use std::time::Duration;

    fn test_config(max_connections: usize) -> HubConfig {
        HubConfig {
            heartbeat_interval_ms: 30_000,
            connection_timeout_ms: 60_000,
            max_connections,
            enable_heartbeat: false,
            write_deadline_ms: 200,
        }
    }

    #[tokio::test]
    async fn send_to_user_reaches_every_connection_for_that_user() {
        let hub = Hub::new(test_config(10));
        let (a, _rx_a) = hub
            .create_connection(Some("u1".into()), None, HashMap::new())
            .await
            .unwrap();
        let (b, _rx_b) = hub
            .create_connection(Some("u1".into()), None, HashMap::new())
            .await
            .unwrap();

        let event = Event::new("t", serde_json::json!({"n": 1}));
        let result = hub.send_to_user("u1", &event).await;

        assert_eq!(result.sent, 2);
        assert_eq!(result.failed, 0);
        assert!(hub.registry.contains(&a.id));
        assert!(hub.registry.contains(&b.id));
    }

    #[tokio::test]
    async fn capacity_exceeded_leaves_registry_at_the_cap() {
        let hub = Hub::new(test_config(2));
        hub.create_connection(None, None, HashMap::new())
            .await
            .unwrap();
        hub.create_connection(None, None, HashMap::new())
            .await
            .unwrap();

        let err = hub
            .create_connection(None, None, HashMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::CapacityExceeded));
        assert_eq!(hub.registry.len(), 2);
    }

    #[tokio::test]
    async fn heartbeat_reaps_a_hanging_writer_but_keeps_a_healthy_one() {
        let hub = Hub::new(HubConfig {
            heartbeat_interval_ms: 1,
            connection_timeout_ms: 1_000,
            max_connections: 10,
            enable_heartbeat: false,
            write_deadline_ms: 50,
        });

        let (hanging, _rx) = hub
            .create_connection(None, None, HashMap::new())
            .await
            .unwrap();
        // swap in a writer that never accepts bytes, simulating a stalled peer
        let hanging_id = hanging.id.clone();
        hub.registry.remove(&hanging_id);
        let stuck = Arc::new(Connection::new(
            hanging_id.clone(),
            None,
            None,
            HashMap::new(),
            Arc::new(HangingWriter::default()),
        ));
        hub.registry.add(stuck);

        let (healthy, _rx2) = hub
            .create_connection(None, None, HashMap::new())
            .await
            .unwrap();

        hub.heartbeat_tick().await;

        assert!(!hub.registry.contains(&hanging_id));
        assert!(hub.registry.contains(&healthy.id));
    }

    #[tokio::test]
    async fn shutdown_empties_the_registry_and_is_idempotent() {
        let hub = Hub::new(test_config(10));
        hub.create_connection(None, None, HashMap::new())
            .await
            .unwrap();

        hub.shutdown().await;
        assert_eq!(hub.stats().total_connections, 0);

        hub.shutdown().await; // idempotent, must not panic
        assert_eq!(hub.stats().total_connections, 0);
    }

    #[tokio::test]
    async fn send_sent_plus_failed_equals_selector_size() {
        let hub = Hub::new(test_config(10));
        let (_a, _rx_a) = hub
            .create_connection(None, None, HashMap::new())
            .await
            .unwrap();
        let (b, _rx_b) = hub
            .create_connection(None, None, HashMap::new())
            .await
            .unwrap();

        hub.registry.remove(&b.id);
        let failing = Arc::new(Connection::new(
            b.id.clone(),
            None,
            None,
            HashMap::new(),
            Arc::new(HangingWriter::default()),
        ));
        hub.registry.add(failing);

        let before = hub.registry.list(&Selector::all()).len();
        let event = Event::new("t", serde_json::json!(1));
        let result = hub.send(&event, &Selector::all()).await;

        assert_eq!(result.sent + result.failed, before as u64);
        assert_eq!(result.sent, 1);
        assert_eq!(result.failed, 1);
    }

    #[tokio::test]
    async fn observers_fire_on_connect_and_on_disconnect_only() {
        let hub = Hub::new(test_config(10));
        let connects = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let disconnects = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let connects_clone = connects.clone();
        hub.set_on_connect(move |_conn| {
            connects_clone.fetch_add(1, Ordering::SeqCst);
        });
        let disconnects_clone = disconnects.clone();
        hub.set_on_disconnect(move |_id| {
            disconnects_clone.fetch_add(1, Ordering::SeqCst);
        });

        let (conn, _rx) = hub
            .create_connection(None, None, HashMap::new())
            .await
            .unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);

        assert!(hub.remove_connection(&conn.id));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        // second removal is a no-op: the observer must not fire again
        assert!(!hub.remove_connection(&conn.id));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recording_writer_observes_the_connected_event_first() {
        let hub = Hub::new(test_config(10));
        let writer = Arc::new(RecordingWriter::default());
        let id = hub.fresh_id();
        let conn = Arc::new(Connection::new(
            id.clone(),
            None,
            None,
            HashMap::new(),
            writer.clone(),
        ));
        hub.registry.add(conn);
        let connected = Event::new(codec::EVENT_CONNECTED, serde_json::json!({"connectionId": id}));
        writer.write(Bytes::from(codec::encode(&connected))).await;

        let received = writer.received();
        assert_eq!(received.len(), 1);
        assert!(String::from_utf8_lossy(&received[0]).contains("connected"));

        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
