//! The bundled streaming-fetch consumer (§4.5, §9).
//!
//! Grounded in the donor's use of `reqwest::Client` for outbound HTTP (seen
//! across the `other_examples/` retrieval pack, e.g. the MCP streamable-http
//! transport's `Client` + `Arc<RwLock<...>>` session state), adapted into a
//! chunked-body SSE reader built on [`crate::codec`]. No browser
//! `EventSource` variant is provided (§9): this is the portable,
//! service-to-service shape.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::codec::{self, Event};
use crate::hub::connection::now_millis;

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Event types the client handles itself and never forwards to user
/// handlers (§4.5).
const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Default)]
pub struct ClientStatus {
    pub state: Option<ClientState>,
    pub connection_id: Option<String>,
    pub last_heartbeat_millis: Option<i64>,
    pub reconnect_attempts: u32,
    pub error: Option<String>,
}

struct Inner {
    state: ClientState,
    connection_id: Option<String>,
    last_heartbeat_millis: Option<i64>,
    reconnect_attempts: u32,
    error: Option<String>,
    disconnect_requested: bool,
    next_handler_id: u64,
    handlers: HashMap<String, Vec<(u64, EventHandler)>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: ClientState::Disconnected,
            connection_id: None,
            last_heartbeat_millis: None,
            reconnect_attempts: 0,
            error: None,
            disconnect_requested: false,
            next_handler_id: 0,
            handlers: HashMap::new(),
        }
    }
}

/// Configuration for reconnect behavior (§4.5, §8 scenario 6).
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

pub struct SseClient {
    http: reqwest::Client,
    url: String,
    reconnect: ReconnectConfig,
    inner: Mutex<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SseClient {
    pub fn new(url: impl Into<String>, reconnect: ReconnectConfig) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::builder()
                .cookie_store(true)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("building a default reqwest client never fails"),
            url: url.into(),
            reconnect,
            inner: Mutex::new(Inner::default()),
            task: Mutex::new(None),
        })
    }

    pub fn status(&self) -> ClientStatus {
        let inner = self.inner.lock().unwrap();
        ClientStatus {
            state: Some(inner.state),
            connection_id: inner.connection_id.clone(),
            last_heartbeat_millis: inner.last_heartbeat_millis,
            reconnect_attempts: inner.reconnect_attempts,
            error: inner.error.clone(),
        }
    }

    /// Registers `handler` under `event_type` (use `"*"` for wildcard).
    /// Returns an idempotent unsubscribe closure (§4.5 subscription registry).
    pub fn subscribe(
        self: &Arc<Self>,
        event_type: impl Into<String>,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> impl FnOnce() + Send + 'static {
        let event_type = event_type.into();
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_handler_id;
            inner.next_handler_id += 1;
            inner
                .handlers
                .entry(event_type.clone())
                .or_default()
                .push((id, Arc::new(handler)));
            id
        };

        let this = Arc::clone(self);
        move || {
            let mut inner = this.inner.lock().unwrap();
            if let Some(handlers) = inner.handlers.get_mut(&event_type) {
                handlers.retain(|(hid, _)| *hid != id);
                if handlers.is_empty() {
                    inner.handlers.remove(&event_type);
                }
            }
        }
    }

    /// Starts the connect/reconnect loop in the background. A second call
    /// while already running replaces the in-flight task (§4.5: "one
    /// current stream request at a time").
    pub fn connect(self: &Arc<Self>) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
        self.inner.lock().unwrap().disconnect_requested = false;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_loop().await });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Cancels any pending reconnect and aborts the active request.
    pub fn disconnect(&self) {
        self.inner.lock().unwrap().disconnect_requested = true;
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
        self.set_state(ClientState::Disconnected, None);
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            self.set_state(ClientState::Connecting, None);

            if let Err(err) = self.stream_once().await {
                tracing::warn!(error = %err, "sse stream ended");
                self.inner.lock().unwrap().error = Some(err);
            }

            if self.inner.lock().unwrap().disconnect_requested {
                return;
            }

            let attempts = {
                let mut inner = self.inner.lock().unwrap();
                inner.reconnect_attempts += 1;
                inner.reconnect_attempts
            };
            if attempts > self.reconnect.max_attempts {
                self.set_state(
                    ClientState::Disconnected,
                    Some("exceeded maxReconnectAttempts".to_string()),
                );
                return;
            }
            tokio::time::sleep(self.reconnect.delay).await;
        }
    }

    async fn stream_once(&self) -> Result<(), String> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("unexpected status {}", response.status()));
        }

        self.set_state(ClientState::Connected, None);

        let mut buf = Vec::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            buf.extend_from_slice(&chunk);

            let (records, rest) = codec::split_records(&buf);
            for record in &records {
                if let Some(event) = codec::decode_record(record) {
                    self.dispatch(&event);
                }
            }
            let consumed = buf.len() - rest.len();
            buf.drain(..consumed);
        }

        Ok(())
    }

    fn set_state(&self, state: ClientState, error: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        if error.is_some() {
            inner.error = error;
        }
    }

    /// `connected`/`heartbeat` are handled internally; everything else goes
    /// to type-specific handlers, then wildcard handlers. Panicking
    /// handlers are caught and logged, never abort the stream (§4.5).
    fn dispatch(&self, event: &Event) {
        match event.event_type.as_str() {
            codec::EVENT_CONNECTED => {
                let mut inner = self.inner.lock().unwrap();
                inner.connection_id = event
                    .data
                    .get("connectionId")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                inner.state = ClientState::Connected;
                inner.reconnect_attempts = 0;
                return;
            }
            codec::EVENT_HEARTBEAT => {
                self.inner.lock().unwrap().last_heartbeat_millis = Some(now_millis());
                return;
            }
            _ => {}
        }

        let handlers: Vec<EventHandler> = {
            let inner = self.inner.lock().unwrap();
            let mut out = Vec::new();
            if let Some(typed) = inner.handlers.get(&event.event_type) {
                out.extend(typed.iter().map(|(_, h)| h.clone()));
            }
            if let Some(wild) = inner.handlers.get(WILDCARD) {
                out.extend(wild.iter().map(|(_, h)| h.clone()));
            }
            out
        };

        for handler in handlers {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
            if result.is_err() {
                tracing::warn!(event_type = %event.event_type, "subscriber handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client() -> Arc<SseClient> {
        SseClient::new(
            "http://127.0.0.1:0/api/sse",
            ReconnectConfig {
                max_attempts: 2,
                delay: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn connected_event_populates_connection_id_and_resets_attempts() {
        let client = client();
        client.inner.lock().unwrap().reconnect_attempts = 3;
        client.dispatch(&Event::new(
            codec::EVENT_CONNECTED,
            json!({"connectionId": "sse_1_abc"}),
        ));

        let status = client.status();
        assert_eq!(status.connection_id.as_deref(), Some("sse_1_abc"));
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(status.state, Some(ClientState::Connected));
    }

    #[test]
    fn heartbeat_updates_last_heartbeat_without_reaching_handlers() {
        let client = client();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        client.subscribe(WILDCARD, move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        client.dispatch(&Event::new(codec::EVENT_HEARTBEAT, json!({"timestamp": 1})));

        assert!(client.status().last_heartbeat_millis.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wildcard_and_typed_handlers_both_fire_exactly_once() {
        let client = client();
        let typed_calls = Arc::new(AtomicUsize::new(0));
        let wildcard_calls = Arc::new(AtomicUsize::new(0));

        let typed_clone = typed_calls.clone();
        client.subscribe("x.y", move |_| {
            typed_clone.fetch_add(1, Ordering::SeqCst);
        });
        let wild_clone = wildcard_calls.clone();
        client.subscribe(WILDCARD, move |_| {
            wild_clone.fetch_add(1, Ordering::SeqCst);
        });

        client.dispatch(&Event::new("x.y", json!({"v": 1})));

        assert_eq!(typed_calls.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_future_dispatch() {
        let client = client();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let unsubscribe = client.subscribe("x.y", move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        unsubscribe();
        client.dispatch(&Event::new("x.y", json!({"v": 1})));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_handler_does_not_poison_dispatch() {
        let client = client();
        client.subscribe("boom", |_| panic!("handler exploded"));
        // must not panic the test itself
        client.dispatch(&Event::new("boom", json!(null)));
    }

    /// A listener that accepts then immediately drops every connection,
    /// simulating a server that closes mid-handshake. With
    /// `maxReconnectAttempts = 2` the client must fail, reconnect twice,
    /// fail a third time, and settle in `Disconnected` with a terminal
    /// error — never retry past the cap.
    #[tokio::test]
    async fn reconnect_loop_settles_disconnected_after_exhausting_attempts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => drop(socket),
                    Err(_) => break,
                }
            }
        });

        let client = SseClient::new(
            format!("http://{addr}/api/sse"),
            ReconnectConfig {
                max_attempts: 2,
                delay: Duration::from_millis(10),
            },
        );
        client.connect();

        tokio::time::sleep(Duration::from_millis(500)).await;

        let status = client.status();
        assert_eq!(status.state, Some(ClientState::Disconnected));
        assert!(status.reconnect_attempts > 2);
        assert!(
            status
                .error
                .as_deref()
                .unwrap_or("")
                .contains("maxReconnectAttempts")
        );
    }

    /// A listener that fails the first connection then accepts and streams
    /// a `connected` event on the second, holding that connection open —
    /// the clean reconnect must reset the attempt counter back to zero
    /// before the (still-open) stream ever ends (§8 scenario 6).
    #[tokio::test]
    async fn a_clean_reconnect_resets_the_attempt_counter() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;

            // first connection: accept then drop, forcing one failed attempt
            if let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }

            // second connection: stream a `connected` event as one chunk of
            // a chunked body and never send the terminating `0\r\n\r\n`, so
            // the response body stays open while this task sleeps
            if let Ok((mut socket, _)) = listener.accept().await {
                let body = "event: connected\ndata: {\"connectionId\":\"sse_1_abc\"}\n\n";
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
                    body.len(),
                    body,
                );
                let _ = socket.write_all(response.as_bytes()).await;
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        });

        let client = SseClient::new(
            format!("http://{addr}/api/sse"),
            ReconnectConfig {
                max_attempts: 5,
                delay: Duration::from_millis(10),
            },
        );
        client.connect();

        tokio::time::sleep(Duration::from_millis(500)).await;

        let status = client.status();
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(status.state, Some(ClientState::Connected));
        assert_eq!(status.connection_id.as_deref(), Some("sse_1_abc"));
    }
}
