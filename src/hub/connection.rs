//! A single open stream to one client (§3).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use rand::Rng;
use rand::distr::Alphanumeric;

use super::writer::ConnectionWriter;

/// Globally unique handle for one connection: `"sse_" + millis + "_" + 9
/// alphanumeric chars` (§4.3). Collisions are not expected at any realistic
/// rate but the registry retries generation on the off chance of one.
pub fn generate_id() -> String {
    let millis = now_millis();
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    format!("sse_{millis}_{suffix}")
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct Connection {
    pub id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Set at creation, never mutated thereafter (§3).
    pub metadata: HashMap<String, String>,
    pub writer: Arc<dyn ConnectionWriter>,
    last_seen_millis: AtomicI64,
}

impl Connection {
    pub fn new(
        id: String,
        user_id: Option<String>,
        session_id: Option<String>,
        metadata: HashMap<String, String>,
        writer: Arc<dyn ConnectionWriter>,
    ) -> Self {
        Self {
            id,
            user_id,
            session_id,
            metadata,
            writer,
            last_seen_millis: AtomicI64::new(now_millis()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn last_seen_millis(&self) -> i64 {
        self.last_seen_millis.load(Ordering::Acquire)
    }

    /// Refreshed only by heartbeat delivery (§3), called by the hub's
    /// heartbeat loop after a successful broadcast write.
    pub fn touch(&self) {
        self.last_seen_millis
            .store(now_millis(), Ordering::Release);
    }

    pub fn is_stale(&self, timeout_millis: i64) -> bool {
        now_millis() - self.last_seen_millis() > timeout_millis
    }

    pub fn matches_metadata(&self, predicate: &HashMap<String, String>) -> bool {
        if predicate.is_empty() {
            return true;
        }
        predicate
            .iter()
            .all(|(k, v)| self.metadata.get(k) == Some(v))
    }
}
