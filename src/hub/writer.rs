//! The per-connection output sink, kept behind a trait object so the hub
//! never has to know whether it is pushing bytes into an HTTP response body,
//! a test double, or (in scenario 3 of §8) a writer that never drains.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use salvo::async_trait;
use tokio::sync::mpsc;

/// The four capabilities §9 asks of a connection's writer: push bytes,
/// observe failure, close idempotently, observe peer-side cancellation.
#[async_trait]
pub trait ConnectionWriter: Send + Sync {
    /// Pushes one already-encoded record. Returns `false` on any failure
    /// (channel full, channel closed, writer already closed) — the hub
    /// treats that as a write failure and evicts the connection (§4.3).
    async fn write(&self, bytes: Bytes) -> bool;

    /// Idempotent close; swallows the already-closed case (§7 `CloseRace`).
    fn close(&self);

    /// True once the peer has gone away (body future dropped) or `close`
    /// has been called.
    fn is_closed(&self) -> bool;
}

/// Backs a connection with a bounded `tokio::mpsc` channel whose receiver
/// side is adapted into the HTTP response body stream (`routers::sse`).
///
/// There is deliberately no unbounded buffering: a full channel means the
/// peer isn't draining fast enough, and `write` reports failure immediately
/// rather than growing memory without bound (§5 resource bounds).
pub struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl ChannelWriter {
    /// Builds a writer/receiver pair. `capacity` bounds how many encoded
    /// records may be queued before a slow consumer starts failing writes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }
}

#[async_trait]
impl ConnectionWriter for ChannelWriter {
    async fn write(&self, bytes: Bytes) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.try_send(bytes) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::Release);
                false
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Never accepts a write; used to exercise the heartbeat reaper
    /// (§8 scenario 3) without a real transport.
    #[derive(Default)]
    pub struct HangingWriter {
        closed: AtomicBool,
    }

    #[async_trait]
    impl ConnectionWriter for HangingWriter {
        async fn write(&self, _bytes: Bytes) -> bool {
            false
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    /// Records every record it receives, for assertions in tests.
    #[derive(Default)]
    pub struct RecordingWriter {
        closed: AtomicBool,
        received: Mutex<Vec<Bytes>>,
    }

    impl RecordingWriter {
        pub fn received(&self) -> Vec<Bytes> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConnectionWriter for RecordingWriter {
        async fn write(&self, bytes: Bytes) -> bool {
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            self.received.lock().unwrap().push(bytes);
            true
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }
}
