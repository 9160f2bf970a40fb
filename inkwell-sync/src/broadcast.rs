//! Fan-out broadcast to the N-1 other connections of a document.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` messages. A receiver that falls further behind observes
//! `Lagged` and is expected to resynchronize from a full state.
//!
//! Messages are encoded once and shared as `Arc<Outbound>`; receivers skip
//! frames whose `origin` is their own connection id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// One pre-encoded frame and the connection it came from.
#[derive(Debug)]
pub struct Outbound {
    /// Originating connection, or nil for server-generated frames.
    pub origin: Uuid,
    pub bytes: Vec<u8>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub receivers: usize,
}

/// Lock-free counters; read through [`BroadcastGroup::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast channel shared by all connections of one document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Outbound>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is the per-receiver buffer before lagging receivers
    /// start losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// New receiver that sees every frame sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Outbound>> {
        self.sender.subscribe()
    }

    /// Encode once and send to every receiver. Returns the receiver count.
    pub fn broadcast(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(Outbound { origin, bytes })))
    }

    /// Send an already-encoded frame (zero-copy fast path).
    pub fn broadcast_raw(&self, frame: Arc<Outbound>) -> usize {
        // No receivers is not an error: the last connection may have left.
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            receivers: self.receiver_count(),
        }
    }
}
