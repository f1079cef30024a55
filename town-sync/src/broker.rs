//! In-process broadcast transport for sessions sharing a device.
//!
//! The original browser implementation abused `localStorage` storage events
//! for cross-tab messaging, writing every message under a randomly suffixed
//! key because the notification primitive only fires on value change. A real
//! pub/sub channel makes that workaround unnecessary: this broker is a thin
//! wrapper over `tokio::sync::broadcast` carrying pre-encoded envelopes, with
//! explicit delivery semantics — repeat-value publishes always reach every
//! subscriber.
//!
//! Delivery is at-most-once per subscriber (a lagging receiver drops the
//! oldest buffered messages). Sessions compensate with the sync-request and
//! presence-heartbeat convergence mechanisms, not with transport retries.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::protocol::{Envelope, EnvelopeError};

/// Fan-out statistics, tracked lock-free.
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    pub messages_published: u64,
    pub subscribers: usize,
}

/// Cross-session message bus for one device.
///
/// Construct one per process (or one per test) and hand an `Arc` to every
/// session; there is deliberately no global instance.
pub struct LocalBroker {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    capacity: usize,
    published: AtomicU64,
}

impl LocalBroker {
    /// `capacity` bounds how many messages a slow subscriber may buffer
    /// before it starts losing the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            published: AtomicU64::new(0),
        }
    }

    /// Encode and fan out one envelope. Returns the number of subscribers
    /// that received it; zero subscribers is not an error.
    pub fn publish(&self, envelope: &Envelope) -> Result<usize, EnvelopeError> {
        let encoded = Arc::new(envelope.encode()?);
        Ok(self.publish_raw(encoded))
    }

    /// Fan out pre-encoded bytes (zero-copy fast path).
    pub fn publish_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.published.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Attach a new receiver. The receiver only sees messages published
    /// after this call; earlier state is recovered via a sync request.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            messages_published: self.published.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(256)
    }
}
