//! Broker seams.
//!
//! [`Broker`] is the subject data plane (publish, subscribe, queue groups).
//! [`StreamStore`] is the append-only stream primitive the event log is built
//! on (capped length, consumer groups, acknowledgements).

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::types::{EventId, Subject};
use crate::Result;

pub use self::memory::MemoryBroker;

pub mod memory;

pub type SubscriptionId = u64;

#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: Subject,
    pub payload: Bytes,
}

/// A broker side registration. Deliveries arrive on `rx` in broker order.
pub struct BrokerSubscription {
    pub id: SubscriptionId,
    /// Connection epoch the registration belongs to.
    pub epoch: u64,
    pub rx: mpsc::Receiver<Delivery>,
    /// Deliveries the broker dropped because `rx` was full.
    pub dropped: Arc<AtomicU64>,
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Establishes the connection, errors while the server is unreachable.
    async fn connect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Bumped by every reconnect that loses server side registrations,
    /// registrations from older epochs must be made again.
    #[inline]
    fn epoch(&self) -> u64 {
        0
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        capacity: usize,
    ) -> Result<BrokerSubscription>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    Head,
    //`$`, only entries appended after the group is created
    Tail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EventId,
    pub payload: Bytes,
}

#[async_trait]
pub trait StreamStore: Send + Sync + 'static {
    /// Appends and returns the entry id, monotonic per stream. The stream is
    /// trimmed to roughly `max_len` entries, 0 keeps everything.
    async fn append(&self, stream: &str, payload: Bytes, max_len: usize) -> Result<EventId>;

    /// Creates the group if missing, returns false when it already existed.
    async fn create_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<bool>;

    /// Entries never delivered to the group, waiting up to `block` for new
    /// ones. Returned entries stay pending for `consumer` until acked.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Entries delivered to `consumer` and not acknowledged yet.
    async fn read_pending(&self, stream: &str, group: &str, consumer: &str, count: usize)
        -> Result<Vec<StreamEntry>>;

    async fn ack(&self, stream: &str, group: &str, ids: &[EventId]) -> Result<()>;

    async fn len(&self, stream: &str) -> Result<usize>;
}
