//! The plain queue message type `Kv::enqueue`/`Kv::dequeue` move around.
//!
//! Undelivered tracking itself is a collection-layer concern, not a `Kv`
//! one: `collection::Collection::listen_queue` records a message that
//! exhausts its retries under the owning collection's `und` key family.

use serde_derive::{Deserialize, Serialize};

use crate::key::Key;

/// One message pulled off the queue by `Kv::dequeue`.
///
/// `topic` identifies which listener this message belongs to — every
/// `Kv` backend shares one underlying queue, and without a topic two
/// collections calling `enqueue`/`dequeue` against the same backend would
/// steal each other's messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Monotonically increasing, unique within one backend instance.
    pub id: u64,
    pub topic: String,
    pub value: Vec<u8>,
    /// Number of times this message has been redelivered after a prior
    /// delivery was never acknowledged.
    pub delivery_count: u32,
}

/// A message recorded as undelivered: dequeued (or due) but not
/// acknowledged within the backend's retry window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UndeliveredEntry {
    pub key: Key,
    pub message: QueueMessage,
}
