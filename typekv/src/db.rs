//! The database-level surface: a thin handle over a shared `Kv` backend
//! that hands out namespaced `Collection`s and exposes the handful of
//! operations that cut across all of them (a cross-collection atomic
//! builder, a bulk reset, and the queue primitives).

use std::sync::Arc;
use std::time::Duration;

use crate::collection::{Collection, CollectionAtomicBuilder, Model};
use crate::error::CResult;
use crate::key::Key;
use crate::kv::queue::QueueMessage;
use crate::kv::{Kv, ListOptions, ListSelector};

/// Owns the shared `Kv` handle every `Collection` it hands out is built on.
/// Cloning a `Database` is cheap (`Arc` clone) and every clone shares the
/// same backend.
#[derive(Clone)]
pub struct Database {
    kv: Arc<dyn Kv>,
}

impl Database {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Database { kv }
    }

    /// A typed collection namespaced under `path`. Calling this twice with
    /// the same path and the same `T` is safe and cheap; nothing is
    /// registered centrally, so two different `T`s at the same path will
    /// both happily read and write the same underlying keys (a caller
    /// error the type system can't catch, same as picking the wrong schema
    /// version for an existing table).
    pub fn collection<T: Model>(&self, path: &[&str]) -> Collection<T> {
        Collection::new(Arc::clone(&self.kv), path)
    }

    /// Starts a commit spanning any number of collections. `select` a
    /// collection to get `add`/`set`/`delete` lowered into the same checks
    /// and index mutations that collection's own
    /// `insert_with_id`/`overwrite_with_id`/`delete` would emit alone,
    /// batched with everything else into one backend commit; raw
    /// `check`/`set`/`delete`/`enqueue` keep working directly on keys
    /// without selecting anything.
    pub fn atomic(&self) -> CollectionAtomicBuilder<'_> {
        CollectionAtomicBuilder::new(&*self.kv)
    }

    /// Raw, collection-agnostic queue access. `topic` scopes messages the
    /// same way a `Collection`'s own topic does — pick a name distinct
    /// from any collection path sharing this backend to avoid stealing
    /// their messages.
    pub fn enqueue(&self, topic: &str, value: Vec<u8>, delay: Option<Duration>) -> CResult<()> {
        self.kv.enqueue(topic, value, delay)
    }

    pub async fn listen_queue(
        &self,
        topic: &str,
        mut while_cond: impl FnMut() -> bool,
        mut handler: impl FnMut(&QueueMessage) -> CResult<()>,
    ) -> CResult<()> {
        while while_cond() {
            match self.kv.dequeue(topic)? {
                Some(message) => handler(&message)?,
                None => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        Ok(())
    }

    /// Counts every entry in the backend, across every collection and key
    /// family. Administrative: unlike a collection's `count`, this has no
    /// notion of "live documents only" beyond lazy-expiry filtering `Kv`
    /// already applies.
    pub fn count_all(&self) -> CResult<usize> {
        Ok(self.kv.list(ListSelector::Prefix(Key::default()), ListOptions::default())?.len())
    }

    /// Deletes every entry in the backend directly, bypassing the indexed
    /// write protocol (no history is appended, no per-document checks run
    /// — this is a raw reset, not a replay of `Collection::delete` for
    /// every document). Returns the number of keys removed.
    pub fn delete_all(&self) -> CResult<usize> {
        let entries = self.kv.list(ListSelector::Prefix(Key::default()), ListOptions::default())?;
        let count = entries.len();
        for (key, _) in entries {
            self.kv.delete(&key)?;
        }
        Ok(count)
    }

    /// Resets the backend to empty. Currently identical to `delete_all`;
    /// kept as a distinct name because a backend with its own
    /// out-of-band state (a disk engine's compaction log, say) may one day
    /// need more than a key-by-key delete to fully reset.
    pub fn wipe(&self) -> CResult<()> {
        self.delete_all()?;
        Ok(())
    }
}
