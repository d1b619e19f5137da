//! The ordered key-value interface: atomic multi-key commits, optimistic
//! concurrency via per-entry versionstamps, prefix/range listing, and
//! enqueue/dequeue. Everything in `collection` and `db` is built purely on
//! top of this trait, never on a concrete backend.

pub mod atomic;
pub mod engine_kv;
pub mod memory;
pub mod queue;
pub mod watch;

use std::time::Duration;

use crate::error::CResult;
use crate::key::{Key, Versionstamp};

pub use atomic::{AtomicBuilder, CommitOutcome, KvCheck, KvMutation, MutationKind};
pub use engine_kv::EngineKv;
pub use memory::MemoryKv;
pub use queue::{QueueMessage, UndeliveredEntry};
pub use watch::WatchStream;

/// A live value together with the versionstamp minted when it was last
/// written. `versionstamp` is the unit of optimistic concurrency: a
/// `KvCheck` compares against it, never against the value itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub value: Vec<u8>,
    pub versionstamp: Versionstamp,
}

/// Selects the key range a `list` call iterates.
pub enum ListSelector {
    /// All keys sharing `prefix` as a prefix.
    Prefix(Key),
    /// An explicit, already-ordered key range.
    Range(Key, Key),
}

/// Pagination and post-limit filtering for `Kv::list`.
///
/// `limit` bounds how many raw id-entries are examined; `filter` is then
/// applied to the decoded results, so a `filter` that rejects most entries
/// can legitimately return fewer than `limit` results without that being a
/// bug (spec's standardized post-limit-filter behavior).
#[derive(Default)]
pub struct ListOptions {
    /// Resume strictly after this encoded key. `None` starts from the
    /// beginning of the selected range. Never conflate with an empty-string
    /// cursor: "no cursor" and "cursor at the empty key" are both
    /// representable and distinct.
    pub cursor: Option<Vec<u8>>,
    pub limit: Option<usize>,
    pub reverse: bool,
}

/// The ordered key-value store every higher layer is built on.
///
/// Implementations must be safe to call concurrently from multiple threads;
/// `&self` (not `&mut self`) is deliberate so `Kv` handles can be shared
/// behind a plain reference or `Arc` without an external mutex.
pub trait Kv: Send + Sync {
    fn get(&self, key: &Key) -> CResult<Option<Entry>>;

    fn get_many(&self, keys: &[Key]) -> CResult<Vec<Option<Entry>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Writes `value` under `key`, minting a fresh versionstamp. If
    /// `expire_in` is set, reads past that duration treat the entry as
    /// absent without requiring an explicit delete (lazy expiry).
    fn set(&self, key: &Key, value: Vec<u8>, expire_in: Option<Duration>) -> CResult<Versionstamp>;

    fn delete(&self, key: &Key) -> CResult<()>;

    /// Lists entries in key order (or reverse, if `opts.reverse`) under the
    /// given selector, honoring `opts.cursor`/`opts.limit`.
    fn list(&self, selector: ListSelector, opts: ListOptions) -> CResult<Vec<(Key, Entry)>>;

    /// Starts an atomic builder accumulating checks and mutations to apply
    /// as a single commit.
    fn atomic(&self) -> AtomicBuilder<'_>;

    /// Appends `value` to `topic`'s queue, to be delivered to a
    /// `listen_queue` consumer registered on that same topic. `delay`
    /// postpones visibility (used for redelivery backoff).
    fn enqueue(&self, topic: &str, value: Vec<u8>, delay: Option<Duration>) -> CResult<()>;

    /// Dequeues and returns the next message visible on `topic`, if any,
    /// without blocking. Messages on other topics are left untouched. A
    /// message not acknowledged (see `queue::UndeliveredEntry`) before the
    /// caller moves on is recorded as undelivered.
    fn dequeue(&self, topic: &str) -> CResult<Option<QueueMessage>>;

    /// Registers interest in changes to `keys`, returning a stream that
    /// yields the new `Entry` (or `None` on delete) each time one of them
    /// is written by any commit, including this process's own.
    fn watch(&self, keys: Vec<Key>) -> WatchStream;
}

/// Shared helper used by every `Kv` implementation's `list`: applies
/// cursor/limit/reverse to an already key-ordered sequence of candidates.
/// `range` additionally bounds by the raw encoded bytes, so callers can
/// pass either a prefix-derived range or an explicit one uniformly.
pub(crate) fn paginate<I>(iter: I, opts: &ListOptions) -> Vec<(Key, Entry)>
where
    I: Iterator<Item = (Key, Entry)>,
{
    let mut items: Vec<_> = if let Some(cursor) = &opts.cursor {
        iter.skip_while(|(k, _)| &k.encode() <= cursor).collect()
    } else {
        iter.collect()
    };
    if opts.reverse {
        items.reverse();
    }
    if let Some(limit) = opts.limit {
        items.truncate(limit);
    }
    items
}

pub(crate) fn selector_bounds(selector: &ListSelector) -> (Vec<u8>, Option<Vec<u8>>) {
    match selector {
        ListSelector::Prefix(prefix) => {
            let start = prefix.encode();
            let end = crate::key::prefix_end(&start);
            (start, end)
        }
        ListSelector::Range(start, end) => (start.encode(), Some(end.encode())),
    }
}
