//! The atomic builder: accumulate checks and mutations across any number
//! of keys (and collections, from the caller's point of view — this layer
//! only sees keys) and apply them as one commit.
//!
//! A failed commit is a *value*, not an error: see `CommitOutcome`. Only a
//! backend failure (disk I/O, poisoned lock) surfaces as `Err`.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::CResult;
use crate::key::{Key, Versionstamp};

/// An optimistic-concurrency precondition: the entry at `key` must currently
/// carry exactly `versionstamp` (or must not exist, if `versionstamp` is
/// `None`) for the commit to proceed.
#[derive(Clone, Debug)]
pub struct KvCheck {
    pub key: Key,
    pub versionstamp: Option<Versionstamp>,
}

/// One write to apply as part of a commit.
#[derive(Clone, Debug)]
pub struct KvMutation {
    pub key: Key,
    pub kind: MutationKind,
}

#[derive(Clone, Debug)]
pub enum MutationKind {
    Set(Vec<u8>, Option<Duration>),
    Delete,
    /// Adds `operand` to the little-endian u64 stored at `key` (0 if
    /// absent), clamping on overflow rather than panicking or wrapping.
    Sum(u64),
    Min(u64),
    Max(u64),
}

/// The result of `AtomicBuilder::commit`. `Conflict` means every check or
/// mutation was rejected without effect — the backend guarantees a
/// rejected commit touches nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Ok(Versionstamp),
    Conflict,
}

impl CommitOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommitOutcome::Ok(_))
    }
}

/// Implemented by each `Kv` backend to actually apply a built commit.
/// Kept separate from the public `Kv` trait so `AtomicBuilder` doesn't need
/// to be generic over the backend type.
pub trait AtomicSink: Send + Sync {
    fn apply(
        &self,
        checks: &[KvCheck],
        mutations: &[KvMutation],
        enqueues: &[(String, Vec<u8>, Option<Duration>)],
    ) -> CResult<CommitOutcome>;
}

pub struct AtomicBuilder<'a> {
    sink: &'a dyn AtomicSink,
    checks: Vec<KvCheck>,
    mutations: Vec<KvMutation>,
    enqueues: Vec<(String, Vec<u8>, Option<Duration>)>,
}

impl<'a> AtomicBuilder<'a> {
    pub fn new(sink: &'a dyn AtomicSink) -> Self {
        AtomicBuilder { sink, checks: Vec::new(), mutations: Vec::new(), enqueues: Vec::new() }
    }

    /// Fails the commit unless `key` currently carries `versionstamp`.
    pub fn check(mut self, key: Key, versionstamp: Versionstamp) -> Self {
        self.checks.push(KvCheck { key, versionstamp: Some(versionstamp) });
        self
    }

    /// Fails the commit unless `key` does not currently exist.
    pub fn check_absent(mut self, key: Key) -> Self {
        self.checks.push(KvCheck { key, versionstamp: None });
        self
    }

    pub fn set(mut self, key: Key, value: Vec<u8>) -> Self {
        self.mutations.push(KvMutation { key, kind: MutationKind::Set(value, None) });
        self
    }

    pub fn set_with_expire(mut self, key: Key, value: Vec<u8>, expire_in: Duration) -> Self {
        self.mutations.push(KvMutation { key, kind: MutationKind::Set(value, Some(expire_in)) });
        self
    }

    pub fn delete(mut self, key: Key) -> Self {
        self.mutations.push(KvMutation { key, kind: MutationKind::Delete });
        self
    }

    pub fn sum(mut self, key: Key, operand: u64) -> Self {
        self.mutations.push(KvMutation { key, kind: MutationKind::Sum(operand) });
        self
    }

    pub fn min(mut self, key: Key, operand: u64) -> Self {
        self.mutations.push(KvMutation { key, kind: MutationKind::Min(operand) });
        self
    }

    pub fn max(mut self, key: Key, operand: u64) -> Self {
        self.mutations.push(KvMutation { key, kind: MutationKind::Max(operand) });
        self
    }

    pub fn enqueue(mut self, topic: impl Into<String>, value: Vec<u8>, delay: Option<Duration>) -> Self {
        self.enqueues.push((topic.into(), value, delay));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty() && self.mutations.is_empty() && self.enqueues.is_empty()
    }

    /// Applies the accumulated checks and mutations as a single commit.
    ///
    /// Two mutations targeting the same key within one commit never reach
    /// the backend — a single atomic write can only have one final effect
    /// per key. This is an index invariant violation (I4's primary-index
    /// self-collision included), so per spec it surfaces as `Conflict`,
    /// the same outcome a failed precondition produces, never as an `Err`
    /// (the collection runtime's index-diffing in
    /// `collection::Collection::write_with_id` is responsible for never
    /// producing one in ordinary operation).
    pub fn commit(self) -> CResult<CommitOutcome> {
        let mut seen = HashSet::with_capacity(self.mutations.len());
        for m in &self.mutations {
            if !seen.insert(m.key.encode()) {
                return Ok(CommitOutcome::Conflict);
            }
        }
        self.sink.apply(&self.checks, &self.mutations, &self.enqueues)
    }
}
