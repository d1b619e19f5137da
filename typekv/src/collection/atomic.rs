//! The cross-collection atomic builder: `select` switches which typed
//! collection subsequent `add`/`set`/`delete` calls target, each lowered
//! into the same per-key checks and mutations the matching single-collection
//! operation (`Collection::insert_with_id`/`write_with_id`/`delete`) would
//! emit on its own, all batched into one `Kv` commit. Raw `check`/`set`/
//! `delete`/`enqueue` keep working directly on keys, so a commit can mix
//! collection-level and raw-key operations freely.
//!
//! A document-level precondition that can't be expressed as a backend
//! `KvCheck` — "this id already exists" for `add`, "this id exists" for
//! `set`/`delete` — is evaluated against a plain read before the commit is
//! built, same as the single-collection methods do. Finding that
//! precondition already violated flags the whole builder so `commit` reports
//! `Conflict` without touching the backend, rather than building a
//! half-composed commit.

use serde_json::Value;

use crate::error::CResult;
use crate::key::{Key, Versionstamp};
use crate::kv::{AtomicBuilder, CommitOutcome, Kv};

use super::history::{HistoryOp, HistoryRecord};
use super::model::Model;
use super::segment::IdEntryPayload;
use super::Collection;

struct PendingHistory {
    base: Key,
    id: String,
    op: HistoryOp,
    snapshot: Option<Value>,
}

/// Accumulates a commit that may span any number of collections.
pub struct CollectionAtomicBuilder<'a> {
    kv: &'a dyn Kv,
    builder: AtomicBuilder<'a>,
    pending_history: Vec<PendingHistory>,
    conflict: bool,
}

impl<'a> CollectionAtomicBuilder<'a> {
    pub(crate) fn new(kv: &'a dyn Kv) -> Self {
        CollectionAtomicBuilder { kv, builder: kv.atomic(), pending_history: Vec::new(), conflict: false }
    }

    pub fn check(mut self, key: Key, versionstamp: Versionstamp) -> Self {
        self.builder = self.builder.check(key, versionstamp);
        self
    }

    pub fn check_absent(mut self, key: Key) -> Self {
        self.builder = self.builder.check_absent(key);
        self
    }

    pub fn set(mut self, key: Key, value: Vec<u8>) -> Self {
        self.builder = self.builder.set(key, value);
        self
    }

    pub fn delete(mut self, key: Key) -> Self {
        self.builder = self.builder.delete(key);
        self
    }

    pub fn sum(mut self, key: Key, operand: u64) -> Self {
        self.builder = self.builder.sum(key, operand);
        self
    }

    pub fn min(mut self, key: Key, operand: u64) -> Self {
        self.builder = self.builder.min(key, operand);
        self
    }

    pub fn max(mut self, key: Key, operand: u64) -> Self {
        self.builder = self.builder.max(key, operand);
        self
    }

    pub fn enqueue(mut self, topic: impl Into<String>, value: Vec<u8>, delay: Option<std::time::Duration>) -> Self {
        self.builder = self.builder.enqueue(topic, value, delay);
        self
    }

    /// Switches the builder's current collection. Everything accumulated so
    /// far (raw or belonging to a previously selected collection) stays in
    /// the commit.
    pub fn select<T: Model>(self, collection: &Collection<T>) -> SelectedCollection<'a, '_, T> {
        SelectedCollection { inner: self, collection }
    }

    /// Applies every accumulated check, mutation and enqueue as one commit,
    /// then records one history entry per collection-level `add`/`set`/
    /// `delete` call against the commit's versionstamp. History is recorded
    /// after the commit lands, the same as the single-collection write
    /// methods do — a crash between the two leaves the commit durable but
    /// its history entry missing, same window that already exists there.
    pub fn commit(self) -> CResult<CommitOutcome> {
        if self.conflict {
            return Ok(CommitOutcome::Conflict);
        }
        match self.builder.commit()? {
            CommitOutcome::Conflict => Ok(CommitOutcome::Conflict),
            CommitOutcome::Ok(versionstamp) => {
                for pending in self.pending_history {
                    let key = pending.base.push("hist").push(pending.id.as_str()).push(versionstamp.0 as i64);
                    let record = HistoryRecord { op: pending.op, timestamp: chrono::Utc::now(), snapshot: pending.snapshot };
                    self.kv.set(&key, bincode::serialize(&record)?, None)?;
                }
                Ok(CommitOutcome::Ok(versionstamp))
            }
        }
    }
}

/// A `CollectionAtomicBuilder` with a collection selected; `add`/`set`/
/// `delete` target it until another `select` switches away.
pub struct SelectedCollection<'a, 'c, T: Model> {
    inner: CollectionAtomicBuilder<'a>,
    collection: &'c Collection<T>,
}

impl<'a, 'c, T: Model> SelectedCollection<'a, 'c, T> {
    /// Inserts `value` under `id`, emitting the same checks and index
    /// mutations `Collection::insert_with_id` would on its own (I1, I4).
    pub fn add(mut self, id: impl Into<String>, value: T) -> CResult<Self> {
        value.validate()?;
        let id = id.into();
        let c = self.collection;
        let (payload, segments) = c.encode_payload(&value)?;

        self.inner.builder =
            self.inner.builder.check_absent(c.id_key(&id)).set(c.id_key(&id), bincode::serialize(&payload)?);
        for (ordinal, segment) in segments.into_iter().enumerate() {
            self.inner.builder = self.inner.builder.set(c.segment_key(&id, ordinal as u32), segment);
        }
        for (field, v) in value.primary_index() {
            self.inner.builder = self
                .inner
                .builder
                .check_absent(c.primary_key(field, &v))
                .set(c.primary_key(field, &v), id.as_bytes().to_vec());
        }
        for (field, v) in value.secondary_index() {
            self.inner.builder = self.inner.builder.set(c.secondary_key(field, &v, &id), id.as_bytes().to_vec());
        }

        let snapshot = Some(serde_json::to_value(&value)?);
        self.inner.pending_history.push(PendingHistory { base: c.base.clone(), id, op: HistoryOp::Insert, snapshot });
        Ok(self)
    }

    /// Overwrites `id`, diffing indices the same way
    /// `Collection::overwrite_with_id` does standalone. `expected`, if set,
    /// must match the document's current versionstamp. A missing `id`, or a
    /// mismatched `expected`, flags the whole commit `Conflict` rather than
    /// erroring — the same outcome `overwrite_with_id` produces alone.
    pub fn set(mut self, id: impl Into<String>, value: T, expected: Option<Versionstamp>) -> CResult<Self> {
        value.validate()?;
        let id = id.into();
        let c = self.collection;
        let (old_versionstamp, old_payload, old_value) = match c.read_raw(&id)? {
            None => {
                self.inner.conflict = true;
                return Ok(self);
            }
            Some((vs, _, _)) if expected.is_some_and(|exp| exp != vs) => {
                self.inner.conflict = true;
                return Ok(self);
            }
            Some(existing) => existing,
        };

        let old_primary = old_value.primary_index();
        let old_secondary = old_value.secondary_index();
        let new_primary = value.primary_index();
        let new_secondary = value.secondary_index();

        let (payload, segments) = c.encode_payload(&value)?;
        let new_segment_count = match &payload {
            IdEntryPayload::Segmented { segment_count, .. } => *segment_count,
            IdEntryPayload::Inline { .. } => 0,
        };
        let old_segment_count = match &old_payload {
            IdEntryPayload::Segmented { segment_count, .. } => *segment_count,
            IdEntryPayload::Inline { .. } => 0,
        };

        self.inner.builder = self
            .inner
            .builder
            .check(c.id_key(&id), old_versionstamp)
            .set(c.id_key(&id), bincode::serialize(&payload)?);

        for (ordinal, segment) in segments.into_iter().enumerate() {
            self.inner.builder = self.inner.builder.set(c.segment_key(&id, ordinal as u32), segment);
        }
        for ordinal in new_segment_count..old_segment_count {
            self.inner.builder = self.inner.builder.delete(c.segment_key(&id, ordinal));
        }

        for (field, v) in &old_primary {
            if !new_primary.iter().any(|(f, val)| f == field && val == v) {
                self.inner.builder = self.inner.builder.delete(c.primary_key(field, v));
            }
        }
        for (field, v) in &new_primary {
            if !old_primary.iter().any(|(f, val)| f == field && val == v) {
                self.inner.builder =
                    self.inner.builder.check_absent(c.primary_key(field, v)).set(c.primary_key(field, v), id.as_bytes().to_vec());
            }
        }

        for (field, v) in &old_secondary {
            if !new_secondary.iter().any(|(f, val)| f == field && val == v) {
                self.inner.builder = self.inner.builder.delete(c.secondary_key(field, v, &id));
            }
        }
        for (field, v) in &new_secondary {
            if !old_secondary.iter().any(|(f, val)| f == field && val == v) {
                self.inner.builder = self.inner.builder.set(c.secondary_key(field, v, &id), id.as_bytes().to_vec());
            }
        }

        let snapshot = Some(serde_json::to_value(&value)?);
        self.inner.pending_history.push(PendingHistory {
            base: c.base.clone(),
            id,
            op: HistoryOp::Overwrite,
            snapshot,
        });
        Ok(self)
    }

    /// Deletes `id`, emitting the same id/segment/index deletions
    /// `Collection::delete` would standalone. A missing `id` flags the
    /// whole commit `Conflict`, matching `delete` returning `false` alone.
    pub fn delete(mut self, id: impl Into<String>) -> CResult<Self> {
        let id = id.into();
        let c = self.collection;
        let (versionstamp, payload, value) = match c.read_raw(&id)? {
            Some(existing) => existing,
            None => {
                self.inner.conflict = true;
                return Ok(self);
            }
        };

        self.inner.builder = self.inner.builder.check(c.id_key(&id), versionstamp).delete(c.id_key(&id));
        if let IdEntryPayload::Segmented { segment_count, .. } = payload {
            for ordinal in 0..segment_count {
                self.inner.builder = self.inner.builder.delete(c.segment_key(&id, ordinal));
            }
        }
        for (field, v) in value.primary_index() {
            self.inner.builder = self.inner.builder.delete(c.primary_key(field, &v));
        }
        for (field, v) in value.secondary_index() {
            self.inner.builder = self.inner.builder.delete(c.secondary_key(field, &v, &id));
        }

        self.inner.pending_history.push(PendingHistory { base: c.base.clone(), id, op: HistoryOp::Delete, snapshot: None });
        Ok(self)
    }

    /// Switches to another collection, keeping everything accumulated so far.
    pub fn select<U: Model>(self, collection: &Collection<U>) -> SelectedCollection<'a, '_, U> {
        SelectedCollection { inner: self.inner, collection }
    }

    pub fn commit(self) -> CResult<CommitOutcome> {
        self.inner.commit()
    }
}
