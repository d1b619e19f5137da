//! Typed, namespaced collections over a `Kv` backend: the indexed write
//! protocol (insert/overwrite/update/delete), large-value segmentation, and
//! the append-only history log, all composed from plain `Kv::atomic()`
//! commits.

pub mod atomic;
pub mod history;
pub mod merge;
pub mod model;
pub mod segment;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;

use crate::error::{CResult, Error};
use crate::key::{Key, KeyPart, Versionstamp};
use crate::kv::queue::{QueueMessage, UndeliveredEntry};
use crate::kv::{CommitOutcome, Kv, ListOptions, ListSelector, WatchStream};

pub use atomic::{CollectionAtomicBuilder, SelectedCollection};
pub use history::{HistoryOp, HistoryRecord};
pub use model::Model;
pub use segment::{EncodingTag, IdEntryPayload};

/// A document read back from a `Collection`: its id, the versionstamp of
/// the commit that last wrote it, and the decoded value.
#[derive(Clone, Debug, PartialEq)]
pub struct Document<T> {
    pub id: String,
    pub versionstamp: Versionstamp,
    pub value: T,
}

/// The outcome of a write. `Conflict` covers every rejection the indexed
/// write protocol can produce: a stale `expected` versionstamp, an id that
/// already exists (`insert`), an id that doesn't (`overwrite`/`update`
/// without `insert`), or a primary-index value already owned by another
/// document (I4).
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOutcome<T> {
    Written(Document<T>),
    Conflict,
}

impl<T> WriteOutcome<T> {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written(_))
    }
}

/// A predicate evaluated against each decoded document, applied strictly
/// after `ListOptions::limit` has already bounded how many raw id-entries
/// were examined: a filter that rejects most of a page can legitimately
/// return fewer results than `limit` without that being a bug.
pub type Filter<'a, T> = Option<&'a dyn Fn(&T) -> bool>;

/// Fixed text constant every collection's base key is namespaced under, so
/// a `Kv` backend can be shared with unrelated key space without collision.
const FRAMEWORK_PREFIX: &str = "tk";

fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// One namespaced typed collection. `base` fixes the key prefix every
/// entry this collection writes lives under; nesting collections is just
/// constructing one with a longer `base`.
pub struct Collection<T: Model> {
    kv: Arc<dyn Kv>,
    base: Key,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Model> Collection<T> {
    pub fn new(kv: Arc<dyn Kv>, path: &[&str]) -> Self {
        let base = path.iter().fold(Key::default().push(FRAMEWORK_PREFIX), |key, segment| key.push(*segment));
        Collection { kv, base, _marker: PhantomData }
    }

    /// A collection nested under this one, sharing the same backend.
    pub fn nested<U: Model>(&self, path: &[&str]) -> Collection<U> {
        let base = path.iter().fold(self.base.clone(), |key, segment| key.push(*segment));
        Collection { kv: Arc::clone(&self.kv), base, _marker: PhantomData }
    }

    fn id_key(&self, id: &str) -> Key {
        self.base.clone().push("id").push(id)
    }

    fn primary_key(&self, field: &str, value: &KeyPart) -> Key {
        self.base.clone().push("pi").push(field).push(value.clone())
    }

    fn secondary_key(&self, field: &str, value: &KeyPart, id: &str) -> Key {
        self.base.clone().push("si").push(field).push(value.clone()).push(id)
    }

    fn segment_key(&self, id: &str, ordinal: u32) -> Key {
        self.base.clone().push("seg").push(id).push(ordinal as i64)
    }

    fn history_key(&self, id: &str, versionstamp: Versionstamp) -> Key {
        self.base.clone().push("hist").push(id).push(versionstamp.0 as i64)
    }

    fn undelivered_key(&self, queue_message_id: i64) -> Key {
        self.base.clone().push("und").push(queue_message_id)
    }

    /// Identifies this collection's messages on a `Kv` backend's shared
    /// queue, so two collections enqueueing onto the same backend never
    /// dequeue each other's payloads.
    fn topic(&self) -> String {
        self.base.encode().iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Encodes `value` and decides whether it fits in the id entry itself
    /// or needs segmenting, returning the descriptor to store at the id key
    /// plus whichever segment chunks (if any) need their own `seg` keys.
    fn encode_payload(&self, value: &T) -> CResult<(IdEntryPayload, Vec<Vec<u8>>)> {
        let bytes = bincode::serialize(value)?;
        if bytes.len() > segment::SEGMENT_THRESHOLD {
            let segments = segment::chunk(&bytes);
            let payload =
                IdEntryPayload::Segmented { encoding: EncodingTag::Structured, segment_count: segments.len() as u32 };
            Ok((payload, segments))
        } else {
            Ok((IdEntryPayload::Inline { encoding: EncodingTag::Structured, value: bytes }, Vec::new()))
        }
    }

    fn decode_value(&self, payload: &IdEntryPayload, segments: Vec<Option<Vec<u8>>>) -> CResult<T> {
        let (encoding, bytes) = match payload {
            IdEntryPayload::Inline { encoding, value } => (*encoding, value.clone()),
            IdEntryPayload::Segmented { encoding, .. } => (*encoding, segment::reassemble(segments)?),
        };
        match encoding {
            EncodingTag::Structured => Ok(bincode::deserialize(&bytes)?),
            EncodingTag::Json => {
                let text = String::from_utf8(bytes)
                    .map_err(|e| Error::Parse(format!("segmented json value is not utf8: {e}")))?;
                Ok(serde_json::from_str(&text)?)
            }
        }
    }

    fn read_raw(&self, id: &str) -> CResult<Option<(Versionstamp, IdEntryPayload, T)>> {
        let entry = match self.kv.get(&self.id_key(id))? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let payload: IdEntryPayload = bincode::deserialize(&entry.value)?;
        let segments = match &payload {
            IdEntryPayload::Inline { .. } => Vec::new(),
            IdEntryPayload::Segmented { segment_count, .. } => {
                let mut segments = Vec::with_capacity(*segment_count as usize);
                for ordinal in 0..*segment_count {
                    segments.push(self.kv.get(&self.segment_key(id, ordinal))?.map(|e| e.value));
                }
                segments
            }
        };
        let value = self.decode_value(&payload, segments)?;
        Ok(Some((entry.versionstamp, payload, value)))
    }

    fn record_history(&self, id: &str, versionstamp: Versionstamp, op: HistoryOp, value: Option<&T>) -> CResult<()> {
        let snapshot = value.map(serde_json::to_value).transpose()?;
        let record = HistoryRecord { op, timestamp: chrono::Utc::now(), snapshot };
        self.kv.set(&self.history_key(id, versionstamp), bincode::serialize(&record)?, None)?;
        Ok(())
    }

    /// All history records for `id`, oldest first (I6).
    pub fn history(&self, id: &str) -> CResult<Vec<(Versionstamp, HistoryRecord)>> {
        let prefix = self.base.clone().push("hist").push(id);
        let entries = self.kv.list(ListSelector::Prefix(prefix), ListOptions::default())?;
        entries
            .into_iter()
            .map(|(_, entry)| {
                let record: HistoryRecord = bincode::deserialize(&entry.value)?;
                Ok((entry.versionstamp, record))
            })
            .collect()
    }

    pub fn delete_history(&self, id: &str) -> CResult<()> {
        let prefix = self.base.clone().push("hist").push(id);
        let entries = self.kv.list(ListSelector::Prefix(prefix), ListOptions::default())?;
        for (key, _) in entries {
            self.kv.delete(&key)?;
        }
        Ok(())
    }

    /// Inserts `value` under a freshly minted random id.
    pub fn insert(&self, value: T) -> CResult<WriteOutcome<T>> {
        self.insert_with_id(random_id(), value)
    }

    /// Upsert: overwrites `id` if it already names a live document,
    /// inserts it otherwise. Unlike `overwrite_with_id`, never rejects a
    /// missing id as a `Conflict` — that's the distinction from `overwrite`
    /// the per-collection `write` operation exists to make.
    pub fn write(&self, id: String, value: T) -> CResult<WriteOutcome<T>> {
        if self.kv.get(&self.id_key(&id))?.is_some() {
            self.overwrite_with_id(&id, value, None)
        } else {
            self.insert_with_id(id, value)
        }
    }

    /// Inserts `value` under `id`. Fails (I1) if `id` already names a live
    /// document, or (I4) if any of `value`'s primary-indexed fields already
    /// belong to a different document.
    pub fn insert_with_id(&self, id: String, value: T) -> CResult<WriteOutcome<T>> {
        value.validate()?;
        let (payload, segments) = self.encode_payload(&value)?;

        let mut builder =
            self.kv.atomic().check_absent(self.id_key(&id)).set(self.id_key(&id), bincode::serialize(&payload)?);
        for (ordinal, segment) in segments.into_iter().enumerate() {
            builder = builder.set(self.segment_key(&id, ordinal as u32), segment);
        }
        for (field, value) in value.primary_index() {
            builder = builder.check_absent(self.primary_key(field, &value)).set(
                self.primary_key(field, &value),
                id.as_bytes().to_vec(),
            );
        }
        for (field, value) in value.secondary_index() {
            builder = builder.set(self.secondary_key(field, &value, &id), id.as_bytes().to_vec());
        }

        match builder.commit()? {
            CommitOutcome::Conflict => Ok(WriteOutcome::Conflict),
            CommitOutcome::Ok(versionstamp) => {
                self.record_history(&id, versionstamp, HistoryOp::Insert, Some(&value))?;
                Ok(WriteOutcome::Written(Document { id, versionstamp, value }))
            }
        }
    }

    /// Replaces an existing document wholesale. `expected`, if set, must
    /// match the document's current versionstamp or the write is rejected
    /// as a `Conflict` without touching anything. Only the index entries
    /// that actually change are written or deleted, so a primary/secondary
    /// value a document already owns never collides with itself.
    pub fn overwrite_with_id(&self, id: &str, value: T, expected: Option<Versionstamp>) -> CResult<WriteOutcome<T>> {
        self.write_with_id(id, value, expected, HistoryOp::Overwrite)
    }

    fn write_with_id(&self, id: &str, value: T, expected: Option<Versionstamp>, op: HistoryOp) -> CResult<WriteOutcome<T>> {
        value.validate()?;
        let (old_versionstamp, old_payload, old_value) = match self.read_raw(id)? {
            None => return Ok(WriteOutcome::Conflict),
            Some((vs, _, _)) if expected.is_some_and(|exp| exp != vs) => return Ok(WriteOutcome::Conflict),
            Some(existing) => existing,
        };

        let old_primary = old_value.primary_index();
        let old_secondary = old_value.secondary_index();
        let new_primary = value.primary_index();
        let new_secondary = value.secondary_index();

        let (payload, segments) = self.encode_payload(&value)?;
        let new_segment_count = match &payload {
            IdEntryPayload::Segmented { segment_count, .. } => *segment_count,
            IdEntryPayload::Inline { .. } => 0,
        };
        let old_segment_count = match &old_payload {
            IdEntryPayload::Segmented { segment_count, .. } => *segment_count,
            IdEntryPayload::Inline { .. } => 0,
        };

        let mut builder = self
            .kv
            .atomic()
            .check(self.id_key(id), old_versionstamp)
            .set(self.id_key(id), bincode::serialize(&payload)?);

        for (ordinal, segment) in segments.into_iter().enumerate() {
            builder = builder.set(self.segment_key(id, ordinal as u32), segment);
        }
        for ordinal in new_segment_count..old_segment_count {
            builder = builder.delete(self.segment_key(id, ordinal));
        }

        for (field, value) in &old_primary {
            if !new_primary.iter().any(|(f, v)| f == field && v == value) {
                builder = builder.delete(self.primary_key(field, value));
            }
        }
        for (field, value) in &new_primary {
            if !old_primary.iter().any(|(f, v)| f == field && v == value) {
                builder = builder
                    .check_absent(self.primary_key(field, value))
                    .set(self.primary_key(field, value), id.as_bytes().to_vec());
            }
        }

        for (field, value) in &old_secondary {
            if !new_secondary.iter().any(|(f, v)| f == field && v == value) {
                builder = builder.delete(self.secondary_key(field, value, id));
            }
        }
        for (field, value) in &new_secondary {
            if !old_secondary.iter().any(|(f, v)| f == field && v == value) {
                builder = builder.set(self.secondary_key(field, value, id), id.as_bytes().to_vec());
            }
        }

        match builder.commit()? {
            CommitOutcome::Conflict => Ok(WriteOutcome::Conflict),
            CommitOutcome::Ok(versionstamp) => {
                self.record_history(id, versionstamp, op, Some(&value))?;
                Ok(WriteOutcome::Written(Document { id: id.to_string(), versionstamp, value }))
            }
        }
    }

    /// Deep-merges `patch` into the document's current value (mapping
    /// fields recurse, everything else is replaced) and writes the result
    /// through the same index-diffing commit `overwrite_with_id` uses.
    pub fn update_with_id(&self, id: &str, patch: serde_json::Value, expected: Option<Versionstamp>) -> CResult<WriteOutcome<T>> {
        let (versionstamp, _, old_value) = self.read_raw(id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(exp) = expected {
            if exp != versionstamp {
                return Ok(WriteOutcome::Conflict);
            }
        }
        let mut base = serde_json::to_value(&old_value)?;
        merge::deep_merge(&mut base, patch);
        let merged: T = serde_json::from_value(base)?;
        self.write_with_id(id, merged, Some(versionstamp), HistoryOp::Update)
    }

    /// Removes a document's id, segment, and index entries. Returns
    /// `false` if `id` didn't name a live document, or if the deletion
    /// lost a race with a concurrent write.
    pub fn delete(&self, id: &str) -> CResult<bool> {
        let (versionstamp, payload, value) = match self.read_raw(id)? {
            Some(existing) => existing,
            None => return Ok(false),
        };

        let mut builder = self.kv.atomic().check(self.id_key(id), versionstamp).delete(self.id_key(id));
        if let IdEntryPayload::Segmented { segment_count, .. } = payload {
            for ordinal in 0..segment_count {
                builder = builder.delete(self.segment_key(id, ordinal));
            }
        }
        for (field, value) in value.primary_index() {
            builder = builder.delete(self.primary_key(field, &value));
        }
        for (field, value) in value.secondary_index() {
            builder = builder.delete(self.secondary_key(field, &value, id));
        }

        match builder.commit()? {
            CommitOutcome::Conflict => Ok(false),
            CommitOutcome::Ok(commit_versionstamp) => {
                self.record_history(id, commit_versionstamp, HistoryOp::Delete, None)?;
                Ok(true)
            }
        }
    }

    pub fn get(&self, id: &str) -> CResult<Option<Document<T>>> {
        Ok(self.read_raw(id)?.map(|(versionstamp, _, value)| Document { id: id.to_string(), versionstamp, value }))
    }

    /// Fetches each id in turn. A document failing `filter` is reported as
    /// absent (`None`) rather than returned, applied per-document after
    /// decoding — pass `None` to fetch unconditionally.
    pub fn get_many(&self, ids: &[String], filter: Filter<'_, T>) -> CResult<Vec<Option<Document<T>>>> {
        ids.iter()
            .map(|id| Ok(self.get(id)?.filter(|doc| filter.map_or(true, |f| f(&doc.value)))))
            .collect()
    }

    /// The id-entry's stored value by `field`, if any document currently
    /// owns it (I4 guarantees at most one).
    pub fn find_by_primary(&self, field: &str, value: impl Into<KeyPart>) -> CResult<Option<Document<T>>> {
        let key = self.primary_key(field, &value.into());
        match self.kv.get(&key)? {
            None => Ok(None),
            Some(entry) => {
                let id = String::from_utf8(entry.value)
                    .map_err(|e| Error::Backend(format!("primary index entry is not a valid id: {e}")))?;
                self.get(&id)
            }
        }
    }

    pub fn find_by_secondary(&self, field: &str, value: impl Into<KeyPart>) -> CResult<Vec<Document<T>>> {
        let prefix = self.base.clone().push("si").push(field).push(value.into());
        let entries = self.kv.list(ListSelector::Prefix(prefix), ListOptions::default())?;
        entries
            .into_iter()
            .filter_map(|(key, _)| match key.0.last() {
                Some(KeyPart::String(id)) => self.get(id).transpose(),
                _ => None,
            })
            .collect()
    }

    /// Lists documents in id order. `opts.limit` bounds how many id-entries
    /// are examined, not how many documents are returned after decoding;
    /// `filter`, if given, further narrows the decoded results.
    pub fn list(&self, opts: ListOptions, filter: Filter<'_, T>) -> CResult<Vec<Document<T>>> {
        let prefix = self.base.clone().push("id");
        let entries = self.kv.list(ListSelector::Prefix(prefix), opts)?;
        entries
            .into_iter()
            .filter_map(|(key, entry)| {
                let id = match key.0.last() {
                    Some(KeyPart::String(id)) => id.clone(),
                    _ => return Some(Err(Error::Key("id entry key missing its id part".into()))),
                };
                let result = (|| {
                    let payload: IdEntryPayload = bincode::deserialize(&entry.value)?;
                    let segments = match &payload {
                        IdEntryPayload::Inline { .. } => Vec::new(),
                        IdEntryPayload::Segmented { segment_count, .. } => {
                            let mut segments = Vec::with_capacity(*segment_count as usize);
                            for ordinal in 0..*segment_count {
                                segments.push(self.kv.get(&self.segment_key(&id, ordinal))?.map(|e| e.value));
                            }
                            segments
                        }
                    };
                    self.decode_value(&payload, segments)
                })();
                match result {
                    Ok(value) => filter
                        .map_or(true, |f| f(&value))
                        .then(|| Ok(Document { id, versionstamp: entry.versionstamp, value })),
                    Err(e) => Some(Err(e)),
                }
            })
            .collect()
    }

    /// Counts live documents. With no `filter`, counts raw id-entries
    /// without decoding values or segments; with one, decodes each
    /// id-entry `opts.limit` admits and counts only those passing it.
    pub fn count(&self, opts: ListOptions, filter: Filter<'_, T>) -> CResult<usize> {
        match filter {
            None => {
                let prefix = self.base.clone().push("id");
                Ok(self.kv.list(ListSelector::Prefix(prefix), opts)?.len())
            }
            Some(_) => Ok(self.list(opts, filter)?.len()),
        }
    }

    pub fn add_many(&self, values: Vec<T>) -> CResult<Vec<WriteOutcome<T>>> {
        values.into_iter().map(|value| self.insert(value)).collect()
    }

    /// Applies each patch, skipping (as `WriteOutcome::Conflict`) any
    /// document whose pre-patch value fails `filter`.
    pub fn update_many(
        &self,
        patches: Vec<(String, serde_json::Value)>,
        filter: Filter<'_, T>,
    ) -> CResult<Vec<WriteOutcome<T>>> {
        patches
            .into_iter()
            .map(|(id, patch)| match (self.get(&id)?, filter) {
                (Some(doc), Some(f)) if !f(&doc.value) => Ok(WriteOutcome::Conflict),
                _ => self.update_with_id(&id, patch, None),
            })
            .collect()
    }

    /// Deletes each id whose current value passes `filter` (or every
    /// listed id, if `filter` is `None`). Returns the number deleted.
    pub fn delete_many(&self, ids: &[String], filter: Filter<'_, T>) -> CResult<usize> {
        let mut deleted = 0;
        for id in ids {
            let passes = match filter {
                None => true,
                Some(f) => self.get(id)?.is_some_and(|doc| f(&doc.value)),
            };
            if passes && self.delete(id)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Deletes the (at most one, by I4) document owning `value` under
    /// `field`.
    pub fn delete_by_primary(&self, field: &str, value: impl Into<KeyPart>) -> CResult<bool> {
        match self.find_by_primary(field, value)? {
            Some(doc) => self.delete(&doc.id),
            None => Ok(false),
        }
    }

    pub fn delete_by_secondary(&self, field: &str, value: impl Into<KeyPart>) -> CResult<usize> {
        let docs = self.find_by_secondary(field, value)?;
        let mut deleted = 0;
        for doc in docs {
            if self.delete(&doc.id)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub fn update_by_primary(
        &self,
        field: &str,
        value: impl Into<KeyPart>,
        patch: serde_json::Value,
    ) -> CResult<Option<WriteOutcome<T>>> {
        match self.find_by_primary(field, value)? {
            Some(doc) => Ok(Some(self.update_with_id(&doc.id, patch, None)?)),
            None => Ok(None),
        }
    }

    pub fn update_by_secondary(
        &self,
        field: &str,
        value: impl Into<KeyPart>,
        patch: serde_json::Value,
    ) -> CResult<Vec<WriteOutcome<T>>> {
        self.find_by_secondary(field, value)?
            .into_iter()
            .map(|doc| self.update_with_id(&doc.id, patch.clone(), None))
            .collect()
    }

    pub fn for_each(&self, opts: ListOptions, filter: Filter<'_, T>, mut f: impl FnMut(&Document<T>)) -> CResult<()> {
        for doc in self.list(opts, filter)? {
            f(&doc);
        }
        Ok(())
    }

    pub fn map<R>(&self, opts: ListOptions, filter: Filter<'_, T>, mut f: impl FnMut(&Document<T>) -> R) -> CResult<Vec<R>> {
        Ok(self.list(opts, filter)?.iter().map(|doc| f(doc)).collect())
    }

    /// Streams changes to a single document's id entry.
    pub fn watch(&self, id: &str) -> WatchStream {
        self.kv.watch(vec![self.id_key(id)])
    }

    pub fn enqueue(&self, value: Vec<u8>, delay: Option<Duration>) -> CResult<()> {
        self.kv.enqueue(&self.topic(), value, delay)
    }

    pub fn find_undelivered(&self) -> CResult<Vec<UndeliveredEntry>> {
        let prefix = self.base.clone().push("und");
        let entries = self.kv.list(ListSelector::Prefix(prefix), ListOptions::default())?;
        entries
            .into_iter()
            .map(|(key, entry)| Ok(UndeliveredEntry { key, message: bincode::deserialize(&entry.value)? }))
            .collect()
    }

    pub fn delete_undelivered(&self, message_id: u64) -> CResult<()> {
        self.kv.delete(&self.undelivered_key(message_id as i64))
    }

    /// Dequeues and dispatches to `handler` until `while_cond` returns
    /// `false`, retrying a failed handler up to `max_attempts` times (with
    /// a short fixed backoff between redeliveries) before recording it
    /// under this collection's undelivered family for later recovery.
    ///
    /// `Kv::enqueue` mints a fresh message id on every call, so a
    /// redelivered message never keeps its original id; attempts are
    /// tracked by payload instead. This is process-local bookkeeping, not
    /// persisted (spec's "no cross-process coordination" non-goal).
    pub async fn listen_queue(
        &self,
        max_attempts: u32,
        mut while_cond: impl FnMut() -> bool,
        mut handler: impl FnMut(&QueueMessage) -> CResult<()>,
    ) -> CResult<()> {
        let topic = self.topic();
        let mut attempts: HashMap<Vec<u8>, u32> = HashMap::new();
        while while_cond() {
            match self.kv.dequeue(&topic)? {
                Some(message) => match handler(&message) {
                    Ok(()) => {
                        attempts.remove(&message.value);
                    }
                    Err(_) => {
                        let count = attempts.entry(message.value.clone()).or_insert(0);
                        *count += 1;
                        if *count >= max_attempts {
                            self.kv.set(
                                &self.undelivered_key(message.id as i64),
                                bincode::serialize(&message)?,
                                None,
                            )?;
                            attempts.remove(&message.value);
                        } else {
                            self.kv.enqueue(&topic, message.value.clone(), Some(Duration::from_millis(200)))?;
                        }
                    }
                },
                None => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde_derive::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        email: String,
        team: String,
        age: u32,
    }

    impl Model for User {
        fn validate(&self) -> CResult<()> {
            if self.email.is_empty() {
                return Err(Error::Validation("email must not be empty".into()));
            }
            Ok(())
        }

        fn primary_index(&self) -> Vec<(&'static str, KeyPart)> {
            vec![("email", self.email.clone().into())]
        }

        fn secondary_index(&self) -> Vec<(&'static str, KeyPart)> {
            vec![("team", self.team.clone().into())]
        }
    }

    fn collection() -> Collection<User> {
        Collection::new(Arc::new(MemoryKv::new()), &["users"])
    }

    #[test]
    fn insert_then_get_round_trips() {
        let users = collection();
        let user = User { email: "a@x.com".into(), team: "eng".into(), age: 30 };
        let outcome = users.insert_with_id("u1".into(), user.clone()).unwrap();
        assert!(outcome.is_written());
        let doc = users.get("u1").unwrap().unwrap();
        assert_eq!(doc.value, user);
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let users = collection();
        let user = User { email: "a@x.com".into(), team: "eng".into(), age: 30 };
        users.insert_with_id("u1".into(), user.clone()).unwrap();
        let outcome = users.insert_with_id("u1".into(), user).unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);
    }

    #[test]
    fn insert_rejects_duplicate_primary_index_value() {
        let users = collection();
        let a = User { email: "shared@x.com".into(), team: "eng".into(), age: 30 };
        let b = User { email: "shared@x.com".into(), team: "sales".into(), age: 40 };
        users.insert_with_id("u1".into(), a).unwrap();
        let outcome = users.insert_with_id("u2".into(), b).unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);
    }

    #[test]
    fn small_values_are_inline_with_no_segment_entries() {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let users: Collection<User> = Collection::new(Arc::clone(&kv), &["users"]);
        users.insert_with_id("u1".into(), User { email: "a@x.com".into(), team: "eng".into(), age: 30 }).unwrap();

        let seg_prefix = Key::default().push(FRAMEWORK_PREFIX).push("users").push("seg");
        assert!(kv.list(ListSelector::Prefix(seg_prefix), ListOptions::default()).unwrap().is_empty());
    }

    #[test]
    fn large_values_are_segmented_reassembled_and_cleaned_up_on_delete() {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let users: Collection<User> = Collection::new(Arc::clone(&kv), &["users"]);
        let big_team = "x".repeat(segment::SEGMENT_THRESHOLD * 2 + 10);
        let user = User { email: "big@x.com".into(), team: big_team.clone(), age: 50 };
        users.insert_with_id("u1".into(), user).unwrap();

        let seg_prefix = Key::default().push(FRAMEWORK_PREFIX).push("users").push("seg");
        assert!(!kv.list(ListSelector::Prefix(seg_prefix.clone()), ListOptions::default()).unwrap().is_empty());

        let fetched = users.get("u1").unwrap().unwrap();
        assert_eq!(fetched.value.team, big_team);

        users.delete("u1").unwrap();
        assert!(kv.list(ListSelector::Prefix(seg_prefix), ListOptions::default()).unwrap().is_empty());
    }

    #[test]
    fn overwriting_a_segmented_value_with_a_small_one_drops_the_old_segments() {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let users: Collection<User> = Collection::new(Arc::clone(&kv), &["users"]);
        let big_team = "x".repeat(segment::SEGMENT_THRESHOLD * 2);
        users
            .insert_with_id("u1".into(), User { email: "a@x.com".into(), team: big_team, age: 30 })
            .unwrap();

        users.overwrite_with_id("u1", User { email: "a@x.com".into(), team: "eng".into(), age: 31 }, None).unwrap();

        let seg_prefix = Key::default().push(FRAMEWORK_PREFIX).push("users").push("seg");
        assert!(kv.list(ListSelector::Prefix(seg_prefix), ListOptions::default()).unwrap().is_empty());
        assert_eq!(users.get("u1").unwrap().unwrap().value.team, "eng");
    }

    #[test]
    fn insert_runs_validate() {
        let users = collection();
        let user = User { email: String::new(), team: "eng".into(), age: 30 };
        assert!(users.insert_with_id("u1".into(), user).is_err());
    }

    #[test]
    fn find_by_primary_and_secondary() {
        let users = collection();
        users
            .insert_with_id("u1".into(), User { email: "a@x.com".into(), team: "eng".into(), age: 30 })
            .unwrap();
        users
            .insert_with_id("u2".into(), User { email: "b@x.com".into(), team: "eng".into(), age: 25 })
            .unwrap();

        let found = users.find_by_primary("email", "a@x.com").unwrap().unwrap();
        assert_eq!(found.id, "u1");

        let mut team = users.find_by_secondary("team", "eng").unwrap();
        team.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(team.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["u1", "u2"]);
    }

    #[test]
    fn overwrite_changes_primary_index_atomically() {
        let users = collection();
        users
            .insert_with_id("u1".into(), User { email: "a@x.com".into(), team: "eng".into(), age: 30 })
            .unwrap();
        let new_value = User { email: "a2@x.com".into(), team: "eng".into(), age: 31 };
        let outcome = users.overwrite_with_id("u1", new_value, None).unwrap();
        assert!(outcome.is_written());

        assert!(users.find_by_primary("email", "a@x.com").unwrap().is_none());
        assert!(users.find_by_primary("email", "a2@x.com").unwrap().is_some());
    }

    #[test]
    fn overwrite_keeps_unchanged_index_entry_without_self_collision() {
        let users = collection();
        users
            .insert_with_id("u1".into(), User { email: "a@x.com".into(), team: "eng".into(), age: 30 })
            .unwrap();
        let new_value = User { email: "a@x.com".into(), team: "eng".into(), age: 31 };
        let outcome = users.overwrite_with_id("u1", new_value, None).unwrap();
        assert!(outcome.is_written());
        assert_eq!(users.find_by_primary("email", "a@x.com").unwrap().unwrap().id, "u1");
    }

    #[test]
    fn overwrite_rejects_stale_expected_versionstamp() {
        let users = collection();
        let doc = users
            .insert_with_id("u1".into(), User { email: "a@x.com".into(), team: "eng".into(), age: 30 })
            .unwrap();
        let stale = match doc {
            WriteOutcome::Written(d) => d.versionstamp,
            WriteOutcome::Conflict => panic!("expected a write"),
        };
        users
            .overwrite_with_id("u1", User { email: "a@x.com".into(), team: "eng".into(), age: 31 }, None)
            .unwrap();
        let outcome = users
            .overwrite_with_id("u1", User { email: "a@x.com".into(), team: "eng".into(), age: 32 }, Some(stale))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);
    }

    #[test]
    fn update_deep_merges_and_reindexes() {
        let users = collection();
        users
            .insert_with_id("u1".into(), User { email: "a@x.com".into(), team: "eng".into(), age: 30 })
            .unwrap();
        let outcome = users.update_with_id("u1", serde_json::json!({"team": "sales"}), None).unwrap();
        match outcome {
            WriteOutcome::Written(doc) => assert_eq!(doc.value.team, "sales"),
            WriteOutcome::Conflict => panic!("expected a write"),
        }
        assert!(users.find_by_secondary("team", "eng").unwrap().is_empty());
        assert_eq!(users.find_by_secondary("team", "sales").unwrap().len(), 1);
    }

    #[test]
    fn update_missing_id_is_not_found() {
        let users = collection();
        let err = users.update_with_id("missing", serde_json::json!({}), None).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn delete_removes_id_and_index_entries() {
        let users = collection();
        users
            .insert_with_id("u1".into(), User { email: "a@x.com".into(), team: "eng".into(), age: 30 })
            .unwrap();
        assert!(users.delete("u1").unwrap());
        assert!(users.get("u1").unwrap().is_none());
        assert!(users.find_by_primary("email", "a@x.com").unwrap().is_none());
        assert!(users.find_by_secondary("team", "eng").unwrap().is_empty());
    }

    #[test]
    fn delete_missing_id_returns_false() {
        let users = collection();
        assert!(!users.delete("missing").unwrap());
    }

    #[test]
    fn list_and_count() {
        let users = collection();
        for (id, email) in [("u1", "a@x.com"), ("u2", "b@x.com"), ("u3", "c@x.com")] {
            users.insert_with_id(id.into(), User { email: email.into(), team: "eng".into(), age: 30 }).unwrap();
        }
        assert_eq!(users.count(ListOptions::default(), None).unwrap(), 3);
        assert_eq!(users.list(ListOptions::default(), None).unwrap().len(), 3);
        let page = users.list(ListOptions { limit: Some(2), ..Default::default() }, None).unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn filter_is_applied_after_decoding_and_after_the_kv_level_limit() {
        let users = collection();
        for (id, email, age) in [("u1", "a@x.com", 20), ("u2", "b@x.com", 40), ("u3", "c@x.com", 60)] {
            users.insert_with_id(id.into(), User { email: email.into(), team: "eng".into(), age }).unwrap();
        }
        let over_30: &dyn Fn(&User) -> bool = &|u| u.age > 30;

        let filtered = users.list(ListOptions::default(), Some(over_30)).unwrap();
        assert_eq!(filtered.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["u2", "u3"]);
        assert_eq!(users.count(ListOptions::default(), Some(over_30)).unwrap(), 2);

        // A limit of 1 bounds the raw id-entries examined to just "u1",
        // which the filter then rejects outright — fewer than `limit`
        // results is correct, not a bug.
        let limited = users.list(ListOptions { limit: Some(1), ..Default::default() }, Some(over_30)).unwrap();
        assert!(limited.is_empty());

        let fetched = users.get_many(&["u1".into(), "u2".into()], Some(over_30)).unwrap();
        assert!(fetched[0].is_none());
        assert!(fetched[1].is_some());

        let updates =
            users.update_many(vec![("u1".into(), serde_json::json!({"age": 99}))], Some(over_30)).unwrap();
        assert_eq!(updates, vec![WriteOutcome::Conflict]);
        assert_eq!(users.get("u1").unwrap().unwrap().value.age, 20);

        let deleted = users.delete_many(&["u1".into(), "u2".into(), "u3".into()], Some(over_30)).unwrap();
        assert_eq!(deleted, 2);
        assert!(users.get("u1").unwrap().is_some());
        assert!(users.get("u2").unwrap().is_none());
    }

    #[test]
    fn history_records_every_write_in_commit_order() {
        let users = collection();
        users
            .insert_with_id("u1".into(), User { email: "a@x.com".into(), team: "eng".into(), age: 30 })
            .unwrap();
        users.update_with_id("u1", serde_json::json!({"age": 31}), None).unwrap();
        users.delete("u1").unwrap();

        let history = users.history("u1").unwrap();
        let ops: Vec<_> = history.iter().map(|(_, r)| r.op.clone()).collect();
        assert_eq!(ops, vec![HistoryOp::Insert, HistoryOp::Update, HistoryOp::Delete]);
        for pair in history.windows(2) {
            assert!(pair[0].0 < pair[1].0);
            assert!(pair[0].1.timestamp <= pair[1].1.timestamp);
        }
    }

    #[tokio::test]
    async fn listen_queue_records_undelivered_after_max_attempts() {
        let users = collection();
        users.enqueue(b"payload".to_vec(), None).unwrap();

        let calls = std::cell::Cell::new(0);
        users
            .listen_queue(
                2,
                || calls.get() < 2,
                |_msg| {
                    calls.set(calls.get() + 1);
                    Err(Error::Validation("handler always fails".into()))
                },
            )
            .await
            .unwrap();

        let undelivered = users.find_undelivered().unwrap();
        assert_eq!(undelivered.len(), 1);
        assert_eq!(undelivered[0].message.value, b"payload");
    }

    #[test]
    fn collections_sharing_a_backend_do_not_steal_each_others_queue_messages() {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let users: Collection<User> = Collection::new(Arc::clone(&kv), &["users"]);
        let orders: Collection<User> = Collection::new(Arc::clone(&kv), &["orders"]);

        users.enqueue(b"user-event".to_vec(), None).unwrap();
        orders.enqueue(b"order-event".to_vec(), None).unwrap();

        assert_eq!(kv.dequeue(&orders.topic()).unwrap().unwrap().value, b"order-event");
        assert!(kv.dequeue(&orders.topic()).unwrap().is_none());
        assert_eq!(kv.dequeue(&users.topic()).unwrap().unwrap().value, b"user-event");
    }

    #[test]
    fn add_many_and_delete_many() {
        let users = collection();
        let outcomes = users
            .add_many(vec![
                User { email: "a@x.com".into(), team: "eng".into(), age: 30 },
                User { email: "b@x.com".into(), team: "eng".into(), age: 25 },
            ])
            .unwrap();
        let ids: Vec<String> = outcomes
            .into_iter()
            .map(|o| match o {
                WriteOutcome::Written(doc) => doc.id,
                WriteOutcome::Conflict => panic!("expected a write"),
            })
            .collect();
        assert_eq!(users.count(ListOptions::default(), None).unwrap(), 2);
        assert_eq!(users.delete_many(&ids, None).unwrap(), 2);
        assert_eq!(users.count(ListOptions::default(), None).unwrap(), 0);
    }
}
