//! The export/import dump tool: walks a collection's id-entry family,
//! resolving segments transparently, and serializes every document as one
//! line of JSON. Import re-inserts documents through `Collection::write` so
//! indices are rebuilt rather than replayed byte-for-byte.
//!
//! Generic over an unknown `T` isn't possible without a type registry this
//! tool doesn't have, so it reads and writes through `RawDocument`, a
//! `Model` holding an arbitrary `serde_json::Value`. `RawDocument`'s wire
//! representation is a single length-prefixed string (the JSON text),
//! which keeps it self-describing the way `codec::bytes_codec::BytesCodec`
//! encodes values — unlike a `bincode`-derived struct layout, a reader
//! doesn't need to know the original Rust type to decode it. A collection
//! written by application code using its own `T` has its own bincode
//! layout and isn't readable through `RawDocument`; this tool is for
//! collections meant to be dumped and restored by itself.

use std::io::{BufRead, Write};

use serde::de::{Deserializer, Error as DeError};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_derive::{Deserialize as DeriveDeserialize, Serialize as DeriveSerialize};

use typekv::collection::{Collection, Model};
use typekv::db::Database;
use typekv::error::CResult;

#[derive(Clone, Debug, PartialEq)]
pub struct RawDocument(pub serde_json::Value);

impl Serialize for RawDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = serde_json::to_string(&self.0).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }
}

impl<'de> Deserialize<'de> for RawDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let value = serde_json::from_str(&text).map_err(D::Error::custom)?;
        Ok(RawDocument(value))
    }
}

impl Model for RawDocument {}

#[derive(Debug, DeriveSerialize, DeriveDeserialize)]
struct DumpRecord {
    id: String,
    value: serde_json::Value,
}

/// Writes every live document in `collection` to `out` as newline-delimited
/// JSON, oldest-id-first is not guaranteed (`list` has no ordering
/// guarantee beyond key order). Returns the number of documents written.
pub fn export(collection: &Collection<RawDocument>, mut out: impl Write) -> CResult<usize> {
    let documents = collection.list(Default::default(), None)?;
    let count = documents.len();
    for document in documents {
        let record = DumpRecord { id: document.id, value: document.value.0 };
        let line = serde_json::to_string(&record)?;
        writeln!(out, "{line}")?;
    }
    Ok(count)
}

/// Reads newline-delimited JSON dump records from `input` and upserts each
/// one into `collection` via `write` (insert-or-overwrite, never
/// `Conflict`ing on an id that's merely being restored). Returns the number
/// of documents written.
pub fn import(collection: &Collection<RawDocument>, input: impl BufRead) -> CResult<usize> {
    let mut count = 0;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: DumpRecord = serde_json::from_str(&line)?;
        collection.write(record.id, RawDocument(record.value))?;
        count += 1;
    }
    Ok(count)
}

pub fn open_collection(db: &Database, path: &[&str]) -> Collection<RawDocument> {
    db.collection(path)
}
