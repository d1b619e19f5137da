//! Large-value segmentation: a value whose encoded form exceeds
//! `SEGMENT_THRESHOLD` is split into fixed-size chunks stored under `seg`
//! keys, found and reassembled by id. A value under the threshold is
//! carried inline in the id entry itself — no `seg` keys at all — so an
//! ordinary small document costs exactly one entry, not two.

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Chunk size chosen well under common backend per-entry value limits.
pub const SEGMENT_THRESHOLD: usize = 60_000;

/// Which encoder produced the bytes stored in a document's segments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodingTag {
    /// `codec::bytes_codec::BytesCodec` (bincode, the in-process default).
    Structured,
    /// `codec::json_codec::JsonCodec` (utf8 text, portable across backends
    /// that reject arbitrary binary values). No writer currently chooses
    /// this; decoding exists so a document written by such a backend
    /// reads correctly.
    Json,
}

/// The payload stored at a document's `id` key. `Inline` carries the
/// encoded value directly — the common case, one entry per document.
/// `Segmented` is a descriptor only: the bytes live under this id's `seg`
/// keys, ordinals `0..segment_count-1` (I5).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IdEntryPayload {
    Inline { encoding: EncodingTag, value: Vec<u8> },
    Segmented { encoding: EncodingTag, segment_count: u32 },
}

/// Splits `bytes` into `SEGMENT_THRESHOLD`-sized chunks. Only called once
/// `bytes.len()` is already known to exceed the threshold, so this never
/// needs to represent "zero segments" — a value small enough for that stays
/// `Inline` instead.
pub fn chunk(bytes: &[u8]) -> Vec<Vec<u8>> {
    bytes.chunks(SEGMENT_THRESHOLD).map(|c| c.to_vec()).collect()
}

/// Reassembles segments in ordinal order. Errors if any ordinal `0..count`
/// is missing (I5 violation — should never happen if writes went through
/// `Collection`, but a caller reading a foreign database shouldn't panic).
pub fn reassemble(segments: Vec<Option<Vec<u8>>>) -> CResult<Vec<u8>> {
    let mut out = Vec::new();
    for (ordinal, segment) in segments.into_iter().enumerate() {
        match segment {
            Some(bytes) => out.extend(bytes),
            None => return Err(Error::Backend(format!("missing segment ordinal {ordinal}"))),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_at_threshold() {
        let bytes = vec![7u8; SEGMENT_THRESHOLD * 2 + 10];
        let chunks = chunk(&bytes);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), SEGMENT_THRESHOLD);
        assert_eq!(chunks[2].len(), 10);
    }

    #[test]
    fn reassemble_round_trips_chunking() {
        let bytes = vec![3u8; SEGMENT_THRESHOLD + 1];
        let chunks = chunk(&bytes);
        let segments = chunks.into_iter().map(Some).collect();
        assert_eq!(reassemble(segments).unwrap(), bytes);
    }

    #[test]
    fn reassemble_errors_on_missing_ordinal() {
        let segments = vec![Some(vec![1]), None, Some(vec![2])];
        assert!(reassemble(segments).is_err());
    }
}
