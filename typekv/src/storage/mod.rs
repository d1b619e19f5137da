pub mod log;
pub mod engine;
pub mod log_cask;
pub mod memory;

use serde_derive::{Deserialize, Serialize};
use crate::error::CResult;

/// In-memory index from key to the (offset, length) of its most recent
/// entry on disk. Ordered so it can drive sequential compaction scans.
pub type KeyDir = std::collections::BTreeMap<Vec<u8>, (u64, u32)>;

/// Point-in-time summary of a storage engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage engine.
    pub name: String,

    /// The number of live keys in the engine.
    pub keys: u64,

    /// The logical size of live key/value pairs.
    pub size: u64,

    /// The on-disk size of all data, live and garbage.
    pub total_disk_size: u64,

    /// The on-disk size of live data.
    pub live_disk_size: u64,
    
    /// The on-disk size of garbage data.
    pub garbage_disk_size: u64,
}

/// A scan iterator, with a blanket implementation (in lieu of trait aliases).
pub trait ScanIteratorT: DoubleEndedIterator<Item = CResult<(Vec<u8>, Vec<u8>)>> {}

impl<I: DoubleEndedIterator<Item = CResult<(Vec<u8>, Vec<u8>)>>> ScanIteratorT for I {}
