//! The append-only write/delete log kept per document (I6): every commit
//! that touches a document's `id` entry appends one record here, keyed by
//! that commit's own versionstamp so the log is ordered by commit order
//! without a second counter.

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryOp {
    Insert,
    Overwrite,
    Update,
    Delete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub op: HistoryOp,
    /// Wall-clock time the commit applied, not the versionstamp's logical
    /// order — two records can share a versionstamp-adjacent commit and
    /// still differ here by however long the commit took to apply.
    pub timestamp: DateTime<Utc>,
    /// The value after the operation, or `None` for `Delete`.
    pub snapshot: Option<Value>,
}
