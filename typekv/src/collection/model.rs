//! The trait a collection's value type implements: validation plus the
//! index fields that must be kept transactionally consistent.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CResult;
use crate::key::KeyPart;

/// A value stored in a `Collection`.
///
/// `primary_index`/`secondary_index` declare which fields participate in
/// indexing (spec §4.1's primary-unique / secondary-multi distinction): a
/// primary-indexed field may have at most one live document per value
/// (I4); a secondary-indexed field may be shared by any number of live
/// documents, each reachable through its own `si` entry (I3).
pub trait Model: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Rejects a value before it is ever written. The default accepts
    /// everything; override to enforce invariants the type system can't
    /// (non-empty strings, value ranges, cross-field consistency).
    fn validate(&self) -> CResult<()> {
        Ok(())
    }

    /// Primary (unique) index fields: `(field_name, value)`.
    fn primary_index(&self) -> Vec<(&'static str, KeyPart)> {
        Vec::new()
    }

    /// Secondary (non-unique) index fields: `(field_name, value)`.
    fn secondary_index(&self) -> Vec<(&'static str, KeyPart)> {
        Vec::new()
    }
}
