//! Change notification for a fixed set of keys.
//!
//! Watching is exact-key, not prefix-based (spec's Non-goals exclude
//! range/full-text secondary indexes; the same equality-only stance applies
//! here). A commit that writes a watched key broadcasts it to every open
//! `WatchStream`, including ones opened by the writer itself.

use std::collections::HashSet;

use crate::key::Key;
use crate::kv::Entry;

pub(crate) type WatchEvent = (Key, Option<Entry>);

/// A handle returned by `Kv::watch`. Call `next().await` in a loop to
/// receive `(key, Some(entry))` on write or `(key, None)` on delete for any
/// of the keys passed to `watch`.
pub struct WatchStream {
    keys: HashSet<Vec<u8>>,
    rx: tokio::sync::broadcast::Receiver<WatchEvent>,
}

impl WatchStream {
    pub(crate) fn new(keys: Vec<Key>, rx: tokio::sync::broadcast::Receiver<WatchEvent>) -> Self {
        WatchStream { keys: keys.iter().map(Key::encode).collect(), rx }
    }

    /// Waits for the next change to any watched key. Returns `None` once
    /// the backend that created this stream has been dropped.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok((key, entry)) if self.keys.contains(&key.encode()) => return Some((key, entry)),
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
