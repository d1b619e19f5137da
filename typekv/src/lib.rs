//! `typekv` is a typed, schema-driven document layer over an ordered
//! key-value store. The store supports atomic multi-key commits, optimistic
//! concurrency via per-entry versionstamps, prefix range listing, and an
//! enqueue/dequeue facility; the document layer adds namespaced typed
//! collections, transactional indexing, large-value segmentation, and an
//! atomic builder that composes writes across collections into one commit.
//! [Author fengyang]
//!
//! ## Getting started
//!
//! ```rust
//! use typekv::kv::{Kv, MemoryKv};
//! use typekv::key::Key;
//!
//! fn run() -> typekv::error::CResult<()> {
//!     let kv = MemoryKv::new();
//!     let key = Key::default().push("users").push("1");
//!     kv.set(&key, b"alice".to_vec(), None)?;
//!     let entry = kv.get(&key)?.unwrap();
//!     assert_eq!(entry.value, b"alice");
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod collection;
pub mod db;
pub mod error;
pub mod key;
pub mod kv;
pub mod storage;
