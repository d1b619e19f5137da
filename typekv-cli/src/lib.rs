//! `typekv-cli`: an administrative tool over a `typekv` backend. [Author fengyang]
//!
//! ## Getting started
//!
//! ```doc
//! ❯ typekv-cli --data-dir ./data dump --collection users --output users.ndjson
//! ❯ typekv-cli --data-dir ./data load --collection users --input users.ndjson
//! ❯ typekv-cli --data-dir ./data count
//! ❯ typekv-cli --data-dir ./data wipe
//! ```

pub mod command;
pub mod config;
pub mod dump;
pub mod trace;
