//! Layered configuration for `typekv-cli`, loaded with `confy` (the
//! workspace's config-file crate): `ConfigLoad::default()` overridden by
//! whatever `confy::load_path` finds on disk, itself overridden by CLI
//! flags in `main.rs`.

use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigLoad {
    version: u8,

    /// Directory holding the durable `LogCask` engine's data files. `None`
    /// means run against a throwaway in-memory backend instead.
    pub data_dir: Option<String>,

    pub log_level: String,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad { version: 0, data_dir: None, log_level: "info".to_string() }
    }
}

impl ConfigLoad {
    pub fn new(path: &str) -> anyhow::Result<Self> {
        Ok(confy::load_path(path)?)
    }
}
