//! Session configuration.
//!
//! Every knob has a default, so an empty TOML file is a valid config.

use crate::delta::{BLOCK_LEN, MAX_COPY_LEN};
use crate::streaming::protocol::{ProtocolVersion, MAX_PAYLOAD_SIZE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default size of data chunks handed to the writer (32KB).
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Default worker count: detected hardware parallelism + 1.
pub fn default_workers() -> usize {
    num_cpus::get() + 1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Concurrent signature/delta/read workers.
    pub workers: usize,

    /// Depth of the worker -> writer queue. 1 makes every hand-off wait
    /// for the writer, which bounds memory to roughly one chunk per worker.
    pub queue_depth: usize,

    /// Maximum payload of a single data chunk.
    pub chunk_size: usize,

    /// Block length used when the receiver computes signatures.
    pub block_len: u32,

    /// Highest protocol version proposed (sender) or accepted (receiver).
    pub max_version: u16,

    /// Remove target entries that are not part of the manifest.
    pub delete_extraneous: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: 1,
            chunk_size: DEFAULT_CHUNK_SIZE,
            block_len: BLOCK_LEN,
            max_version: ProtocolVersion::CURRENT.get(),
            delete_extraneous: true,
        }
    }
}

impl SessionConfig {
    /// Load a TOML config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.queue_depth == 0 {
            anyhow::bail!("queue_depth must be at least 1");
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_PAYLOAD_SIZE as usize {
            anyhow::bail!(
                "chunk_size must be between 1 and {} bytes",
                MAX_PAYLOAD_SIZE
            );
        }
        if self.block_len == 0 || self.block_len > MAX_COPY_LEN {
            anyhow::bail!("block_len must be between 1 and {} bytes", MAX_COPY_LEN);
        }
        if self.max_version == 0 {
            anyhow::bail!("max_version must be at least 1");
        }
        Ok(())
    }

    pub(crate) fn max_version(&self) -> ProtocolVersion {
        ProtocolVersion::new(self.max_version)
    }
}
