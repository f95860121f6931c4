// ── Transfer configuration ───────────────────────────────────────────────────

use crate::error::{TransferError, TransferResult};
use serde::{Deserialize, Serialize};

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_chunk_size() -> usize {
    256 * 1024
}
fn default_max_workers() -> usize {
    4
}
fn default_batch_stat_size() -> usize {
    50
}

/// Knobs for one transfer operation. Immutable once the operation starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// Bytes requested per remote read.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Upper bound on concurrent transfer workers. Anything below 2 runs
    /// the whole list sequentially with no pool overhead.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Paths per batched stat call during enumeration.
    #[serde(default = "default_batch_stat_size")]
    pub batch_stat_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_workers: default_max_workers(),
            batch_stat_size: default_batch_stat_size(),
        }
    }
}

impl TransferConfig {
    /// Worker count the scheduler actually uses (a configured 0 behaves
    /// like 1).
    pub fn effective_workers(&self) -> usize {
        self.max_workers.max(1)
    }

    pub fn validate(&self) -> TransferResult<()> {
        if self.chunk_size == 0 {
            return Err(TransferError::invalid_config(
                "chunkSize must be at least 1 byte",
            ));
        }
        if self.batch_stat_size == 0 {
            return Err(TransferError::invalid_config(
                "batchStatSize must be at least 1",
            ));
        }
        Ok(())
    }
}
