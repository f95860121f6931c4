// ── RemoteEnumerator – tree listing + size manifest ──────────────────────────

use bundlepull_core::config::TransferConfig;
use bundlepull_core::error::TransferResult;
use bundlepull_core::transport::Transport;
use bundlepull_core::types::{join_remote, RemoteFileStat, RemoteTree};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;

/// Builds the transfer manifest for a remote root: one listing call, then
/// sizes via batched stats with a per-path fallback when a whole batch call
/// fails.
pub struct RemoteEnumerator {
    transport: Arc<dyn Transport>,
    config: TransferConfig,
}

impl RemoteEnumerator {
    pub fn new(transport: Arc<dyn Transport>, config: TransferConfig) -> Self {
        Self { transport, config }
    }

    /// Enumerate `root` into a [`RemoteTree`].
    ///
    /// Listed entries whose stat comes back missing or as a directory stay
    /// in the raw file list but are dropped from the size manifest — the
    /// listing and the stat snapshot are taken at different times and are
    /// allowed to disagree.
    pub async fn enumerate(&self, root: &str) -> TransferResult<RemoteTree> {
        let listing = self.transport.list_tree(root).await?;
        debug!(
            "Enumerating '{}': {} files, {} dirs listed",
            root,
            listing.files.len(),
            listing.dirs.len()
        );

        let mut files = HashMap::new();
        for batch in listing.files.chunks(self.config.batch_stat_size.max(1)) {
            let paths: Vec<String> = batch.iter().map(|rel| join_remote(root, rel)).collect();
            let stats = match self.transport.batch_stat(&paths).await {
                Ok(stats) => stats,
                Err(err) if err.is_transport_loss() => return Err(err),
                Err(err) => {
                    // One batch failing must not cost us the batches that
                    // already succeeded; resolve just this one path by path.
                    debug!("Batch stat failed, falling back to per-path stats: {}", err);
                    self.stat_batch_individually(&paths).await?
                }
            };
            for (rel, path) in batch.iter().zip(&paths) {
                if let Some(stat) = stats.get(path) {
                    if stat.is_transferable() {
                        files.insert(rel.clone(), stat.size);
                    }
                }
            }
        }

        let tree = RemoteTree {
            directories: listing.dirs,
            listed_files: listing.files,
            files,
        };
        info!(
            "Enumerated '{}': {} transferable files, {} bytes",
            root,
            tree.files.len(),
            tree.total_bytes()
        );
        Ok(tree)
    }

    /// Fallback for one failed batch. Stat errors here are real errors,
    /// transport loss included, and propagate.
    async fn stat_batch_individually(
        &self,
        paths: &[String],
    ) -> TransferResult<HashMap<String, RemoteFileStat>> {
        let mut stats = HashMap::with_capacity(paths.len());
        for path in paths {
            let stat = self.transport.stat(path).await?;
            stats.insert(path.clone(), stat);
        }
        Ok(stats)
    }
}
