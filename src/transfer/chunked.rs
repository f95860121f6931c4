// ── ChunkedFileTransfer – one remote file, fixed-size reads ──────────────────

use bundlepull_core::error::{TransferError, TransferResult};
use bundlepull_core::progress::ProgressTracker;
use bundlepull_core::transport::Transport;
use bundlepull_core::types::FileOutcome;
use log::warn;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Copies single remote files to local paths in `chunk_size` reads through
/// whatever transport it is handed.
pub struct ChunkedFileTransfer {
    transport: Arc<dyn Transport>,
    chunk_size: usize,
}

impl ChunkedFileTransfer {
    pub fn new(transport: Arc<dyn Transport>, chunk_size: usize) -> Self {
        Self {
            transport,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Download `remote_path` to `local_path`, creating parent directories
    /// as needed. Passing `expected_size` skips the stat round trip when the
    /// caller already enumerated the file.
    ///
    /// A read that comes back short or empty before `expected_size` is
    /// reached ends the copy: the remote can shrink while a transfer runs,
    /// so this is a truncated outcome, not an error. Every written chunk is
    /// reported to the tracker.
    pub async fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        expected_size: Option<u64>,
        progress: Option<&ProgressTracker>,
    ) -> TransferResult<FileOutcome> {
        let size = match expected_size {
            Some(size) => size,
            None => {
                let stat = self.transport.stat(remote_path).await?;
                if !stat.exists {
                    return Err(TransferError::not_found(remote_path));
                }
                if stat.is_directory {
                    return Err(TransferError::is_directory(remote_path));
                }
                stat.size
            }
        };

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TransferError::io_error(format!(
                    "Failed to create '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let mut local = tokio::fs::File::create(local_path).await.map_err(|e| {
            TransferError::io_error(format!(
                "Failed to create local '{}': {}",
                local_path.display(),
                e
            ))
        })?;

        let mut offset: u64 = 0;
        while offset < size {
            let want = (size - offset).min(self.chunk_size as u64) as usize;
            let chunk = self.transport.read_chunk(remote_path, offset, want).await?;
            if chunk.is_empty() {
                break;
            }
            local.write_all(&chunk).await.map_err(|e| {
                TransferError::io_error(format!(
                    "Write error for '{}': {}",
                    local_path.display(),
                    e
                ))
            })?;
            offset += chunk.len() as u64;
            if let Some(tracker) = progress {
                tracker.advance(chunk.len() as u64);
            }
            if chunk.len() < want {
                break;
            }
        }
        local.flush().await.map_err(|e| {
            TransferError::io_error(format!(
                "Flush error for '{}': {}",
                local_path.display(),
                e
            ))
        })?;

        let truncated = offset < size;
        if truncated {
            warn!(
                "Remote file '{}' ended early: {} of {} bytes",
                remote_path, offset, size
            );
        }
        Ok(FileOutcome {
            bytes_written: offset,
            truncated,
            checksum: None,
        })
    }
}
