// ── ParallelTransferScheduler – bounded worker pool over one transport ───────

use crate::transfer::chunked::ChunkedFileTransfer;
use bundlepull_core::config::TransferConfig;
use bundlepull_core::error::{TransferError, TransferErrorKind, TransferResult};
use bundlepull_core::progress::ProgressTracker;
use bundlepull_core::transport::Transport;
use bundlepull_core::types::{
    is_safe_relative, join_remote, FileFailure, RemoteTree, TransferReport, TransferUnit,
};
use chrono::Utc;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Runs a list of [`TransferUnit`]s to completion over a single transport,
/// at most `max_workers` at a time.
///
/// Per-file failures are isolated: the unit is recorded and its siblings
/// keep going. Transport loss is different — it ends the run with an error
/// so the caller can switch transports and start the whole operation over
/// (a report must never mix bytes from two transports).
pub struct ParallelTransferScheduler {
    transport: Arc<dyn Transport>,
    config: TransferConfig,
}

/// Tallies shared between workers while a run is in flight.
#[derive(Default)]
struct Outcomes {
    transferred_files: usize,
    transferred_bytes: u64,
    failed: Vec<FileFailure>,
    truncated: Vec<String>,
    transport_lost: Option<TransferError>,
}

impl ParallelTransferScheduler {
    pub fn new(transport: Arc<dyn Transport>, config: TransferConfig) -> Self {
        Self { transport, config }
    }

    /// Turn an enumerated tree into per-file jobs rooted at `local_dir`.
    ///
    /// Listing entries whose relative path could escape `local_dir` never
    /// become units; they come back as failures so the final report still
    /// accounts for them.
    pub fn plan(
        tree: &RemoteTree,
        remote_root: &str,
        local_dir: &Path,
    ) -> (Vec<TransferUnit>, Vec<FileFailure>) {
        let mut units = Vec::new();
        let mut rejected = Vec::new();
        for (rel, size) in tree.transferable() {
            if !is_safe_relative(rel) {
                warn!("Rejecting unsafe remote path '{}'", rel);
                rejected.push(FileFailure {
                    path: rel.to_string(),
                    kind: TransferErrorKind::IoError,
                    message: format!("Unsafe relative path rejected: {}", rel),
                });
                continue;
            }
            units.push(TransferUnit {
                remote_path: join_remote(remote_root, rel),
                relative_path: rel.to_string(),
                local_path: local_dir.join(rel),
                expected_size: size,
            });
        }
        (units, rejected)
    }

    /// Create the local directory skeleton before any worker runs. Parents
    /// are created before children by sorting paths shortest first.
    pub async fn prepare_directories(tree: &RemoteTree, local_dir: &Path) -> TransferResult<()> {
        tokio::fs::create_dir_all(local_dir).await.map_err(|e| {
            TransferError::io_error(format!(
                "Failed to create '{}': {}",
                local_dir.display(),
                e
            ))
        })?;
        let mut dirs: Vec<&String> = tree
            .directories
            .iter()
            .filter(|dir| is_safe_relative(dir))
            .collect();
        dirs.sort_by_key(|dir| dir.len());
        for dir in dirs {
            let path = local_dir.join(dir);
            tokio::fs::create_dir_all(&path).await.map_err(|e| {
                TransferError::io_error(format!("Failed to create '{}': {}", path.display(), e))
            })?;
        }
        Ok(())
    }

    /// Run every unit. Worker counts at or below one skip the pool and run
    /// the list strictly in order.
    pub async fn run(
        &self,
        units: Vec<TransferUnit>,
        progress: Option<Arc<ProgressTracker>>,
    ) -> TransferResult<TransferReport> {
        let operation_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let total_files = units.len();
        let total_bytes: u64 = units.iter().map(|unit| unit.expected_size).sum();
        info!(
            "Transfer {} started: {} files, {} bytes over {}",
            operation_id,
            total_files,
            total_bytes,
            self.transport.name()
        );

        let outcomes = Arc::new(Mutex::new(Outcomes::default()));
        let workers = self.config.effective_workers();

        if workers <= 1 || units.len() <= 1 {
            for unit in units {
                if transport_is_lost(&outcomes) {
                    break;
                }
                run_unit(
                    self.transport.clone(),
                    self.config.chunk_size,
                    unit,
                    progress.clone(),
                    outcomes.clone(),
                )
                .await;
            }
        } else {
            let semaphore = Arc::new(Semaphore::new(workers));
            let mut handles = Vec::with_capacity(units.len());
            for unit in units {
                // Stop dispatching once any worker has lost the transport.
                if transport_is_lost(&outcomes) {
                    break;
                }
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| TransferError::io_error("Worker pool closed unexpectedly"))?;
                let transport = self.transport.clone();
                let chunk_size = self.config.chunk_size;
                let progress = progress.clone();
                let outcomes = outcomes.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    if transport_is_lost(&outcomes) {
                        return;
                    }
                    run_unit(transport, chunk_size, unit, progress, outcomes).await;
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        }

        let mut state = outcomes
            .lock()
            .map_err(|_| TransferError::io_error("Transfer worker panicked"))?;
        if let Some(lost) = state.transport_lost.take() {
            return Err(lost);
        }

        let report = TransferReport {
            operation_id,
            transport: self.transport.name().to_string(),
            total_files,
            transferred_files: state.transferred_files,
            failed: std::mem::take(&mut state.failed),
            truncated: std::mem::take(&mut state.truncated),
            total_bytes,
            transferred_bytes: state.transferred_bytes,
            started_at,
            completed_at: Utc::now(),
        };
        info!(
            "Transfer {} finished: {}/{} files, {} bytes, {} failed, {} truncated",
            report.operation_id,
            report.transferred_files,
            report.total_files,
            report.transferred_bytes,
            report.failed.len(),
            report.truncated.len()
        );
        Ok(report)
    }
}

fn transport_is_lost(outcomes: &Arc<Mutex<Outcomes>>) -> bool {
    outcomes
        .lock()
        .map(|state| state.transport_lost.is_some())
        .unwrap_or(true)
}

async fn run_unit(
    transport: Arc<dyn Transport>,
    chunk_size: usize,
    unit: TransferUnit,
    progress: Option<Arc<ProgressTracker>>,
    outcomes: Arc<Mutex<Outcomes>>,
) {
    let copier = ChunkedFileTransfer::new(transport, chunk_size);
    let result = copier
        .download(
            &unit.remote_path,
            &unit.local_path,
            Some(unit.expected_size),
            progress.as_deref(),
        )
        .await;
    let mut state = match outcomes.lock() {
        Ok(guard) => guard,
        Err(_) => return,
    };
    match result {
        Ok(outcome) => {
            debug!(
                "Transferred '{}' ({} bytes)",
                unit.relative_path, outcome.bytes_written
            );
            state.transferred_files += 1;
            state.transferred_bytes += outcome.bytes_written;
            if outcome.truncated {
                state.truncated.push(unit.relative_path);
            }
        }
        Err(err) if err.is_transport_loss() => {
            warn!(
                "Transport lost while transferring '{}': {}",
                unit.relative_path, err.message
            );
            if state.transport_lost.is_none() {
                state.transport_lost = Some(err);
            }
        }
        Err(err) => {
            warn!("Transfer of '{}' failed: {}", unit.relative_path, err);
            state.failed.push(FileFailure::from_error(unit.relative_path, &err));
        }
    }
}
