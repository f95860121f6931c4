// ── FallbackController – transport selection, loss recovery, retry ───────────

use crate::rpc::{AgentRpc, DeviceControl, DumpResult, RpcTransport};
use crate::transfer::{ChunkedFileTransfer, ParallelTransferScheduler, RemoteEnumerator};
use bundlepull_core::checksum;
use bundlepull_core::config::TransferConfig;
use bundlepull_core::error::{TransferError, TransferResult};
use bundlepull_core::progress::{ProgressSink, ProgressTracker};
use bundlepull_core::transport::Transport;
use bundlepull_core::types::{BundleReport, FileOutcome, RemoteTree, TransferReport};
use bundlepull_ssh::ssh::{SftpTransport, SshConfig};
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Stable system processes the agent can be re-targeted to when the original
/// target dies, tried in order. Long-lived daemons first.
pub const TRANSFER_PROCESS_CANDIDATES: [&str; 4] =
    ["SpringBoard", "backboardd", "launchd", "installd"];

/// Where the controller currently sources its transport from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Agent RPC against the originally attached (or re-targeted) process.
    Primary,
    /// Transport lost; re-targeting the agent to a stable process.
    Switching,
    /// Running over SSH/SFTP.
    SshFallback,
    /// No viable transport left. Terminal for this controller.
    Failed,
}

/// How the controller obtains its SSH fallback transport.
///
/// The dominant caller already holds a connected SSH session (the RPC port
/// is usually reached through a tunnel over it), so handing over a ready
/// transport avoids a second handshake. Lazy connection from a config is
/// for callers that only want SSH touched if the agent actually dies.
pub enum SshFallback {
    /// Connect with this config when fallback is first needed.
    Config(SshConfig),
    /// Use an already-connected transport.
    Transport(Arc<dyn Transport>),
}

struct ControllerState {
    state: TransportState,
    ssh_transport: Option<Arc<dyn Transport>>,
}

/// Drives every transfer operation against the currently viable transport.
///
/// Operations run whole: when the agent transport dies mid-operation the
/// controller repairs or replaces the transport and then retries the entire
/// operation, never just the failed call — RPC and SFTP enumerations build
/// independent manifests that must not be mixed within one report.
pub struct FallbackController {
    agent: Arc<dyn AgentRpc>,
    device: Arc<dyn DeviceControl>,
    ssh: Option<SshFallback>,
    config: TransferConfig,
    inner: Mutex<ControllerState>,
}

impl std::fmt::Debug for FallbackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FallbackController {
    pub fn new(
        agent: Arc<dyn AgentRpc>,
        device: Arc<dyn DeviceControl>,
        ssh: Option<SshFallback>,
        config: TransferConfig,
    ) -> TransferResult<Self> {
        config.validate()?;
        Ok(Self {
            agent,
            device,
            ssh,
            config,
            inner: Mutex::new(ControllerState {
                state: TransportState::Primary,
                ssh_transport: None,
            }),
        })
    }

    pub async fn state(&self) -> TransportState {
        self.inner.lock().await.state
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    // ── Facade operations ────────────────────────────────────────────────────

    /// Enumerate the tree under `root` into a manifest plus its total byte
    /// count.
    pub async fn enumerate(&self, root: &str) -> TransferResult<(RemoteTree, u64)> {
        let root = root.to_string();
        let config = self.config.clone();
        self.run_op(move |transport| {
            Box::pin(enumerate_once(transport, root.clone(), config.clone()))
        })
        .await
    }

    /// Download the whole tree under `root` into `local_dir`.
    pub async fn download_tree(
        &self,
        root: &str,
        local_dir: &Path,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> TransferResult<TransferReport> {
        let root = root.to_string();
        let local_dir = local_dir.to_path_buf();
        let config = self.config.clone();
        self.run_op(move |transport| {
            Box::pin(download_tree_once(
                transport,
                root.clone(),
                local_dir.clone(),
                config.clone(),
                sink.clone(),
            ))
        })
        .await
    }

    /// Download one remote file, checksumming the local result.
    pub async fn download_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> TransferResult<FileOutcome> {
        let remote_path = remote_path.to_string();
        let local_path = local_path.to_path_buf();
        let config = self.config.clone();
        self.run_op(move |transport| {
            Box::pin(download_file_once(
                transport,
                remote_path.clone(),
                local_path.clone(),
                config.clone(),
                sink.clone(),
            ))
        })
        .await
    }

    /// Download a bundle tree plus one auxiliary artifact under a single
    /// progress total, then best-effort delete the remote artifact.
    pub async fn pull_bundle(
        &self,
        root: &str,
        artifact: &str,
        local_dir: &Path,
        local_artifact: &Path,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> TransferResult<BundleReport> {
        let root = root.to_string();
        let artifact = artifact.to_string();
        let local_dir = local_dir.to_path_buf();
        let local_artifact = local_artifact.to_path_buf();
        let config = self.config.clone();
        self.run_op(move |transport| {
            Box::pin(pull_bundle_once(
                transport,
                root.clone(),
                artifact.clone(),
                local_dir.clone(),
                local_artifact.clone(),
                config.clone(),
                sink.clone(),
            ))
        })
        .await
    }

    /// Have the agent dump the decrypted main executable on the device.
    ///
    /// Agent-only: the dump runs inside the attached target process, so
    /// there is no SFTP equivalent and no re-targeted process that could
    /// produce it. Transport loss here is surfaced, not recovered.
    pub async fn dump_executable(&self, out_path: &str) -> TransferResult<DumpResult> {
        self.agent.dump_decrypted_executable(out_path).await
    }

    // ── Transport selection ──────────────────────────────────────────────────

    /// Run `op` on the active transport, resolving transport loss between
    /// attempts. The resolution budget caps retries at one SSH fallback plus
    /// one re-target per candidate so a run can never loop forever.
    async fn run_op<T, F>(&self, op: F) -> TransferResult<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn Transport>) -> BoxFuture<'static, TransferResult<T>>,
    {
        let mut resolutions_left = 1 + TRANSFER_PROCESS_CANDIDATES.len();
        loop {
            let transport = self.active_transport().await?;
            match op(transport).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transport_loss() => {
                    if resolutions_left == 0 {
                        error!("Transport loss budget exhausted; giving up");
                        self.inner.lock().await.state = TransportState::Failed;
                        return Err(failed_error());
                    }
                    resolutions_left -= 1;
                    self.resolve_transport_loss(&err).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn active_transport(&self) -> TransferResult<Arc<dyn Transport>> {
        let inner = self.inner.lock().await;
        match inner.state {
            TransportState::Failed => Err(failed_error()),
            TransportState::SshFallback => {
                inner.ssh_transport.clone().ok_or_else(failed_error)
            }
            TransportState::Primary | TransportState::Switching => {
                Ok(Arc::new(RpcTransport::new(self.agent.clone())))
            }
        }
    }

    /// Repair or replace the transport after a loss. SSH takes precedence
    /// when configured; otherwise the agent is re-targeted to a stable
    /// process. A loss on the SSH transport itself is terminal.
    async fn resolve_transport_loss(&self, cause: &TransferError) -> TransferResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            TransportState::Failed => Err(failed_error()),
            TransportState::SshFallback => {
                error!("SSH transport lost: {}", cause.message);
                inner.state = TransportState::Failed;
                Err(failed_error())
            }
            TransportState::Primary | TransportState::Switching => {
                warn!("Agent transport lost: {}", cause.message);
                match self.ssh.as_ref() {
                    Some(SshFallback::Transport(transport)) => {
                        info!("Falling back to the connected SSH transport");
                        inner.ssh_transport = Some(transport.clone());
                        inner.state = TransportState::SshFallback;
                        Ok(())
                    }
                    Some(SshFallback::Config(config)) => {
                        info!("Connecting SSH fallback to {}", config.addr());
                        inner.state = TransportState::SshFallback;
                        match SftpTransport::connect(config.clone()).await {
                            Ok(transport) => {
                                inner.ssh_transport = Some(Arc::new(transport));
                                Ok(())
                            }
                            Err(err) => {
                                error!("SSH fallback connection failed: {}", err);
                                inner.state = TransportState::Failed;
                                Err(failed_error())
                            }
                        }
                    }
                    None => {
                        inner.state = TransportState::Switching;
                        self.switch_to_transfer_process(&mut inner).await
                    }
                }
            }
        }
    }

    /// Re-target the agent to the first stable candidate process whose pid
    /// differs from the current attachment. One attach attempt; failure is
    /// terminal.
    async fn switch_to_transfer_process(&self, inner: &mut ControllerState) -> TransferResult<()> {
        let processes = match self.device.list_processes().await {
            Ok(list) => list,
            Err(err) => {
                error!("Process list unavailable during fallback: {}", err);
                inner.state = TransportState::Failed;
                return Err(failed_error());
            }
        };
        let attached = self.device.attached_pid();
        let target = TRANSFER_PROCESS_CANDIDATES.iter().find_map(|name| {
            processes
                .iter()
                .find(|process| process.name == *name && Some(process.pid) != attached)
        });
        let target = match target {
            Some(process) => process,
            None => {
                error!("No stable process available to re-target the agent");
                inner.state = TransportState::Failed;
                return Err(failed_error());
            }
        };

        info!("Re-targeting agent to {} (pid {})", target.name, target.pid);
        if let Err(err) = self.device.detach().await {
            debug!("Detach from dead target failed: {}", err.message);
        }
        match self.device.attach(target.pid).await {
            Ok(()) => {
                inner.state = TransportState::Primary;
                Ok(())
            }
            Err(err) => {
                error!("Attach to {} failed: {}", target.name, err.message);
                inner.state = TransportState::Failed;
                Err(failed_error())
            }
        }
    }
}

fn failed_error() -> TransferError {
    TransferError::no_viable_transport(
        "Agent transport lost and no fallback succeeded. Retry without resuming \
         the target process, or configure SSH for SFTP fallback.",
    )
}

// ── Per-attempt operation bodies ─────────────────────────────────────────────
//
// Each takes owned parameters so run_op can retry it on a fresh transport.

async fn enumerate_once(
    transport: Arc<dyn Transport>,
    root: String,
    config: TransferConfig,
) -> TransferResult<(RemoteTree, u64)> {
    let enumerator = RemoteEnumerator::new(transport, config);
    let tree = enumerator.enumerate(&root).await?;
    let total = tree.total_bytes();
    Ok((tree, total))
}

async fn download_tree_once(
    transport: Arc<dyn Transport>,
    root: String,
    local_dir: PathBuf,
    config: TransferConfig,
    sink: Option<Arc<dyn ProgressSink>>,
) -> TransferResult<TransferReport> {
    let enumerator = RemoteEnumerator::new(transport.clone(), config.clone());
    let tree = enumerator.enumerate(&root).await?;
    ParallelTransferScheduler::prepare_directories(&tree, &local_dir).await?;
    let (units, rejected) = ParallelTransferScheduler::plan(&tree, &root, &local_dir);

    let progress = sink.map(|sink| {
        Arc::new(ProgressTracker::new(
            "Downloading",
            tree.total_bytes(),
            sink,
        ))
    });
    let scheduler = ParallelTransferScheduler::new(transport, config);
    let mut report = scheduler.run(units, progress.clone()).await?;
    if let Some(tracker) = progress {
        tracker.finish();
    }
    report.total_files += rejected.len();
    report.failed.extend(rejected);
    Ok(report)
}

async fn download_file_once(
    transport: Arc<dyn Transport>,
    remote_path: String,
    local_path: PathBuf,
    config: TransferConfig,
    sink: Option<Arc<dyn ProgressSink>>,
) -> TransferResult<FileOutcome> {
    let stat = transport.stat(&remote_path).await?;
    if !stat.exists {
        return Err(TransferError::not_found(remote_path));
    }
    if stat.is_directory {
        return Err(TransferError::is_directory(remote_path));
    }

    let progress = sink.map(|sink| ProgressTracker::new("Downloading", stat.size, sink));
    let copier = ChunkedFileTransfer::new(transport, config.chunk_size);
    let mut outcome = copier
        .download(&remote_path, &local_path, Some(stat.size), progress.as_ref())
        .await?;
    if let Some(tracker) = progress {
        tracker.finish();
    }
    outcome.checksum = Some(local_checksum(&local_path).await?);
    Ok(outcome)
}

async fn pull_bundle_once(
    transport: Arc<dyn Transport>,
    root: String,
    artifact: String,
    local_dir: PathBuf,
    local_artifact: PathBuf,
    config: TransferConfig,
    sink: Option<Arc<dyn ProgressSink>>,
) -> TransferResult<BundleReport> {
    let enumerator = RemoteEnumerator::new(transport.clone(), config.clone());
    let tree = enumerator.enumerate(&root).await?;

    let artifact_stat = transport.stat(&artifact).await?;
    if !artifact_stat.exists {
        return Err(TransferError::not_found(artifact));
    }
    if artifact_stat.is_directory {
        return Err(TransferError::is_directory(artifact));
    }

    ParallelTransferScheduler::prepare_directories(&tree, &local_dir).await?;
    let (units, rejected) = ParallelTransferScheduler::plan(&tree, &root, &local_dir);

    // One progress total for the tree and the artifact together.
    let progress = sink.map(|sink| {
        Arc::new(ProgressTracker::new(
            "Downloading",
            tree.total_bytes() + artifact_stat.size,
            sink,
        ))
    });

    let scheduler = ParallelTransferScheduler::new(transport.clone(), config.clone());
    let mut report = scheduler.run(units, progress.clone()).await?;
    report.total_files += rejected.len();
    report.failed.extend(rejected);

    let copier = ChunkedFileTransfer::new(transport.clone(), config.chunk_size);
    let mut artifact_outcome = copier
        .download(
            &artifact,
            &local_artifact,
            Some(artifact_stat.size),
            progress.as_deref(),
        )
        .await?;
    if let Some(tracker) = progress {
        tracker.finish();
    }
    artifact_outcome.checksum = Some(local_checksum(&local_artifact).await?);

    let artifact_removed = match transport.remove(&artifact).await {
        Ok(()) => true,
        Err(err) => {
            debug!("Could not remove remote artifact '{}': {}", artifact, err);
            false
        }
    };

    Ok(BundleReport {
        tree: report,
        artifact: artifact_outcome,
        artifact_removed,
    })
}

async fn local_checksum(path: &Path) -> TransferResult<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        checksum::sha256_file(&path).map_err(TransferError::from)
    })
    .await
    .map_err(|e| TransferError::io_error(format!("Checksum task failed: {}", e)))?
}
