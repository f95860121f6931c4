// ── RpcTransport – Transport impl over the instrumentation agent ─────────────

use crate::rpc::types::{DumpResult, ProcessInfo};
use async_trait::async_trait;
use bundlepull_core::error::{TransferError, TransferResult};
use bundlepull_core::transport::Transport;
use bundlepull_core::types::{RemoteFileStat, RemoteListing};
use std::collections::HashMap;
use std::sync::Arc;

/// RPC surface of the remote instrumentation agent. Each call is one
/// request/response round trip into the attached process. Attaching,
/// spawning and injection live with the collaborator implementing this
/// trait; this subsystem only calls it.
#[async_trait]
pub trait AgentRpc: Send + Sync {
    /// Stat one remote path. A missing path is `exists == false`, not an
    /// error.
    async fn stat(&self, path: &str) -> TransferResult<RemoteFileStat>;

    /// Stat many paths in one round trip, keyed by path. All-or-nothing: a
    /// failed call reports no results for any path in the batch.
    async fn batch_stat(&self, paths: &[String])
        -> TransferResult<HashMap<String, RemoteFileStat>>;

    /// List the tree under `root`; paths come back relative to it, with
    /// directories ahead of their contents.
    async fn list_files(&self, root: &str) -> TransferResult<RemoteListing>;

    /// Read up to `size` bytes at `offset`. Fewer bytes than requested means
    /// end of file.
    async fn read_chunk(&self, path: &str, offset: u64, size: usize) -> TransferResult<Vec<u8>>;

    /// Remove a remote file. `false` means the agent could not remove it.
    async fn remove_path(&self, path: &str) -> TransferResult<bool>;

    /// Have the agent write the decrypted main executable to `out_path` on
    /// the device.
    async fn dump_decrypted_executable(&self, out_path: &str) -> TransferResult<DumpResult>;
}

/// Device-level process control, used when the RPC transport has to be
/// re-targeted to a stable system process after the original target dies.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn list_processes(&self) -> TransferResult<Vec<ProcessInfo>>;

    /// PID the agent currently sits in, if attached.
    fn attached_pid(&self) -> Option<u32>;

    async fn detach(&self) -> TransferResult<()>;

    /// Attach to `pid`. Single attempt; any retry policy belongs to the
    /// caller.
    async fn attach(&self, pid: u32) -> TransferResult<()>;
}

/// Agent-backed implementation of the transport capability trait.
///
/// Mostly a rename layer, with one normalisation: a failed `batch_stat` that
/// is not a transport loss becomes `BatchStatFailed`, the recoverable kind
/// the enumerator resolves path by path. Transport loss always passes
/// through untouched so the fallback controller sees it.
pub struct RpcTransport {
    agent: Arc<dyn AgentRpc>,
}

impl RpcTransport {
    pub fn new(agent: Arc<dyn AgentRpc>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Transport for RpcTransport {
    fn name(&self) -> &'static str {
        "rpc"
    }

    async fn list_tree(&self, root: &str) -> TransferResult<RemoteListing> {
        self.agent.list_files(root).await
    }

    async fn stat(&self, path: &str) -> TransferResult<RemoteFileStat> {
        self.agent.stat(path).await
    }

    async fn batch_stat(
        &self,
        paths: &[String],
    ) -> TransferResult<HashMap<String, RemoteFileStat>> {
        match self.agent.batch_stat(paths).await {
            Ok(stats) => Ok(stats),
            Err(err) if err.is_transport_loss() => Err(err),
            Err(err) => Err(TransferError::batch_stat_failed(err.message)),
        }
    }

    async fn read_chunk(&self, path: &str, offset: u64, size: usize) -> TransferResult<Vec<u8>> {
        self.agent.read_chunk(path, offset, size).await
    }

    async fn remove(&self, path: &str) -> TransferResult<()> {
        if self.agent.remove_path(path).await? {
            Ok(())
        } else {
            Err(
                TransferError::io_error(format!("Agent could not remove '{}'", path))
                    .with_path(path),
            )
        }
    }
}
