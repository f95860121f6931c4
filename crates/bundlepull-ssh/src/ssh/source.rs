// ── SftpTransport – Transport impl backed by an SshSession ───────────────────

use crate::ssh::service::SshSession;
use crate::ssh::types::SshConfig;
use bundlepull_core::error::{TransferError, TransferResult};
use bundlepull_core::transport::Transport;
use bundlepull_core::types::{RemoteFileStat, RemoteListing};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

fn join_failed(err: tokio::task::JoinError) -> TransferError {
    TransferError::io_error(format!("Blocking SFTP task failed: {}", err))
}

/// SFTP-backed transport. ssh2 calls are blocking, so every operation hops
/// onto the blocking pool with a cloned session handle.
///
/// There is no batched stat in the SFTP protocol; `batch_stat` is answered
/// from the stats collected during the last `list_tree` walk and falls back
/// to individual stat calls for paths the walk never saw.
pub struct SftpTransport {
    session: Arc<SshSession>,
    walk_stats: Mutex<HashMap<String, RemoteFileStat>>,
}

impl SftpTransport {
    pub fn new(session: SshSession) -> Self {
        Self {
            session: Arc::new(session),
            walk_stats: Mutex::new(HashMap::new()),
        }
    }

    /// Connect a fresh SSH session and wrap it.
    pub async fn connect(config: SshConfig) -> TransferResult<Self> {
        let session = tokio::task::spawn_blocking(move || SshSession::connect(config))
            .await
            .map_err(join_failed)??;
        Ok(Self::new(session))
    }

    pub fn session(&self) -> &Arc<SshSession> {
        &self.session
    }
}

#[async_trait]
impl Transport for SftpTransport {
    fn name(&self) -> &'static str {
        "sftp"
    }

    async fn list_tree(&self, root: &str) -> TransferResult<RemoteListing> {
        let session = self.session.clone();
        let root = root.to_string();
        let (listing, stats) = tokio::task::spawn_blocking(move || session.walk(&root))
            .await
            .map_err(join_failed)??;
        if let Ok(mut cache) = self.walk_stats.lock() {
            cache.extend(stats);
        }
        Ok(listing)
    }

    async fn stat(&self, path: &str) -> TransferResult<RemoteFileStat> {
        let session = self.session.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || session.stat(&path))
            .await
            .map_err(join_failed)?
    }

    async fn batch_stat(
        &self,
        paths: &[String],
    ) -> TransferResult<HashMap<String, RemoteFileStat>> {
        let mut out = HashMap::new();
        let mut misses = Vec::new();
        if let Ok(cache) = self.walk_stats.lock() {
            for path in paths {
                match cache.get(path) {
                    Some(stat) => {
                        out.insert(path.clone(), stat.clone());
                    }
                    None => misses.push(path.clone()),
                }
            }
        } else {
            misses = paths.to_vec();
        }

        if !misses.is_empty() {
            let session = self.session.clone();
            let stats = tokio::task::spawn_blocking(move || {
                let mut resolved = Vec::with_capacity(misses.len());
                for path in misses {
                    let stat = session.stat(&path)?;
                    resolved.push((path, stat));
                }
                Ok::<_, TransferError>(resolved)
            })
            .await
            .map_err(join_failed)??;
            out.extend(stats);
        }
        Ok(out)
    }

    async fn read_chunk(&self, path: &str, offset: u64, size: usize) -> TransferResult<Vec<u8>> {
        let session = self.session.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || session.read_chunk(&path, offset, size))
            .await
            .map_err(join_failed)?
    }

    async fn remove(&self, path: &str) -> TransferResult<()> {
        let session = self.session.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || session.remove(&path))
            .await
            .map_err(join_failed)?
    }
}
