//! Transport capability trait.
//!
//! Everything the transfer pipeline needs from a remote endpoint, whether the
//! bytes travel over agent RPC or SSH/SFTP. Higher layers are written against
//! this trait only; swapping transports mid-operation is the fallback
//! controller's job, never the pipeline's.

use crate::error::TransferResult;
use crate::types::{RemoteFileStat, RemoteListing};
use async_trait::async_trait;
use std::collections::HashMap;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short tag for logs and reports ("rpc", "sftp").
    fn name(&self) -> &'static str;

    /// List the tree under `root` once. Directories come back before their
    /// contents; all paths are relative to `root`.
    async fn list_tree(&self, root: &str) -> TransferResult<RemoteListing>;

    /// Stat one remote path. A missing path is a successful
    /// `exists == false` result, not an error.
    async fn stat(&self, path: &str) -> TransferResult<RemoteFileStat>;

    /// Stat a batch of absolute paths in one round trip, keyed by path.
    ///
    /// May fail as a unit with `BatchStatFailed`; callers then retry the
    /// same batch path by path through [`stat`](Transport::stat).
    async fn batch_stat(&self, paths: &[String])
        -> TransferResult<HashMap<String, RemoteFileStat>>;

    /// Read up to `size` bytes at `offset`. A short or empty buffer means the
    /// remote had nothing more to give at that offset — callers treat it as
    /// end of stream rather than retrying.
    async fn read_chunk(&self, path: &str, offset: u64, size: usize) -> TransferResult<Vec<u8>>;

    /// Delete a remote file. Used for best-effort cleanup of temporaries.
    async fn remove(&self, path: &str) -> TransferResult<()>;
}
