//! # bundlepull
//!
//! Resilient multi-transport bundle transfer: pulls a remote directory tree
//! and individual remote files over either an RPC channel into an attached
//! instrumentation agent or an SSH/SFTP session, with bounded parallel
//! workers, shared progress/ETA tracking, and automatic transport fallback
//! when the agent dies mid-transfer.
//!
//! The entry point is [`FallbackController`]: hand it the agent and device
//! collaborators (and optionally an SSH fallback) and drive `enumerate`,
//! `download_tree`, `download_file` or `pull_bundle` against it. The SSH
//! side also exposes [`SshTunnel`] for surfacing a remote control port on
//! localhost.

pub mod fallback;
pub mod rpc;
pub mod transfer;

pub use bundlepull_core::{
    format_bytes, format_duration, ConsoleProgress, ProgressSink, ProgressSnapshot,
    ProgressTracker, Transport, TransferConfig, TransferError, TransferErrorKind, TransferResult,
};
pub use bundlepull_core::types::{
    BundleReport, FileFailure, FileOutcome, RemoteFileStat, RemoteListing, RemoteTree,
    TransferReport, TransferUnit,
};
pub use bundlepull_ssh::ssh::{SftpTransport, SshConfig, SshSession, SshTunnel};

pub use fallback::{FallbackController, SshFallback, TransportState, TRANSFER_PROCESS_CANDIDATES};
pub use rpc::{AgentRpc, DeviceControl, DumpResult, ProcessInfo, RpcTransport};
pub use transfer::{ChunkedFileTransfer, ParallelTransferScheduler, RemoteEnumerator};
