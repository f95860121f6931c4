// ── Types ─────────────────────────────────────────────────────────────────────

use crate::error::TransferErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ── Remote filesystem snapshots ──────────────────────────────────────────────

/// Stat result for one remote path, as reported by a transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFileStat {
    pub exists: bool,
    pub is_directory: bool,
    pub size: u64,
}

impl RemoteFileStat {
    pub fn file(size: u64) -> Self {
        Self {
            exists: true,
            is_directory: false,
            size,
        }
    }

    pub fn directory() -> Self {
        Self {
            exists: true,
            is_directory: true,
            size: 0,
        }
    }

    pub fn missing() -> Self {
        Self::default()
    }

    /// Entries that belong in a size manifest: present and not a directory.
    pub fn is_transferable(&self) -> bool {
        self.exists && !self.is_directory
    }
}

/// Raw listing of a remote tree. Paths are relative to the listed root;
/// directories appear before their contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteListing {
    pub dirs: Vec<String>,
    pub files: Vec<String>,
}

/// Enumerated remote tree: the raw listing plus the size manifest built from
/// stat results. Listed entries that stat'd as missing or as directories are
/// kept in `listed_files` but absent from `files` — consumers that move bytes
/// must filter by manifest membership.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTree {
    pub directories: Vec<String>,
    pub listed_files: Vec<String>,
    pub files: HashMap<String, u64>,
}

impl RemoteTree {
    /// Sum of manifest sizes. A snapshot — the remote may change afterwards.
    pub fn total_bytes(&self) -> u64 {
        self.files.values().sum()
    }

    /// Manifest entries in listing order.
    pub fn transferable(&self) -> impl Iterator<Item = (&str, u64)> {
        self.listed_files
            .iter()
            .filter_map(|rel| self.files.get(rel).map(|size| (rel.as_str(), *size)))
    }
}

// ── Transfer jobs and outcomes ───────────────────────────────────────────────

/// One download job handed to a worker. Identity is the remote path; a unit
/// is attempted exactly once per scheduler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferUnit {
    pub remote_path: String,
    pub relative_path: String,
    pub local_path: PathBuf,
    pub expected_size: u64,
}

/// An isolated per-file failure. Never aborts sibling transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFailure {
    pub path: String,
    pub kind: TransferErrorKind,
    pub message: String,
}

impl FileFailure {
    pub fn from_error(path: impl Into<String>, err: &crate::error::TransferError) -> Self {
        Self {
            path: path.into(),
            kind: err.kind,
            message: err.message.clone(),
        }
    }
}

/// Result of a single-file download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOutcome {
    pub bytes_written: u64,
    /// The copy ended before the expected size was reached. Tolerated, not
    /// retried — the remote size can change while a transfer runs.
    pub truncated: bool,
    pub checksum: Option<String>,
}

/// Aggregated result of a tree download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReport {
    pub operation_id: String,
    /// Transport tag the operation ran on ("rpc", "sftp").
    pub transport: String,
    pub total_files: usize,
    pub transferred_files: usize,
    pub failed: Vec<FileFailure>,
    pub truncated: Vec<String>,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl TransferReport {
    pub fn elapsed(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }

    /// Every listed unit arrived whole.
    pub fn fully_transferred(&self) -> bool {
        self.failed.is_empty() && self.truncated.is_empty()
    }
}

/// Combined result of a bundle pull: the tree report plus the auxiliary
/// artifact downloaded under the same progress total.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleReport {
    pub tree: TransferReport,
    pub artifact: FileOutcome,
    /// Whether the remote artifact was deleted afterwards. Cleanup is
    /// best-effort; `false` is not a failure.
    pub artifact_removed: bool,
}

// ── Remote path helpers ──────────────────────────────────────────────────────

/// Join a remote root and a relative path with `/` (remote paths are POSIX).
pub fn join_remote(root: &str, rel: &str) -> String {
    if root.ends_with('/') {
        format!("{}{}", root, rel)
    } else {
        format!("{}/{}", root, rel)
    }
}

/// Remote listings are untrusted input: reject relative paths that could
/// escape the local destination directory.
pub fn is_safe_relative(rel: &str) -> bool {
    if rel.is_empty() || rel.starts_with('/') {
        return false;
    }
    !rel.split('/').any(|component| component == "..")
}
