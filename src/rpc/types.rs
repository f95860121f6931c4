// ── Types ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

/// One entry from the device's process list, used to pick a re-target
/// candidate after transport loss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

impl ProcessInfo {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
        }
    }
}

/// What the agent reports after writing the decrypted executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpResult {
    /// Remote path the decrypted binary was written to.
    pub out_path: String,
    pub bundle_path: String,
    pub executable_name: String,
}
