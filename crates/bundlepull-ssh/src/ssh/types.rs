// ── Types ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_ssh_port() -> u16 {
    22
}
fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_keepalive_secs() -> u64 {
    30
}

// ── Connection & Authentication ──────────────────────────────────────────────

/// Everything needed to open the SSH fallback connection. Presence of this
/// config is what makes the SSH fallback path available at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub private_key_passphrase: Option<String>,
    #[serde(default = "default_true")]
    pub use_agent: bool,
    /// TCP connect timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Keepalive interval in seconds, `0` to disable.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,
}

impl SshConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
