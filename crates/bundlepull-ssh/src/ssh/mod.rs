// ── bundlepull-ssh / ssh module ──────────────────────────────────────────────
//
// SSH transport services providing:
//   • Session management (password / key / agent auth with keepalive)
//   • Remote tree walking, stat, and whole-file download over one reused
//     SFTP sub-channel
//   • The SFTP-backed implementation of the transport capability trait
//   • A local TCP tunnel forwarding each accepted connection over its own
//     direct-tcpip channel

pub mod service;
pub mod source;
pub mod tunnel;
pub mod types;

pub use service::SshSession;
pub use source::SftpTransport;
pub use tunnel::SshTunnel;
pub use types::*;
