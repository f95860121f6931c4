// ── bundlepull / rpc module ──────────────────────────────────────────────────
//
// The RPC side of the transfer subsystem:
//   • Collaborator traits for the remote instrumentation agent and for
//     device-level process control (implemented outside this crate)
//   • The agent-backed implementation of the transport capability trait

pub mod transport;
pub mod types;

pub use transport::{AgentRpc, DeviceControl, RpcTransport};
pub use types::{DumpResult, ProcessInfo};
