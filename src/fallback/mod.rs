// ── bundlepull / fallback module ─────────────────────────────────────────────
//
// Transport orchestration: which transport an operation runs on, what
// happens when that transport dies mid-operation, and the facade the caller
// drives everything through.

pub mod controller;

pub use controller::{
    FallbackController, SshFallback, TransportState, TRANSFER_PROCESS_CANDIDATES,
};
