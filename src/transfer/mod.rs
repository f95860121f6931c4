// ── bundlepull / transfer module ─────────────────────────────────────────────
//
// The transport-agnostic transfer pipeline:
//   • Enumeration of the remote tree into a size manifest
//   • Chunked single-file downloads
//   • The bounded parallel scheduler that drives a whole tree

pub mod chunked;
pub mod enumerate;
pub mod scheduler;

pub use chunked::ChunkedFileTransfer;
pub use enumerate::RemoteEnumerator;
pub use scheduler::ParallelTransferScheduler;
