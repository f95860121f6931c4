//! Shared infrastructure for the bundlepull workspace:
//!
//!   • Categorised transfer errors with a kind-driven recovery contract
//!   • Transfer configuration with serde defaults and validation
//!   • Remote listing / tree / unit / report data types
//!   • Thread-safe progress tracking with injected render sinks
//!   • The [`Transport`] capability trait both transport backends implement
//!   • Streamed local-file checksums

pub mod checksum;
pub mod config;
pub mod error;
pub mod progress;
pub mod transport;
pub mod types;

pub use config::TransferConfig;
pub use error::{TransferError, TransferErrorKind, TransferResult};
pub use progress::{
    format_bytes, format_duration, ConsoleProgress, ProgressSink, ProgressSnapshot,
    ProgressTracker,
};
pub use transport::Transport;
pub use types::*;
