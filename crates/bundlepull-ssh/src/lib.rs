//! # bundlepull – SSH
//!
//! SSH connectivity for the fallback transport path: session management,
//! SFTP-backed enumeration and download, and local TCP tunnelling over SSH.

pub mod ssh;
