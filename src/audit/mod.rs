//! Audit Log System
//!
//! The forward-secure, hash-chained log of directory changes: entry
//! encoding, the append-only file, the signer and the verifier.

pub mod entry;
pub mod log_file;
pub mod signer;
pub mod verify;

pub use entry::{canonical_bytes, ChangeEntry, ChangeType};
pub use log_file::AuditLogFile;
pub use signer::{ChainSigner, SignedEntry};
pub use verify::{ChainVerifier, VerificationReport, VerificationWarning, DEFAULT_MAX_ELISION};
