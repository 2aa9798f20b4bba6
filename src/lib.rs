//! Core SIP signaling stack: transaction state machines (RFC 3261 §17),
//! dialog lifecycle (RFC 3261 §12), a shard-partitioned dialog registry,
//! and the REFER/Replaces call-transfer extension (RFC 3515/3891/4488).
//!
//! Message parsing/serialization is delegated to the `rsip` crate; socket
//! I/O, SDP negotiation, and authentication header formatting are external
//! collaborators this crate only talks to through the [`transport`] trait
//! and plain `Vec<u8>` bodies.

pub mod config;
pub mod dialog;
pub mod identifiers;
pub mod metrics;
pub mod rsip_ext;
pub mod shard_map;
pub mod stack;
pub mod transaction;
pub mod transport;

use crate::dialog::DialogId;
use crate::transaction::key::TransactionKey;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error kinds for this crate.
///
/// Variant names are part of the crate's contract: callers match on them
/// to decide retry/give-up policy, so renaming one is a breaking change.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Error(String),

    #[error("dialog error: {0} ({1})")]
    DialogError(String, DialogId),

    #[error("transaction error: {0} ({1})")]
    TransactionError(String, TransactionKey),

    #[error("transport error: {0}")]
    TransportLayerError(String),

    #[error("dns resolution error: {0}")]
    DnsResolutionError(String),

    /// Operation not permitted in the dialog's current state.
    #[error("invalid state: {0} (dialog {1})")]
    InvalidState(String, DialogId),

    /// Dialog or transaction not known to the registry/map.
    #[error("not found: {0}")]
    NotFound(String),

    /// Local and remote tag would be equal; request construction aborted.
    #[error("tag collision in dialog {0}")]
    TagCollision(DialogId),

    /// A required SIP header was absent from a message the core needed to read.
    #[error("missing header {0}")]
    MissingHeader(String),

    /// Timer B/F elapsed without a final response.
    #[error("transaction timeout ({0})")]
    TransactionTimeout(TransactionKey),

    /// The underlying transaction ended without ever producing a response.
    #[error("transaction terminated without response ({0})")]
    TransactionTerminated(TransactionKey),

    /// A 3xx-6xx final response to a request this crate issued.
    #[error("peer rejected with {0}")]
    PeerRejected(rsip::StatusCode),

    /// The caller's context/cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// MaxDialogs / MaxTransactions reached.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Malformed URI, oversized header, control characters, etc.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// An internal invariant was violated; the affected dialog is torn down.
    #[error("internal corruption: {0} (dialog {1})")]
    InternalCorruption(String, DialogId),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(format!("channel send failed: {}", e))
    }
}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::Error(format!("sip message error: {}", e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::TransportLayerError(e.to_string())
    }
}
