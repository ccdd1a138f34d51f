//! Error taxonomy for both protocol roles.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why a header was refused before any handshake line was written.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("filename is empty")]
    EmptyName,
    #[error("invalid file size {0}")]
    NonPositiveSize(i64),
    #[error("file too large ({size} bytes, receiver limit is {max})")]
    TooLarge { size: i64, max: i64 },
    #[error("sha256 must be 64 hex chars, got {0}")]
    DigestLength(usize),
    #[error("sha256 is not valid hex")]
    DigestNotHex,
}

/// Receiver-side session failure. Every variant after `DecisionRejected`
/// happens after the part file exists and implies it was removed.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("failed to read header: {0}")]
    HeaderReadFailed(#[source] io::Error),
    #[error("invalid JSON header: {0}")]
    HeaderDecodeFailed(#[from] serde_json::Error),
    #[error("invalid metadata: {0}")]
    ValidationFailed(#[from] ValidationError),
    #[error("transfer rejected")]
    DecisionRejected,
    #[error("failed to write handshake response: {0}")]
    ResponseWriteFailed(#[source] io::Error),
    #[error("failed to create output file: {0}")]
    OutputCreateFailed(#[source] io::Error),
    #[error("transfer failed: {0}")]
    TransferFailed(#[source] io::Error),
    #[error("transfer incomplete: got {received} bytes, expected {expected}")]
    TransferIncomplete { expected: u64, received: u64 },
    #[error("SHA-256 mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("failed to finalize {path}: {source}")]
    CommitFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    /// True for failures that happen before the transfer was accepted and
    /// therefore never touched the filesystem.
    pub fn is_pre_accept(&self) -> bool {
        matches!(
            self,
            TransferError::HeaderReadFailed(_)
                | TransferError::HeaderDecodeFailed(_)
                | TransferError::ValidationFailed(_)
                | TransferError::DecisionRejected
        )
    }
}

/// Sender-side failure.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("failed to read {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {peer}: {source}")]
    Connect {
        peer: String,
        #[source]
        source: io::Error,
    },
    #[error("source file changed: expected {expected} bytes, found {actual}")]
    SourceChanged { expected: u64, actual: u64 },
    #[error("failed to send header: {0}")]
    HeaderWriteFailed(#[source] io::Error),
    #[error("failed to read response: {0}")]
    ResponseReadFailed(#[source] io::Error),
    #[error("timed out waiting for receiver response")]
    ResponseTimeout,
    #[error("receiver rejected the file: {0:?}")]
    Rejected(String),
    #[error("failed to send file: {0}")]
    SendFailed(#[source] io::Error),
}
