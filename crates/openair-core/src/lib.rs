//! OpenAir Core - point-to-point file transfer over a raw TCP stream
//!
//! The sender offers a file with a one-line JSON header, the receiver answers
//! `ACCEPT` or `REJECT`, then the raw bytes follow. The receiver hashes while
//! it writes to a `.part` file and only renames it into place once the
//! SHA-256 matches.

pub mod config;
pub mod decision;
pub mod error;
pub mod format;
pub mod header;
pub mod metadata;
pub mod receiver;
pub mod sender;

// Re-export commonly used types
pub use config::TransferConfig;
pub use decision::{AutoDecision, DecisionSource};
pub use error::{SendError, TransferError, ValidationError};
pub use format::format_bytes;
pub use metadata::{sanitize_filename, FileMetadata};
pub use receiver::{Committed, Receiver, SessionEvent};
pub use sender::PreparedFile;
