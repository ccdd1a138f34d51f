//! Accept/reject decision sources.

use async_trait::async_trait;

use crate::metadata::FileMetadata;

/// Something that decides whether an offered file is accepted.
///
/// Called once per connection with metadata that has already been validated
/// and sanitized. `peer` is a display label for the remote end.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    async fn decide(&self, meta: &FileMetadata, peer: &str) -> bool;
}

/// Fixed answer, typically from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoDecision {
    Accept,
    Reject,
}

#[async_trait]
impl DecisionSource for AutoDecision {
    async fn decide(&self, meta: &FileMetadata, peer: &str) -> bool {
        tracing::debug!("Auto-{:?} {} from {}", self, meta.name, peer);
        *self == AutoDecision::Accept
    }
}

/// Plain predicates act as policy callbacks.
#[async_trait]
impl<F> DecisionSource for F
where
    F: Fn(&FileMetadata) -> bool + Send + Sync,
{
    async fn decide(&self, meta: &FileMetadata, _peer: &str) -> bool {
        self(meta)
    }
}
