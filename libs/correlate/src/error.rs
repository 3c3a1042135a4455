//! Error types for the correlation registry.

use canary_context::ContextError;
use thiserror::Error;

/// Errors returned by [`CorrelationRegistry`](crate::CorrelationRegistry) and
/// [`Subscriber`](crate::Subscriber).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// `sent` was called for a key that is still pending.
    #[error("key {0} already sent")]
    DuplicateKey(String),

    /// A wait was started for a key that was never sent (or already deleted).
    #[error("wait called before key {0} was sent")]
    NotSent(String),

    /// A multi-key wait was started with an empty key set.
    #[error("no keys to wait on")]
    NoKeys,

    /// The wait ended because its context was cancelled or expired.
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl RegistryError {
    /// Returns true if the error came from the caller's context rather than
    /// from misuse of the registry.
    pub fn is_context(&self) -> bool {
        matches!(self, Self::Context(_))
    }
}
