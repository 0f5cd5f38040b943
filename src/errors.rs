//! Error type definitions

use thiserror::Error;

/// An error produced by a [`BatchFetch`](`crate::fetch::BatchFetch`) implementation.
///
/// Fetch errors are consumed by the polling loop, logged and translated into
/// retry behavior. They are never surfaced to subscribers.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct FetchError(#[from] anyhow::Error);

impl FetchError {
    /// Create a fetch error from a message
    pub fn msg<M: std::fmt::Display>(msg: M) -> Self {
        Self(anyhow::anyhow!(msg.to_string()))
    }

    /// Create a fetch error from an underlying source error
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self(anyhow::Error::new(err))
    }

    /// Return true if the error looks like a server-side failure.
    ///
    /// Detection is a substring match on "500" anywhere in the error chain,
    /// mirroring how dashboard clients distinguish an overloaded backend from
    /// a transient transport failure. Overload errors are suppressed until
    /// the next natural poll interval instead of being retried eagerly.
    pub fn is_server_error(&self) -> bool {
        format!("{:#}", self.0).contains("500")
    }
}
