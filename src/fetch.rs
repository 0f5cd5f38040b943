//! Batch fetch trait and key types

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FetchError;

/// An opaque identifier for one entity whose live data is tracked.
///
/// Keys are cheap to clone and compare. They carry no structure as far as the
/// scheduler is concerned; the fetcher is the only party that interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(Arc<str>);

impl Key {
    /// Return the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(Arc::from(s))
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(Arc::from(s.as_str()))
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The result of one batched fetch: latest data by key.
///
/// Keys missing from the map are recorded as having no data.
pub type BatchData = HashMap<Key, Value>;

/// A caller-supplied asynchronous batch-fetch function.
///
/// One call covers every key due in a batch cycle. Implementations are free
/// to fan the batch out however they like (single query, chunked requests)
/// as long as one result map comes back.
///
/// Any async function or closure taking `Vec<Key>` and returning
/// `Result<BatchData, FetchError>` implements this trait:
///
/// ```rust
/// use livedata::{BatchData, FetchError, Key};
///
/// async fn fetch(keys: Vec<Key>) -> Result<BatchData, FetchError> {
///     // issue one query for all keys
///     Ok(BatchData::new())
/// }
/// ```
#[async_trait]
pub trait BatchFetch: Send + Sync + 'static {
    /// Fetch the latest data for the given keys
    async fn fetch(&self, keys: &[Key]) -> Result<BatchData, FetchError>;
}

#[async_trait]
impl<F, Fut> BatchFetch for F
where
    F: Fn(Vec<Key>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BatchData, FetchError>> + Send + 'static,
{
    async fn fetch(&self, keys: &[Key]) -> Result<BatchData, FetchError> {
        (self)(keys.to_vec()).await
    }
}
