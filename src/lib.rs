#![cfg_attr(docsrs, feature(doc_cfg))]
//! livedata keeps a dynamic set of dashboard entities fresh by polling a
//! caller-supplied batched fetch function at a fixed cadence.
//!
//! The crate is built around two collaborators:
//!
//! - A [LiveDataThread](`LiveDataThread`) owns the polling loop for one
//!   category of entities. Components that display an entity
//!   [subscribe](`LiveDataThread::subscribe`) its key; the thread keeps a
//!   reference count per key, starts its interval loop when the first key
//!   becomes observed and stops it when the last subscriber goes away.
//! - A [LiveDataManager](`LiveDataManager`) does the request/response
//!   bookkeeping: it decides which observed keys are stale enough to refetch,
//!   tracks in-flight requests so no key is fetched twice concurrently, and
//!   caches the latest result per key.
//!
//! On every tick the thread asks the manager for the due keys, issues one
//! batched call to the [BatchFetch](`BatchFetch`) function and reports the
//! results back. A cycle that finds more due keys than fit in a batch keeps
//! draining until nothing is due. Ticks that arrive while the configured
//! number of batches is already in flight are dropped, not queued.
//!
//! # Fetching
//!
//! The fetcher is any async function or closure taking the due keys and
//! returning data by key:
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use livedata::{BatchData, FetchError, Key, LiveDataManager, LiveDataThread, Opts};
//!
//! async fn fetch_assets(keys: Vec<Key>) -> Result<BatchData, FetchError> {
//!     // one query covering every due key
//!     Ok(BatchData::new())
//! }
//!
//! # tokio_test::block_on(async {
//! let manager = LiveDataManager::new();
//! let thread = LiveDataThread::with_opts(
//!     "assets",
//!     manager.clone(),
//!     fetch_assets,
//!     Opts::default().poll_rate(Duration::from_secs(10)),
//! );
//!
//! thread.subscribe(Key::from("asset-1"));
//!
//! // results land in the manager
//! let mut updates = manager.on_update();
//! updates.changed().await.unwrap();
//! let latest = manager.get("asset-1");
//! # })
//! ```
//!
//! # Failure policy
//!
//! Fetch errors never reach subscribers. An error that looks like a
//! server-side failure (its message contains `"500"`) marks the affected
//! keys as fetched with an empty result, so an overloaded backend is left
//! alone until the next natural poll interval. Any other error leaves the
//! keys eligible for immediate retry and defers the next attempt by
//! `min(poll_rate, 5s)`.
//!
//! # Observability
//!
//! The crate is instrumented with the [tracing](https://crates.io/crates/tracing)
//! crate. Each loop runs inside a span carrying the thread name; batch
//! activity is logged at DEBUG, bookkeeping at TRACE and fetch failures at
//! WARN. Pair it with
//! [tracing_subscriber](https://crates.io/crates/tracing-subscriber) to get
//! structured or human readable logs.

pub mod errors;
mod fetch;
mod manager;
mod thread;

pub use errors::FetchError;
pub use fetch::{BatchData, BatchFetch, Key};
pub use manager::{LiveDataManager, OnDataUpdate};
pub use thread::{LiveDataThread, Opts};
