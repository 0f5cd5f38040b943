//! Reference-counted batched polling loop

use std::cmp;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, span, trace, warn, Instrument, Level};

use crate::fetch::{BatchData, BatchFetch, Key};
use crate::manager::LiveDataManager;

/// Options controlling the polling behavior of a [`LiveDataThread`]
#[derive(Clone)]
pub struct Opts {
    /// Cadence of the fetch loop. Defaults to 30 seconds
    poll_rate: Duration,
    /// Maximum number of interval loops and concurrent fetch batches.
    /// Defaults to 4
    parallel_fetches: usize,
    /// Maximum number of keys per batched fetch. Defaults to 250
    batch_size: usize,
    /// Delay before the first cycle of a freshly started loop.
    /// Defaults to 250 milliseconds
    initial_delay: Duration,
}

impl Opts {
    pub fn poll_rate(self, poll_rate: Duration) -> Self {
        let mut opts = self;
        opts.poll_rate = poll_rate;
        opts
    }

    pub fn parallel_fetches(self, parallel_fetches: usize) -> Self {
        let mut opts = self;
        opts.parallel_fetches = parallel_fetches.max(1);
        opts
    }

    pub fn batch_size(self, batch_size: usize) -> Self {
        let mut opts = self;
        opts.batch_size = batch_size.max(1);
        opts
    }

    pub fn initial_delay(self, initial_delay: Duration) -> Self {
        let mut opts = self;
        opts.initial_delay = initial_delay;
        opts
    }
}

impl Default for Opts {
    fn default() -> Self {
        Opts {
            poll_rate: Duration::from_secs(30),
            parallel_fetches: 4,
            batch_size: 250,
            initial_delay: Duration::from_millis(250),
        }
    }
}

/// Upper bound on the deferral after a failed batch
const MAX_ERROR_WAIT: Duration = Duration::from_secs(5);

struct ThreadState {
    /// Subscriber count per observed key
    listeners: HashMap<Key, usize>,
    /// Current cadence of the fetch loops
    poll_rate: Duration,
    /// Number of batch fetches currently in flight
    active_fetches: usize,
    /// Handles of the running interval loops, bounded by `parallel_fetches`
    loops: Vec<JoinHandle<()>>,
}

struct Inner<F> {
    name: String,
    opts: Opts,
    manager: LiveDataManager,
    fetcher: F,
    state: Mutex<ThreadState>,
}

/// A named polling loop for one category of live dashboard entities
///
/// The thread keeps a reference count of subscribers per observed key. The
/// fetch loop starts when the first key becomes observed and stops when the
/// last subscriber is gone. On each tick the thread asks its
/// [`LiveDataManager`] which observed keys are stale, issues one batched
/// fetch for them, reports the results back and keeps draining until nothing
/// is due.
///
/// Despite the name, no OS thread is involved: the loops are tokio tasks and
/// all suspension happens at timer and network await points.
///
/// ```rust,no_run
/// use livedata::{BatchData, FetchError, Key, LiveDataManager, LiveDataThread};
///
/// async fn fetch_assets(keys: Vec<Key>) -> Result<BatchData, FetchError> {
///     // one query covering all due keys
///     Ok(BatchData::new())
/// }
///
/// # tokio_test::block_on(async {
/// let manager = LiveDataManager::new();
/// let thread = LiveDataThread::new("assets", manager.clone(), fetch_assets);
///
/// // a component starts displaying an asset
/// thread.subscribe(Key::from("asset-1"));
///
/// // ... results become available through the manager
/// let mut updates = manager.on_update();
/// updates.changed().await.unwrap();
/// let latest = manager.get("asset-1");
///
/// // the component goes away, polling stops with the last subscriber
/// thread.unsubscribe(&Key::from("asset-1"));
/// # })
/// ```
///
/// # Failure policy
///
/// A fetch error whose message looks like a server-side failure (contains
/// `"500"`) marks the affected keys as fetched with an empty result, so they
/// are not requested again until the next natural poll interval. Any other
/// error leaves the keys eligible for immediate retry and defers the next
/// drain attempt by `min(poll_rate, 5s)`. Errors are logged, never surfaced
/// to subscribers.
pub struct LiveDataThread<F> {
    inner: Arc<Inner<F>>,
}

impl<F> Clone for LiveDataThread<F> {
    fn clone(&self) -> Self {
        LiveDataThread {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: BatchFetch> LiveDataThread<F> {
    /// Create a new thread with default [`Opts`]
    ///
    /// The thread is idle until the first key is subscribed.
    pub fn new(name: impl Into<String>, manager: LiveDataManager, fetcher: F) -> Self {
        Self::with_opts(name, manager, fetcher, Opts::default())
    }

    /// Create a new thread with the given [`Opts`]
    pub fn with_opts(
        name: impl Into<String>,
        manager: LiveDataManager,
        fetcher: F,
        opts: Opts,
    ) -> Self {
        let state = ThreadState {
            listeners: HashMap::new(),
            poll_rate: opts.poll_rate,
            active_fetches: 0,
            loops: Vec::new(),
        };
        LiveDataThread {
            inner: Arc::new(Inner {
                name: name.into(),
                opts,
                manager,
                fetcher,
                state: Mutex::new(state),
            }),
        }
    }

    /// The thread name, used in logging spans
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The manager this thread reports to
    pub fn manager(&self) -> &LiveDataManager {
        &self.inner.manager
    }

    /// Register a subscriber for a key
    ///
    /// Starts a fetch loop unless the parallel loop limit has been reached,
    /// so the first observed key always starts polling.
    pub fn subscribe(&self, key: Key) {
        let mut state = self.inner.lock_state();
        let count = state.listeners.entry(key.clone()).or_insert(0);
        *count += 1;
        trace!(thread = %self.inner.name, %key, count = *count, "subscribed");
        self.start_fetch_loop(&mut state);
    }

    /// Drop a subscriber for a key
    ///
    /// Counts never go below zero; unsubscribing a key that is not observed
    /// is a no-op. Stops the fetch loop when the last key is gone.
    pub fn unsubscribe(&self, key: &Key) {
        let mut state = self.inner.lock_state();
        let Some(count) = state.listeners.get_mut(key) else {
            return;
        };
        *count -= 1;
        trace!(thread = %self.inner.name, %key, count = *count, "unsubscribed");
        if *count == 0 {
            state.listeners.remove(key);
        }
        if state.listeners.is_empty() {
            debug!(thread = %self.inner.name, "no keys observed, stopping fetch loop");
            stop_fetch_loop(&mut state);
        }
    }

    /// Change the polling cadence
    ///
    /// Running loops are restarted so the new rate takes effect immediately.
    pub fn set_poll_rate(&self, poll_rate: Duration) {
        let mut state = self.inner.lock_state();
        state.poll_rate = poll_rate;

        let running = state.loops.len();
        if running > 0 {
            stop_fetch_loop(&mut state);
            for _ in 0..running {
                self.start_fetch_loop(&mut state);
            }
        }
    }

    /// Snapshot of the currently observed keys
    pub fn observed_keys(&self) -> Vec<Key> {
        self.inner.lock_state().listeners.keys().cloned().collect()
    }

    /// Return true if at least one fetch loop is running
    pub fn is_polling(&self) -> bool {
        !self.inner.lock_state().loops.is_empty()
    }

    /// Start one more interval loop, up to the parallel fetch limit
    fn start_fetch_loop(&self, state: &mut ThreadState) {
        if state.loops.len() >= self.inner.opts.parallel_fetches {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        // tokio intervals reject a zero period
        let poll_rate = state.poll_rate.max(Duration::from_millis(1));
        let initial_delay = self.inner.opts.initial_delay;
        let loop_span = span!(Level::DEBUG, "fetch_loop", thread = %self.inner.name);

        let handle = tokio::spawn(
            async move {
                // first cycle after a short delay, then at the fixed cadence.
                // Missed ticks are dropped, not queued
                let mut timer = interval_at(Instant::now() + initial_delay, poll_rate);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    timer.tick().await;
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    let cycle_span =
                        span!(Level::DEBUG, "batch_cycle", thread = %inner.name);
                    // cycles run as their own tasks so stopping the timers
                    // never cancels an outstanding fetch
                    tokio::spawn(Inner::batch_cycle(inner).instrument(cycle_span));
                }
            }
            .instrument(loop_span),
        );
        state.loops.push(handle);
        debug!(
            thread = %self.inner.name,
            loops = state.loops.len(),
            poll_rate = ?poll_rate,
            "started fetch loop"
        );
    }
}

/// Clear all active interval timers
fn stop_fetch_loop(state: &mut ThreadState) {
    for handle in state.loops.drain(..) {
        handle.abort();
    }
}

impl<F> Inner<F> {
    fn lock_state(&self) -> MutexGuard<'_, ThreadState> {
        // the lock is never held across an await point, recover on poison
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// Bookkeeping guard for one in-flight batch fetch
///
/// If the fetch unwinds instead of returning, the guard restores the
/// in-flight count and unmarks the keys on drop so they stay eligible
/// for the next cycle. Disarmed once the fetch reports a result.
struct FetchGuard<F> {
    inner: Arc<Inner<F>>,
    keys: Vec<Key>,
    armed: bool,
}

impl<F> FetchGuard<F> {
    fn disarm(mut self) -> Vec<Key> {
        self.armed = false;
        std::mem::take(&mut self.keys)
    }
}

impl<F> Drop for FetchGuard<F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("batch fetch terminated without a result, unmarking keys");
        self.inner.lock_state().active_fetches -= 1;
        self.inner.manager.unmark_keys_requested(&self.keys);
    }
}

impl<F: BatchFetch> Inner<F> {
    /// Run batched fetches until no observed key is due
    ///
    /// Each iteration asks the manager for the due keys, marks them
    /// requested and issues one batched fetch. On success the results are
    /// reported back and the loop immediately drains again.
    async fn batch_cycle(self: Arc<Self>) {
        loop {
            let (keys, poll_rate) = {
                let mut state = self.lock_state();
                if state.active_fetches >= self.opts.parallel_fetches {
                    trace!("parallel fetch limit reached, dropping tick");
                    return;
                }

                let observed: Vec<Key> = state.listeners.keys().cloned().collect();
                let keys = self.manager.determine_keys_to_fetch(
                    &observed,
                    state.poll_rate,
                    self.opts.batch_size,
                );
                if keys.is_empty() {
                    return;
                }

                // mark before releasing the lock so a concurrent cycle
                // cannot pick the same keys
                self.manager.mark_keys_requested(&keys);
                state.active_fetches += 1;
                (keys, state.poll_rate)
            };

            debug!(keys = keys.len(), "fetching batch");
            let guard = FetchGuard {
                inner: Arc::clone(&self),
                keys,
                armed: true,
            };
            let result = self.fetcher.fetch(&guard.keys).await;
            let keys = guard.disarm();
            self.lock_state().active_fetches -= 1;

            match result {
                Ok(data) => {
                    self.manager.update_fetched_keys(&keys, data);
                }
                Err(err) if err.is_server_error() => {
                    warn!("batch fetch failed with server error, suppressing keys until next poll: {err:#}");
                    // record an empty result so the keys are not requested
                    // again before the poll interval elapses
                    self.manager.update_fetched_keys(&keys, BatchData::new());
                }
                Err(err) => {
                    warn!("batch fetch failed: {err:#}");
                    self.manager.unmark_keys_requested(&keys);
                    sleep(cmp::min(poll_rate, MAX_ERROR_WAIT)).await;
                }
            }
        }
    }
}

impl<F> Drop for Inner<F> {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            stop_fetch_loop(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tokio::sync::watch;
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{prelude::*, EnvFilter};

    use super::*;
    use crate::errors::FetchError;

    fn init() {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(false)
                    .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE),
            )
            .with(EnvFilter::from_default_env())
            .try_init()
            .unwrap_or(());
    }

    async fn noop_fetch(keys: Vec<Key>) -> Result<BatchData, FetchError> {
        Ok(keys
            .into_iter()
            .map(|key| (key, Value::Bool(true)))
            .collect())
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_subscriber_starts_loop_last_stops_it() {
        init();
        let thread = LiveDataThread::new("assets", LiveDataManager::new(), noop_fetch);
        assert!(!thread.is_polling());

        thread.subscribe(Key::from("a"));
        assert!(thread.is_polling());

        // a second subscriber on the same key keeps the loop alive
        thread.subscribe(Key::from("a"));
        thread.unsubscribe(&Key::from("a"));
        assert!(thread.is_polling());

        thread.unsubscribe(&Key::from("a"));
        assert!(!thread.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redundant_unsubscribes_are_noops() {
        init();
        let thread = LiveDataThread::new("assets", LiveDataManager::new(), noop_fetch);

        // unsubscribing a key that was never observed does nothing
        thread.unsubscribe(&Key::from("a"));
        thread.unsubscribe(&Key::from("a"));
        assert!(thread.observed_keys().is_empty());

        // counts never go negative: one subscribe observes the key again
        thread.subscribe(Key::from("a"));
        assert_eq!(thread.observed_keys(), vec![Key::from("a")]);
        assert!(thread.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_count_is_bounded() {
        init();
        let opts = Opts::default().parallel_fetches(2);
        let thread =
            LiveDataThread::with_opts("assets", LiveDataManager::new(), noop_fetch, opts);

        for i in 0..10 {
            thread.subscribe(Key::from(format!("key-{i}").as_str()));
        }
        assert_eq!(thread.inner.lock_state().loops.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_never_exceed_limit() {
        init();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = watch::channel(false);

        let fetcher = {
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            move |keys: Vec<Key>| {
                let running = Arc::clone(&running);
                let max_seen = Arc::clone(&max_seen);
                let mut gate = gate_rx.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    // hold the fetch open until the test releases the gate
                    gate.wait_for(|open| *open).await.map_err(FetchError::new)?;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(keys
                        .into_iter()
                        .map(|key| (key, Value::Bool(true)))
                        .collect::<BatchData>())
                }
            }
        };

        // batch_size 1 makes every key its own fetch, so the only thing
        // limiting concurrency is the parallel fetch cap
        let opts = Opts::default()
            .poll_rate(Duration::from_secs(1))
            .parallel_fetches(2)
            .batch_size(1);
        let manager = LiveDataManager::new();
        let thread = LiveDataThread::with_opts("assets", manager.clone(), fetcher, opts);

        for i in 0..5 {
            thread.subscribe(Key::from(format!("key-{i}").as_str()));
        }

        // let several ticks elapse while the fetches are blocked
        sleep(Duration::from_secs(5)).await;
        assert_eq!(running.load(Ordering::SeqCst), 2);

        gate_tx.send(true).unwrap();
        // the drain loop finishes the remaining keys once unblocked
        sleep(Duration::from_secs(5)).await;

        assert_eq!(max_seen.load(Ordering::SeqCst), 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
        for i in 0..5 {
            assert_eq!(manager.get(&format!("key-{i}")), Some(Value::Bool(true)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_suppress_keys_until_next_poll() {
        init();
        let attempts = Arc::new(AtomicUsize::new(0));

        let fetcher = {
            let attempts = Arc::clone(&attempts);
            move |keys: Vec<Key>| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        return Err(FetchError::msg("request failed with status 500"));
                    }
                    Ok(keys
                        .into_iter()
                        .map(|key| (key, Value::Bool(true)))
                        .collect::<BatchData>())
                }
            }
        };

        let opts = Opts::default().poll_rate(Duration::from_secs(10));
        let manager = LiveDataManager::new();
        let thread = LiveDataThread::with_opts("assets", manager.clone(), fetcher, opts);
        thread.subscribe(Key::from("a"));

        // the first attempt fails with a 500; the key must not be requested
        // again before the poll interval elapses
        sleep(Duration::from_secs(5)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get("a"), Some(Value::Null));

        // the next natural poll tick retries and succeeds
        sleep(Duration::from_secs(6)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(manager.get("a"), Some(Value::Bool(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_retry_within_short_backoff() {
        init();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempt_times = Arc::new(Mutex::new(Vec::new()));

        let fetcher = {
            let attempts = Arc::clone(&attempts);
            let attempt_times = Arc::clone(&attempt_times);
            move |keys: Vec<Key>| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                attempt_times.lock().unwrap().push(Instant::now());
                async move {
                    if n == 0 {
                        return Err(FetchError::msg("connection refused"));
                    }
                    Ok(keys
                        .into_iter()
                        .map(|key| (key, Value::Bool(true)))
                        .collect::<BatchData>())
                }
            }
        };

        // with a 30s poll rate the deferral is capped at 5s
        let opts = Opts::default().poll_rate(Duration::from_secs(30));
        let manager = LiveDataManager::new();
        let thread = LiveDataThread::with_opts("assets", manager.clone(), fetcher, opts);
        thread.subscribe(Key::from("a"));

        sleep(Duration::from_secs(4)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        // the drain loop retries after min(poll_rate, 5s), well before the
        // next poll tick
        sleep(Duration::from_secs(2)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(manager.get("a"), Some(Value::Bool(true)));

        let times = attempt_times.lock().unwrap();
        assert_eq!(times[1].duration_since(times[0]), MAX_ERROR_WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_fetch_does_not_wedge_polling() {
        init();
        let attempts = Arc::new(AtomicUsize::new(0));

        let fetcher = {
            let attempts = Arc::clone(&attempts);
            move |keys: Vec<Key>| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        panic!("fetcher exploded");
                    }
                    Ok::<_, FetchError>(
                        keys.into_iter()
                            .map(|key| (key, Value::Bool(true)))
                            .collect::<BatchData>(),
                    )
                }
            }
        };

        let opts = Opts::default().poll_rate(Duration::from_secs(5));
        let manager = LiveDataManager::new();
        let thread = LiveDataThread::with_opts("assets", manager.clone(), fetcher, opts);
        thread.subscribe(Key::from("a"));

        // the first cycle unwinds inside the fetcher; the key must stay
        // eligible and the in-flight count must be restored
        sleep(Duration::from_secs(1)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(thread.inner.lock_state().active_fetches, 0);

        // the next poll tick retries and succeeds
        sleep(Duration::from_secs(5)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(manager.get("a"), Some(Value::Bool(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_poll_rate_takes_effect() {
        init();
        let attempts = Arc::new(AtomicUsize::new(0));

        let fetcher = {
            let attempts = Arc::clone(&attempts);
            move |keys: Vec<Key>| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok::<_, FetchError>(
                        keys.into_iter()
                            .map(|key| (key, Value::Bool(true)))
                            .collect::<BatchData>(),
                    )
                }
            }
        };

        let opts = Opts::default().poll_rate(Duration::from_secs(3600));
        let thread =
            LiveDataThread::with_opts("assets", LiveDataManager::new(), fetcher, opts);
        thread.subscribe(Key::from("a"));
        thread.set_poll_rate(Duration::from_secs(1));

        sleep(Duration::from_secs(4)).await;
        assert!(attempts.load(Ordering::SeqCst) >= 3);
        assert!(thread.is_polling());
    }
}
