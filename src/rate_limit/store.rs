use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::{Clock, SystemClock};

/// How often the in-memory store sweeps dead windows by default.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Counter state for one partition key within one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests counted in the current window (>= 1).
    pub count: u64,
    /// Epoch milliseconds at which the window ends.
    pub reset_at: u64,
}

impl CounterEntry {
    /// First request of a fresh window starting at `now_millis`.
    pub fn new_window(now_millis: u64, window: Duration) -> Self {
        Self { count: 1, reset_at: now_millis.saturating_add(window_millis(window)) }
    }

    /// The window has ended. An entry is still live at exactly `reset_at`.
    pub fn is_expired(&self, now_millis: u64) -> bool {
        now_millis > self.reset_at
    }
}

pub(crate) fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}

/// Storage interface for fixed-window counters.
///
/// Implementations can be in-process or networked. Reads never fail for a missing key: absence
/// means "start a new window".
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the entry for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<CounterEntry>, Self::Error>;

    /// Overwrite the entry for `key`. Last writer wins.
    async fn set(&self, key: &str, entry: CounterEntry) -> Result<(), Self::Error>;

    /// Remove the entry for `key`.
    async fn delete(&self, key: &str) -> Result<(), Self::Error>;

    /// Remove every entry whose window ended before `now_millis`. Returns the number removed.
    async fn cleanup(&self, now_millis: u64) -> Result<usize, Self::Error>;

    /// Count one request for `key`, starting a new window if the current one is absent or over.
    ///
    /// The provided implementation is a plain get-modify-set and is **not** atomic: two
    /// concurrent callers for the same key can read the same entry and both write `count + 1`,
    /// undercounting by one. Stores with an atomic increment-with-expiry primitive should
    /// override it.
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now_millis: u64,
    ) -> Result<CounterEntry, Self::Error> {
        let entry = match self.get(key).await? {
            Some(mut live) if !live.is_expired(now_millis) => {
                live.count = live.count.saturating_add(1);
                live
            }
            _ => CounterEntry::new_window(now_millis, window),
        };
        self.set(key, entry).await?;
        Ok(entry)
    }

    /// Take back one count from the window of `key` ending at `reset_at`.
    ///
    /// Nothing happens if that window is gone or has been replaced by a newer one. An entry whose
    /// count drops to zero is removed. Returns the entry left behind, if any. Like `increment`,
    /// the provided implementation is a non-atomic get-modify-set.
    async fn decrement(&self, key: &str, reset_at: u64) -> Result<Option<CounterEntry>, Self::Error> {
        match self.get(key).await? {
            Some(mut entry) if entry.reset_at == reset_at => {
                entry.count = entry.count.saturating_sub(1);
                if entry.count == 0 {
                    self.delete(key).await?;
                    Ok(None)
                } else {
                    self.set(key, entry).await?;
                    Ok(Some(entry))
                }
            }
            other => Ok(other),
        }
    }
}

/// In-process counter store.
///
/// Clones share the same map. `increment` runs under a single lock, so same-key updates are
/// serialized even on a multi-threaded runtime.
#[derive(Clone, Debug)]
pub struct InMemoryCounterStore {
    entries: Arc<Mutex<HashMap<String, CounterEntry>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self { entries: Arc::new(Mutex::new(HashMap::new())), clock: Arc::new(SystemClock) }
    }

    /// Override the clock the cleanup task reads.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Number of stored entries, live or not yet swept.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    /// Start the periodic sweep. The task stops when the returned handle is shut down or dropped.
    ///
    /// # Panics
    /// Must be called from within a tokio runtime.
    pub fn spawn_cleanup(&self, interval: Duration) -> CleanupHandle {
        self.spawn_cleanup_with(interval, self.clock.clone())
    }

    /// Like [`spawn_cleanup`](Self::spawn_cleanup), judging expiry by `clock` instead of the
    /// store's own clock.
    pub(crate) fn spawn_cleanup_with(&self, interval: Duration, clock: Arc<dyn Clock>) -> CleanupHandle {
        let interval = interval.max(Duration::from_millis(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let store = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the first sweep is one interval out.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let removed = store.remove_expired(clock.now_millis());
                        if removed > 0 {
                            tracing::debug!(target: "turnstile::store", removed, "swept expired counters");
                        }
                    }
                }
            }
            tracing::debug!(target: "turnstile::store", "cleanup task stopped");
        });

        CleanupHandle { shutdown: Some(shutdown_tx), task: Some(task) }
    }

    fn remove_expired(&self, now_millis: u64) -> usize {
        let mut map = self.map();
        let before = map.len();
        map.retain(|_, entry| !entry.is_expired(now_millis));
        before - map.len()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, CounterEntry>> {
        // A panic mid-update leaves at worst one stale counter behind.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    type Error = std::convert::Infallible;

    async fn get(&self, key: &str) -> Result<Option<CounterEntry>, Self::Error> {
        Ok(self.map().get(key).copied())
    }

    async fn set(&self, key: &str, entry: CounterEntry) -> Result<(), Self::Error> {
        self.map().insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        self.map().remove(key);
        Ok(())
    }

    async fn cleanup(&self, now_millis: u64) -> Result<usize, Self::Error> {
        Ok(self.remove_expired(now_millis))
    }

    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now_millis: u64,
    ) -> Result<CounterEntry, Self::Error> {
        let mut map = self.map();
        let entry = map
            .entry(key.to_string())
            .and_modify(|live| {
                if live.is_expired(now_millis) {
                    *live = CounterEntry::new_window(now_millis, window);
                } else {
                    live.count = live.count.saturating_add(1);
                }
            })
            .or_insert_with(|| CounterEntry::new_window(now_millis, window));
        Ok(*entry)
    }

    async fn decrement(&self, key: &str, reset_at: u64) -> Result<Option<CounterEntry>, Self::Error> {
        let mut map = self.map();
        let Some(entry) = map.get_mut(key) else {
            return Ok(None);
        };
        if entry.reset_at != reset_at {
            return Ok(Some(*entry));
        }
        entry.count = entry.count.saturating_sub(1);
        if entry.count == 0 {
            map.remove(key);
            return Ok(None);
        }
        Ok(Some(*entry))
    }
}

/// Lifecycle handle for a background cleanup task.
///
/// Dropping the handle aborts the task; [`CleanupHandle::shutdown`] stops it gracefully.
#[derive(Debug)]
pub struct CleanupHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CleanupHandle {
    /// Signal the task to stop and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
