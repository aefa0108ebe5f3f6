use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::{classify, ErrorKind};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

pub type Fetcher<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub fetched_at_ms: i64,
    pub ttl_ms: i64,
}

impl<T> CacheEntry<T> {
    pub fn is_valid(&self, now_ms: i64) -> bool {
        now_ms - self.fetched_at_ms < self.ttl_ms
    }
}

/// Result of a cache read. `error` is set when nothing could be served
/// (`value` is `T::default()`) or when the backend rejected the session
/// (`value` is the last stored one).
#[derive(Debug)]
pub struct Lookup<T> {
    pub value: T,
    pub served_from_cache: bool,
    pub error: Option<Error>,
}

impl<T> Lookup<T> {
    fn cached(value: T) -> Self {
        Self {
            value,
            served_from_cache: true,
            error: None,
        }
    }

    fn fetched(value: T) -> Self {
        Self {
            value,
            served_from_cache: false,
            error: None,
        }
    }

    pub fn into_result(self) -> Result<T> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Updated,
    Invalidated,
    Cleared,
}

struct State<T> {
    entry: Option<CacheEntry<T>>,
    valid: bool,
    // bumped by invalidate/clear; fetches started under an older epoch are not stored
    epoch: u64,
    // bumped by every stored fetch
    generation: u64,
}

/// Read-through cache for a single resource with a fixed time-to-live.
///
/// Fetches are serialised per cache: callers that queue behind an
/// in-flight fetch reuse its result instead of issuing their own. A failed
/// fetch falls back to the last stored value, even an expired one. Auth
/// failures are always reported.
pub struct TimedCache<T> {
    name: String,
    fetcher: Fetcher<T>,
    clock: Arc<dyn Clock>,
    ttl_ms: i64,
    state: Mutex<State<T>>,
    fetching: Mutex<()>,
    fetches: AtomicU64,
    subscribers: Mutex<Vec<Sender<CacheEvent>>>,
}

impl<T> fmt::Debug for TimedCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedCache")
            .field("name", &self.name)
            .field("ttl_ms", &self.ttl_ms)
            .field("fetches", &self.fetches.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> TimedCache<T>
where
    T: Clone + Default + Send + 'static,
{
    pub fn new<F>(name: impl Into<String>, clock: Arc<dyn Clock>, ttl: Duration, fetcher: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            fetcher: Box::new(fetcher),
            clock,
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            state: Mutex::new(State {
                entry: None,
                valid: false,
                epoch: 0,
                generation: 0,
            }),
            fetching: Mutex::new(()),
            fetches: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, force_refresh: bool) -> Lookup<T> {
        let seen_generation = {
            let state = self.state.lock();
            if !force_refresh {
                if let Some(value) = self.fresh_value(&state) {
                    return Lookup::cached(value);
                }
            }
            state.generation
        };

        let _fetching = self.fetching.lock();

        {
            let state = self.state.lock();
            if state.generation != seen_generation && state.valid {
                if let Some(entry) = state.entry.as_ref() {
                    tracing::trace!(cache = %self.name, "reusing result of concurrent fetch");
                    return Lookup::cached(entry.value.clone());
                }
            }
        }

        self.fetch()
    }

    fn fresh_value(&self, state: &State<T>) -> Option<T> {
        if !state.valid {
            return None;
        }
        let entry = state.entry.as_ref()?;
        if entry.is_valid(self.clock.now_ms()) {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn fetch(&self) -> Lookup<T> {
        let epoch = self.state.lock().epoch;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(cache = %self.name, "fetching");

        match (self.fetcher)() {
            Ok(value) => {
                let stored = {
                    let mut state = self.state.lock();
                    if state.epoch == epoch {
                        state.entry = Some(CacheEntry {
                            value: value.clone(),
                            fetched_at_ms: self.clock.now_ms(),
                            ttl_ms: self.ttl_ms,
                        });
                        state.valid = true;
                        state.generation += 1;
                        true
                    } else {
                        false
                    }
                };
                if stored {
                    self.notify(CacheEvent::Updated);
                } else {
                    tracing::debug!(cache = %self.name, "cache invalidated during fetch; result not stored");
                }
                Lookup::fetched(value)
            }
            Err(err) => {
                let state = self.state.lock();
                match state.entry.as_ref() {
                    // stale data must not hide a rejected session
                    Some(entry) if classify(&err) == ErrorKind::Auth => {
                        tracing::warn!(cache = %self.name, error = %err, "fetch rejected; sign-in required");
                        Lookup {
                            value: entry.value.clone(),
                            served_from_cache: true,
                            error: Some(err),
                        }
                    }
                    Some(entry) => {
                        tracing::warn!(cache = %self.name, error = %err, "fetch failed; serving last known value");
                        Lookup::cached(entry.value.clone())
                    }
                    None => {
                        tracing::warn!(cache = %self.name, error = %err, "fetch failed with nothing cached");
                        Lookup {
                            value: T::default(),
                            served_from_cache: false,
                            error: Some(err),
                        }
                    }
                }
            }
        }
    }

    pub fn invalidate(&self) {
        self.reset();
        tracing::debug!(cache = %self.name, "invalidated");
        self.notify(CacheEvent::Invalidated);
    }

    /// Logout: drops the entry like `invalidate` but tells subscribers the
    /// data is gone rather than stale.
    pub fn clear(&self) {
        self.reset();
        tracing::debug!(cache = %self.name, "cleared");
        self.notify(CacheEvent::Cleared);
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.entry = None;
        state.valid = false;
        state.epoch += 1;
    }

    /// Applies `mutate` to the cached value without refetching. The entry
    /// keeps its original fetch time. Returns false if nothing is cached.
    pub fn update<F>(&self, mutate: F) -> bool
    where
        F: FnOnce(&mut T),
    {
        let updated = {
            let mut state = self.state.lock();
            match state.entry.as_mut() {
                Some(entry) => {
                    mutate(&mut entry.value);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify(CacheEvent::Updated);
        }
        updated
    }

    pub fn peek(&self) -> Option<CacheEntry<T>> {
        self.state.lock().entry.clone()
    }

    pub fn is_valid(&self) -> bool {
        let state = self.state.lock();
        self.fresh_value(&state).is_some()
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> Receiver<CacheEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn notify(&self, event: CacheEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event).is_ok());
    }
}

pub trait Clearable: Send + Sync {
    fn clear_all(&self);
}

impl<T> Clearable for TimedCache<T>
where
    T: Clone + Default + Send + 'static,
{
    fn clear_all(&self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    struct Origin {
        calls: AtomicUsize,
        failing: AtomicBool,
        denied: AtomicBool,
        data: Mutex<Vec<i32>>,
    }

    impl Origin {
        fn new(data: Vec<i32>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                denied: AtomicBool::new(false),
                data: Mutex::new(data),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    fn cache_with(origin: &Arc<Origin>, clock: &Arc<ManualClock>, ttl_ms: u64) -> TimedCache<Vec<i32>> {
        let origin = origin.clone();
        TimedCache::new(
            "numbers",
            clock.clone(),
            Duration::from_millis(ttl_ms),
            move || {
                origin.calls.fetch_add(1, Ordering::SeqCst);
                if origin.denied.load(Ordering::SeqCst) {
                    return Err(crate::error::ApiError::Unauthenticated.into());
                }
                if origin.failing.load(Ordering::SeqCst) {
                    return Err(anyhow!("network unreachable"));
                }
                Ok(origin.data.lock().clone())
            },
        )
    }

    #[test]
    fn serves_cached_value_until_ttl_elapses() {
        let clock = Arc::new(ManualClock::new(0));
        let origin = Origin::new(vec![1, 2, 3]);
        let cache = cache_with(&origin, &clock, 5_000);

        let first = cache.get(false);
        assert_eq!(first.value, vec![1, 2, 3]);
        assert!(!first.served_from_cache);
        assert_eq!(origin.calls(), 1);

        clock.set(3_000);
        let second = cache.get(false);
        assert_eq!(second.value, vec![1, 2, 3]);
        assert!(second.served_from_cache);
        assert_eq!(origin.calls(), 1);

        clock.set(6_000);
        let third = cache.get(false);
        assert!(!third.served_from_cache);
        assert_eq!(origin.calls(), 2);
    }

    #[test]
    fn ttl_boundary_triggers_exactly_one_fetch() {
        let clock = Arc::new(ManualClock::new(10_000));
        let origin = Origin::new(vec![7]);
        let cache = cache_with(&origin, &clock, 1_000);

        cache.get(false);
        clock.set(10_000 + 999);
        cache.get(false);
        assert_eq!(cache.fetch_count(), 1);

        clock.set(10_000 + 1_001);
        cache.get(false);
        cache.get(false);
        assert_eq!(cache.fetch_count(), 2);
    }

    #[test]
    fn failed_fetch_falls_back_to_expired_value() {
        let clock = Arc::new(ManualClock::new(0));
        let origin = Origin::new(vec![4, 5]);
        let cache = cache_with(&origin, &clock, 100);

        cache.get(false);
        origin.fail(true);
        clock.advance(500);

        let lookup = cache.get(false);
        assert_eq!(lookup.value, vec![4, 5]);
        assert!(lookup.served_from_cache);
        assert!(lookup.error.is_none());
        assert_eq!(origin.calls(), 2);
    }

    #[test]
    fn auth_failure_is_reported_alongside_stale_value() {
        let clock = Arc::new(ManualClock::new(0));
        let origin = Origin::new(vec![4, 5]);
        let cache = cache_with(&origin, &clock, 100);

        cache.get(false);
        origin.denied.store(true, Ordering::SeqCst);
        clock.advance(500);

        let lookup = cache.get(false);
        assert_eq!(lookup.value, vec![4, 5]);
        assert!(lookup.served_from_cache);
        let err = lookup.into_result().unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Auth);
    }

    #[test]
    fn failed_fetch_without_history_reports_error() {
        let clock = Arc::new(ManualClock::new(0));
        let origin = Origin::new(vec![1]);
        origin.fail(true);
        let cache = cache_with(&origin, &clock, 100);

        let lookup = cache.get(false);
        assert!(lookup.value.is_empty());
        assert!(!lookup.served_from_cache);
        let err = lookup.error.expect("error surfaced");
        assert!(err.to_string().contains("network unreachable"));
        assert!(cache.peek().is_none());
    }

    #[test]
    fn invalidate_forces_fetch_within_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let origin = Origin::new(vec![1]);
        let cache = cache_with(&origin, &clock, 60_000);

        cache.get(false);
        cache.invalidate();
        assert!(!cache.is_valid());
        cache.get(false);
        assert_eq!(origin.calls(), 2);
    }

    #[test]
    fn invalidate_drops_entry() {
        let clock = Arc::new(ManualClock::new(0));
        let origin = Origin::new(vec![9]);
        let cache = cache_with(&origin, &clock, 60_000);

        cache.get(false);
        cache.invalidate();
        assert!(cache.peek().is_none());
        origin.fail(true);
        let lookup = cache.get(false);
        assert!(lookup.value.is_empty());
        assert!(!lookup.served_from_cache);
        assert!(lookup.error.is_some());
    }

    #[test]
    fn clear_drops_entry() {
        let clock = Arc::new(ManualClock::new(0));
        let origin = Origin::new(vec![9]);
        let cache = cache_with(&origin, &clock, 60_000);

        cache.get(false);
        cache.clear();
        origin.fail(true);
        let lookup = cache.get(false);
        assert!(lookup.value.is_empty());
        assert!(lookup.error.is_some());
    }

    #[test]
    fn force_refresh_bypasses_valid_entry() {
        let clock = Arc::new(ManualClock::new(0));
        let origin = Origin::new(vec![1]);
        let cache = cache_with(&origin, &clock, 60_000);

        cache.get(false);
        *origin.data.lock() = vec![2];
        let lookup = cache.get(true);
        assert_eq!(lookup.value, vec![2]);
        assert!(!lookup.served_from_cache);
    }

    #[test]
    fn update_preserves_fetch_time() {
        let clock = Arc::new(ManualClock::new(0));
        let origin = Origin::new(vec![1, 2]);
        let cache = cache_with(&origin, &clock, 1_000);

        assert!(!cache.update(|v| v.push(0)));
        cache.get(false);
        clock.set(900);
        assert!(cache.update(|v| v.retain(|n| *n != 1)));

        let entry = cache.peek().expect("entry");
        assert_eq!(entry.value, vec![2]);
        assert_eq!(entry.fetched_at_ms, 0);

        clock.set(1_000);
        cache.get(false);
        assert_eq!(origin.calls(), 2);
    }

    #[test]
    fn subscribers_see_updates_and_invalidations() {
        let clock = Arc::new(ManualClock::new(0));
        let origin = Origin::new(vec![1]);
        let cache = cache_with(&origin, &clock, 1_000);
        let events = cache.subscribe();

        cache.get(false);
        cache.invalidate();
        cache.clear();

        let seen: Vec<_> = events.try_iter().collect();
        assert_eq!(
            seen,
            vec![CacheEvent::Updated, CacheEvent::Invalidated, CacheEvent::Cleared]
        );
    }

    #[test]
    fn invalidation_during_fetch_discards_result() {
        let clock = Arc::new(ManualClock::new(0));
        let slot: Arc<Mutex<Option<Arc<TimedCache<Vec<i32>>>>>> = Arc::new(Mutex::new(None));
        let hook = slot.clone();
        let cache = Arc::new(TimedCache::new(
            "racy",
            clock.clone(),
            Duration::from_secs(60),
            move || {
                if let Some(cache) = hook.lock().as_ref() {
                    cache.invalidate();
                }
                Ok(vec![1])
            },
        ));
        *slot.lock() = Some(cache.clone());

        let lookup = cache.get(false);
        assert_eq!(lookup.value, vec![1]);
        assert!(cache.peek().is_none());
        *slot.lock() = None;
    }

    #[test]
    fn concurrent_misses_share_one_fetch() {
        let clock = Arc::new(ManualClock::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = Arc::new(TimedCache::new(
            "slow",
            clock,
            Duration::from_secs(60),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                Ok(vec![42])
            },
        ));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || cache.get(false).value)
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![42]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
