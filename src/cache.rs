//! Defines `PromiseCache`, a keyed store of promises.
//!
//! The cache maps keys to promises, typically the pending or settled result of a
//! request for that key, so that concurrent consumers share one request instead
//! of issuing their own. On top of a plain map it offers:
//! - a capacity, enforced by an [`EvictionPolicy`] whenever a new key would
//!   overflow it;
//! - expiry, removing an entry a fixed time after it was stored;
//! - automatic removal of entries whose promise is rejected, so that the next
//!   consumer retries;
//! - a fail hook that intercepts a rejection before any consumer sees it and
//!   gets to resolve or reject the stored promise itself.
//!
//! Every removal (explicit, by eviction, by expiry or by rejection) reports the
//! entry through its `discarded` hook exactly once. Overwriting a key replaces
//! the entry silently.
use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::{debug, trace};

use crate::{
    ConfigurationError, Deferred, Eviction, EvictionPolicy, Promise, Timer, promise::lock,
};

/// The trait for cache keys.
pub trait Key: Eq + Hash + Clone + Send + 'static {}

impl Key for char {}
impl Key for &'static str {}
impl Key for String {}
impl Key for i8 {}
impl Key for u8 {}
impl Key for i16 {}
impl Key for u16 {}
impl Key for i32 {}
impl Key for u32 {}
impl Key for i64 {}
impl Key for u64 {}
impl Key for i128 {}
impl Key for u128 {}
impl Key for isize {}
impl Key for usize {}

type DiscardedHook<K, T, E> = Arc<dyn Fn(&K, &Promise<T, E>) + Send + Sync>;
type FailHook<K, T, E> = Arc<dyn Fn(Deferred<T, E>, &K, &Promise<T, E>) + Send + Sync>;

/// Per-entry settings passed to [`PromiseCache::set_with`].
///
/// Anything left unset falls back to the cache-wide default.
pub struct EntryOptions<K, T, E> {
    expire_after: Option<Duration>,
    on_fail: Option<FailHook<K, T, E>>,
    on_discarded: Option<DiscardedHook<K, T, E>>,
}

impl<K, T, E> EntryOptions<K, T, E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            expire_after: None,
            on_fail: None,
            on_discarded: None,
        }
    }

    /// Removes the entry once `duration` has elapsed since it was stored.
    pub fn expire_after(mut self, duration: Duration) -> Self {
        self.expire_after = Some(duration);
        self
    }

    /// Intercepts the rejection of the stored promise. See
    /// [`PromiseCacheBuilder::on_fail`].
    pub fn on_fail(
        mut self,
        hook: impl Fn(Deferred<T, E>, &K, &Promise<T, E>) + Send + Sync + 'static,
    ) -> Self {
        self.on_fail = Some(Arc::new(hook));
        self
    }

    /// Called with the key and stored promise when the entry leaves the cache.
    pub fn on_discarded(mut self, hook: impl Fn(&K, &Promise<T, E>) + Send + Sync + 'static) -> Self {
        self.on_discarded = Some(Arc::new(hook));
        self
    }
}

impl<K, T, E> Default for EntryOptions<K, T, E> {
    fn default() -> Self {
        Self::new()
    }
}

struct Entry<K, T, E> {
    promise: Promise<T, E>,
    // Identifies this particular store of the key, so late timers and
    // rejections of a replaced promise leave the new entry alone.
    generation: u64,
    discarded: Option<DiscardedHook<K, T, E>>,
    expiry: Option<Timer>,
}

struct State<K, T, E> {
    entries: HashMap<K, Entry<K, T, E>>,
    policy: Option<Box<dyn EvictionPolicy<K>>>,
    next_generation: u64,
}

impl<K: Key, T, E> State<K, T, E> {
    fn take(&mut self, key: &K) -> Option<Entry<K, T, E>> {
        let entry = self.entries.remove(key)?;
        if let Some(policy) = self.policy.as_mut() {
            policy.on_remove(key);
        }
        Some(entry)
    }

    fn evict(&mut self, n: usize) -> Vec<(K, Entry<K, T, E>)> {
        let Some(policy) = self.policy.as_mut() else {
            return Vec::new();
        };
        let victims = policy.evict(n);
        victims
            .into_iter()
            .filter_map(|key| self.take(&key).map(|entry| (key, entry)))
            .collect()
    }
}

struct Shared<K, T, E> {
    state: Mutex<State<K, T, E>>,
    capacity: Option<usize>,
    evict_rate: usize,
    expire_after: Option<Duration>,
    on_discarded: Option<DiscardedHook<K, T, E>>,
    on_fail: Option<FailHook<K, T, E>>,
}

impl<K, T, E> Shared<K, T, E>
where
    K: Key,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn remove_if_current(&self, key: &K, generation: u64) -> bool {
        let entry = {
            let mut state = lock(&self.state);
            let current = state
                .entries
                .get(key)
                .is_some_and(|entry| entry.generation == generation);
            if current { state.take(key) } else { None }
        };
        match entry {
            Some(entry) => {
                self.discard(key, entry);
                true
            }
            None => false,
        }
    }

    fn discard(&self, key: &K, entry: Entry<K, T, E>) {
        if let Some(expiry) = &entry.expiry {
            expiry.cancel();
        }
        if let Some(hook) = &entry.discarded {
            hook(key, &entry.promise);
        }
    }
}

/// A map of keys to promises with eviction, expiry and failure handling.
///
/// # Example
/// ```
/// # use orderly::{Deferred, Eviction, PromiseCache};
/// #
/// let cache = PromiseCache::<u32, &str, ()>::builder()
///     .eviction(Eviction::Lru)
///     .capacity(2)
///     .build()
///     .unwrap();
///
/// cache.set(0, Deferred::new().promise());
/// cache.set(1, Deferred::new().promise());
/// cache.get(&0);
/// // Key 1 was never read, so it makes room for key 2.
/// cache.set(2, Deferred::new().promise());
///
/// assert!(cache.contains_key(&0));
/// assert!(!cache.contains_key(&1));
/// assert_eq!(cache.len(), 2);
/// ```
pub struct PromiseCache<K, T, E> {
    shared: Arc<Shared<K, T, E>>,
}

/// Configures a [`PromiseCache`].
pub struct PromiseCacheBuilder<K, T, E> {
    eviction: Option<Eviction<K>>,
    capacity: Option<usize>,
    evict_rate: usize,
    expire_after: Option<Duration>,
    on_discarded: Option<DiscardedHook<K, T, E>>,
    on_fail: Option<FailHook<K, T, E>>,
    entries: Vec<(K, Promise<T, E>)>,
}

impl<K, T, E> PromiseCacheBuilder<K, T, E>
where
    K: Key,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// The policy choosing which entries to evict.
    pub fn eviction(mut self, eviction: Eviction<K>) -> Self {
        self.eviction = Some(eviction);
        self
    }

    /// The maximum number of entries. Requires an eviction policy.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// How many entries to evict at once when the capacity is exceeded.
    /// Defaults to `1`; `0` is treated as `1`.
    pub fn evict_rate(mut self, evict_rate: usize) -> Self {
        self.evict_rate = evict_rate.max(1);
        self
    }

    /// Default expiry for stored entries.
    pub fn expire_after(mut self, duration: Duration) -> Self {
        self.expire_after = Some(duration);
        self
    }

    /// Default hook called with the key and stored promise when an entry
    /// leaves the cache.
    pub fn on_discarded(mut self, hook: impl Fn(&K, &Promise<T, E>) + Send + Sync + 'static) -> Self {
        self.on_discarded = Some(Arc::new(hook));
        self
    }

    /// Default hook intercepting rejected promises.
    ///
    /// With a fail hook, the cache stores a promise of its own in place of the
    /// one passed to [`set`](PromiseCache::set). It resolves along with the
    /// original; if the original is rejected, the hook receives the deferred
    /// behind the stored promise, the key and the original promise, and decides
    /// the outcome. The entry stays cached either way.
    pub fn on_fail(
        mut self,
        hook: impl Fn(Deferred<T, E>, &K, &Promise<T, E>) + Send + Sync + 'static,
    ) -> Self {
        self.on_fail = Some(Arc::new(hook));
        self
    }

    /// Entries stored right after the cache is built, in iteration order.
    pub fn entries(mut self, entries: impl IntoIterator<Item = (K, Promise<T, E>)>) -> Self {
        self.entries.extend(entries);
        self
    }

    /// Builds the cache.
    ///
    /// Fails if the capacity is zero, or if a capacity is set without an
    /// eviction policy to enforce it.
    pub fn build(self) -> Result<PromiseCache<K, T, E>, ConfigurationError> {
        match (self.capacity, &self.eviction) {
            (Some(0), _) => return Err(ConfigurationError::ZeroCapacity),
            (Some(capacity), None) => {
                return Err(ConfigurationError::CapacityWithoutEviction { capacity });
            }
            _ => {}
        }

        let cache = PromiseCache {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries: HashMap::with_capacity(self.capacity.unwrap_or(16).min(1024)),
                    policy: self.eviction.map(Eviction::into_policy),
                    next_generation: 0,
                }),
                capacity: self.capacity,
                evict_rate: self.evict_rate,
                expire_after: self.expire_after,
                on_discarded: self.on_discarded,
                on_fail: self.on_fail,
            }),
        };
        for (key, promise) in self.entries {
            cache.set(key, promise);
        }
        Ok(cache)
    }
}

impl<K, T, E> PromiseCache<K, T, E>
where
    K: Key,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates an unbounded cache without expiry or hooks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries: HashMap::with_capacity(16),
                    policy: None,
                    next_generation: 0,
                }),
                capacity: None,
                evict_rate: 1,
                expire_after: None,
                on_discarded: None,
                on_fail: None,
            }),
        }
    }

    #[must_use]
    pub fn builder() -> PromiseCacheBuilder<K, T, E> {
        PromiseCacheBuilder {
            eviction: None,
            capacity: None,
            evict_rate: 1,
            expire_after: None,
            on_discarded: None,
            on_fail: None,
            entries: Vec::new(),
        }
    }

    /// Stores `promise` under `key` with the cache-wide settings.
    ///
    /// See [`set_with`](PromiseCache::set_with).
    pub fn set(&self, key: K, promise: Promise<T, E>) -> Promise<T, E> {
        self.set_with(key, promise, EntryOptions::new())
    }

    /// Stores `promise` under `key`, overriding the cache-wide settings with
    /// `options`, and returns the promise actually stored.
    ///
    /// If `key` is new and the cache is full, the eviction policy first removes
    /// `evict_rate` entries. Overwriting an existing key evicts nothing and does
    /// not report the replaced entry as discarded.
    ///
    /// Without a fail hook the original promise is stored, and its rejection
    /// removes the entry as long as it has not been replaced in the meantime.
    /// With a fail hook the stored promise is an interceptor, see
    /// [`PromiseCacheBuilder::on_fail`].
    pub fn set_with(
        &self,
        key: K,
        promise: Promise<T, E>,
        options: EntryOptions<K, T, E>,
    ) -> Promise<T, E> {
        let shared = &self.shared;
        let fail = options.on_fail.or_else(|| shared.on_fail.clone());
        let discarded = options.on_discarded.or_else(|| shared.on_discarded.clone());
        let expire_after = options.expire_after.or(shared.expire_after);

        let interceptor = fail.as_ref().map(|_| Deferred::new());
        let stored = interceptor
            .as_ref()
            .map_or_else(|| promise.clone(), Deferred::promise);

        let (generation, replaced, evicted) = {
            let mut state = lock(&shared.state);
            let mut evicted = Vec::new();
            if let Some(capacity) = shared.capacity
                && !state.entries.contains_key(&key)
                && state.entries.len() >= capacity
            {
                evicted = state.evict(shared.evict_rate);
            }

            let generation = state.next_generation;
            state.next_generation += 1;
            let expiry = expire_after.map(|duration| {
                let weak = Arc::downgrade(shared);
                let key = key.clone();
                Timer::start(duration, move || {
                    if let Some(shared) = weak.upgrade()
                        && shared.remove_if_current(&key, generation)
                    {
                        trace!("cache entry expired");
                    }
                })
            });
            let replaced = state.entries.insert(
                key.clone(),
                Entry {
                    promise: stored.clone(),
                    generation,
                    discarded,
                    expiry,
                },
            );
            if let Some(policy) = state.policy.as_mut() {
                policy.on_insert(&key);
            }
            (generation, replaced, evicted)
        };

        if let Some(Entry {
            expiry: Some(expiry),
            ..
        }) = replaced
        {
            expiry.cancel();
        }
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "cache over capacity");
        }
        for (key, entry) in evicted {
            shared.discard(&key, entry);
        }

        match (interceptor, fail) {
            (Some(interceptor), Some(fail)) => {
                let original = promise.downgrade();
                promise.on_settled(move |outcome| match outcome {
                    Ok(value) => interceptor.resolve(value.clone()),
                    Err(_) => {
                        if let Some(original) = original.upgrade() {
                            trace!("intercepting rejected cache entry");
                            fail(interceptor, &key, &original);
                        }
                    }
                });
            }
            _ => {
                let weak = Arc::downgrade(shared);
                promise.on_failure(move |_| {
                    if let Some(shared) = weak.upgrade()
                        && shared.remove_if_current(&key, generation)
                    {
                        trace!("removed rejected cache entry");
                    }
                });
            }
        }
        stored
    }

    /// Returns the promise stored under `key` and records the access with the
    /// eviction policy.
    pub fn get(&self, key: &K) -> Option<Promise<T, E>> {
        let mut guard = lock(&self.shared.state);
        let state = &mut *guard;
        let promise = state.entries.get(key)?.promise.clone();
        if let Some(policy) = state.policy.as_mut() {
            policy.on_access(key);
        }
        Some(promise)
    }

    /// Removes the entry under `key`, reports it as discarded and returns its
    /// promise.
    pub fn remove(&self, key: &K) -> Option<Promise<T, E>> {
        let entry = lock(&self.shared.state).take(key)?;
        let promise = entry.promise.clone();
        self.shared.discard(key, entry);
        Some(promise)
    }

    /// Lets the eviction policy remove up to `n` entries, and returns their keys.
    ///
    /// Does nothing without an eviction policy.
    pub fn evict(&self, n: usize) -> Vec<K> {
        let evicted = lock(&self.shared.state).evict(n);
        let mut keys = Vec::with_capacity(evicted.len());
        for (key, entry) in evicted {
            self.shared.discard(&key, entry);
            keys.push(key);
        }
        keys
    }

    /// A copy of the current key to promise bindings.
    #[must_use]
    pub fn promises(&self) -> HashMap<K, Promise<T, E>> {
        lock(&self.shared.state)
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.promise.clone()))
            .collect()
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        lock(&self.shared.state).entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.shared.state).entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.shared.state).entries.is_empty()
    }

    /// The configured capacity, `None` if unbounded.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }
}

impl<K, T, E> Default for PromiseCache<K, T, E>
where
    K: Key,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
