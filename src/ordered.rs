//! Defines `OrderedPromises`, which keeps the results for one resource in order.
//!
//! The tracker holds the promises issued for a single resource in the order they
//! were pushed. Whenever one of them settles, every older promise that is still
//! tracked is discarded (its result would be stale by the time it arrived), and
//! the settled promise is reported through the `next` callbacks. If it was the
//! newest tracked promise, the `last` callbacks fire as well.
//!
//! The ordering is only kept on the client side, which makes this a good fit for
//! stateless requests. Discarding a promise does not abort the work behind it;
//! the `discarded` callback is the place to do that.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tracing::trace;

use crate::{Promise, promise::lock};

type OutcomeHook<T, E, V> = Arc<dyn Fn(&Promise<T, E>, &V) + Send + Sync>;
type DiscardHook<T, E> = Arc<dyn Fn(&Promise<T, E>) + Send + Sync>;

struct Handlers<T, E> {
    next: Option<OutcomeHook<T, E, T>>,
    next_fail: Option<OutcomeHook<T, E, E>>,
    last: Option<OutcomeHook<T, E, T>>,
    last_fail: Option<OutcomeHook<T, E, E>>,
    discarded: Option<DiscardHook<T, E>>,
}

impl<T, E> Clone for Handlers<T, E> {
    fn clone(&self) -> Self {
        Self {
            next: self.next.clone(),
            next_fail: self.next_fail.clone(),
            last: self.last.clone(),
            last_fail: self.last_fail.clone(),
            discarded: self.discarded.clone(),
        }
    }
}

struct Tracked<T, E> {
    id: u64,
    promise: Promise<T, E>,
}

struct State<T, E> {
    // Insertion order; entries leave from the front once settled or discarded.
    queue: VecDeque<Tracked<T, E>>,
    next_id: u64,
    handlers: Handlers<T, E>,
}

struct Shared<T, E> {
    state: Mutex<State<T, E>>,
}

/// Tracks in-flight promises for one resource and reports only fresh results.
///
/// # Example
/// ```
/// # use std::sync::{Arc, Mutex};
/// # use orderly::{Deferred, OrderedPromises};
/// #
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let seen_cl = Arc::clone(&seen);
///
/// let tracker = OrderedPromises::<u32, ()>::new();
/// tracker.on_next(move |_, value| seen_cl.lock().unwrap().push(*value));
///
/// let older = Deferred::new();
/// let newer = Deferred::new();
/// tracker.push(older.promise()).push(newer.promise());
///
/// newer.resolve(2);
/// // Stale by now, ignored.
/// older.resolve(1);
/// assert_eq!(*seen.lock().unwrap(), vec![2]);
/// ```
pub struct OrderedPromises<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> OrderedPromises<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates an empty tracker with no-op callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::with_capacity(8),
                    next_id: 0,
                    handlers: Handlers {
                        next: None,
                        next_fail: None,
                        last: None,
                        last_fail: None,
                        discarded: None,
                    },
                }),
            }),
        }
    }

    /// Creates a tracker for an initial list of promises.
    ///
    /// Promises that are already settled are processed right away, before any
    /// callback can be registered. Use [`new`](OrderedPromises::new), register
    /// the callbacks, then [`extend`](OrderedPromises::extend) if that matters.
    pub fn with_promises(promises: impl IntoIterator<Item = Promise<T, E>>) -> Self {
        let tracker = Self::new();
        tracker.extend(promises);
        tracker
    }

    /// Adds a promise to the end of the tracked sequence.
    pub fn push(&self, promise: Promise<T, E>) -> &Self {
        let id = {
            let mut state = lock(&self.shared.state);
            let id = state.next_id;
            state.next_id += 1;
            state.queue.push_back(Tracked {
                id,
                promise: promise.clone(),
            });
            id
        };
        let shared = Arc::downgrade(&self.shared);
        let settled = promise.downgrade();
        promise.on_settled(move |outcome| {
            if let (Some(shared), Some(settled)) = (shared.upgrade(), settled.upgrade()) {
                shared.process(id, &settled, outcome);
            }
        });
        self
    }

    /// Adds every promise from `promises`, in iteration order.
    pub fn extend(&self, promises: impl IntoIterator<Item = Promise<T, E>>) -> &Self {
        for promise in promises {
            self.push(promise);
        }
        self
    }

    /// Callback for a promise that resolves while no newer promise has settled.
    ///
    /// Receives the promise and its value. Replaces the previous handler.
    pub fn on_next(&self, handler: impl Fn(&Promise<T, E>, &T) + Send + Sync + 'static) -> &Self {
        lock(&self.shared.state).handlers.next = Some(Arc::new(handler));
        self
    }

    /// Callback for a promise that is rejected while no newer promise has settled.
    pub fn on_next_fail(
        &self,
        handler: impl Fn(&Promise<T, E>, &E) + Send + Sync + 'static,
    ) -> &Self {
        lock(&self.shared.state).handlers.next_fail = Some(Arc::new(handler));
        self
    }

    /// Callback for the newest tracked promise resolving, leaving nothing tracked.
    pub fn on_last(&self, handler: impl Fn(&Promise<T, E>, &T) + Send + Sync + 'static) -> &Self {
        lock(&self.shared.state).handlers.last = Some(Arc::new(handler));
        self
    }

    /// Callback for the newest tracked promise being rejected, leaving nothing tracked.
    pub fn on_last_fail(
        &self,
        handler: impl Fn(&Promise<T, E>, &E) + Send + Sync + 'static,
    ) -> &Self {
        lock(&self.shared.state).handlers.last_fail = Some(Arc::new(handler));
        self
    }

    /// Callback for each older promise discarded because a newer one settled first.
    ///
    /// Useful to release resources or abort the work behind the discarded promise.
    pub fn on_discarded(&self, handler: impl Fn(&Promise<T, E>) + Send + Sync + 'static) -> &Self {
        lock(&self.shared.state).handlers.discarded = Some(Arc::new(handler));
        self
    }

    /// A copy of the promises still tracked: neither settled nor discarded.
    #[must_use]
    pub fn promises(&self) -> Vec<Promise<T, E>> {
        lock(&self.shared.state)
            .queue
            .iter()
            .map(|tracked| tracked.promise.clone())
            .collect()
    }

    /// Number of promises still tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.shared.state).queue.is_empty()
    }
}

impl<T, E> Default for OrderedPromises<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Shared<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn process(&self, id: u64, settled: &Promise<T, E>, outcome: &Result<T, E>) {
        let mut state = lock(&self.state);
        // Not tracked anymore means it was discarded by a newer settlement.
        let Some(position) = state.queue.iter().position(|tracked| tracked.id == id) else {
            return;
        };
        let discarded: Vec<Promise<T, E>> = state
            .queue
            .drain(..=position)
            .take(position)
            .map(|tracked| tracked.promise)
            .collect();
        let was_last = state.queue.is_empty();
        let handlers = state.handlers.clone();
        drop(state);

        for promise in &discarded {
            trace!("discarding stale promise");
            if let Some(handler) = &handlers.discarded {
                handler(promise);
            }
        }
        match outcome {
            Ok(value) => {
                if let Some(handler) = &handlers.next {
                    handler(settled, value);
                }
                if was_last && let Some(handler) = &handlers.last {
                    handler(settled, value);
                }
            }
            Err(error) => {
                if let Some(handler) = &handlers.next_fail {
                    handler(settled, error);
                }
                if was_last && let Some(handler) = &handlers.last_fail {
                    handler(settled, error);
                }
            }
        }
    }
}
