//! Defines the `Promise` and `Deferred` types.
//!
//! A `Promise` is a shared handle to a value that will be settled exactly once,
//! either with a success payload or with an error. The right to settle it lives
//! in a `Deferred`, created together with the promise by [`Deferred::new`].
//!
//! Consumers observe a promise in one of two ways:
//! - by registering a continuation with [`Promise::on_settled`], which runs on the
//!   thread that settles the promise (or immediately if it is already settled);
//! - by `.await`ing it, since `Promise` implements [`Future`] on any executor.
//!
//! Only the first settlement is effective. Later calls to `resolve`, `reject` or
//! `settle` are silently ignored, so several racing producers can share one
//! `Deferred` without coordination.
//!
//! Settling a promise from inside a continuation does not recurse: the nested
//! settlement is queued on the current thread and its continuations run once
//! the outer ones are done. Chains of any length settle in constant stack
//! depth.
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    future::Future,
    mem,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    task::{Context, Poll, Waker, ready},
};

use pin_project_lite::pin_project;

use crate::timing::thread_pool;

type Continuation<T, E> = Box<dyn FnOnce(&Result<T, E>) + Send>;
type Job = Box<dyn FnOnce()>;

thread_local! {
    // `Some` while this thread runs continuations; nested settlements wait here.
    static PENDING: RefCell<Option<VecDeque<Job>>> = const { RefCell::new(None) };
}

// Runs `job` right away, unless this thread is already running continuations,
// in which case it is queued behind them. The outermost call drains the queue.
fn run_or_defer(job: Job) {
    let job = PENDING.with_borrow_mut(|pending| {
        if let Some(queue) = pending.as_mut() {
            queue.push_back(job);
            return None;
        }
        *pending = Some(VecDeque::new());
        Some(job)
    });
    let Some(job) = job else {
        return;
    };

    let _drain = Drain;
    job();
    while let Some(next) =
        PENDING.with_borrow_mut(|pending| pending.as_mut().and_then(VecDeque::pop_front))
    {
        next();
    }
}

// Closes the drain, also when a continuation panics.
struct Drain;

impl Drop for Drain {
    fn drop(&mut self) {
        // Leftovers are dropped outside the borrow, their captures may settle.
        let leftover = PENDING.with_borrow_mut(Option::take);
        drop(leftover);
    }
}

enum State<T, E> {
    Pending {
        continuations: Vec<Continuation<T, E>>,
        wakers: Vec<Waker>,
    },
    Settled(Result<T, E>),
}

struct Shared<T, E> {
    state: Mutex<State<T, E>>,
}

// Every component keeps its invariants intact before calling out to user code,
// so a panic in a continuation never leaves half-updated state behind a
// poisoned lock.
pub(crate) fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A settle-once value shared between a producer and any number of consumers.
///
/// Cloning a `Promise` produces another handle to the same underlying value;
/// [`Promise::ptr_eq`] compares that identity.
pub struct Promise<T, E> {
    shared: Arc<Shared<T, E>>,
}

/// A non-owning handle to a promise, used by continuations that must refer back
/// to the promise they are registered on.
pub(crate) struct WeakPromise<T, E> {
    shared: Weak<Shared<T, E>>,
}

impl<T, E> WeakPromise<T, E> {
    pub(crate) fn upgrade(&self) -> Option<Promise<T, E>> {
        self.shared.upgrade().map(|shared| Promise { shared })
    }
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> Promise<T, E> {
    fn pending() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending {
                    continuations: Vec::new(),
                    wakers: Vec::new(),
                }),
            }),
        }
    }

    fn settled(outcome: Result<T, E>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Settled(outcome)),
            }),
        }
    }

    /// Returns `true` if both handles refer to the same promise.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.shared, &other.shared)
    }

    /// Returns `true` while the promise has not been settled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(*lock(&self.shared.state), State::Pending { .. })
    }

    pub(crate) fn downgrade(&self) -> WeakPromise<T, E> {
        WeakPromise {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a promise that is already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        Self::settled(Ok(value))
    }

    /// Creates a promise that is already rejected with `error`.
    pub fn rejected(error: E) -> Self {
        Self::settled(Err(error))
    }

    /// Drives `future` to completion on the shared thread pool and exposes its
    /// result as a promise.
    ///
    /// The future must not depend on executor-specific facilities (for example
    /// `tokio::time::sleep()`), since it is polled outside of any runtime.
    /// A more convenient way to call this is via the
    /// [`into_promise()`](../promise_ext/trait.IntoPromise.html#method.into_promise) operator.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let deferred = Deferred::new();
        let promise = deferred.promise();
        thread_pool().spawn_ok(Settle { future, deferred });
        promise
    }

    /// Returns a copy of the outcome if the promise has been settled.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<T, E>> {
        match &*lock(&self.shared.state) {
            State::Settled(outcome) => Some(outcome.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Registers a continuation that receives the outcome of this promise.
    ///
    /// If the promise is still pending, `continuation` runs on the thread that
    /// eventually settles it, right after the settlement. If the promise is
    /// already settled, `continuation` runs immediately on the calling thread,
    /// or, when called from within another continuation, as soon as that
    /// thread's queued continuations have run. Continuations run in
    /// registration order and never while an internal lock is held, so they
    /// are free to call back into this promise.
    pub fn on_settled<F>(&self, continuation: F)
    where
        F: FnOnce(&Result<T, E>) + Send + 'static,
    {
        let mut state = lock(&self.shared.state);
        match &mut *state {
            State::Pending { continuations, .. } => continuations.push(Box::new(continuation)),
            State::Settled(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                run_or_defer(Box::new(move || continuation(&outcome)));
            }
        }
    }

    /// Registers a continuation that only runs if the promise resolves.
    pub fn on_success<F>(&self, continuation: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.on_settled(move |outcome| {
            if let Ok(value) = outcome {
                continuation(value);
            }
        });
    }

    /// Registers a continuation that only runs if the promise is rejected.
    pub fn on_failure<F>(&self, continuation: F)
    where
        F: FnOnce(&E) + Send + 'static,
    {
        self.on_settled(move |outcome| {
            if let Err(error) = outcome {
                continuation(error);
            }
        });
    }

    /// Settles `target` with this promise's outcome once it is known.
    ///
    /// Since a deferred honours only its first settlement, piping into a
    /// deferred that something else settles first is a no-op.
    pub fn pipe(&self, target: &Deferred<T, E>) {
        let target = target.clone();
        self.on_settled(move |outcome| target.settle(outcome.clone()));
    }
}

impl<T, E> Future for Promise<T, E>
where
    T: Clone,
    E: Clone,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock(&self.shared.state);
        match &mut *state {
            State::Settled(outcome) => Poll::Ready(outcome.clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// The settling side of a [`Promise`].
///
/// A `Deferred` can be cloned and handed to several producers; whichever
/// settles it first decides the outcome and every later attempt is ignored.
pub struct Deferred<T, E> {
    promise: Promise<T, E>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T, E> Deferred<T, E> {
    /// Creates a pending promise together with the capability to settle it.
    #[must_use]
    pub fn new() -> Self {
        Self {
            promise: Promise::pending(),
        }
    }

    /// Returns the promise controlled by this deferred.
    #[must_use]
    pub fn promise(&self) -> Promise<T, E> {
        self.promise.clone()
    }

    /// Returns `true` once the promise has been resolved or rejected.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !self.promise.is_pending()
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Resolves the promise with `value` unless it is already settled.
    pub fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    /// Rejects the promise with `error` unless it is already settled.
    pub fn reject(&self, error: E) {
        self.settle(Err(error));
    }

    /// Settles the promise with `outcome` unless it is already settled.
    ///
    /// Registered continuations run on the calling thread before this returns,
    /// and before any task awaiting the promise is woken. Called from within a
    /// continuation, the settlement takes effect immediately but its
    /// continuations are queued until the running ones are done.
    pub fn settle(&self, outcome: Result<T, E>) {
        let mut state = lock(&self.promise.shared.state);
        if matches!(*state, State::Settled(_)) {
            return;
        }
        let previous = mem::replace(&mut *state, State::Settled(outcome.clone()));
        drop(state);

        let State::Pending {
            continuations,
            wakers,
        } = previous
        else {
            return;
        };
        if continuations.is_empty() && wakers.is_empty() {
            return;
        }
        run_or_defer(Box::new(move || {
            // Awaiting tasks resume after every continuation has observed the outcome.
            for continuation in continuations {
                continuation(&outcome);
            }
            for waker in wakers {
                waker.wake();
            }
        }));
    }
}

impl<T, E> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.is_settled())
            .finish()
    }
}

pin_project! {
    // Polls a future on the thread pool and settles the deferred with its output.
    #[must_use = "futures do nothing unless polled or .awaited"]
    struct Settle<F, T, E> {
        #[pin]
        future: F,
        deferred: Deferred<T, E>,
    }
}

impl<F, T, E> Future for Settle<F, T, E>
where
    F: Future<Output = Result<T, E>>,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let outcome = ready!(this.future.poll(cx));
        this.deferred.settle(outcome);
        Poll::Ready(())
    }
}
