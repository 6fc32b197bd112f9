//! Defines `Sequence`, a strictly linear chain of asynchronous steps.
//!
//! Each pushed step starts once the previous one has settled, so the order of
//! the push calls is the order of execution. A step receives a [`Deferred`] to
//! settle whenever its work is done, together with the previous step's value.
//! When a step is rejected, the following steps are rejected in turn until one
//! with a fallback picks up the error.
//!
//! Besides plain actions, a sequence can wait for a promise it did not start,
//! run synchronous functions, race a timeout against the step before it, and
//! run an action once nothing else is queued.
use std::{
    mem,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use tracing::{debug, trace};

use crate::{Deferred, Promise, Timer, promise::lock};

type Action<T, E> = Box<dyn FnOnce(Deferred<T, E>, T) + Send>;
type Fallback<T, E> = Box<dyn FnOnce(Deferred<T, E>, E) + Send>;

/// Values a step may return besides settling its deferred directly.
///
/// A returned promise is piped into the step's deferred. Whichever settles the
/// deferred first wins, the other is ignored.
pub trait StepResult<T, E> {
    fn pipe_into(self, deferred: &Deferred<T, E>);
}

impl<T, E> StepResult<T, E> for () {
    fn pipe_into(self, _deferred: &Deferred<T, E>) {}
}

impl<T, E> StepResult<T, E> for Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn pipe_into(self, deferred: &Deferred<T, E>) {
        self.pipe(deferred);
    }
}

impl<T, E> StepResult<T, E> for Option<Promise<T, E>>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn pipe_into(self, deferred: &Deferred<T, E>) {
        if let Some(promise) = self {
            promise.pipe(deferred);
        }
    }
}

fn boxed_action<T, E, F, R>(action: F) -> Action<T, E>
where
    T: 'static,
    E: 'static,
    F: FnOnce(Deferred<T, E>, T) -> R + Send + 'static,
    R: StepResult<T, E>,
{
    Box::new(move |deferred: Deferred<T, E>, value: T| {
        action(deferred.clone(), value).pipe_into(&deferred)
    })
}

fn boxed_fallback<T, E, F, R>(fallback: F) -> Fallback<T, E>
where
    T: 'static,
    E: 'static,
    F: FnOnce(Deferred<T, E>, E) -> R + Send + 'static,
    R: StepResult<T, E>,
{
    Box::new(move |deferred: Deferred<T, E>, error: E| {
        fallback(deferred.clone(), error).pipe_into(&deferred)
    })
}

enum StepKind<T, E> {
    Action {
        action: Action<T, E>,
        fallback: Option<Fallback<T, E>>,
    },
    Promise(Promise<T, E>),
    Timeout {
        handler: Box<dyn FnOnce(Deferred<T, E>) + Send>,
        duration: Duration,
    },
    WhenEmpty {
        action: Action<T, E>,
        fallback: Option<Fallback<T, E>>,
    },
}

/// A step description, for building a sequence from a list.
///
/// # Example
/// ```
/// # use orderly::{Sequence, Step};
/// #
/// let sequence = Sequence::<u32, String>::from_steps([
///     Step::action(|deferred, _| deferred.reject("offline".to_string())),
///     Step::action_with_fallback(
///         |deferred, value| deferred.resolve(value),
///         |deferred, _| deferred.resolve(7),
///     ),
///     Step::synchronous(|value: u32| value * 6),
/// ]);
/// assert_eq!(sequence.promise().outcome(), Some(Ok(42)));
/// ```
pub struct Step<T, E>(StepKind<T, E>);

impl<T, E> Step<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// See [`Sequence::push`].
    pub fn action<R: StepResult<T, E>>(
        action: impl FnOnce(Deferred<T, E>, T) -> R + Send + 'static,
    ) -> Self {
        Step(StepKind::Action {
            action: boxed_action(action),
            fallback: None,
        })
    }

    /// See [`Sequence::push_with_fallback`].
    pub fn action_with_fallback<R1, R2>(
        action: impl FnOnce(Deferred<T, E>, T) -> R1 + Send + 'static,
        fallback: impl FnOnce(Deferred<T, E>, E) -> R2 + Send + 'static,
    ) -> Self
    where
        R1: StepResult<T, E>,
        R2: StepResult<T, E>,
    {
        Step(StepKind::Action {
            action: boxed_action(action),
            fallback: Some(boxed_fallback(fallback)),
        })
    }

    /// See [`Sequence::push_promise`].
    pub fn promise(promise: Promise<T, E>) -> Self {
        Step(StepKind::Promise(promise))
    }

    /// See [`Sequence::push_synchronous`].
    pub fn synchronous(action: impl FnOnce(T) -> T + Send + 'static) -> Self {
        Step(StepKind::Action {
            action: Box::new(move |deferred: Deferred<T, E>, value: T| {
                deferred.resolve(action(value))
            }),
            fallback: None,
        })
    }

    /// See [`Sequence::push_synchronous_with_fallback`].
    pub fn synchronous_with_fallback(
        action: impl FnOnce(T) -> T + Send + 'static,
        fallback: impl FnOnce(E) -> T + Send + 'static,
    ) -> Self {
        Step(StepKind::Action {
            action: Box::new(move |deferred: Deferred<T, E>, value: T| {
                deferred.resolve(action(value))
            }),
            fallback: Some(Box::new(move |deferred: Deferred<T, E>, error: E| {
                deferred.resolve(fallback(error))
            })),
        })
    }

    /// See [`Sequence::set_timeout`].
    pub fn timeout<R: StepResult<T, E>>(
        handler: impl FnOnce(Deferred<T, E>) -> R + Send + 'static,
        duration: Duration,
    ) -> Self {
        Step(StepKind::Timeout {
            handler: Box::new(move |deferred: Deferred<T, E>| {
                handler(deferred.clone()).pipe_into(&deferred)
            }),
            duration,
        })
    }

    /// See [`Sequence::when_empty`].
    pub fn when_empty<R: StepResult<T, E>>(
        action: impl FnOnce(Deferred<T, E>, T) -> R + Send + 'static,
    ) -> Self {
        Step(StepKind::WhenEmpty {
            action: boxed_action(action),
            fallback: None,
        })
    }

    /// See [`Sequence::when_empty_with_fallback`].
    pub fn when_empty_with_fallback<R1, R2>(
        action: impl FnOnce(Deferred<T, E>, T) -> R1 + Send + 'static,
        fallback: impl FnOnce(Deferred<T, E>, E) -> R2 + Send + 'static,
    ) -> Self
    where
        R1: StepResult<T, E>,
        R2: StepResult<T, E>,
    {
        Step(StepKind::WhenEmpty {
            action: boxed_action(action),
            fallback: Some(boxed_fallback(fallback)),
        })
    }
}

struct State<T, E> {
    tail: Promise<T, E>,
    // Bumped every time the tail is replaced.
    generation: u64,
}

struct Shared<T, E> {
    state: Mutex<State<T, E>>,
}

/// A chain of steps executed one after the other.
///
/// # Example
/// ```
/// # use orderly::{Deferred, Sequence};
/// #
/// let pending = Deferred::new();
/// let sequence = Sequence::<u32, ()>::new();
/// sequence
///     .push_promise(pending.promise())
///     .push(|deferred, value| deferred.resolve(value + 1));
///
/// assert!(sequence.promise().is_pending());
/// pending.resolve(41);
/// assert_eq!(sequence.promise().outcome(), Some(Ok(42)));
/// ```
pub struct Sequence<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Sequence<T, E>
where
    T: Clone + Default + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates an empty sequence, seeded with `T::default()`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(T::default())
    }

    /// Creates a sequence and pushes `steps` in order.
    pub fn from_steps(steps: impl IntoIterator<Item = Step<T, E>>) -> Self {
        let sequence = Self::new();
        for step in steps {
            sequence.push_step(step);
        }
        sequence
    }
}

impl<T, E> Sequence<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates an empty sequence whose first step receives `seed`.
    pub fn with_seed(seed: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    tail: Promise::resolved(seed),
                    generation: 0,
                }),
            }),
        }
    }

    /// Appends an action, run with the previous step's value once it resolves.
    ///
    /// The action settles the deferred it receives, or returns a promise that
    /// settles it. If the previous step is rejected, the action is skipped and
    /// the rejection passes on.
    pub fn push<R: StepResult<T, E>>(
        &self,
        action: impl FnOnce(Deferred<T, E>, T) -> R + Send + 'static,
    ) -> &Self {
        self.chain(boxed_action(action), None)
    }

    /// Appends an action, and a fallback run with the error instead if the
    /// previous step is rejected.
    pub fn push_with_fallback<R1, R2>(
        &self,
        action: impl FnOnce(Deferred<T, E>, T) -> R1 + Send + 'static,
        fallback: impl FnOnce(Deferred<T, E>, E) -> R2 + Send + 'static,
    ) -> &Self
    where
        R1: StepResult<T, E>,
        R2: StepResult<T, E>,
    {
        self.chain(boxed_action(action), Some(boxed_fallback(fallback)))
    }

    /// Appends a promise started elsewhere.
    ///
    /// The step settles with the promise's outcome, but never before the
    /// previous step has settled. If the previous step is rejected, the step
    /// still waits for the promise and then passes the rejection on.
    pub fn push_promise(&self, promise: Promise<T, E>) -> &Self {
        let deferred = Deferred::new();
        let previous = self.replace_tail(deferred.promise());
        previous.on_settled(move |outcome| match outcome {
            Ok(_) => promise.pipe(&deferred),
            Err(error) => {
                let error = error.clone();
                promise.on_settled(move |_| deferred.reject(error));
            }
        });
        self
    }

    /// Appends a synchronous function whose return value resolves the step.
    ///
    /// A synchronous step cannot reject the sequence. Without a fallback, a
    /// rejection of the previous step passes through it untouched.
    pub fn push_synchronous(&self, action: impl FnOnce(T) -> T + Send + 'static) -> &Self {
        self.push_step(Step::synchronous(action))
    }

    /// Appends a synchronous function, and a synchronous fallback that turns a
    /// rejection of the previous step back into a value.
    pub fn push_synchronous_with_fallback(
        &self,
        action: impl FnOnce(T) -> T + Send + 'static,
        fallback: impl FnOnce(E) -> T + Send + 'static,
    ) -> &Self {
        self.push_step(Step::synchronous_with_fallback(action, fallback))
    }

    /// Races a timer against the current end of the sequence.
    ///
    /// If the previous step settles within `duration`, its outcome passes
    /// through and `handler` never runs. Otherwise `handler` runs with the
    /// step's deferred as if it were a regular action, and the late outcome of
    /// the previous step is ignored.
    pub fn set_timeout<R: StepResult<T, E>>(
        &self,
        handler: impl FnOnce(Deferred<T, E>) -> R + Send + 'static,
        duration: Duration,
    ) -> &Self {
        self.push_step(Step::timeout(handler, duration))
    }

    /// Runs `action` once the sequence has nothing left to execute.
    ///
    /// Steps pushed before the sequence drains run first; the action then
    /// becomes the new end of the sequence. It runs at most once, and never if
    /// steps keep being pushed. If the last step is rejected, the rejection
    /// passes on without running the action.
    pub fn when_empty<R: StepResult<T, E>>(
        &self,
        action: impl FnOnce(Deferred<T, E>, T) -> R + Send + 'static,
    ) -> &Self {
        self.push_step(Step::when_empty(action))
    }

    /// Like [`when_empty`](Sequence::when_empty), with a fallback run if the
    /// last step is rejected.
    pub fn when_empty_with_fallback<R1, R2>(
        &self,
        action: impl FnOnce(Deferred<T, E>, T) -> R1 + Send + 'static,
        fallback: impl FnOnce(Deferred<T, E>, E) -> R2 + Send + 'static,
    ) -> &Self
    where
        R1: StepResult<T, E>,
        R2: StepResult<T, E>,
    {
        self.push_step(Step::when_empty_with_fallback(action, fallback))
    }

    /// Appends a step described by a [`Step`].
    pub fn push_step(&self, step: Step<T, E>) -> &Self {
        match step.0 {
            StepKind::Action { action, fallback } => self.chain(action, fallback),
            StepKind::Promise(promise) => self.push_promise(promise),
            StepKind::Timeout { handler, duration } => self.timeout(handler, duration),
            StepKind::WhenEmpty { action, fallback } => {
                let (tail, generation) = {
                    let state = lock(&self.shared.state);
                    (state.tail.clone(), state.generation)
                };
                watch(Arc::downgrade(&self.shared), &tail, generation, action, fallback);
                self
            }
        }
    }

    /// The promise of the last step currently in the sequence.
    #[must_use]
    pub fn promise(&self) -> Promise<T, E> {
        lock(&self.shared.state).tail.clone()
    }

    fn replace_tail(&self, tail: Promise<T, E>) -> Promise<T, E> {
        let mut state = lock(&self.shared.state);
        state.generation += 1;
        mem::replace(&mut state.tail, tail)
    }

    fn chain(&self, action: Action<T, E>, fallback: Option<Fallback<T, E>>) -> &Self {
        let deferred = Deferred::new();
        let previous = self.replace_tail(deferred.promise());
        previous.on_settled(move |outcome| advance(deferred, outcome, action, fallback));
        self
    }

    fn timeout(
        &self,
        handler: Box<dyn FnOnce(Deferred<T, E>) + Send>,
        duration: Duration,
    ) -> &Self {
        let deferred = Deferred::new();
        let previous = self.replace_tail(deferred.promise());
        let timer = {
            let deferred = deferred.clone();
            Timer::start(duration, move || {
                debug!(?duration, "sequence timeout fired");
                handler(deferred);
            })
        };
        previous.on_settled(move |outcome| {
            if timer.cancel() {
                deferred.settle(outcome.clone());
            } else {
                trace!("step settled after its timeout");
            }
        });
        self
    }
}

impl<T, E> Default for Sequence<T, E>
where
    T: Clone + Default + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn advance<T, E>(
    deferred: Deferred<T, E>,
    outcome: &Result<T, E>,
    action: Action<T, E>,
    fallback: Option<Fallback<T, E>>,
) where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    match outcome {
        Ok(value) => action(deferred, value.clone()),
        Err(error) => match fallback {
            Some(fallback) => fallback(deferred, error.clone()),
            None => deferred.reject(error.clone()),
        },
    }
}

// Waits for `observed` to settle, then runs the action if `observed` is still
// the end of the sequence, or starts waiting on the new end otherwise.
fn watch<T, E>(
    shared: Weak<Shared<T, E>>,
    observed: &Promise<T, E>,
    generation: u64,
    action: Action<T, E>,
    fallback: Option<Fallback<T, E>>,
) where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    observed.on_settled(move |outcome| {
        let deferred = Deferred::new();
        let newer = match shared.upgrade() {
            Some(strong) => {
                let mut state = lock(&strong.state);
                if state.generation == generation {
                    state.tail = deferred.promise();
                    state.generation += 1;
                    None
                } else {
                    Some((state.tail.clone(), state.generation))
                }
            }
            // Nothing can be pushed anymore, so the sequence stays empty.
            None => None,
        };
        match newer {
            Some((tail, generation)) => {
                trace!("sequence grew, waiting again");
                watch(shared, &tail, generation, action, fallback);
            }
            None => advance(deferred, outcome, action, fallback),
        }
    });
}
