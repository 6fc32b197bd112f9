//! Defines the `LastAction` serializer.
//!
//! `LastAction` accepts actions (functions that return promises) and executes at
//! most one of them at a time. While an action is in flight, newly pushed actions
//! wait in a single slot: each push replaces the previous occupant, which is
//! dropped without running. When the in-flight action completes, the newest
//! waiting action runs next and receives the completed action's outcome.
//!
//! This is a client side way of keeping the effects of requests in order. More
//! network efficient solutions need server collaboration (sequence numbers,
//! acknowledgements...), which is out of reach here.
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::{ActionError, Deferred, Promise, promise::lock};

/// A unit of asynchronous work as accepted by [`LastAction`].
///
/// The argument is the outcome of the previously executed action, or `None` if
/// nothing has completed yet.
pub type ActionFn<T, E> = Arc<dyn Fn(Option<Result<T, E>>) -> Promise<T, E> + Send + Sync>;

type Hook<V> = Arc<dyn Fn(&V) + Send + Sync>;

struct Job<T, E> {
    action: ActionFn<T, E>,
    retries: usize,
    deferred: Deferred<T, ActionError<E>>,
    // Outcome of a superseded action, handed straight to this one.
    handoff: Option<Result<T, E>>,
}

struct State<T, E> {
    // An action is executing (or about to be, from the trampoline slot).
    busy: bool,
    // The newest push that arrived while busy.
    waiting: Option<Job<T, E>>,
    // Set while `drive` is on some stack; jobs that become runnable meanwhile are
    // parked in `ready` instead of recursing.
    driving: bool,
    ready: Option<Job<T, E>>,
    last_response: Option<Result<T, E>>,
    last_action: Option<ActionFn<T, E>>,
}

struct Shared<T, E> {
    state: Mutex<State<T, E>>,
    on_complete: Option<Hook<T>>,
    on_error: Option<Hook<E>>,
    retries: usize,
}

/// Executes only the latest pushed action, one at a time.
///
/// # Example
/// ```
/// # use orderly::{Deferred, LastAction, Promise};
/// #
/// let actions = LastAction::<&str, &str>::new();
/// let first = Deferred::new();
/// let in_flight = first.promise();
///
/// actions.push(move |_| in_flight.clone());
/// // Superseded by the third push before it gets to run.
/// let dropped = actions.push(|_| Promise::resolved("never"));
/// let last = actions.push(|previous| match previous {
///     Some(Ok(value)) => Promise::resolved(value),
///     _ => Promise::rejected("no input"),
/// });
///
/// first.resolve("first");
/// assert!(dropped.outcome().unwrap().unwrap_err().is_superseded());
/// assert_eq!(last.outcome(), Some(Ok("first")));
/// ```
pub struct LastAction<T, E> {
    shared: Arc<Shared<T, E>>,
}

/// Configures a [`LastAction`].
pub struct LastActionBuilder<T, E> {
    on_complete: Option<Hook<T>>,
    on_error: Option<Hook<E>>,
    retries: usize,
}

impl<T, E> LastActionBuilder<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Callback for an action that resolves while no newer action is waiting.
    pub fn on_complete(mut self, hook: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(hook));
        self
    }

    /// Callback for an action that fails, with its retries used up, while no
    /// newer action is waiting.
    pub fn on_error(mut self, hook: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Default number of retries for each pushed action. Defaults to `0`.
    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn build(self) -> LastAction<T, E> {
        LastAction {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    busy: false,
                    waiting: None,
                    driving: false,
                    ready: None,
                    last_response: None,
                    last_action: None,
                }),
                on_complete: self.on_complete,
                on_error: self.on_error,
                retries: self.retries,
            }),
        }
    }
}

impl<T, E> LastAction<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a serializer with no callbacks and no retries.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> LastActionBuilder<T, E> {
        LastActionBuilder {
            on_complete: None,
            on_error: None,
            retries: 0,
        }
    }

    /// Pushes an action using the default retry count.
    ///
    /// See [`push_with_retries`](LastAction::push_with_retries).
    pub fn push<F>(&self, action: F) -> Promise<T, ActionError<E>>
    where
        F: Fn(Option<Result<T, E>>) -> Promise<T, E> + Send + Sync + 'static,
    {
        self.push_with_retries(action, self.shared.retries)
    }

    /// Pushes an action that is retried up to `retries` times on failure.
    ///
    /// If nothing is executing, the action starts immediately on the calling
    /// thread. Otherwise it takes the waiting slot, and the action that
    /// previously held the slot is dropped: its promise rejects with
    /// [`ActionError::Superseded`] right away.
    ///
    /// The returned promise settles with this push's own outcome. Retries stop
    /// as soon as a newer action is waiting, in which case the promise rejects
    /// with the last failure.
    pub fn push_with_retries<F>(&self, action: F, retries: usize) -> Promise<T, ActionError<E>>
    where
        F: Fn(Option<Result<T, E>>) -> Promise<T, E> + Send + Sync + 'static,
    {
        let action: ActionFn<T, E> = Arc::new(action);
        let deferred = Deferred::new();
        let promise = deferred.promise();
        let job = Job {
            action: Arc::clone(&action),
            retries,
            deferred,
            handoff: None,
        };

        let mut state = lock(&self.shared.state);
        state.last_action = Some(action);
        if state.busy {
            let dropped = state.waiting.replace(job);
            drop(state);
            if let Some(dropped) = dropped {
                debug!("dropping superseded action");
                dropped.deferred.reject(ActionError::Superseded);
            }
        } else {
            state.busy = true;
            drop(state);
            self.shared.drive(job);
        }
        promise
    }

    /// The most recently pushed action, whether or not it has run.
    #[must_use]
    pub fn last_action(&self) -> Option<ActionFn<T, E>> {
        lock(&self.shared.state).last_action.clone()
    }

    /// The outcome of the most recently completed action that no newer push
    /// was waiting on. A superseded action hands its outcome to the waiting
    /// one instead.
    #[must_use]
    pub fn last_response(&self) -> Option<Result<T, E>> {
        lock(&self.shared.state).last_response.clone()
    }

    /// Returns `true` while an action is executing.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        lock(&self.shared.state).busy
    }

    /// Returns `true` if an action is waiting for the executing one to finish.
    #[must_use]
    pub fn has_waiting(&self) -> bool {
        lock(&self.shared.state).waiting.is_some()
    }

    /// The default retry count applied by [`push`](LastAction::push).
    #[must_use]
    pub fn retries(&self) -> usize {
        self.shared.retries
    }
}

impl<T, E> Default for LastAction<T, E>
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
    // Runs `job` and every job that becomes runnable synchronously while it runs,
    // in a loop. Actions that settle immediately (or keep failing immediately
    // through their retries) therefore never grow the stack.
    fn drive(self: &Arc<Self>, job: Job<T, E>) {
        {
            let mut state = lock(&self.state);
            if state.driving {
                state.ready = Some(job);
                return;
            }
            state.driving = true;
        }
        let mut job = job;
        loop {
            self.execute(job);
            let mut state = lock(&self.state);
            match state.ready.take() {
                Some(next) => job = next,
                None => {
                    state.driving = false;
                    return;
                }
            }
        }
    }

    fn execute(self: &Arc<Self>, mut job: Job<T, E>) {
        let input = match job.handoff.take() {
            Some(outcome) => Some(outcome),
            None => lock(&self.state).last_response.clone(),
        };
        let running = (job.action)(input);
        let shared = Arc::clone(self);
        running.on_settled(move |outcome| shared.finished(job, outcome.clone()));
    }

    fn finished(self: &Arc<Self>, mut job: Job<T, E>, outcome: Result<T, E>) {
        let mut state = lock(&self.state);
        if let Some(mut next) = state.waiting.take() {
            drop(state);
            trace!("action finished with a newer one waiting");
            next.handoff = Some(outcome.clone());
            match outcome {
                Ok(value) => job.deferred.resolve(value),
                Err(error) => job.deferred.reject(ActionError::Failed(error)),
            }
            self.drive(next);
            return;
        }

        match outcome {
            Ok(value) => {
                state.last_response = Some(Ok(value.clone()));
                state.busy = false;
                drop(state);
                if let Some(hook) = &self.on_complete {
                    hook(&value);
                }
                job.deferred.resolve(value);
            }
            Err(error) if job.retries > 0 => {
                state.last_response = Some(Err(error));
                job.retries -= 1;
                drop(state);
                debug!(retries_left = job.retries, "retrying failed action");
                self.drive(job);
            }
            Err(error) => {
                state.last_response = Some(Err(error.clone()));
                state.busy = false;
                drop(state);
                if let Some(hook) = &self.on_error {
                    hook(&error);
                }
                job.deferred.reject(ActionError::Failed(error));
            }
        }
    }
}
