//! Timing utilities for expiry and timeout races.
//!
//! Timers are armed on a single background thread that keeps every pending
//! deadline in a heap. When a deadline passes, its callback is handed to the
//! shared thread pool, so a slow callback never holds up the next deadline.
//!
//! Firing and cancelling a [`Timer`] are mutually exclusive: exactly one of
//! them wins, which is what lets callers act on "the timer did not fire" as a
//! hard guarantee.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    convert::Infallible,
    sync::{
        Arc, Condvar, Mutex, OnceLock, PoisonError,
        atomic::{AtomicU8, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use futures::executor::{ThreadPool, ThreadPoolBuilder};
use tracing::trace;

use crate::{Deferred, Promise, promise::lock};

static THREAD_POOL: OnceLock<ThreadPool> = OnceLock::new();
static DRIVER: OnceLock<Arc<Driver>> = OnceLock::new();

// Roughly thirty years; anything longer is treated as "never" in practice.
const MAX_DELAY: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELED: u8 = 2;

type TimerCallback = Box<dyn FnOnce() + Send>;

pub(crate) fn thread_pool() -> &'static ThreadPool {
    THREAD_POOL.get_or_init(|| {
        ThreadPoolBuilder::new()
            .pool_size(8)
            .name_prefix("orderly-pool-")
            .create()
            .expect("Thread pool creation failed")
    })
}

struct TimerState {
    status: AtomicU8,
    callback: Mutex<Option<TimerCallback>>,
}

impl TimerState {
    fn fire(&self) {
        if self
            .status
            .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let callback = lock(&self.callback).take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn is_armed(&self) -> bool {
        self.status.load(Ordering::Acquire) == ARMED
    }
}

/// A one-shot timer that runs a callback once its duration has elapsed.
///
/// Dropping a `Timer` does **not** cancel it; call [`Timer::cancel`] for that.
pub struct Timer {
    state: Arc<TimerState>,
    deadline: Instant,
}

impl Timer {
    /// Arms a timer that runs `callback` on the shared thread pool after `duration`.
    ///
    /// The countdown starts from the moment this method is called.
    pub fn start(duration: Duration, callback: impl FnOnce() + Send + 'static) -> Self {
        let deadline = Instant::now() + duration.min(MAX_DELAY);
        let state = Arc::new(TimerState {
            status: AtomicU8::new(ARMED),
            callback: Mutex::new(Some(Box::new(callback))),
        });
        driver().arm(deadline, Arc::clone(&state));
        Timer { state, deadline }
    }

    /// Cancels the timer.
    ///
    /// Returns `true` if the callback had not started and now never will, and
    /// `false` if the timer already fired or was already canceled.
    pub fn cancel(&self) -> bool {
        let canceled = self
            .state
            .status
            .compare_exchange(ARMED, CANCELED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if canceled {
            // Release whatever the callback captured right away.
            lock(&self.state.callback).take();
        }
        canceled
    }

    /// Returns `true` once the callback has been started.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.state.status.load(Ordering::Acquire) == FIRED
    }

    /// Returns `true` while the timer can still fire or be canceled.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.state.is_armed()
    }

    /// The instant at which the timer fires.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Returns a promise that resolves after `duration`.
///
/// # Example
/// ```
/// # use std::time::Duration;
/// # use orderly::sleep;
/// #
/// # async {
/// sleep(Duration::from_millis(10)).await.ok();
/// # };
/// ```
pub fn sleep(duration: Duration) -> Promise<(), Infallible> {
    let deferred = Deferred::new();
    let promise = deferred.promise();
    Timer::start(duration, move || deferred.resolve(()));
    promise
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    timer: Arc<TimerState>,
}

// Reversed so that `BinaryHeap` pops the earliest deadline first.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

struct Queue {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
}

struct Driver {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

fn driver() -> &'static Driver {
    DRIVER.get_or_init(|| {
        let driver = Arc::new(Driver {
            queue: Mutex::new(Queue {
                heap: BinaryHeap::with_capacity(16),
                next_seq: 0,
            }),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&driver);
        thread::Builder::new()
            .name("orderly-timer".into())
            .spawn(move || worker.run())
            .expect("Timer thread creation failed");
        driver
    })
}

impl Driver {
    fn arm(&self, deadline: Instant, timer: Arc<TimerState>) {
        let mut queue = lock(&self.queue);
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Scheduled {
            deadline,
            seq,
            timer,
        });
        drop(queue);
        self.wakeup.notify_one();
    }

    fn run(&self) {
        let mut queue = lock(&self.queue);
        loop {
            let now = Instant::now();
            match queue.heap.peek().map(|scheduled| scheduled.deadline) {
                None => {
                    queue = self
                        .wakeup
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) if deadline <= now => {
                    let Some(due) = queue.heap.pop() else {
                        continue;
                    };
                    // Canceled timers are skipped here rather than removed
                    // from the heap when they are canceled.
                    if due.timer.is_armed() {
                        trace!(seq = due.seq, "timer due");
                        let timer = due.timer;
                        thread_pool().spawn_ok(async move { timer.fire() });
                    }
                }
                Some(deadline) => {
                    queue = match self.wakeup.wait_timeout(queue, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }
    }
}
