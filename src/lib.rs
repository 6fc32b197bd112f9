//! Client-side ordering primitives built on settle-once promises.
//!
//! `orderly` tames the interleaving of asynchronous work when there is no
//! server-side coordination to lean on: no sequence numbers, no acks, only the
//! order in which requests were issued and the order in which they complete.
//!
//! The crate is designed to work independently of any specific async runtime.
//! A [`Promise`] can be awaited from any executor, and it can also be observed
//! through plain continuations registered with [`Promise::on_settled`], which
//! run on whichever thread settles it.
//!
//! Features include:
//! - [`Deferred`] and [`Promise`], the settle-once pair everything else is built on
//! - [`LastAction`], which runs one action at a time, drops superseded actions
//!   and retries failed ones
//! - [`OrderedPromises`], which reports only the freshest completion among
//!   concurrent requests for one resource and discards the stale ones
//! - [`PromiseCache`], a keyed promise store with LRU, MRU or LFU eviction,
//!   expiry, and a failure hook that can recover a rejected promise before any
//!   consumer sees it
//! - [`Sequence`], a strictly linear chain of asynchronous and synchronous
//!   steps with fallbacks, timeouts and "when empty" hooks
//!
//! Every component is an independent state machine; composition happens at the
//! call site.

pub mod cache;
pub mod error;
pub mod eviction;
pub mod last_action;
pub mod ordered;
pub mod promise;
pub mod promise_ext;
pub mod sequence;
pub mod timing;

pub use cache::{EntryOptions, Key, PromiseCache, PromiseCacheBuilder};
pub use error::{ActionError, ConfigurationError};
pub use eviction::{Eviction, EvictionPolicy, Lfu, Lru, Mru};
pub use last_action::{LastAction, LastActionBuilder};
pub use ordered::OrderedPromises;
pub use promise::{Deferred, Promise};
pub use sequence::{Sequence, Step, StepResult};
pub use timing::{Timer, sleep};
