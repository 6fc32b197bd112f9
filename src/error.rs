//! Error types used by the ordering primitives.
//!
//! - [`ConfigurationError`] is returned synchronously when a component is set
//!   up in a way it cannot honour.
//! - [`ActionError`] is what a [`LastAction`](crate::LastAction) push settles
//!   with when its action does not deliver a value.

use thiserror::Error;

/// Invalid component setup, reported when the component is built.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A capacity was configured without an eviction policy to enforce it.
    #[error("capacity {capacity} is set but no eviction policy is configured")]
    CapacityWithoutEviction {
        /// The configured capacity.
        capacity: usize,
    },

    /// A capacity of zero can never hold the entry being inserted.
    #[error("capacity must be greater than zero")]
    ZeroCapacity,

    /// An eviction policy was named that does not exist.
    #[error("unknown eviction policy `{0}`, expected one of `lru`, `mru`, `lfu`")]
    UnknownEviction(String),
}

impl ConfigurationError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigurationError::CapacityWithoutEviction { .. } => "capacity_without_eviction",
            ConfigurationError::ZeroCapacity => "zero_capacity",
            ConfigurationError::UnknownEviction(_) => "unknown_eviction",
        }
    }
}

/// Outcome of a [`LastAction`](crate::LastAction) push that did not resolve.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError<E> {
    /// The action ran and was rejected, after any retries were used up.
    #[error("action failed: {0}")]
    Failed(E),

    /// A newer push replaced this one before it got the chance to run.
    #[error("action superseded by a newer push")]
    Superseded,
}

impl<E> ActionError<E> {
    /// Returns `true` if the push was dropped without running.
    #[must_use]
    pub fn is_superseded(&self) -> bool {
        matches!(self, ActionError::Superseded)
    }

    /// Returns the action's rejection reason, if it ran and failed.
    pub fn into_failure(self) -> Option<E> {
        match self {
            ActionError::Failed(error) => Some(error),
            ActionError::Superseded => None,
        }
    }
}
