//! Promises/A+ deferred values.
//!
//! A [`Promise`] is a value or failure that is not known yet. Continuations
//! registered with [`Promise::then`] and friends run once it settles, always
//! from a task handed to the promise's [`Scheduler`] and never on the caller's
//! own stack. A promise can be resolved with another promise or with any
//! foreign [`Thenable`], in which case it adopts that value's eventual state.
//!
//! # Examples
//!
//! ```
//! use promise_out::{Error, ManualScheduler, Promise, Resolution};
//!
//! let scheduler = ManualScheduler::new();
//! let doubled = Promise::<i32>::resolved(&scheduler.handle(), 21)
//!     .then(|v| Ok(Resolution::Value(v * 2)), |e: Error| Err(e));
//! scheduler.run_until_idle();
//! assert_eq!(doubled.value(), Some(42));
//! ```
pub mod channel;
pub mod combinators;
pub mod pair;
mod promise;
mod resolve;
pub mod scheduler;

pub use channel::ThreadScheduler;
pub use pair::Deferred;
pub use promise::{OnFulfilled, OnRejected, Promise, State};
pub use resolve::{RejectPromise, ResolvePromise, Resolution, Then, ThenFn, Thenable};
pub use scheduler::{ManualScheduler, Schedule, Scheduler, Task};

use thiserror::Error;

/// Failures raised by the promise machinery itself.
///
/// `Error` also serves as the default rejection reason type, so a plain
/// message can be carried in [`Error::Reason`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("promise cannot be resolved with itself")]
    SelfResolution,
    #[error("callback panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Reason(String),
}

impl Error {
    pub fn reason(message: impl Into<String>) -> Self {
        Error::Reason(message.into())
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Reason(message.to_owned())
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Reason(message)
    }
}
