//! The resolution procedure.
//!
//! Settling a promise goes through [`run`], which takes an arbitrary
//! candidate [`Resolution`] and either settles the promise with it or, when
//! the candidate is itself promise-like, waits for that value to settle
//! first. Foreign promise-like values are reached through the [`Thenable`]
//! capability.
use std::any::Any;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};

use crate::promise::Promise;
use crate::Error;

/// A candidate value for settling a promise.
pub enum Resolution<T, E = Error> {
    /// A plain value; fulfills directly.
    Value(T),
    /// A promise of this crate; its state is adopted.
    Promise(Promise<T, E>),
    /// A foreign promise-like value; its state is adopted through `then`.
    Thenable(Box<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E>
where
    T: 'static,
    E: 'static,
{
    /// A thenable whose `then` capability is the given function.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_out::{ManualScheduler, Promise, Resolution};
    ///
    /// let scheduler = ManualScheduler::new();
    /// let thenable = Resolution::thenable(|resolve, _reject| {
    ///     resolve.fulfill(42);
    ///     Ok(())
    /// });
    /// let promise = Promise::<i32>::resolve(&scheduler.handle(), thenable);
    /// assert_eq!(promise.value(), Some(42));
    /// ```
    pub fn thenable<F>(then: F) -> Self
    where
        F: FnOnce(ResolvePromise<T, E>, RejectPromise<T, E>) -> Result<(), E> + Send + 'static,
    {
        Resolution::Thenable(Box::new(FnThenable(then)))
    }
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Promise(promise)
    }
}

impl<T: fmt::Debug, E> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Promise(_) => f.write_str("Promise(..)"),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}

/// A value that may expose a `then` capability.
///
/// Implement this to let promises adopt the state of a promise-like value
/// from somewhere else.
pub trait Thenable<T, E>: Send {
    /// Looks up the `then` capability.
    ///
    /// An `Err` rejects the promise being resolved. [`Then::Opaque`] means the
    /// value turned out not to be promise-like and fulfills with it as is.
    fn probe(self: Box<Self>) -> Result<Then<T, E>, E>;
}

/// The outcome of probing a [`Thenable`].
pub enum Then<T, E> {
    Callable(ThenFn<T, E>),
    Opaque(T),
}

/// A `then` capability. It is invoked at most once, with fresh callbacks.
pub type ThenFn<T, E> =
    Box<dyn FnOnce(ResolvePromise<T, E>, RejectPromise<T, E>) -> Result<(), E> + Send>;

struct FnThenable<F>(F);

impl<T, E, F> Thenable<T, E> for FnThenable<F>
where
    F: FnOnce(ResolvePromise<T, E>, RejectPromise<T, E>) -> Result<(), E> + Send + 'static,
{
    fn probe(self: Box<Self>) -> Result<Then<T, E>, E> {
        Ok(Then::Callable(Box::new(self.0)))
    }
}

/// Shared between one pair of resolving callbacks.
struct Resolver<T, E> {
    target: Promise<T, E>,
    called: AtomicBool,
    handoff: Mutex<Handoff<T, E>>,
}

/// While the `then` capability is on the stack, a resolution is handed back
/// to the caller's loop instead of recursing.
enum Handoff<T, E> {
    Invoking(Option<Resolution<T, E>>),
    Detached,
}

impl<T, E> Resolver<T, E> {
    fn lock_handoff(&self) -> MutexGuard<'_, Handoff<T, E>> {
        self.handoff.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The `resolvePromise` callback handed to producers and thenables.
///
/// Shares a once-only guard with its [`RejectPromise`]: only the first call
/// to either has any effect.
pub struct ResolvePromise<T, E = Error> {
    resolver: Arc<Resolver<T, E>>,
}

/// The `rejectPromise` callback handed to producers and thenables.
pub struct RejectPromise<T, E = Error> {
    resolver: Arc<Resolver<T, E>>,
}

impl<T, E> Clone for ResolvePromise<T, E> {
    fn clone(&self) -> Self {
        ResolvePromise {
            resolver: Arc::clone(&self.resolver),
        }
    }
}

impl<T, E> Clone for RejectPromise<T, E> {
    fn clone(&self) -> Self {
        RejectPromise {
            resolver: Arc::clone(&self.resolver),
        }
    }
}

impl<T, E> fmt::Debug for ResolvePromise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvePromise")
            .field("called", &self.resolver.called.load(Ordering::Acquire))
            .finish()
    }
}

impl<T, E> fmt::Debug for RejectPromise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectPromise")
            .field("called", &self.resolver.called.load(Ordering::Acquire))
            .finish()
    }
}

impl<T, E> ResolvePromise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    /// Resolves the promise with `candidate`, unwrapping it if promise-like.
    pub fn resolve(&self, candidate: Resolution<T, E>) {
        if self.resolver.called.swap(true, Ordering::AcqRel) {
            debug!("resolving callback already used, ignoring resolve");
            return;
        }
        let mut handoff = self.resolver.lock_handoff();
        if let Handoff::Invoking(slot) = &mut *handoff {
            *slot = Some(candidate);
            return;
        }
        drop(handoff);
        run(&self.resolver.target, candidate);
    }

    pub fn fulfill(&self, value: T) {
        self.resolve(Resolution::Value(value))
    }
}

impl<T, E> RejectPromise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    /// Rejects the promise with `reason`. The reason is never unwrapped.
    pub fn reject(&self, reason: E) {
        if self.resolver.called.swap(true, Ordering::AcqRel) {
            debug!("resolving callback already used, ignoring reject");
            return;
        }
        self.resolver.target.settle(Err(reason));
    }
}

/// Callbacks bound to `target` outside of any `then` invocation.
pub(crate) fn capabilities<T, E>(
    target: &Promise<T, E>,
) -> (ResolvePromise<T, E>, RejectPromise<T, E>) {
    let resolver = Arc::new(Resolver {
        target: target.clone(),
        called: AtomicBool::new(false),
        handoff: Mutex::new(Handoff::Detached),
    });
    (
        ResolvePromise {
            resolver: Arc::clone(&resolver),
        },
        RejectPromise { resolver },
    )
}

/// Runs a producer against `target`, then resolves whatever it handed back.
pub(crate) fn start<T, E, P>(target: &Promise<T, E>, producer: P)
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
    P: FnOnce(ResolvePromise<T, E>, RejectPromise<T, E>) -> Result<(), E>,
{
    if let Some(candidate) = invoke(target, producer) {
        run(target, candidate);
    }
}

/// Settles `target` from `candidate`.
///
/// Promise-like candidates that resolve synchronously with further
/// promise-like values are unwound here in a loop, so nesting depth never
/// turns into stack depth.
pub(crate) fn run<T, E>(target: &Promise<T, E>, candidate: Resolution<T, E>)
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    let mut candidate = candidate;
    loop {
        let then = match candidate {
            Resolution::Value(value) => {
                target.settle(Ok(value));
                return;
            }
            Resolution::Promise(source) => {
                if source.ptr_eq(target) {
                    target.settle(Err(Error::SelfResolution.into()));
                } else {
                    target.adopt(&source);
                }
                return;
            }
            Resolution::Thenable(thenable) => match catch_panic(move || thenable.probe()) {
                Ok(Then::Callable(then)) => then,
                Ok(Then::Opaque(value)) => {
                    target.settle(Ok(value));
                    return;
                }
                Err(reason) => {
                    target.settle(Err(reason));
                    return;
                }
            },
        };
        trace!("invoking thenable for promise {:?}", target.id());
        match invoke(target, then) {
            Some(next) => candidate = next,
            None => return,
        }
    }
}

/// Calls `then` with fresh callbacks bound to `target`.
///
/// Returns the resolution passed synchronously to the resolve callback, if
/// any. A failure raised by `then` rejects `target` unless a callback already
/// fired, in which case it is dropped.
fn invoke<T, E, F>(target: &Promise<T, E>, then: F) -> Option<Resolution<T, E>>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
    F: FnOnce(ResolvePromise<T, E>, RejectPromise<T, E>) -> Result<(), E>,
{
    let resolver = Arc::new(Resolver {
        target: target.clone(),
        called: AtomicBool::new(false),
        handoff: Mutex::new(Handoff::Invoking(None)),
    });
    let resolve = ResolvePromise {
        resolver: Arc::clone(&resolver),
    };
    let reject = RejectPromise {
        resolver: Arc::clone(&resolver),
    };
    let outcome = catch_panic(move || then(resolve, reject));
    let handed_back = match mem::replace(&mut *resolver.lock_handoff(), Handoff::Detached) {
        Handoff::Invoking(slot) => slot,
        Handoff::Detached => None,
    };
    if let Err(reason) = outcome {
        if resolver.called.swap(true, Ordering::AcqRel) {
            debug!("dropping failure raised after promise {:?} was resolved", target.id());
        } else {
            target.settle(Err(reason));
        }
    }
    handed_back
}

/// Runs user code, turning a panic into a rejection reason.
pub(crate) fn catch_panic<R, E, F>(f: F) -> Result<R, E>
where
    E: From<Error>,
    F: FnOnce() -> Result<R, E>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        debug!("callback panicked, rejecting: {}", message);
        Err(Error::Panicked(message).into())
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use crate::State;

    /// A thenable that fails or turns out not to be callable when probed.
    struct Lookup(Result<Option<i32>, Error>);

    impl Thenable<i32, Error> for Lookup {
        fn probe(self: Box<Self>) -> Result<Then<i32, Error>, Error> {
            match self.0 {
                Ok(Some(value)) => Ok(Then::Opaque(value)),
                Ok(None) => Ok(Then::Callable(Box::new(|resolve: ResolvePromise<i32>, _| {
                    resolve.fulfill(7);
                    Ok(())
                }))),
                Err(e) => Err(e),
            }
        }
    }

    fn nested(depth: usize) -> Resolution<usize> {
        if depth == 0 {
            return Resolution::Value(0);
        }
        Resolution::thenable(move |resolve, _| {
            resolve.resolve(nested(depth - 1));
            Ok(())
        })
    }

    #[test]
    fn test_plain_value_fulfills() {
        let scheduler = ManualScheduler::new();
        let promise = Promise::<i32>::resolve(&scheduler.handle(), Resolution::Value(3));
        assert_eq!(promise.state(), State::Fulfilled(3));
    }

    #[test]
    fn test_resolving_with_itself_rejects() {
        let scheduler = ManualScheduler::new();
        let (deferred, promise) = Promise::<i32>::deferred(&scheduler.handle());
        deferred.resolve(Resolution::Promise(promise.clone()));
        assert_eq!(promise.state(), State::Rejected(Error::SelfResolution));
    }

    #[test]
    fn test_then_lookup_failure_rejects() {
        let scheduler = ManualScheduler::new();
        let thenable: Resolution<i32> =
            Resolution::Thenable(Box::new(Lookup(Err(Error::reason("getter")))));
        let promise = Promise::<i32>::resolve(&scheduler.handle(), thenable);
        assert_eq!(promise.state(), State::Rejected(Error::reason("getter")));
    }

    #[test]
    fn test_non_callable_then_fulfills_with_value() {
        let scheduler = ManualScheduler::new();
        let opaque: Resolution<i32> = Resolution::Thenable(Box::new(Lookup(Ok(Some(11)))));
        assert_eq!(
            Promise::<i32>::resolve(&scheduler.handle(), opaque).value(),
            Some(11)
        );
        let callable: Resolution<i32> = Resolution::Thenable(Box::new(Lookup(Ok(None))));
        assert_eq!(
            Promise::<i32>::resolve(&scheduler.handle(), callable).value(),
            Some(7)
        );
    }

    #[test]
    fn test_only_first_callback_counts() {
        let scheduler = ManualScheduler::new();
        let thenable = Resolution::thenable(|resolve, reject| {
            resolve.fulfill(1);
            reject.reject(Error::reason("late"));
            resolve.fulfill(2);
            Ok(())
        });
        let promise = Promise::<i32>::resolve(&scheduler.handle(), thenable);
        assert_eq!(promise.value(), Some(1));
    }

    #[test]
    fn test_failure_after_resolve_is_swallowed() {
        let scheduler = ManualScheduler::new();
        let thenable = Resolution::thenable(|resolve, _| {
            resolve.fulfill(1);
            Err(Error::reason("thrown"))
        });
        let promise = Promise::<i32>::resolve(&scheduler.handle(), thenable);
        assert_eq!(promise.value(), Some(1));
    }

    #[test]
    fn test_failure_before_resolve_rejects_and_disarms() {
        let scheduler = ManualScheduler::new();
        let stash = Arc::new(Mutex::new(None));
        let keep = stash.clone();
        let thenable = Resolution::thenable(move |resolve: ResolvePromise<i32>, _| {
            *keep.lock().unwrap() = Some(resolve);
            Err(Error::reason("thrown"))
        });
        let promise = Promise::<i32>::resolve(&scheduler.handle(), thenable);
        stash.lock().unwrap().take().unwrap().fulfill(5);
        assert_eq!(promise.state(), State::Rejected(Error::reason("thrown")));
    }

    #[test]
    fn test_panicking_then_rejects() {
        let scheduler = ManualScheduler::new();
        let thenable = Resolution::<i32>::thenable(|_, _| panic!("probe exploded"));
        let promise = Promise::resolve(&scheduler.handle(), thenable);
        assert_eq!(
            promise.state(),
            State::Rejected(Error::Panicked("probe exploded".into()))
        );
    }

    #[test]
    fn test_asynchronous_thenable_is_adopted() {
        let scheduler = ManualScheduler::new();
        let handle = scheduler.handle();
        let later = handle.clone();
        let thenable = Resolution::thenable(move |resolve, _| {
            later.schedule(Box::new(move || resolve.fulfill(42)));
            Ok(())
        });
        let promise = Promise::<i32>::resolve(&handle, thenable);
        assert!(promise.is_pending());
        scheduler.run_until_idle();
        assert_eq!(promise.value(), Some(42));
    }

    #[test]
    fn test_deep_synchronous_nesting_does_not_recurse() {
        let scheduler = ManualScheduler::new();
        let promise = Promise::resolve(&scheduler.handle(), nested(100_000));
        assert_eq!(promise.value(), Some(0));
    }

    #[test]
    fn test_thenable_resolving_to_rejected_promise() {
        let scheduler = ManualScheduler::new();
        let handle = scheduler.handle();
        let inner = Promise::<i32>::reject(&handle, Error::reason("inner"));
        let thenable = Resolution::thenable(move |resolve, _| {
            resolve.resolve(Resolution::Promise(inner));
            Ok(())
        });
        let promise = Promise::resolve(&handle, thenable);
        assert!(promise.is_pending());
        scheduler.run_until_idle();
        assert_eq!(promise.reason(), Some(Error::reason("inner")));
    }
}
