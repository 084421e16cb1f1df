use std::fmt;

use crate::resolve::{self, RejectPromise, ResolvePromise, Resolution};
use crate::scheduler::Scheduler;
use crate::{Error, Promise};

/// The producing half of a pending promise.
///
/// `Deferred::new` hands out the promise together with the handle that
/// settles it. Handles may be cloned and sent to other threads; the first
/// settlement through any of them wins.
///
/// # Examples
///
/// ```
/// use promise_out::{Deferred, ThreadScheduler};
/// use futures::executor::block_on;
/// use std::thread;
///
/// let scheduler = ThreadScheduler::spawn().unwrap().handle();
/// let (deferred, promise) = Deferred::<String>::new(&scheduler);
///
/// let task1 = thread::spawn(move || block_on(async {
///     println!("Received {:?}", promise.await);
/// }));
/// deferred.fulfill("Hi".into());
/// task1.join().expect("The task1 thread has panicked.");
/// ```
pub struct Deferred<T, E = Error> {
    resolve: ResolvePromise<T, E>,
    reject: RejectPromise<T, E>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Deferred {
            resolve: self.resolve.clone(),
            reject: self.reject.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("resolve", &self.resolve)
            .finish()
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    pub fn new(scheduler: &Scheduler) -> (Self, Promise<T, E>) {
        let promise = Promise::pending(scheduler);
        let (resolve, reject) = resolve::capabilities(&promise);
        (Deferred { resolve, reject }, promise)
    }

    /// Resolves the promise, adopting `candidate` if it is promise-like.
    pub fn resolve(&self, candidate: Resolution<T, E>) {
        self.resolve.resolve(candidate)
    }

    pub fn fulfill(&self, value: T) {
        self.resolve.fulfill(value)
    }

    pub fn reject(&self, reason: E) {
        self.reject.reject(reason)
    }
}
