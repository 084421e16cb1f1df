use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use log::{debug, log_enabled, trace};

use crate::combinators;
use crate::pair::Deferred;
use crate::resolve::{self, RejectPromise, ResolvePromise, Resolution};
use crate::scheduler::Scheduler;
use crate::Error;

/// A boxed fulfillment continuation, as taken by [`Promise::observe`].
pub type OnFulfilled<T, U, E> = Box<dyn FnOnce(T) -> Result<Resolution<U, E>, E> + Send>;

/// A boxed rejection continuation, as taken by [`Promise::observe`].
pub type OnRejected<U, E> = Box<dyn FnOnce(E) -> Result<Resolution<U, E>, E> + Send>;

type Reaction<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

/// Where a promise is in its life. Leaves `Pending` at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

struct Inner<T, E> {
    state: State<T, E>,
    observers: Vec<Reaction<T, E>>,
    wakers: Vec<Waker>, // tasks `.await`ing this promise
}

thread_local! {
    static RELEASING: RefCell<Option<Vec<Box<dyn Send>>>> = const { RefCell::new(None) };
}

/// A derived promise held by a reaction of the promise before it.
///
/// A pending chain owns each link through the previous link's observers.
/// Dropping a link hands it to a per-thread queue that is drained in a loop,
/// so dropping a long chain never recurses link by link.
struct Downstream<P: Send + 'static>(Option<P>);

impl<P: Send + 'static> Downstream<P> {
    fn new(promise: P) -> Self {
        Downstream(Some(promise))
    }

    fn promise(&self) -> Option<&P> {
        self.0.as_ref()
    }
}

impl<P: Send + 'static> Drop for Downstream<P> {
    fn drop(&mut self) {
        if let Some(promise) = self.0.take() {
            release(Box::new(promise));
        }
    }
}

fn release(item: Box<dyn Send>) {
    let queued = RELEASING.try_with(|releasing| {
        let mut releasing = releasing.borrow_mut();
        match releasing.as_mut() {
            Some(queue) => {
                queue.push(item);
                None
            }
            None => {
                *releasing = Some(Vec::new());
                Some(item)
            }
        }
    });
    let first = match queued {
        Ok(Some(item)) => item,
        Ok(None) => return,
        // Thread-local storage is gone during thread teardown.
        Err(_) => return,
    };
    drop(first);
    let next = || RELEASING.with(|releasing| releasing.borrow_mut().as_mut().and_then(Vec::pop));
    while let Some(item) = next() {
        drop(item);
    }
    RELEASING.with(|releasing| *releasing.borrow_mut() = None);
}

/// A value or failure that is not known yet.
///
/// `Promise` is a handle; clones refer to the same promise. Continuations
/// registered on it run from tasks given to its [`Scheduler`], in the order
/// they were registered, once it settles.
///
/// # Examples
///
/// ```
/// use promise_out::{Error, ManualScheduler, Promise, Resolution};
///
/// let scheduler = ManualScheduler::new();
/// let (deferred, promise) = Promise::<i32>::deferred(&scheduler.handle());
/// let next = promise
///     .and_then(|v| Ok(Resolution::Value(v + 1)))
///     .catch(|_| Ok(Resolution::Value(0)));
/// deferred.fulfill(1);
/// assert!(next.is_pending());
/// scheduler.run_until_idle();
/// assert_eq!(next.value(), Some(2));
/// ```
pub struct Promise<T, E = Error> {
    inner: Arc<Mutex<Inner<T, E>>>,
    scheduler: Scheduler,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Promise {
            inner: Arc::clone(&self.inner),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Promise")
            .field("state", &inner.state)
            .field("observers", &inner.observers.len())
            .finish()
    }
}

impl<T, E> Promise<T, E> {
    /// Whether both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Promise<T, E>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn id(&self) -> *const () {
        Arc::as_ptr(&self.inner) as *const ()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T, E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone, E: Clone> Promise<T, E> {
    pub fn state(&self) -> State<T, E> {
        self.lock().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.lock().state, State::Pending)
    }

    /// The fulfillment value, if fulfilled.
    pub fn value(&self) -> Option<T> {
        match &self.lock().state {
            State::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The rejection reason, if rejected.
    pub fn reason(&self) -> Option<E> {
        match &self.lock().state {
            State::Rejected(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    pub(crate) fn pending(scheduler: &Scheduler) -> Self {
        Promise {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Pending,
                observers: Vec::new(),
                wakers: Vec::new(),
            })),
            scheduler: scheduler.clone(),
        }
    }

    /// Creates a promise settled by `producer`.
    ///
    /// The producer runs right away and receives the two settling callbacks;
    /// only the first call to either counts. If the producer returns `Err` or
    /// panics before settling, the promise is rejected with that failure.
    pub fn new<P>(scheduler: &Scheduler, producer: P) -> Self
    where
        P: FnOnce(ResolvePromise<T, E>, RejectPromise<T, E>) -> Result<(), E>,
    {
        let promise = Promise::pending(scheduler);
        resolve::start(&promise, producer);
        promise
    }

    /// A promise resolved with `candidate`, adopting it if promise-like.
    pub fn resolve(scheduler: &Scheduler, candidate: Resolution<T, E>) -> Self {
        let promise = Promise::pending(scheduler);
        resolve::run(&promise, candidate);
        promise
    }

    /// A promise fulfilled with `value`.
    pub fn resolved(scheduler: &Scheduler, value: T) -> Self {
        Promise::resolve(scheduler, Resolution::Value(value))
    }

    /// A promise rejected with `reason`.
    pub fn reject(scheduler: &Scheduler, reason: E) -> Self {
        let promise = Promise::pending(scheduler);
        promise.settle(Err(reason));
        promise
    }

    /// A pending promise together with the handle that settles it.
    pub fn deferred(scheduler: &Scheduler) -> (Deferred<T, E>, Self) {
        Deferred::new(scheduler)
    }

    /// See [`combinators::all`].
    pub fn all<I>(scheduler: &Scheduler, inputs: I) -> Promise<Vec<T>, E>
    where
        I: IntoIterator<Item = Resolution<T, E>>,
    {
        combinators::all(scheduler, inputs)
    }

    /// See [`combinators::race`].
    pub fn race<I>(scheduler: &Scheduler, inputs: I) -> Self
    where
        I: IntoIterator<Item = Resolution<T, E>>,
    {
        combinators::race(scheduler, inputs)
    }

    /// Moves the promise out of `Pending`. Later calls do nothing.
    ///
    /// The drain task is scheduled before the lock is released, so a `then`
    /// racing in from another thread is always scheduled behind it.
    pub(crate) fn settle(&self, outcome: Result<T, E>) {
        let mut inner = self.lock();
        if !matches!(inner.state, State::Pending) {
            debug!("promise {:?} already settled, ignoring", self.id());
            return;
        }
        inner.state = match &outcome {
            Ok(value) => State::Fulfilled(value.clone()),
            Err(reason) => State::Rejected(reason.clone()),
        };
        let observers = mem::take(&mut inner.observers);
        let wakers = mem::take(&mut inner.wakers);

        if log_enabled!(log::Level::Trace) {
            let how = if outcome.is_ok() { "fulfilled" } else { "rejected" };
            trace!("promise {:?} {}, {} observers", self.id(), how, observers.len());
        }
        if !observers.is_empty() {
            self.scheduler.schedule(Box::new(move || {
                for reaction in observers {
                    reaction(outcome.clone());
                }
            }));
        }
        drop(inner);

        for waker in wakers {
            waker.wake();
        }
    }

    /// Queues `reaction`, or schedules it at once if already settled.
    fn register(&self, reaction: Reaction<T, E>) {
        let mut inner = self.lock();
        let outcome = match &inner.state {
            State::Pending => {
                inner.observers.push(reaction);
                return;
            }
            State::Fulfilled(value) => Ok(value.clone()),
            State::Rejected(reason) => Err(reason.clone()),
        };
        // Still under the lock: keeps this task behind the drain task.
        self.scheduler.schedule(Box::new(move || reaction(outcome)));
    }

    /// Settles this promise the same way `source` settles.
    pub(crate) fn adopt(&self, source: &Promise<T, E>) {
        trace!("promise {:?} adopting {:?}", self.id(), source.id());
        let target = Downstream::new(self.clone());
        source.register(Box::new(move |outcome| {
            if let Some(target) = target.promise() {
                target.settle(outcome);
            }
        }));
    }

    fn chain<U, G>(&self, continuation: G) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        G: FnOnce(Result<T, E>) -> Result<Resolution<U, E>, E> + Send + 'static,
    {
        let derived = Promise::pending(&self.scheduler);
        let target = Downstream::new(derived.clone());
        self.register(Box::new(move |outcome| {
            let target = match target.promise() {
                Some(target) => target,
                None => return,
            };
            match resolve::catch_panic(move || continuation(outcome)) {
                Ok(candidate) => resolve::run(target, candidate),
                Err(reason) => target.settle(Err(reason)),
            }
        }));
        derived
    }

    /// Registers continuations and returns the promise they settle.
    ///
    /// Whichever continuation matches the outcome runs with the value or
    /// reason. `Ok` resolves the returned promise with its resolution, `Err`
    /// or a panic rejects it.
    pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + Send + 'static,
        R: FnOnce(E) -> Result<Resolution<U, E>, E> + Send + 'static,
    {
        self.chain(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value),
            Err(reason) => on_rejected(reason),
        })
    }

    /// [`then`](Self::then) with optional continuations.
    ///
    /// A missing `on_fulfilled` passes the value through and a missing
    /// `on_rejected` passes the reason through.
    pub fn observe(
        &self,
        on_fulfilled: Option<OnFulfilled<T, T, E>>,
        on_rejected: Option<OnRejected<T, E>>,
    ) -> Promise<T, E> {
        self.then(
            move |value| match on_fulfilled {
                Some(f) => f(value),
                None => Ok(Resolution::Value(value)),
            },
            move |reason| match on_rejected {
                Some(f) => f(reason),
                None => Err(reason),
            },
        )
    }

    /// Continues on fulfillment; a rejection passes through.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + Send + 'static,
    {
        self.then(on_fulfilled, Err)
    }

    /// Continues on rejection; a value passes through.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Result<Resolution<T, E>, E> + Send + 'static,
    {
        self.then(|value| Ok(Resolution::Value(value)), on_rejected)
    }

    /// Runs `on_settled` whatever the outcome, then passes the outcome on
    /// unchanged. Only a failure of `on_settled` itself replaces it.
    pub fn finally<F>(&self, on_settled: F) -> Promise<T, E>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
    {
        self.chain(move |outcome| {
            on_settled()?;
            outcome.map(Resolution::Value)
        })
    }

    pub fn map<U, F>(&self, f: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.chain(move |outcome| outcome.map(|value| Resolution::Value(f(value))))
    }

    pub fn map_err<F>(&self, f: F) -> Promise<T, E>
    where
        F: FnOnce(E) -> E + Send + 'static,
    {
        self.chain(move |outcome| outcome.map(Resolution::Value).map_err(f))
    }
}

impl<T: Clone, E: Clone> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.lock();
        match &inner.state {
            State::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(reason) => Poll::Ready(Err(reason.clone())),
            State::Pending => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}
