//! The scheduling capability promises defer their continuations onto.
//!
//! Nothing in this crate runs a continuation inline. Every delivery is
//! wrapped in a [`Task`] and handed to a [`Schedule`] implementation, which
//! must run tasks in the order they were scheduled.
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks later, first in first out.
///
/// Promises call `schedule` while holding their own lock, which keeps
/// reactions in registration order across threads. An implementation must
/// only enqueue the task; running it inline may deadlock.
pub trait Schedule: Send + Sync {
    fn schedule(&self, task: Task);
}

/// Cloneable handle to a [`Schedule`] implementation.
///
/// Every promise carries one; promises derived through `then` inherit the
/// handle of their source.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<dyn Schedule>,
}

impl Scheduler {
    pub fn new<S>(schedule: S) -> Self
    where
        S: Schedule + 'static,
    {
        Scheduler {
            inner: Arc::new(schedule),
        }
    }

    /// Wraps a plain function as the scheduling capability.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_out::Scheduler;
    /// use std::sync::mpsc::channel;
    ///
    /// let (tx, rx) = channel();
    /// let tx = std::sync::Mutex::new(tx);
    /// let scheduler = Scheduler::from_fn(move |task| {
    ///     let _ = tx.lock().unwrap().send(task);
    /// });
    /// scheduler.schedule(Box::new(|| println!("later")));
    /// rx.recv().unwrap()();
    /// ```
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Task) + Send + Sync + 'static,
    {
        Scheduler::new(FnSchedule(f))
    }

    pub fn schedule(&self, task: Task) {
        self.inner.schedule(task)
    }

    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("inner", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

struct FnSchedule<F>(F);

impl<F> Schedule for FnSchedule<F>
where
    F: Fn(Task) + Send + Sync,
{
    fn schedule(&self, task: Task) {
        (self.0)(task)
    }
}

/// A scheduler that only runs tasks when told to.
///
/// Tests step through deferred work with [`run_next`](Self::run_next) or
/// [`run_until_idle`](Self::run_until_idle) and can observe that nothing ran
/// in between.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    queue: Arc<Mutex<VecDeque<Task>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`Scheduler`] handle feeding this queue.
    pub fn handle(&self) -> Scheduler {
        Scheduler::new(self.clone())
    }

    /// Runs the oldest queued task. Returns `false` if the queue was empty.
    pub fn run_next(&self) -> bool {
        // The lock is released before the task runs; tasks schedule more tasks.
        let task = self.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks until the queue is empty, including tasks scheduled along
    /// the way. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        trace!("manual scheduler ran {} tasks", ran);
        ran
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Schedule for ManualScheduler {
    fn schedule(&self, task: Task) {
        self.lock().push_back(task);
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("queued", &self.len())
            .finish()
    }
}
