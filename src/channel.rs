//! A channel scheduler uses a multi-producer, single-consumer channel as its
//! backend. The producer side can be cloned into every promise; the single
//! consumer is a worker thread that runs tasks in the order they were sent.
//!
use crate::resolve::panic_message;
use crate::scheduler::{Schedule, Scheduler, Task};
use log::{debug, trace, warn};
use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc, Mutex, PoisonError,
    },
    thread,
};

const DEFAULT_NAME: &str = "promise-out";

/// Configures the worker thread of a [`ThreadScheduler`].
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder { name: None }
    }

    /// Configures the name of the worker thread.
    pub fn name(mut self, name: String) -> Builder {
        self.name = Some(name);
        self
    }

    /// Spawns the worker thread.
    pub fn spawn(self) -> io::Result<ThreadScheduler> {
        let name = self.name.unwrap_or_else(|| DEFAULT_NAME.to_owned());
        let (tx, rx) = channel();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || work(rx))?;
        trace!("spawned scheduler thread {}", name);
        Ok(ThreadScheduler {
            sender: Arc::new(Mutex::new(tx)),
        })
    }
}

/// Runs tasks on a dedicated worker thread.
///
/// The worker exits once every clone of the scheduler, and every promise
/// holding one, has been dropped.
///
/// # Examples
///
/// ```
/// use promise_out::{Promise, ThreadScheduler};
/// use futures::executor::block_on;
///
/// let scheduler = ThreadScheduler::spawn().unwrap().handle();
/// let promise = Promise::<String>::resolved(&scheduler, "Hi".into()).map(|s| s + "!");
/// assert_eq!(block_on(promise).unwrap(), "Hi!");
/// ```
#[derive(Debug, Clone)]
pub struct ThreadScheduler {
    sender: Arc<Mutex<Sender<Task>>>,
}

impl ThreadScheduler {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn spawn() -> io::Result<ThreadScheduler> {
        Builder::new().spawn()
    }

    /// A [`Scheduler`] handle feeding this worker.
    pub fn handle(&self) -> Scheduler {
        Scheduler::new(self.clone())
    }
}

impl Schedule for ThreadScheduler {
    fn schedule(&self, task: Task) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.send(task).is_err() {
            debug!("scheduler thread is gone, dropping task");
        }
    }
}

fn work(receiver: Receiver<Task>) {
    for task in receiver {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            warn!("scheduled task panicked: {}", panic_message(payload.as_ref()));
        }
    }
    trace!("scheduler thread exiting");
}
