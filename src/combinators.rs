//! Combinators composing many promises into one.
//!
//! Both are built from [`Promise::new`], [`Promise::resolve`] and
//! [`Promise::then`] only. Inputs are [`Resolution`]s, so plain values,
//! promises and foreign thenables can be mixed freely.
use std::sync::{Arc, Mutex, PoisonError};

use log::trace;

use crate::resolve::Resolution;
use crate::scheduler::Scheduler;
use crate::{Error, Promise};

struct Tally<T> {
    results: Vec<Option<T>>,
    remaining: usize,
}

/// Fulfills with every input's value, in input order, once all have
/// fulfilled. Rejects with the reason of the first input to reject; later
/// outcomes are ignored. An empty input fulfills with an empty `Vec`.
///
/// # Examples
///
/// ```
/// use promise_out::{combinators, ManualScheduler, Promise, Resolution};
///
/// let scheduler = ManualScheduler::new();
/// let handle = scheduler.handle();
/// let all = combinators::all(&handle, vec![
///     Resolution::Value(1),
///     Resolution::Promise(Promise::<i32>::resolved(&handle, 2)),
/// ]);
/// scheduler.run_until_idle();
/// assert_eq!(all.value(), Some(vec![1, 2]));
/// ```
pub fn all<T, E, I>(scheduler: &Scheduler, inputs: I) -> Promise<Vec<T>, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
    I: IntoIterator<Item = Resolution<T, E>>,
{
    let inputs: Vec<_> = inputs.into_iter().collect();
    Promise::new(scheduler, |resolve, reject| {
        let count = inputs.len();
        if count == 0 {
            resolve.fulfill(Vec::new());
            return Ok(());
        }
        let tally = Arc::new(Mutex::new(Tally {
            results: vec![None; count],
            remaining: count,
        }));
        for (index, input) in inputs.into_iter().enumerate() {
            let tally = Arc::clone(&tally);
            let resolve = resolve.clone();
            let reject = reject.clone();
            Promise::resolve(scheduler, input).then(
                move |value| {
                    let mut tally = tally.lock().unwrap_or_else(PoisonError::into_inner);
                    tally.results[index] = Some(value);
                    tally.remaining -= 1;
                    if tally.remaining == 0 {
                        let results = tally.results.iter_mut().filter_map(Option::take).collect();
                        drop(tally);
                        trace!("all: {} inputs fulfilled", count);
                        resolve.fulfill(results);
                    }
                    Ok(Resolution::Value(()))
                },
                move |reason| {
                    reject.reject(reason);
                    Ok(Resolution::Value(()))
                },
            );
        }
        Ok(())
    })
}

/// Settles the same way as whichever input settles first. Plain values
/// count as settled right away, so the first of them wins over anything
/// still pending. An empty input never settles.
///
/// A thenable whose `then` turns out not to be callable is not a plain
/// value: it settles the race one scheduler tick later, so a
/// [`Resolution::Value`] anywhere in the input beats it.
///
/// # Examples
///
/// ```
/// use promise_out::{combinators, ManualScheduler, Promise, Resolution};
///
/// let scheduler = ManualScheduler::new();
/// let handle = scheduler.handle();
/// let (_never, pending) = Promise::<i32>::deferred(&handle);
/// let race = combinators::race(&handle, vec![
///     Resolution::Promise(pending),
///     Resolution::Promise(Promise::resolved(&handle, 5)),
/// ]);
/// scheduler.run_until_idle();
/// assert_eq!(race.value(), Some(5));
/// ```
pub fn race<T, E, I>(scheduler: &Scheduler, inputs: I) -> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
    I: IntoIterator<Item = Resolution<T, E>>,
{
    Promise::new(scheduler, |resolve, reject| {
        for input in inputs {
            let candidate = match input {
                Resolution::Value(value) => {
                    resolve.fulfill(value);
                    continue;
                }
                promise_like => promise_like,
            };
            let resolve = resolve.clone();
            let reject = reject.clone();
            Promise::resolve(scheduler, candidate).then(
                move |value| {
                    resolve.fulfill(value);
                    Ok(Resolution::Value(()))
                },
                move |reason| {
                    reject.reject(reason);
                    Ok(Resolution::Value(()))
                },
            );
        }
        Ok(())
    })
}
