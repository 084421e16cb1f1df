#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use promise_out::{
        combinators, Error, ManualScheduler, Promise, Resolution, State, Then, Thenable,
        ThreadScheduler,
    };
    use std::{thread, time::Duration};

    /// A thenable-looking object with no callable `then`.
    struct Plain(i32);

    impl Thenable<i32, Error> for Plain {
        fn probe(self: Box<Self>) -> Result<Then<i32, Error>, Error> {
            Ok(Then::Opaque(self.0))
        }
    }

    #[test]
    fn test_all_gathers_from_threads() {
        let scheduler = ThreadScheduler::spawn().unwrap().handle();
        let mut inputs = Vec::new();
        let mut producers = Vec::new();
        for i in 0..8 {
            let (deferred, promise) = Promise::<i32>::deferred(&scheduler);
            inputs.push(Resolution::from(promise));
            producers.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis(10 * (8 - i) as u64));
                deferred.fulfill(i);
            }));
        }
        let all = combinators::all(&scheduler, inputs);
        for producer in producers {
            producer.join().expect("The producer thread has panicked");
        }
        assert_eq!(block_on(all), Ok((0..8).collect::<Vec<_>>()));
    }

    #[test]
    fn test_all_mixes_values_promises_and_thenables() {
        let scheduler = ManualScheduler::new();
        let handle = scheduler.handle();
        let (deferred, pending) = Promise::<i32>::deferred(&handle);
        let all = combinators::all::<i32, Error, _>(
            &handle,
            vec![
                Resolution::Value(1),
                Resolution::Thenable(Box::new(Plain(2))),
                Resolution::Promise(pending),
                Resolution::Promise(Promise::resolved(&handle, 4)),
            ],
        );
        scheduler.run_until_idle();
        assert!(all.is_pending());
        deferred.fulfill(3);
        scheduler.run_until_idle();
        assert_eq!(all.value(), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_all_ignores_rejections_after_the_first() {
        let scheduler = ManualScheduler::new();
        let handle = scheduler.handle();
        let (first, a) = Promise::<i32>::deferred(&handle);
        let (second, b) = Promise::<i32>::deferred(&handle);
        let all = combinators::all(&handle, vec![Resolution::from(a), Resolution::from(b)]);
        second.reject(Error::reason("second"));
        scheduler.run_until_idle();
        first.reject(Error::reason("first"));
        scheduler.run_until_idle();
        assert_eq!(all.state(), State::Rejected(Error::reason("second")));
    }

    #[test]
    fn test_race_ignores_input_that_never_settles() {
        let scheduler = ThreadScheduler::spawn().unwrap().handle();
        let (_never, pending) = Promise::<String>::deferred(&scheduler);
        let (deferred, slow) = Promise::<String>::deferred(&scheduler);
        let race =
            combinators::race(&scheduler, vec![Resolution::from(pending), Resolution::from(slow)]);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            deferred.fulfill(String::from("🍓"));
        });
        assert_eq!(block_on(race), Ok(String::from("🍓")));
        producer.join().expect("The producer thread has panicked");
    }

    #[test]
    fn test_race_opaque_thenable_settles_on_next_tick() {
        let scheduler = ManualScheduler::new();
        let handle = scheduler.handle();
        let race = combinators::race::<i32, Error, _>(
            &handle,
            vec![Resolution::Thenable(Box::new(Plain(7)))],
        );
        assert!(race.is_pending());
        scheduler.run_until_idle();
        assert_eq!(race.value(), Some(7));

        let value_first = combinators::race::<i32, Error, _>(
            &handle,
            vec![Resolution::Thenable(Box::new(Plain(7))), Resolution::Value(8)],
        );
        assert_eq!(value_first.value(), Some(8));
        scheduler.run_until_idle();
        assert_eq!(value_first.value(), Some(8));
    }
}
