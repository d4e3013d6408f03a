//! Typed fan-out publish/subscribe channels over pull-style producers.
//!
//! A `Feed` wraps an iterator and multiplexes its values to any number of
//! subscribers, in production order. Derived feeds (`map`, `fold`) return a
//! runner alongside the new feed; runners must be attached to the
//! [`ThreadManager`](super::ThreadManager) so their threads are supervised.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use crossbeam::channel::unbounded;
use parking_lot::Mutex;
use tracing::error;

use super::shared_cell::SharedCell;

type Subscriber<T> = Box<dyn FnMut(T) + Send>;

/// The pump loop for one feed. Attach to the thread manager; it completes
/// when the producer is exhausted.
pub struct FeedRunner {
    body: Box<dyn FnOnce() -> Result<()> + Send>,
}

impl FeedRunner {
    pub fn run(self) -> Result<()> {
        (self.body)()
    }
}

/// A typed fan-out channel. Cloning shares the subscriber list.
pub struct Feed<T> {
    subscribers: Arc<Mutex<Vec<Subscriber<T>>>>,
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Feed<T> {
    /// Builds a feed from a pull-style producer. The runner pumps values
    /// until the producer ends or fails.
    pub fn of<P>(producer: P) -> (Feed<T>, FeedRunner)
    where
        P: IntoIterator<Item = T> + Send + 'static,
        P::IntoIter: Send,
    {
        let feed = Feed {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        };
        let subscribers = feed.subscribers.clone();
        let runner = FeedRunner {
            body: Box::new(move || {
                for value in producer {
                    publish(&subscribers, value);
                }
                Ok(())
            }),
        };
        (feed, runner)
    }

    /// Registers a callback invoked once per published value, in
    /// publication order. Values published before subscription are not
    /// replayed.
    pub fn subscribe(&self, callback: impl FnMut(T) + Send + 'static) {
        self.subscribers.lock().push(Box::new(callback));
    }

    /// A derived feed whose values are `f` applied to this feed's values.
    pub fn map<U, F>(&self, mut f: F) -> (Feed<U>, FeedRunner)
    where
        U: Clone + Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let (tx, rx) = unbounded();
        self.subscribe(move |value| {
            // Receiver gone means the derived runner ended; nothing to do.
            let _ = tx.send(value);
        });
        Feed::of(rx.into_iter().map(move |value| f(value)))
    }

    /// Continuously folds this feed's values into an accumulator exposed
    /// through a [`SharedCell`]. The cell stays empty until the first value
    /// arrives, so `read` blocks until then.
    pub fn fold<A, F>(&self, mut f: F, init: A) -> (SharedCell<A>, FeedRunner)
    where
        A: Clone + Send + 'static,
        F: FnMut(A, T) -> A + Send + 'static,
    {
        let (tx, rx) = unbounded();
        self.subscribe(move |value| {
            let _ = tx.send(value);
        });
        let cell = SharedCell::new();
        let runner_cell = cell.clone();
        let runner = FeedRunner {
            body: Box::new(move || {
                let mut acc = init;
                for value in rx {
                    acc = f(acc, value);
                    runner_cell.swap(acc.clone());
                }
                Ok(())
            }),
        };
        (cell, runner)
    }
}

/// Delivers one value to every live subscriber. A panicking subscriber is
/// logged and dropped; the others are unaffected.
fn publish<T: Clone>(subscribers: &Mutex<Vec<Subscriber<T>>>, value: T) {
    let mut subscribers = subscribers.lock();
    let mut index = 0;
    while index < subscribers.len() {
        let callback = &mut subscribers[index];
        let outcome = catch_unwind(AssertUnwindSafe(|| callback(value.clone())));
        if outcome.is_err() {
            error!(subscriber = index, "feed subscriber panicked, dropping it");
            subscribers.swap_remove(index);
        } else {
            index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<T: Clone + Send + 'static>(feed: &Feed<T>) -> Arc<Mutex<Vec<T>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        feed.subscribe(move |v| sink.lock().push(v));
        seen
    }

    #[test]
    fn test_subscriber_sees_every_value_in_order() {
        let (feed, runner) = Feed::of(vec![1, 2, 3, 4, 5]);
        let seen = drain(&feed);
        runner.run().unwrap();
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_late_subscriber_misses_earlier_values() {
        let (feed, runner) = Feed::of(vec![1, 2, 3]);
        runner.run().unwrap();
        let seen = drain(&feed);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_panicking_subscriber_does_not_affect_others() {
        let (feed, runner) = Feed::of(vec![1, 2, 3]);
        feed.subscribe(|v: i32| {
            if v == 2 {
                panic!("boom");
            }
        });
        let seen = drain(&feed);
        runner.run().unwrap();
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_map_derives_transformed_feed() {
        let (feed, runner) = Feed::of(vec![1, 2, 3]);
        let (doubled, doubled_runner) = feed.map(|v| v * 2);
        let seen = drain(&doubled);
        let pump = std::thread::spawn(move || doubled_runner.run());
        runner.run().unwrap();
        drop(feed);
        pump.join().unwrap().unwrap();
        assert_eq!(*seen.lock(), vec![2, 4, 6]);
    }

    #[test]
    fn test_fold_accumulates_into_cell() {
        let (feed, runner) = Feed::of(vec![1, 2, 3]);
        let (cell, fold_runner) = feed.fold(|acc, v| acc + v, 0);
        let pump = std::thread::spawn(move || fold_runner.run());
        runner.run().unwrap();
        drop(feed);
        pump.join().unwrap().unwrap();
        assert_eq!(cell.read(), 6);
    }
}
