// Blocking primitive for CPU/GPU synchronization
//
// A value guarded by a mutex plus a condition variable. The GPU side updates
// the value and wakes every waiter; the CPU side blocks until a predicate on
// the value holds or a timeout elapses. This stands in for OS event handles
// that fire when a fence reaches a value.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct CompletionEvent<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> CompletionEvent<T> {
    pub fn new(initial: T) -> Self {
        Self {
            state: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Reads the current value without blocking on the condition.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.state.lock())
    }

    /// Mutates the value and wakes all waiters.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut guard = self.state.lock();
        f(&mut guard);
        drop(guard);
        self.cond.notify_all();
    }

    /// Blocks until `predicate` holds. Returns `false` if `timeout` elapsed
    /// first. A timeout too large to represent waits without bound.
    pub fn wait_until<F>(&self, mut predicate: F, timeout: Option<Duration>) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut guard = self.state.lock();

        while !predicate(&guard) {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut guard, deadline).timed_out() {
                        return predicate(&guard);
                    }
                }
                None => self.cond.wait(&mut guard),
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn returns_immediately_when_predicate_holds() {
        let event = CompletionEvent::new(5u64);
        assert!(event.wait_until(|v| *v >= 5, Some(Duration::ZERO)));
    }

    #[test]
    fn times_out_when_never_updated() {
        let event = CompletionEvent::new(0u64);
        let start = Instant::now();
        assert!(!event.wait_until(|v| *v >= 1, Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wakes_on_update_from_another_thread() {
        let event = Arc::new(CompletionEvent::new(0u64));
        let producer = {
            let event = event.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                event.update(|v| *v = 3);
            })
        };

        assert!(event.wait_until(|v| *v >= 3, None));
        producer.join().unwrap();
        assert_eq!(event.read(|v| *v), 3);
    }

    #[test]
    fn huge_timeout_is_treated_as_unbounded() {
        let event = CompletionEvent::new(1u64);
        assert!(event.wait_until(|v| *v == 1, Some(Duration::MAX)));
    }
}
