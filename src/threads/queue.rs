//! Blocking multi-producer multi-consumer queue
//!
//! Items are popped from the front; `try_steal` takes from the back so a
//! second consumer can work the queue from the other end.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::network::MessageHandler;
use crate::protocol::{Endpoint, ReceivedMessage};

/// Queue errors, returned by the `*_throw` variants
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is empty")]
    Empty,

    #[error("Timed out waiting for an item")]
    Timeout,

    #[error("Wait was interrupted")]
    Interrupted,
}

pub type QueueResult<T> = Result<T, QueueError>;

struct Inner<T> {
    items: VecDeque<T>,
    waiters: usize,
    /// Bumped by `break_pop_wait` to release everyone currently waiting
    generation: u64,
    /// A break issued while nobody waited; consumed by the next blocked pop
    pending_break: bool,
}

/// Thread-safe queue with blocking, timed and non-blocking pops
pub struct ConcurrentQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T> ConcurrentQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                waiters: 0,
                generation: 0,
                pending_break: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Push an item onto the back of the queue and wake one waiter
    pub fn push(&self, item: T) {
        self.inner.lock().items.push_back(item);
        self.available.notify_one();
    }

    /// Block until an item is available
    ///
    /// Returns `None` when the wait is broken by `break_pop_wait`.
    pub fn pop(&self) -> Option<T> {
        self.wait_pop(None).ok()
    }

    pub fn pop_throw(&self) -> QueueResult<T> {
        self.wait_pop(None)
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    pub fn try_pop_throw(&self) -> QueueResult<T> {
        self.try_pop().ok_or(QueueError::Empty)
    }

    /// Wait at most `timeout` for an item
    pub fn timed_pop(&self, timeout: Duration) -> Option<T> {
        self.wait_pop(Some(timeout)).ok()
    }

    pub fn timed_pop_throw(&self, timeout: Duration) -> QueueResult<T> {
        self.wait_pop(Some(timeout))
    }

    /// Take an item from the back of the queue
    pub fn try_steal(&self) -> Option<T> {
        self.inner.lock().items.pop_back()
    }

    pub fn try_steal_throw(&self) -> QueueResult<T> {
        self.try_steal().ok_or(QueueError::Empty)
    }

    /// Release every thread blocked in `pop` or `timed_pop`
    ///
    /// If nobody is waiting, the next pop that finds the queue empty returns
    /// immediately as interrupted.
    pub fn break_pop_wait(&self) {
        let mut inner = self.inner.lock();
        if inner.waiters > 0 {
            inner.generation = inner.generation.wrapping_add(1);
            drop(inner);
            self.available.notify_all();
        } else {
            inner.pending_break = true;
        }
    }

    pub fn clear(&self) {
        self.inner.lock().items.clear();
    }

    /// Remove every item, handing each one to `deleter`
    pub fn clear_with<F: FnMut(T)>(&self, deleter: F) {
        let drained: Vec<T> = self.inner.lock().items.drain(..).collect();
        drained.into_iter().for_each(deleter);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    fn wait_pop(&self, timeout: Option<Duration>) -> QueueResult<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();

        if let Some(item) = inner.items.pop_front() {
            return Ok(item);
        }
        if inner.pending_break {
            inner.pending_break = false;
            return Err(QueueError::Interrupted);
        }

        let generation = inner.generation;
        inner.waiters += 1;

        let result = loop {
            if let Some(item) = inner.items.pop_front() {
                break Ok(item);
            }
            if inner.generation != generation {
                break Err(QueueError::Interrupted);
            }

            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut inner, deadline).timed_out() {
                        break inner.items.pop_front().ok_or(QueueError::Timeout);
                    }
                }
                None => self.available.wait(&mut inner),
            }
        };

        inner.waiters -= 1;
        result
    }
}

impl<T: Clone> ConcurrentQueue<T> {
    /// Copy of the item at `index` counted from the front
    pub fn peek(&self, index: usize) -> Option<T> {
        self.inner.lock().items.get(index).cloned()
    }
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHandler for ConcurrentQueue<ReceivedMessage> {
    fn on_message(&self, message: ReceivedMessage, _from: &Endpoint) {
        self.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = ConcurrentQueue::new();
        for i in 0..5 {
            queue.push(i);
        }
        let popped: Vec<i32> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_steal_takes_from_back() {
        let queue = ConcurrentQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.try_steal(), Some(3));
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_steal(), Some(2));
        assert_eq!(queue.try_steal_throw(), Err(QueueError::Empty));
    }

    #[test]
    fn test_throwing_variants() {
        let queue: ConcurrentQueue<u8> = ConcurrentQueue::new();
        assert_eq!(queue.try_pop_throw(), Err(QueueError::Empty));
        assert_eq!(
            queue.timed_pop_throw(Duration::from_millis(20)),
            Err(QueueError::Timeout)
        );
        queue.push(9);
        assert_eq!(queue.pop_throw(), Ok(9));
    }

    #[test]
    fn test_timed_pop_receives_late_item() {
        let queue = Arc::new(ConcurrentQueue::new());
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                queue.push("late");
            })
        };

        assert_eq!(queue.timed_pop(Duration::from_secs(5)), Some("late"));
        producer.join().unwrap();
    }

    #[test]
    fn test_break_pop_wait_wakes_all_waiters() {
        let queue: Arc<ConcurrentQueue<u32>> = Arc::new(ConcurrentQueue::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || queue.pop_throw())
            })
            .collect();

        while queue.inner.lock().waiters < 3 {
            thread::sleep(Duration::from_millis(5));
        }
        queue.break_pop_wait();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Err(QueueError::Interrupted));
        }
    }

    #[test]
    fn test_break_without_waiters_interrupts_next_pop() {
        let queue: ConcurrentQueue<u32> = ConcurrentQueue::new();
        queue.break_pop_wait();
        assert_eq!(queue.pop(), None);

        queue.push(5);
        assert_eq!(queue.pop(), Some(5));
    }

    #[test]
    fn test_clear_with_and_peek() {
        let queue = ConcurrentQueue::new();
        queue.push(String::from("a"));
        queue.push(String::from("b"));
        assert_eq!(queue.peek(1), Some("b".to_string()));
        assert_eq!(queue.peek(2), None);

        let mut seen = Vec::new();
        queue.clear_with(|item| seen.push(item));
        assert_eq!(seen, vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(ConcurrentQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        queue.push(p * 1000 + i);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(queue.len(), 400);
        let mut last = [-1i32; 4];
        while let Some(item) = queue.try_pop() {
            let p = (item / 1000) as usize;
            assert!(item > last[p]);
            last[p] = item;
        }
    }
}
