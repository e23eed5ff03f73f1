use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct Inner<T> {
    queue: VecDeque<T>,
    stopped: bool,
    capacity: Option<usize>,
}

/// MPMC FIFO queue for producer/consumer hand-off.
///
/// `pop` blocks until an element arrives or the queue is stopped; stopping
/// wakes every waiter, and consumers drain remaining elements before seeing
/// `None`. Pushing after `stop` is allowed so a stopped queue can be
/// restarted without losing work.
pub struct BlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BlockingQueue<T> {
    /// Unbounded queue.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Bounded queue: `push` blocks while `capacity` elements are queued.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        BlockingQueue {
            inner: Mutex::new(Inner { queue: VecDeque::new(), stopped: false, capacity }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn push(&self, value: T) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(capacity) = inner.capacity {
            while inner.queue.len() >= capacity && !inner.stopped {
                inner = self.not_full.wait(inner).unwrap();
            }
        }
        inner.queue.push_back(value);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Blocking pop. `None` means the queue was stopped and is drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        while inner.queue.is_empty() && !inner.stopped {
            inner = self.not_empty.wait(inner).unwrap();
        }
        let value = inner.queue.pop_front();
        drop(inner);
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let value = inner.queue.pop_front();
        drop(inner);
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }

    /// Pop, waiting up to `timeout` for an element.
    pub fn try_pop_for(&self, timeout: Duration) -> Option<T> {
        let inner = self.inner.lock().unwrap();
        let (mut inner, _result) = self
            .not_empty
            .wait_timeout_while(inner, timeout, |inner| {
                inner.queue.is_empty() && !inner.stopped
            })
            .unwrap();
        let value = inner.queue.pop_front();
        drop(inner);
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }

    /// Wake all waiters; consumers fail once the queue is drained.
    pub fn stop(&self) {
        self.inner.lock().unwrap().stopped = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn restart(&self) {
        self.inner.lock().unwrap().stopped = false;
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().queue.clear();
        self.not_full.notify_all();
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
