use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{error, info};

use crate::task::BlockingQueue;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of executor threads draining one shared FIFO queue.
///
/// `start`/`stop` take `&self` so a pool can be shared behind an `Arc` with
/// the poller callbacks that submit work to it. A task that panics takes
/// down only the thread that ran it; the rest of the pool keeps draining.
pub struct ThreadPool {
    queue: Arc<BlockingQueue<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    num_threads: usize,
}

impl ThreadPool {
    pub fn new(num_threads: usize) -> Self {
        ThreadPool {
            queue: Arc::new(BlockingQueue::new()),
            threads: Mutex::new(Vec::with_capacity(num_threads)),
            running: AtomicBool::new(false),
            num_threads,
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.restart();

        let mut threads = self.threads.lock().unwrap();
        for _ in 0..self.num_threads {
            let queue = Arc::clone(&self.queue);
            threads.push(thread::spawn(move || worker_loop(&queue)));
        }
        info!(threads = self.num_threads, "thread pool started");
    }

    /// Idempotent: stops the queue, wakes every worker, joins them all.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.queue.stop();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in threads {
            let _ = handle.join();
        }
        info!("thread pool stopped");
    }

    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        self.queue.push(Box::new(task));
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(queue: &BlockingQueue<Task>) {
    while let Some(task) = queue.pop() {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("task panicked, executor thread exiting");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == expected {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("counter stuck at {}", counter.load(Ordering::SeqCst));
    }

    #[test]
    fn submitted_tasks_all_run() {
        let pool = ThreadPool::new(4);
        pool.start();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        wait_for(&counter, 50);
        pool.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let pool = ThreadPool::new(2);
        pool.start();
        pool.stop();
        pool.stop();
    }

    #[test]
    fn panicking_task_leaves_pool_working() {
        let pool = ThreadPool::new(2);
        pool.start();

        pool.submit(|| panic!("boom"));

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        wait_for(&counter, 10);
        pool.stop();
    }

    #[test]
    fn restart_after_stop() {
        let pool = ThreadPool::new(2);
        pool.start();
        pool.stop();
        pool.start();

        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        wait_for(&counter, 1);
        pool.stop();
    }
}
