pub mod blocking_queue;
pub mod thread_pool;

pub use blocking_queue::BlockingQueue;
pub use thread_pool::ThreadPool;
