use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::connection::ConnectionRef;
use crate::net::{self, poller, Poller};
use crate::server::ConnectionPool;
use crate::task::ThreadPool;
use crate::{Error, Result};

const POLL_TIMEOUT_MS: i32 = 100;
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// One event loop plus a pool of executor threads.
///
/// The event thread only polls and dispatches: every readiness notification
/// is turned into a read/write task on the thread pool, so the loop never
/// blocks on socket I/O. Registrations are one-shot; each task re-arms its
/// connection (under the connection lock) with whatever interest remains.
pub struct Worker {
    poller: Arc<dyn Poller>,
    executors: Arc<ThreadPool>,
    connections: Arc<Mutex<HashMap<RawFd, ConnectionRef>>>,
    pool: Arc<ConnectionPool>,
    keepalive_timeout: Duration,
    running: Arc<AtomicBool>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        num_threads: usize,
        pool: Arc<ConnectionPool>,
        keepalive_timeout: Duration,
    ) -> Result<Self> {
        let poller = poller::create()
            .map_err(|e| Error::poller(format!("failed to create poller: {e}")))?;
        Ok(Worker {
            poller,
            executors: Arc::new(ThreadPool::new(num_threads)),
            connections: Arc::new(Mutex::new(HashMap::new())),
            pool,
            keepalive_timeout,
            running: Arc::new(AtomicBool::new(false)),
            event_thread: Mutex::new(None),
        })
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.executors.start();

        let poller = Arc::clone(&self.poller);
        let connections = Arc::clone(&self.connections);
        let pool = Arc::clone(&self.pool);
        let running = Arc::clone(&self.running);
        let keepalive_timeout = self.keepalive_timeout;

        let handle = thread::spawn(move || {
            event_loop(&*poller, &connections, &pool, &running, keepalive_timeout)
        });
        *self.event_thread.lock().unwrap() = Some(handle);
        info!("worker started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.event_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.executors.stop();
        self.connections.lock().unwrap().clear();
        info!("worker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Take ownership of a pooled connection: wire its close callback,
    /// register one-shot read interest, and kick off the first read.
    pub fn add_connection(&self, conn: ConnectionRef) {
        let fd = conn.lock().unwrap().fd();
        self.connections.lock().unwrap().insert(fd, Arc::clone(&conn));

        {
            let poller = Arc::clone(&self.poller);
            let connections = Arc::clone(&self.connections);
            // The pool owns the connection that owns this callback; the
            // back-reference must stay weak.
            let pool = Arc::downgrade(&self.pool);
            conn.lock().unwrap().set_close_callback(Box::new(move |fd| {
                poller.remove(fd);
                connections.lock().unwrap().remove(&fd);
                if let Some(pool) = pool.upgrade() {
                    pool.release(fd);
                }
            }));
        }

        let callback: net::poller::EventCallback = {
            let conn = Arc::clone(&conn);
            let poller = Arc::clone(&self.poller);
            let executors = Arc::clone(&self.executors);
            Arc::new(move |_fd, events| {
                if events & net::ERROR != 0 {
                    let conn = Arc::clone(&conn);
                    executors.submit(move || conn.lock().unwrap().force_close());
                    return;
                }
                if events & net::READABLE != 0 {
                    let conn = Arc::clone(&conn);
                    let poller = Arc::clone(&poller);
                    executors.submit(move || {
                        let mut guard = conn.lock().unwrap();
                        guard.handle_read();
                        if let Some(interest) = guard.interest() {
                            poller.modify(guard.fd(), interest);
                        }
                    });
                }
                if events & net::WRITABLE != 0 {
                    let conn = Arc::clone(&conn);
                    let poller = Arc::clone(&poller);
                    executors.submit(move || {
                        let mut guard = conn.lock().unwrap();
                        guard.handle_write();
                        if let Some(interest) = guard.interest() {
                            poller.modify(guard.fd(), interest);
                        }
                    });
                }
            })
        };

        if !self.poller.add(fd, net::READABLE, callback) {
            error!(fd, "failed to register connection with poller");
            conn.lock().unwrap().force_close();
            return;
        }

        let mut guard = conn.lock().unwrap();
        guard.start();
        // A response tail may still be buffered after the initial read;
        // re-arm with the full remaining interest.
        if let Some(interest) = guard.interest() {
            self.poller.modify(fd, interest);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn event_loop(
    poller: &dyn Poller,
    connections: &Mutex<HashMap<RawFd, ConnectionRef>>,
    pool: &ConnectionPool,
    running: &AtomicBool,
    keepalive_timeout: Duration,
) {
    let mut last_sweep = Instant::now();
    while running.load(Ordering::SeqCst) {
        match poller.poll(POLL_TIMEOUT_MS) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // A concurrently closed fd can race the select fallback's set
            // construction.
            Err(e) if e.raw_os_error() == Some(libc::EBADF) => continue,
            Err(e) => {
                error!(cause = %e, "poll failed, stopping event loop");
                break;
            }
        }

        if last_sweep.elapsed() >= IDLE_SWEEP_INTERVAL {
            last_sweep = Instant::now();
            sweep_idle_connections(connections, pool, keepalive_timeout);
        }
    }
}

/// Force-close connections idle past the keep-alive timeout. Closing goes
/// through the Connection so the fd is closed exactly once and the close
/// callback handles poller and pool cleanup.
fn sweep_idle_connections(
    connections: &Mutex<HashMap<RawFd, ConnectionRef>>,
    pool: &ConnectionPool,
    keepalive_timeout: Duration,
) {
    for fd in pool.get_idle_connections(keepalive_timeout) {
        let conn = connections.lock().unwrap().get(&fd).cloned();
        if let Some(conn) = conn {
            debug!(fd, "closing idle connection");
            conn.lock().unwrap().force_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::Shutdown;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use super::*;
    use crate::connection::{ConnectionSettings, RequestHandler};
    use crate::protocol::Response;

    fn ok_handler() -> RequestHandler {
        Arc::new(|request| {
            let mut response = Response::new();
            response.set_status(200, "");
            response.set_body(request.path().as_bytes().to_vec());
            response
        })
    }

    fn start_worker(pool: &Arc<ConnectionPool>) -> Worker {
        let worker = Worker::new(2, Arc::clone(pool), Duration::from_secs(60)).unwrap();
        worker.start();
        worker
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn connection_is_served_through_the_event_loop() {
        let pool = Arc::new(ConnectionPool::new(4, ConnectionSettings::default()));
        let worker = start_worker(&pool);

        let (local, mut peer) = UnixStream::pair().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let fd = local.into_raw_fd();
        let conn = pool.acquire(fd, ok_handler()).unwrap();
        worker.add_connection(conn);
        assert_eq!(worker.connection_count(), 1);

        // Request written after registration; the event loop must pick it up.
        peer.write_all(b"GET /ping HTTP/1.1\r\n\r\n").unwrap();
        let mut response = [0u8; 4096];
        let n = peer.read(&mut response).unwrap();
        let text = String::from_utf8_lossy(&response[..n]);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("/ping"));

        // Keep-alive: a second request on the same fd gets a second reply.
        peer.write_all(b"GET /pong HTTP/1.1\r\n\r\n").unwrap();
        let n = peer.read(&mut response).unwrap();
        assert!(String::from_utf8_lossy(&response[..n]).ends_with("/pong"));

        worker.stop();
    }

    #[test]
    fn peer_close_releases_the_slot() {
        let pool = Arc::new(ConnectionPool::new(2, ConnectionSettings::default()));
        let worker = start_worker(&pool);

        let (local, peer) = UnixStream::pair().unwrap();
        let conn = pool.acquire(local.into_raw_fd(), ok_handler()).unwrap();
        worker.add_connection(conn);
        assert_eq!(pool.available(), 1);

        peer.shutdown(Shutdown::Both).unwrap();
        assert!(wait_until(Duration::from_secs(2), || pool.available() == 2));
        assert_eq!(worker.connection_count(), 0);

        worker.stop();
    }
}
