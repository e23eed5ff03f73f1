use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock;
use crate::connection::{Connection, ConnectionRef, ConnectionSettings, RequestHandler};
use crate::net::Socket;

struct Slot {
    conn: Option<ConnectionRef>,
    activity_ms: Option<Arc<AtomicU64>>,
    in_use: bool,
}

struct Slots {
    entries: Vec<Slot>,
    free_indices: Vec<usize>,
    fd_to_index: HashMap<RawFd, usize>,
}

/// Preallocated connection slots, shared by every worker.
///
/// A slot's Connection is constructed on first acquire and reused via
/// `reset` afterwards, so steady-state accepts allocate nothing. Invariant:
/// `free_indices` holds exactly the indices with `in_use == false`, and
/// `fd_to_index` maps every in-use fd to its slot.
pub struct ConnectionPool {
    slots: Mutex<Slots>,
    settings: ConnectionSettings,
}

impl ConnectionPool {
    pub fn new(size: usize, settings: ConnectionSettings) -> Self {
        let mut entries = Vec::with_capacity(size);
        let mut free_indices = Vec::with_capacity(size);
        for index in 0..size {
            entries.push(Slot { conn: None, activity_ms: None, in_use: false });
            free_indices.push(index);
        }
        ConnectionPool {
            slots: Mutex::new(Slots { entries, free_indices, fd_to_index: HashMap::new() }),
            settings,
        }
    }

    /// Take a slot for `fd`. `None` means the pool is exhausted and the
    /// caller must close the fd itself.
    pub fn acquire(&self, fd: RawFd, handler: RequestHandler) -> Option<ConnectionRef> {
        let mut guard = self.slots.lock().unwrap();
        let slots = &mut *guard;
        let index = slots.free_indices.pop()?;

        let slot = &mut slots.entries[index];
        let conn = match slot.conn.take() {
            Some(conn) => {
                conn.lock().unwrap().reset(fd);
                conn
            }
            None => {
                let conn = Arc::new(Mutex::new(Connection::new(
                    Socket::from_fd(fd),
                    handler,
                    &self.settings,
                )));
                slot.activity_ms = Some(conn.lock().unwrap().activity_handle());
                conn
            }
        };
        slot.conn = Some(Arc::clone(&conn));
        slot.in_use = true;
        slots.fd_to_index.insert(fd, index);
        Some(conn)
    }

    pub fn release(&self, fd: RawFd) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(index) = slots.fd_to_index.remove(&fd) {
            slots.entries[index].in_use = false;
            slots.free_indices.push(index);
        }
    }

    pub fn available(&self) -> usize {
        self.slots.lock().unwrap().free_indices.len()
    }

    pub fn total_size(&self) -> usize {
        self.slots.lock().unwrap().entries.len()
    }

    /// In-use fds whose last activity is older than `timeout`. Reads the
    /// shared activity atomics only, so no connection lock is taken.
    pub fn get_idle_connections(&self, timeout: Duration) -> Vec<RawFd> {
        let slots = self.slots.lock().unwrap();
        let now = clock::now_ms();
        let timeout_ms = timeout.as_millis() as u64;

        let mut idle = Vec::new();
        for (&fd, &index) in slots.fd_to_index.iter() {
            let slot = &slots.entries[index];
            if !slot.in_use {
                continue;
            }
            if let Some(activity) = &slot.activity_ms {
                if now.saturating_sub(activity.load(Ordering::Relaxed)) > timeout_ms {
                    idle.push(fd);
                }
            }
        }
        idle
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;
    use crate::protocol::Response;

    fn noop_handler() -> RequestHandler {
        Arc::new(|_| Response::new())
    }

    /// Real fds so the pooled connections close something they own.
    fn fresh_fd(peers: &mut Vec<UnixStream>) -> RawFd {
        let (local, peer) = UnixStream::pair().unwrap();
        peers.push(peer);
        local.into_raw_fd()
    }

    #[test]
    fn acquire_and_release_cycle() {
        let pool = ConnectionPool::new(4, ConnectionSettings::default());
        let mut peers = Vec::new();
        assert_eq!(pool.available(), 4);

        let fd = fresh_fd(&mut peers);
        let conn = pool.acquire(fd, noop_handler()).unwrap();
        assert_eq!(pool.available(), 3);
        assert_eq!(conn.lock().unwrap().fd(), fd);

        conn.lock().unwrap().force_close();
        pool.release(fd);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let pool = ConnectionPool::new(2, ConnectionSettings::default());
        let mut peers = Vec::new();

        let fd_a = fresh_fd(&mut peers);
        let fd_b = fresh_fd(&mut peers);
        let _a = pool.acquire(fd_a, noop_handler()).unwrap();
        let _b = pool.acquire(fd_b, noop_handler()).unwrap();
        assert_eq!(pool.available(), 0);

        let fd_c = fresh_fd(&mut peers);
        assert!(pool.acquire(fd_c, noop_handler()).is_none());
        unsafe { libc::close(fd_c) };

        pool.release(fd_a);
        let fd_d = fresh_fd(&mut peers);
        assert!(pool.acquire(fd_d, noop_handler()).is_some());
    }

    #[test]
    fn slot_reuse_resets_the_connection() {
        let pool = ConnectionPool::new(1, ConnectionSettings::default());
        let mut peers = Vec::new();

        let fd_a = fresh_fd(&mut peers);
        let first = pool.acquire(fd_a, noop_handler()).unwrap();
        first.lock().unwrap().force_close();
        pool.release(fd_a);

        let fd_b = fresh_fd(&mut peers);
        let second = pool.acquire(fd_b, noop_handler()).unwrap();
        // Same preallocated slot object, rebound to the new fd.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().unwrap().fd(), fd_b);
    }

    #[test]
    fn release_of_unknown_fd_is_ignored() {
        let pool = ConnectionPool::new(1, ConnectionSettings::default());
        pool.release(9999);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn idle_detection_uses_activity_timestamps() {
        let pool = ConnectionPool::new(2, ConnectionSettings::default());
        let mut peers = Vec::new();

        let fd = fresh_fd(&mut peers);
        let conn = pool.acquire(fd, noop_handler()).unwrap();
        assert!(pool.get_idle_connections(Duration::from_secs(60)).is_empty());

        thread::sleep(Duration::from_millis(30));
        let idle = pool.get_idle_connections(Duration::from_millis(10));
        assert_eq!(idle, vec![fd]);

        // Fresh activity takes it back out of the idle set.
        conn.lock().unwrap().update_activity();
        assert!(pool.get_idle_connections(Duration::from_millis(10)).is_empty());
    }
}
