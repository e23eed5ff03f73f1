use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

/// Readiness event bits, OR-ed into the mask handed to callbacks.
pub const READABLE: u32 = 0b001;
pub const WRITABLE: u32 = 0b010;
pub const ERROR: u32 = 0b100;

pub type EventCallback = Arc<dyn Fn(RawFd, u32) + Send + Sync>;

/// Readiness notifier. One instance per worker; `poll` runs on the worker's
/// event thread and fires callbacks synchronously, while `add`/`modify`/
/// `remove` may be called from executor threads (registration state is
/// internally synchronized).
///
/// Registration is one-shot: after an event fires for an fd, no further
/// events are reported until `modify` re-arms it. This keeps at most one
/// read/write task in flight per connection.
pub trait Poller: Send + Sync {
    fn add(&self, fd: RawFd, events: u32, callback: EventCallback) -> bool;
    fn modify(&self, fd: RawFd, events: u32) -> bool;
    fn remove(&self, fd: RawFd) -> bool;
    fn poll(&self, timeout_ms: i32) -> io::Result<usize>;
}

/// Platform default: epoll on Linux, select elsewhere.
pub fn create() -> io::Result<Arc<dyn Poller>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(EpollPoller::new()?))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(Arc::new(SelectPoller::new()))
    }
}

#[cfg(target_os = "linux")]
pub use epoll::EpollPoller;

#[cfg(target_os = "linux")]
mod epoll {
    use super::*;

    const INITIAL_EVENT_CAPACITY: usize = 16;

    /// Edge-triggered, one-shot epoll wrapper.
    pub struct EpollPoller {
        epfd: RawFd,
        events: Mutex<Vec<libc::epoll_event>>,
        callbacks: Mutex<HashMap<RawFd, EventCallback>>,
    }

    impl EpollPoller {
        pub fn new() -> io::Result<Self> {
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(EpollPoller {
                epfd,
                events: Mutex::new(vec![
                    libc::epoll_event { events: 0, u64: 0 };
                    INITIAL_EVENT_CAPACITY
                ]),
                callbacks: Mutex::new(HashMap::new()),
            })
        }

        fn interest(events: u32) -> u32 {
            let mut mask = (libc::EPOLLET | libc::EPOLLONESHOT) as u32;
            if events & READABLE != 0 {
                mask |= libc::EPOLLIN as u32;
            }
            if events & WRITABLE != 0 {
                mask |= libc::EPOLLOUT as u32;
            }
            mask
        }

        fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> bool {
            let mut ev = libc::epoll_event { events: Self::interest(events), u64: fd as u64 };
            unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) == 0 }
        }
    }

    impl Poller for EpollPoller {
        fn add(&self, fd: RawFd, events: u32, callback: EventCallback) -> bool {
            if !self.ctl(libc::EPOLL_CTL_ADD, fd, events) {
                return false;
            }
            self.callbacks.lock().unwrap().insert(fd, callback);
            true
        }

        fn modify(&self, fd: RawFd, events: u32) -> bool {
            self.ctl(libc::EPOLL_CTL_MOD, fd, events)
        }

        fn remove(&self, fd: RawFd) -> bool {
            let ok = unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) == 0
            };
            self.callbacks.lock().unwrap().remove(&fd);
            ok
        }

        fn poll(&self, timeout_ms: i32) -> io::Result<usize> {
            let mut ready = Vec::new();
            {
                let mut events = self.events.lock().unwrap();
                let n = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        events.len() as libc::c_int,
                        timeout_ms,
                    )
                };
                if n < 0 {
                    return Err(io::Error::last_os_error());
                }
                let n = n as usize;

                for event in events.iter().take(n) {
                    let fd = event.u64 as RawFd;
                    let mut revents = 0;
                    if event.events & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
                        revents |= READABLE;
                    }
                    if event.events & libc::EPOLLOUT as u32 != 0 {
                        revents |= WRITABLE;
                    }
                    if event.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                        revents |= ERROR;
                    }
                    ready.push((fd, revents));
                }

                if n == events.len() {
                    let doubled = events.len() * 2;
                    events.resize(doubled, libc::epoll_event { events: 0, u64: 0 });
                }
            }

            let count = ready.len();
            for (fd, revents) in ready {
                let callback = self.callbacks.lock().unwrap().get(&fd).cloned();
                if let Some(callback) = callback {
                    callback(fd, revents);
                }
            }
            Ok(count)
        }
    }

    impl Drop for EpollPoller {
        fn drop(&mut self) {
            if self.epfd >= 0 {
                unsafe { libc::close(self.epfd) };
            }
        }
    }
}

/// Level-triggered select fallback. One-shot delivery is emulated: firing an
/// event clears the fd's armed mask, and `modify` restores it.
pub struct SelectPoller {
    fds: Mutex<HashMap<RawFd, FdInfo>>,
}

struct FdInfo {
    events: u32,
    armed: u32,
    callback: EventCallback,
}

impl SelectPoller {
    pub fn new() -> Self {
        SelectPoller { fds: Mutex::new(HashMap::new()) }
    }
}

impl Default for SelectPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller for SelectPoller {
    fn add(&self, fd: RawFd, events: u32, callback: EventCallback) -> bool {
        self.fds.lock().unwrap().insert(fd, FdInfo { events, armed: events, callback });
        true
    }

    fn modify(&self, fd: RawFd, events: u32) -> bool {
        match self.fds.lock().unwrap().get_mut(&fd) {
            Some(info) => {
                info.events = events;
                info.armed = events;
                true
            }
            None => false,
        }
    }

    fn remove(&self, fd: RawFd) -> bool {
        self.fds.lock().unwrap().remove(&fd).is_some()
    }

    fn poll(&self, timeout_ms: i32) -> io::Result<usize> {
        let mut readfds = unsafe { std::mem::zeroed::<libc::fd_set>() };
        let mut writefds = unsafe { std::mem::zeroed::<libc::fd_set>() };
        let mut exceptfds = unsafe { std::mem::zeroed::<libc::fd_set>() };
        unsafe {
            libc::FD_ZERO(&mut readfds);
            libc::FD_ZERO(&mut writefds);
            libc::FD_ZERO(&mut exceptfds);
        }

        let mut max_fd = -1;
        {
            let fds = self.fds.lock().unwrap();
            for (&fd, info) in fds.iter() {
                if info.armed & READABLE != 0 {
                    unsafe { libc::FD_SET(fd, &mut readfds) };
                }
                if info.armed & WRITABLE != 0 {
                    unsafe { libc::FD_SET(fd, &mut writefds) };
                }
                unsafe { libc::FD_SET(fd, &mut exceptfds) };
                max_fd = max_fd.max(fd);
            }
        }

        let mut tv = libc::timeval {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
        };
        let ret = unsafe {
            libc::select(max_fd + 1, &mut readfds, &mut writefds, &mut exceptfds, &mut tv)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut fired = Vec::new();
        {
            let mut fds = self.fds.lock().unwrap();
            for (&fd, info) in fds.iter_mut() {
                let mut revents = 0;
                if unsafe { libc::FD_ISSET(fd, &readfds) } {
                    revents |= READABLE;
                }
                if unsafe { libc::FD_ISSET(fd, &writefds) } {
                    revents |= WRITABLE;
                }
                if unsafe { libc::FD_ISSET(fd, &exceptfds) } {
                    revents |= ERROR;
                }
                if revents != 0 {
                    info.armed = 0;
                    fired.push((fd, revents, info.callback.clone()));
                }
            }
        }

        let count = fired.len();
        for (fd, revents, callback) in fired {
            callback(fd, revents);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn readiness_is_one_shot(poller: &dyn Poller) {
        let (mut a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();

        let seen = Arc::new(AtomicU32::new(0));
        let cb: EventCallback = {
            let seen = Arc::clone(&seen);
            Arc::new(move |_fd, events| {
                if events & READABLE != 0 {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        assert!(poller.add(fd, READABLE, cb));

        a.write_all(b"x").unwrap();
        poller.poll(100).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // Not re-armed: the unread byte must not fire again.
        poller.poll(50).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // Re-armed: the pending byte is reported once more.
        assert!(poller.modify(fd, READABLE));
        poller.poll(100).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        assert!(poller.remove(fd));
    }

    #[test]
    fn platform_poller_is_one_shot() {
        let poller = create().unwrap();
        readiness_is_one_shot(poller.as_ref());
    }

    #[test]
    fn select_poller_is_one_shot() {
        let poller = SelectPoller::new();
        readiness_is_one_shot(&poller);
    }

    #[test]
    fn writable_interest_fires() {
        let poller = create().unwrap();
        let (_a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();

        let seen = Arc::new(AtomicU32::new(0));
        let cb: EventCallback = {
            let seen = Arc::clone(&seen);
            Arc::new(move |_fd, events| {
                seen.fetch_or(events, Ordering::SeqCst);
            })
        };
        // A fresh socket with an empty send buffer is immediately writable.
        assert!(poller.add(fd, WRITABLE, cb));
        poller.poll(100).unwrap();
        assert_ne!(seen.load(Ordering::SeqCst) & WRITABLE, 0);
    }

    #[test]
    fn remove_unregistered_fd_reports_failure() {
        let poller = SelectPoller::new();
        assert!(!poller.remove(42));
    }
}
