use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::clock;
use crate::codec::{ParseError, RequestParser};
use crate::net::{Buffer, Socket, READABLE, WRITABLE};
use crate::protocol::{Request, Response, Version};

pub type RequestHandler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;
pub type CloseCallback = Box<dyn FnOnce(RawFd) + Send>;
pub type ConnectionRef = Arc<Mutex<Connection>>;

/// Initial buffer capacities and parser limit for pooled connections.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub max_request_size: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            max_request_size: RequestParser::DEFAULT_MAX_REQUEST_SIZE,
            read_buffer_size: Buffer::INITIAL_SIZE,
            write_buffer_size: Buffer::INITIAL_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Per-socket state machine: read, decode, dispatch, write back.
///
/// All work for one connection runs serialized under its mutex, so requests
/// on a connection are answered strictly in arrival order. The close
/// callback fires exactly once, from whichever path disconnects first; it
/// receives the raw fd so the worker and pool can drop their entries without
/// holding a reference back into this object.
pub struct Connection {
    socket: Socket,
    state: State,
    read_buffer: Buffer,
    write_buffer: Buffer,
    parser: RequestParser,
    last_request: Request,
    handler: RequestHandler,
    close_callback: Option<CloseCallback>,
    activity_ms: Arc<AtomicU64>,
}

impl Connection {
    pub fn new(socket: Socket, handler: RequestHandler, settings: &ConnectionSettings) -> Self {
        if let Err(e) = socket.set_nonblocking(true) {
            error!(cause = %e, fd = socket.fd(), "failed to set socket non-blocking");
        }
        Connection {
            socket,
            state: State::Connecting,
            read_buffer: Buffer::with_capacity(settings.read_buffer_size),
            write_buffer: Buffer::with_capacity(settings.write_buffer_size),
            parser: RequestParser::with_max_size(settings.max_request_size),
            last_request: Request::new(),
            handler,
            close_callback: None,
            activity_ms: Arc::new(AtomicU64::new(clock::now_ms())),
        }
    }

    /// Rebind a pooled connection to a freshly accepted fd.
    pub fn reset(&mut self, fd: RawFd) {
        self.socket = Socket::from_fd(fd);
        if let Err(e) = self.socket.set_nonblocking(true) {
            error!(cause = %e, fd, "failed to set socket non-blocking");
        }
        self.state = State::Connecting;
        self.read_buffer.retrieve_all();
        self.write_buffer.retrieve_all();
        self.parser.reset();
        self.last_request.reset();
        self.close_callback = None;
        self.update_activity();
    }

    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    pub fn set_close_callback(&mut self, callback: CloseCallback) {
        self.close_callback = Some(callback);
    }

    /// Shared activity timestamp (milliseconds, monotonic); the pool slot
    /// keeps a clone so the idle sweep never has to lock the connection.
    pub fn activity_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.activity_ms)
    }

    pub fn update_activity(&self) {
        self.activity_ms.store(clock::now_ms(), Ordering::Relaxed);
    }

    pub fn start(&mut self) {
        self.state = State::Connected;
        self.handle_read();
    }

    /// Events this connection still wants, or `None` once disconnected.
    /// The worker re-arms the one-shot registration with this after every
    /// read/write task.
    pub fn interest(&self) -> Option<u32> {
        match self.state {
            State::Connected => {
                let mut events = READABLE;
                if self.write_buffer.readable_bytes() > 0 {
                    events |= WRITABLE;
                }
                Some(events)
            }
            State::Disconnecting if self.write_buffer.readable_bytes() > 0 => Some(WRITABLE),
            _ => None,
        }
    }

    /// Drain the socket edge-triggered: read until `WouldBlock`, decoding
    /// and answering complete requests as they appear.
    pub fn handle_read(&mut self) {
        if self.state != State::Connected {
            return;
        }
        loop {
            match self.read_buffer.read_from_fd(self.socket.fd()) {
                Ok(0) => {
                    self.handle_close();
                    break;
                }
                Ok(_) => {
                    self.update_activity();
                    self.process_requests();
                    if self.state != State::Connected {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.handle_error(&e);
                    break;
                }
            }
        }
    }

    /// Drain the write buffer once; a remainder waits for the next writable
    /// notification. A disconnecting connection sends FIN and closes when
    /// the buffer empties.
    pub fn handle_write(&mut self) {
        if self.state != State::Connected && self.state != State::Disconnecting {
            return;
        }
        if self.write_buffer.readable_bytes() > 0 {
            match self.socket.send(self.write_buffer.peek()) {
                Ok(n) => {
                    self.write_buffer.retrieve(n);
                    if self.write_buffer.readable_bytes() == 0 && self.state == State::Disconnecting
                    {
                        self.socket.shutdown_write();
                        self.force_close();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => self.handle_error(&e),
            }
        } else if self.state == State::Disconnecting {
            self.socket.shutdown_write();
            self.force_close();
        }
    }

    pub fn send(&mut self, response: &Response) {
        if self.state != State::Connected {
            return;
        }
        response.write_to(&mut self.write_buffer);
        self.handle_write();
    }

    /// Begin a graceful close. The FIN goes out once the write buffer has
    /// drained, so a response queued just before shutdown still reaches the
    /// peer intact.
    pub fn shutdown(&mut self) {
        if self.state == State::Connected {
            self.state = State::Disconnecting;
        }
        if self.write_buffer.readable_bytes() == 0 {
            self.socket.shutdown_write();
            self.force_close();
        }
    }

    /// Close the fd immediately and fire the close callback exactly once.
    pub fn force_close(&mut self) {
        if self.state == State::Disconnected {
            return;
        }
        self.state = State::Disconnected;
        let fd = self.socket.fd();
        if let Some(callback) = self.close_callback.take() {
            callback(fd);
        }
        self.socket.close();
    }

    fn process_requests(&mut self) {
        loop {
            match self.parser.parse(&mut self.read_buffer) {
                Ok(Some(request)) => {
                    self.last_request = request;
                    let response = (self.handler)(&self.last_request);
                    let keep_alive = self.wants_keep_alive();
                    self.send_response(response, keep_alive);
                    self.parser.reset();
                    if !keep_alive {
                        self.shutdown();
                        break;
                    }
                    if self.state != State::Connected {
                        break;
                    }
                }
                Ok(None) => break,
                Err(ParseError::RequestTooLarge { size, max_size }) => {
                    warn!(fd = self.socket.fd(), size, max_size, "request too large, rejecting");
                    self.reject_oversize();
                    break;
                }
                Err(e) => {
                    error!(cause = %e, fd = self.socket.fd(), "request parse failed, closing connection");
                    self.force_close();
                    break;
                }
            }
        }
    }

    fn send_response(&mut self, mut response: Response, keep_alive: bool) {
        response.set_keep_alive(keep_alive);
        self.send(&response);
    }

    fn wants_keep_alive(&self) -> bool {
        let connection = self.last_request.header("Connection").unwrap_or("");
        connection.eq_ignore_ascii_case("keep-alive")
            || (self.last_request.version() == Version::Http11
                && !connection.eq_ignore_ascii_case("close"))
    }

    fn reject_oversize(&mut self) {
        let mut response = Response::make_html(
            413,
            "<html><body><h1>413 Payload Too Large</h1></body></html>",
        );
        response.set_keep_alive(false);
        response.write_to(&mut self.write_buffer);
        self.handle_write();
        self.shutdown();
    }

    fn handle_close(&mut self) {
        debug!(fd = self.socket.fd(), "connection closed by peer");
        self.force_close();
    }

    fn handle_error(&mut self, error: &io::Error) {
        error!(cause = %error, fd = self.socket.fd(), "connection error");
        self.force_close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != State::Disconnected {
            self.force_close();
        }
    }
}
