mod config;
mod pool;
mod worker;

pub use config::Config;
pub use pool::ConnectionPool;
pub use worker::Worker;

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::connection::{ConnectionSettings, RequestHandler};
use crate::net::Socket;
use crate::router::Router;
use crate::{Error, Result};

/// The listener plus its acceptor thread and worker set.
///
/// Built via [`Server::builder`]; the router is frozen behind an `Arc` at
/// build time and shared immutably by every worker, so handlers must be safe
/// for concurrent invocation.
pub struct Server {
    config: Config,
    router: Arc<Router>,
    pool: Arc<ConnectionPool>,
    workers: Arc<Vec<Worker>>,
    listener: Mutex<Option<Arc<Socket>>>,
    local_addr: Mutex<Option<SocketAddrV4>>,
    next_worker: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

pub struct ServerBuilder {
    config: Config,
    router: Option<Router>,
}

impl ServerBuilder {
    fn new() -> Self {
        ServerBuilder { config: Config::default(), router: None }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    /// Validate the configuration and construct the worker set. Fails with
    /// a configuration error before any socket is touched.
    pub fn build(self) -> Result<Server> {
        self.config.validate()?;
        let router = self.router.ok_or_else(|| Error::config("router must be set"))?;

        let settings = ConnectionSettings {
            max_request_size: self.config.max_request_size,
            read_buffer_size: self.config.read_buffer_size,
            write_buffer_size: self.config.write_buffer_size,
        };
        let pool = Arc::new(ConnectionPool::new(self.config.connection_pool_size, settings));

        let keepalive_timeout = Duration::from_secs(self.config.keepalive_timeout_secs);
        let mut workers = Vec::with_capacity(self.config.effective_workers());
        for _ in 0..self.config.effective_workers() {
            workers.push(Worker::new(
                self.config.num_threads_per_worker,
                Arc::clone(&pool),
                keepalive_timeout,
            )?);
        }

        Ok(Server {
            config: self.config,
            router: Arc::new(router),
            pool,
            workers: Arc::new(workers),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            next_worker: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            accept_thread: Mutex::new(None),
        })
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound address, available once `start` has returned. With port 0 in
    /// the configuration this reports the kernel-assigned port.
    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        *self.local_addr.lock().unwrap()
    }

    pub fn pool_available(&self) -> usize {
        self.pool.available()
    }

    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let listener = match self.setup_listener() {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.local_addr.lock().unwrap() = Some(listener.local_addr()?);

        for worker in self.workers.iter() {
            worker.start();
        }

        let listener = Arc::new(listener);
        *self.listener.lock().unwrap() = Some(Arc::clone(&listener));

        let running = Arc::clone(&self.running);
        let pool = Arc::clone(&self.pool);
        let router = Arc::clone(&self.router);
        let workers = Arc::clone(&self.workers);
        let next_worker = Arc::clone(&self.next_worker);
        let batch_size = self.config.accept_batch_size;

        let handle = thread::spawn(move || {
            accept_loop(&running, &listener, &pool, &router, &workers, &next_worker, batch_size)
        });
        *self.accept_thread.lock().unwrap() = Some(handle);

        info!(
            host = %self.config.host,
            port = self.local_addr().map(|a| a.port()).unwrap_or(self.config.port),
            workers = self.workers.len(),
            threads_per_worker = self.config.num_threads_per_worker,
            pool_size = self.pool.total_size(),
            "server started"
        );
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        for worker in self.workers.iter() {
            worker.stop();
        }
        self.listener.lock().unwrap().take();
        info!("server stopped");
    }

    /// Block until the acceptor exits.
    pub fn wait(&self) {
        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn setup_listener(&self) -> Result<Socket> {
        let socket = Socket::create_tcp()?;
        socket.set_reuseaddr(self.config.tcp_reuseaddr)?;
        socket.set_reuseport(self.config.tcp_reuseport)?;
        socket.set_nodelay(self.config.tcp_nodelay)?;
        socket.set_keepalive(true)?;
        socket.bind(SocketAddrV4::new(self.config.host_addr()?, self.config.port))?;
        socket.listen(self.config.backlog)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    running: &AtomicBool,
    listener: &Socket,
    pool: &Arc<ConnectionPool>,
    router: &Arc<Router>,
    workers: &[Worker],
    next_worker: &AtomicUsize,
    batch_size: usize,
) {
    while running.load(Ordering::SeqCst) {
        let mut accepted = 0;

        for _ in 0..batch_size {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok(client) => {
                    handle_new_connection(client, pool, router, workers, next_worker);
                    accepted += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(cause = %e, "accept failed");
                    break;
                }
            }
        }

        if accepted == 0 {
            thread::sleep(Duration::from_micros(100));
        }
    }
}

fn handle_new_connection(
    mut client: Socket,
    pool: &Arc<ConnectionPool>,
    router: &Arc<Router>,
    workers: &[Worker],
    next_worker: &AtomicUsize,
) {
    let fd = client.fd();
    let handler: RequestHandler = {
        let router = Arc::clone(router);
        Arc::new(move |request| router.route(request))
    };

    match pool.acquire(fd, handler) {
        Some(conn) => {
            // The pooled connection owns the fd from here on.
            client.release();
            let index = next_worker.fetch_add(1, Ordering::Relaxed) % workers.len();
            workers[index].add_connection(conn);
        }
        None => {
            warn!(fd, "connection pool exhausted, rejecting connection");
            // Dropping `client` closes the fd.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_without_router_fails() {
        let result = Server::builder().config(Config::default()).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let config = Config { connection_pool_size: 0, ..Config::default() };
        let result = Server::builder().config(config).router(Router::new()).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn build_with_router_and_small_pool() {
        let config = Config {
            num_workers: 1,
            connection_pool_size: 8,
            ..Config::default()
        };
        let server = Server::builder().config(config).router(Router::new()).build().unwrap();
        assert_eq!(server.pool_available(), 8);
        assert!(!server.is_running());
    }
}
