use std::net::Ipv4Addr;
use std::thread;

use crate::{Error, Result};

/// Listener and runtime configuration.
///
/// `num_workers == 0` autodetects hardware concurrency at build time.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,

    pub num_workers: usize,
    pub num_threads_per_worker: usize,

    pub max_connections: usize,
    pub connection_pool_size: usize,

    pub max_request_size: usize,
    pub keepalive_timeout_secs: u64,

    pub read_buffer_size: usize,
    pub write_buffer_size: usize,

    pub tcp_nodelay: bool,
    pub tcp_reuseaddr: bool,
    pub tcp_reuseport: bool,

    pub accept_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: 8080,
            backlog: 4096,
            num_workers: 0,
            num_threads_per_worker: 4,
            max_connections: 100_000,
            connection_pool_size: 100_000,
            max_request_size: 1024 * 1024,
            keepalive_timeout_secs: 60,
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            tcp_nodelay: true,
            tcp_reuseaddr: true,
            tcp_reuseport: true,
            accept_batch_size: 100,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.host_addr()?;
        if self.connection_pool_size == 0 {
            return Err(Error::config("connection_pool_size must be non-zero"));
        }
        if self.num_threads_per_worker == 0 {
            return Err(Error::config("num_threads_per_worker must be non-zero"));
        }
        if self.max_request_size == 0 {
            return Err(Error::config("max_request_size must be non-zero"));
        }
        if self.accept_batch_size == 0 {
            return Err(Error::config("accept_batch_size must be non-zero"));
        }
        Ok(())
    }

    pub fn host_addr(&self) -> Result<Ipv4Addr> {
        self.host
            .parse()
            .map_err(|_| Error::config(format!("invalid host address: {:?}", self.host)))
    }

    pub fn effective_workers(&self) -> usize {
        if self.num_workers > 0 {
            return self.num_workers;
        }
        thread::available_parallelism().map(usize::from).unwrap_or(1).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn bad_host_is_a_config_error() {
        let config = Config { host: "not-an-ip".to_string(), ..Config::default() };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn zero_pool_size_rejected() {
        let config = Config { connection_pool_size: 0, ..Config::default() };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn worker_autodetect_is_at_least_one() {
        let config = Config { num_workers: 0, ..Config::default() };
        assert!(config.effective_workers() >= 1);
        let config = Config { num_workers: 3, ..Config::default() };
        assert_eq!(config.effective_workers(), 3);
    }
}
