use std::io;

use thiserror::Error;

use crate::codec::ParseError;

/// Crate-wide error type. Per-connection failures (parse errors, would-block
/// reads) are handled locally and never surface here; this covers the
/// operations a caller of [`Server`](crate::server::Server) can observe.
#[derive(Error, Debug)]
pub enum Error {
    #[error("socket error: {source}")]
    Socket {
        #[from]
        source: io::Error,
    },

    #[error("poller error: {message}")]
    Poller { message: String },

    #[error("parse error: {source}")]
    Parse {
        #[from]
        source: ParseError,
    },

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("configuration error: {message}")]
    Config { message: String },
}

impl Error {
    pub(crate) fn poller(message: impl Into<String>) -> Self {
        Error::Poller { message: message.into() }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config { message: message.into() }
    }
}
