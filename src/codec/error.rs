use snafu::prelude::*;

/// Hard decode failures. Any of these closes the connection; there is no
/// resynchronization inside a corrupted byte stream.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum ParseError {
    #[snafu(display("malformed request line: {line:?}"))]
    InvalidRequestLine { line: String },

    #[snafu(display("unknown method: {token:?}"))]
    UnknownMethod { token: String },

    #[snafu(display("unknown version: {token:?}"))]
    UnknownVersion { token: String },

    #[snafu(display("malformed header line: {line:?}"))]
    InvalidHeader { line: String },

    #[snafu(display("invalid content-length: {value:?}"))]
    InvalidContentLength { value: String },

    #[snafu(display("request too large, current size: {size}, max size: {max_size}"))]
    RequestTooLarge { size: usize, max_size: usize },
}
