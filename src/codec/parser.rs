use std::mem;

use snafu::ensure;

use crate::codec::error::*;
use crate::codec::ParseError;
use crate::net::Buffer;
use crate::protocol::{Method, Request, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ExpectRequestLine,
    ExpectHeaders,
    ExpectBody,
    Complete,
}

/// Incremental HTTP/1.1 request decoder over a [`Buffer`].
///
/// `parse` consumes exactly the bytes of one framed request and may be
/// called any number of times as data trickles in; state carries over, so a
/// request split across arbitrary TCP chunks decodes the same as one that
/// arrived whole. One request is produced per [`RequestParser::reset`];
/// after completion the parser stays terminal until reset.
pub struct RequestParser {
    state: State,
    content_length: usize,
    max_request_size: usize,
    request: Request,
}

impl RequestParser {
    pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1024 * 1024;

    pub fn new() -> Self {
        Self::with_max_size(Self::DEFAULT_MAX_REQUEST_SIZE)
    }

    pub fn with_max_size(max_request_size: usize) -> Self {
        RequestParser {
            state: State::ExpectRequestLine,
            content_length: 0,
            max_request_size,
            request: Request::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    pub fn reset(&mut self) {
        self.state = State::ExpectRequestLine;
        self.content_length = 0;
        self.request.reset();
    }

    /// Drive the state machine over the readable region. `Ok(None)` means
    /// more bytes are needed; `Ok(Some(_))` is returned exactly once per
    /// decoded request.
    pub fn parse(&mut self, buffer: &mut Buffer) -> Result<Option<Request>, ParseError> {
        loop {
            match self.state {
                State::ExpectRequestLine => match buffer.find_crlf(0) {
                    Some(pos) => {
                        let line = buffer.peek()[..pos].to_vec();
                        self.parse_request_line(&line)?;
                        buffer.retrieve(pos + 2);
                        self.state = State::ExpectHeaders;
                    }
                    None => {
                        self.check_size(buffer.readable_bytes())?;
                        return Ok(None);
                    }
                },

                State::ExpectHeaders => match buffer.find_crlf(0) {
                    Some(0) => {
                        buffer.retrieve(2);
                        ensure!(
                            self.content_length <= self.max_request_size,
                            RequestTooLargeSnafu {
                                size: self.content_length,
                                max_size: self.max_request_size,
                            }
                        );
                        if self.content_length > 0 {
                            self.state = State::ExpectBody;
                        } else {
                            self.state = State::Complete;
                            return Ok(Some(mem::take(&mut self.request)));
                        }
                    }
                    Some(pos) => {
                        let line = buffer.peek()[..pos].to_vec();
                        self.parse_header_line(&line)?;
                        buffer.retrieve(pos + 2);
                    }
                    None => {
                        self.check_size(buffer.readable_bytes())?;
                        return Ok(None);
                    }
                },

                State::ExpectBody => {
                    if buffer.readable_bytes() < self.content_length {
                        return Ok(None);
                    }
                    let body = buffer.retrieve_as_bytes(self.content_length);
                    self.request.set_body(body);
                    self.state = State::Complete;
                    return Ok(Some(mem::take(&mut self.request)));
                }

                // Terminal until reset.
                State::Complete => return Ok(None),
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let text = std::str::from_utf8(line).map_err(|_| {
            InvalidRequestLineSnafu { line: String::from_utf8_lossy(line).into_owned() }.build()
        })?;

        let mut tokens = text.split_ascii_whitespace();
        let (method_token, target, version_token) =
            match (tokens.next(), tokens.next(), tokens.next()) {
                (Some(m), Some(t), Some(v)) => (m, t, v),
                _ => return InvalidRequestLineSnafu { line: text }.fail(),
            };

        let method = Method::parse(method_token);
        ensure!(method != Method::Unknown, UnknownMethodSnafu { token: method_token });
        self.request.set_method(method);

        match target.split_once('?') {
            Some((path, query)) => {
                self.request.set_path(path);
                self.request.set_query(query);
            }
            None => self.request.set_path(target),
        }

        let version = Version::parse(version_token);
        ensure!(version != Version::Unknown, UnknownVersionSnafu { token: version_token });
        self.request.set_version(version);

        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let text = std::str::from_utf8(line).map_err(|_| {
            InvalidHeaderSnafu { line: String::from_utf8_lossy(line).into_owned() }.build()
        })?;

        let (name, value) = match text.split_once(':') {
            Some((name, value)) => (name, value.trim_start()),
            None => return InvalidHeaderSnafu { line: text }.fail(),
        };

        if name == "Content-Length" {
            self.content_length = value
                .parse()
                .map_err(|_| InvalidContentLengthSnafu { value }.build())?;
        }
        self.request.set_header(name, value);
        Ok(())
    }

    fn check_size(&self, readable: usize) -> Result<(), ParseError> {
        ensure!(
            readable <= self.max_request_size,
            RequestTooLargeSnafu { size: readable, max_size: self.max_request_size }
        );
        Ok(())
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(data: &[u8]) -> Buffer {
        let mut buffer = Buffer::new();
        buffer.append(data);
        buffer
    }

    fn parse_all(raw: &[u8]) -> Result<Option<Request>, ParseError> {
        let mut buffer = buffer_with(raw);
        RequestParser::new().parse(&mut buffer)
    }

    #[test]
    fn simple_get() {
        let request = parse_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(request.method(), Method::Get);
        assert_eq!(request.path(), "/hello");
        assert_eq!(request.query(), "");
        assert_eq!(request.version(), Version::Http11);
        assert_eq!(request.header("Host"), Some("localhost"));
        assert!(request.body().is_empty());
    }

    #[test]
    fn query_split_at_first_question_mark() {
        let request = parse_all(b"GET /search?q=a?b&x=1 HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert_eq!(request.path(), "/search");
        assert_eq!(request.query(), "q=a?b&x=1");
    }

    #[test]
    fn body_framed_by_content_length() {
        let request = parse_all(b"POST /submit HTTP/1.1\r\nContent-Length: 4\r\n\r\ndata")
            .unwrap()
            .unwrap();
        assert_eq!(request.method(), Method::Post);
        assert_eq!(&request.body()[..], b"data");
    }

    #[test]
    fn consumes_exactly_one_request() {
        let mut buffer =
            buffer_with(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let mut parser = RequestParser::new();

        let first = parser.parse(&mut buffer).unwrap().unwrap();
        assert_eq!(first.path(), "/a");
        assert!(parser.is_complete());

        // Terminal until reset; the second request is untouched.
        assert!(parser.parse(&mut buffer).unwrap().is_none());

        parser.reset();
        let second = parser.parse(&mut buffer).unwrap().unwrap();
        assert_eq!(second.path(), "/b");
        assert_eq!(buffer.readable_bytes(), 0);
    }

    #[test]
    fn split_across_arbitrary_chunks() {
        let raw = b"POST /items?id=9 HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        // Feed in every possible two-way split, then byte-by-byte.
        for cut in 0..raw.len() {
            let mut parser = RequestParser::new();
            let mut buffer = buffer_with(&raw[..cut]);
            assert!(parser.parse(&mut buffer).unwrap().is_none(), "cut at {cut}");
            buffer.append(&raw[cut..]);
            let request = parser.parse(&mut buffer).unwrap().unwrap();
            assert_eq!(request.path(), "/items");
            assert_eq!(&request.body()[..], b"hello");
        }

        let mut parser = RequestParser::new();
        let mut buffer = Buffer::new();
        let mut decoded = None;
        for &byte in raw.iter() {
            buffer.append(&[byte]);
            if let Some(request) = parser.parse(&mut buffer).unwrap() {
                decoded = Some(request);
            }
        }
        let request = decoded.expect("request must complete on the last byte");
        assert_eq!(request.query(), "id=9");
        assert_eq!(&request.body()[..], b"hello");
    }

    #[test]
    fn reset_and_refeed_yields_identical_request() {
        let raw = b"PUT /thing HTTP/1.1\r\nA: 1\r\nContent-Length: 2\r\n\r\nok";
        let mut parser = RequestParser::new();

        let mut buffer = buffer_with(raw);
        let first = parser.parse(&mut buffer).unwrap().unwrap();

        parser.reset();
        let mut buffer = buffer_with(raw);
        let second = parser.parse(&mut buffer).unwrap().unwrap();

        assert_eq!(first.method(), second.method());
        assert_eq!(first.path(), second.path());
        assert_eq!(first.headers(), second.headers());
        assert_eq!(first.body(), second.body());
    }

    #[test]
    fn unknown_method_is_a_hard_failure() {
        let err = parse_all(b"BREW /pot HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::UnknownMethod { .. }));
    }

    #[test]
    fn unknown_version_is_a_hard_failure() {
        let err = parse_all(b"GET / HTTP/9.9\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::UnknownVersion { .. }));
    }

    #[test]
    fn missing_tokens_fail() {
        let err = parse_all(b"GET /\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidRequestLine { .. }));
    }

    #[test]
    fn header_without_colon_fails() {
        let err = parse_all(b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidHeader { .. }));
    }

    #[test]
    fn header_value_leading_spaces_trimmed() {
        let request = parse_all(b"GET / HTTP/1.1\r\nHost:    spaced.example\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(request.header("Host"), Some("spaced.example"));
    }

    #[test]
    fn garbage_content_length_fails() {
        let err = parse_all(b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidContentLength { .. }));
    }

    #[test]
    fn body_at_limit_parses_and_one_past_fails() {
        let max = 64;
        let head = format!("POST / HTTP/1.1\r\nContent-Length: {max}\r\n\r\n");
        let mut buffer = buffer_with(head.as_bytes());
        buffer.append(&vec![b'a'; max]);
        let mut parser = RequestParser::with_max_size(max);
        let request = parser.parse(&mut buffer).unwrap().unwrap();
        assert_eq!(request.body().len(), max);

        let head = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", max + 1);
        let mut buffer = buffer_with(head.as_bytes());
        let mut parser = RequestParser::with_max_size(max);
        let err = parser.parse(&mut buffer).unwrap_err();
        assert!(matches!(err, ParseError::RequestTooLarge { .. }));
    }

    #[test]
    fn unterminated_header_section_over_limit_fails() {
        let mut parser = RequestParser::with_max_size(128);
        let mut buffer = buffer_with(&vec![b'h'; 256]);
        let err = parser.parse(&mut buffer).unwrap_err();
        assert!(matches!(err, ParseError::RequestTooLarge { .. }));
    }
}
