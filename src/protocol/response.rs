use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::net::Buffer;

/// An in-memory HTTP/1.1 response.
///
/// `set_body`/`append_body` keep `Content-Length` current; serialization
/// adds `Connection` and `Content-Length` headers when the handler did not
/// set them explicitly.
#[derive(Debug, Clone)]
pub struct Response {
    status_code: u16,
    status_message: String,
    headers: HashMap<String, String>,
    body: Bytes,
    keep_alive: bool,
}

impl Response {
    pub fn new() -> Self {
        Response {
            status_code: 200,
            status_message: "OK".to_string(),
            headers: HashMap::new(),
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Set the status code; an empty message picks the standard reason
    /// phrase for the code.
    pub fn set_status(&mut self, code: u16, message: &str) {
        self.status_code = code;
        self.status_message = if message.is_empty() {
            default_status_message(code).to_string()
        } else {
            message.to_string()
        };
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        self.set_header("Content-Length", self.body.len().to_string());
    }

    pub fn append_body(&mut self, data: &[u8]) {
        let mut body = BytesMut::from(&self.body[..]);
        body.extend_from_slice(data);
        self.body = body.freeze();
        self.set_header("Content-Length", self.body.len().to_string());
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.set_header("Content-Type", content_type);
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
        self.set_header("Connection", if keep_alive { "keep-alive" } else { "close" });
    }

    /// Serialize into a write buffer: status line, headers, implicit
    /// `Connection`/`Content-Length`, blank line, body.
    pub fn write_to(&self, buffer: &mut Buffer) {
        buffer.append(format!("HTTP/1.1 {} {}\r\n", self.status_code, self.status_message).as_bytes());
        for (name, value) in &self.headers {
            buffer.append(format!("{name}: {value}\r\n").as_bytes());
        }
        if !self.headers.contains_key("Connection") {
            let value = if self.keep_alive { "keep-alive" } else { "close" };
            buffer.append(format!("Connection: {value}\r\n").as_bytes());
        }
        if !self.headers.contains_key("Content-Length") && !self.body.is_empty() {
            buffer.append(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buffer.append(b"\r\n");
        buffer.append(&self.body);
    }

    pub fn make_404() -> Response {
        Self::make_html(404, "<html><body><h1>404 Not Found</h1></body></html>")
    }

    pub fn make_500() -> Response {
        Self::make_html(500, "<html><body><h1>500 Internal Server Error</h1></body></html>")
    }

    pub fn make_json(code: u16, json: impl Into<Bytes>) -> Response {
        let mut response = Response::new();
        response.set_status(code, "");
        response.set_content_type("application/json");
        response.set_body(json);
        response
    }

    pub fn make_html(code: u16, html: impl Into<Bytes>) -> Response {
        let mut response = Response::new();
        response.set_status(code, "");
        response.set_content_type("text/html");
        response.set_body(html);
        response
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

fn default_status_message(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
