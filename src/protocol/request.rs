use std::collections::HashMap;

use bytes::Bytes;

use crate::protocol::{Method, Version};

/// A decoded HTTP/1.1 request.
///
/// Header names are stored as sent (the map is case-sensitive) and the body
/// is the contiguous `Content-Length`-framed payload.
#[derive(Debug, Clone, Default)]
pub struct Request {
    method: Method,
    path: String,
    query: String,
    version: Version,
    headers: HashMap<String, String>,
    body: Bytes,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The part of the request target after the first `?`, or empty.
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub fn set_query(&mut self, query: impl Into<String>) {
        self.query = query.into();
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn reset(&mut self) {
        *self = Request::default();
    }
}
