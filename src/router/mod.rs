use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use regex::Regex;
use tracing::error;

use crate::protocol::{Method, Request, Response};

pub type Handler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;
pub type Middleware = Arc<dyn Fn(&mut Request) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&str) -> Response + Send + Sync>;

struct Route {
    pattern: String,
    regex: Option<Regex>,
    handler: Handler,
}

/// Dispatch table from parsed requests to handlers.
///
/// Routes are scanned in insertion order per method and the first match
/// wins: plain patterns compare for string equality, patterns containing
/// `(`, `[` or `*` are compiled once as full-string regexes. Middlewares run
/// before matching on a clone of the request (prefix-filtered, insertion
/// order); matching itself always uses the original path. A panicking
/// handler or middleware is confined here and answered with the error
/// handler's response or a default 500 page.
pub struct Router {
    routes: HashMap<Method, Vec<Route>>,
    middlewares: Vec<(String, Middleware)>,
    not_found_handler: Option<Handler>,
    error_handler: Option<ErrorHandler>,
}

impl Router {
    pub fn new() -> Self {
        Router {
            routes: HashMap::new(),
            middlewares: Vec::new(),
            not_found_handler: None,
            error_handler: None,
        }
    }

    /// Register a route. The pattern is treated as a regex iff it contains
    /// one of `(`, `[`, `*`; compilation happens here, never on the request
    /// path. Panics on an invalid regex pattern, which is a programming
    /// error at registration time.
    pub fn add_route(
        &mut self,
        method: Method,
        pattern: impl Into<String>,
        handler: impl Fn(&Request) -> Response + Send + Sync + 'static,
    ) {
        let pattern = pattern.into();
        let regex = if pattern.contains(['(', '[', '*']) {
            // Full-string match semantics, so anchor the pattern.
            Some(Regex::new(&format!("^(?:{pattern})$")).expect("invalid route pattern"))
        } else {
            None
        };
        self.routes
            .entry(method)
            .or_default()
            .push(Route { pattern, regex, handler: Arc::new(handler) });
    }

    pub fn get(
        &mut self,
        pattern: impl Into<String>,
        handler: impl Fn(&Request) -> Response + Send + Sync + 'static,
    ) {
        self.add_route(Method::Get, pattern, handler);
    }

    pub fn post(
        &mut self,
        pattern: impl Into<String>,
        handler: impl Fn(&Request) -> Response + Send + Sync + 'static,
    ) {
        self.add_route(Method::Post, pattern, handler);
    }

    pub fn put(
        &mut self,
        pattern: impl Into<String>,
        handler: impl Fn(&Request) -> Response + Send + Sync + 'static,
    ) {
        self.add_route(Method::Put, pattern, handler);
    }

    pub fn del(
        &mut self,
        pattern: impl Into<String>,
        handler: impl Fn(&Request) -> Response + Send + Sync + 'static,
    ) {
        self.add_route(Method::Delete, pattern, handler);
    }

    /// Append a middleware. It runs for every request whose path starts
    /// with `prefix`; an empty prefix matches everything.
    pub fn use_middleware(
        &mut self,
        prefix: impl Into<String>,
        middleware: impl Fn(&mut Request) + Send + Sync + 'static,
    ) {
        self.middlewares.push((prefix.into(), Arc::new(middleware)));
    }

    pub fn set_not_found_handler(
        &mut self,
        handler: impl Fn(&Request) -> Response + Send + Sync + 'static,
    ) {
        self.not_found_handler = Some(Arc::new(handler));
    }

    /// Handler invoked with the panic message when a route handler or
    /// middleware panics.
    pub fn set_error_handler(
        &mut self,
        handler: impl Fn(&str) -> Response + Send + Sync + 'static,
    ) {
        self.error_handler = Some(Arc::new(handler));
    }

    pub fn route(&self, request: &Request) -> Response {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(request)));
        match result {
            Ok(response) => response,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(cause = %message, path = request.path(), "handler panicked");
                match &self.error_handler {
                    Some(handler) => handler(&message),
                    None => default_error(&message),
                }
            }
        }
    }

    fn dispatch(&self, request: &Request) -> Response {
        let mut modified = request.clone();
        for (prefix, middleware) in &self.middlewares {
            if prefix.is_empty() || request.path().starts_with(prefix.as_str()) {
                middleware(&mut modified);
            }
        }

        if let Some(routes) = self.routes.get(&request.method()) {
            for route in routes {
                let matched = match &route.regex {
                    Some(regex) => regex.is_match(request.path()),
                    None => route.pattern == request.path(),
                };
                if matched {
                    return (route.handler)(&modified);
                }
            }
        }

        match &self.not_found_handler {
            Some(handler) => handler(&modified),
            None => Response::make_404(),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn default_error(message: &str) -> Response {
    Response::make_html(
        500,
        format!("<html><body><h1>500 Internal Server Error</h1><p>{message}</p></body></html>"),
    )
}
