//! Framework-neutral view of one inbound request.

use std::collections::HashMap;

use url::Url;

use crate::error::Result;
use crate::session::{MemorySession, SessionCarrier};

/// Per-route overrides the host may attach to a request.
#[derive(Debug, Clone, Default)]
pub struct RouteSettings {
    /// Overrides the resource strategy's `initiate` default when set.
    pub initiate: Option<bool>,
}

/// One inbound request as the strategies see it.
///
/// The host adapter builds one per request/response cycle; nothing here is
/// shared across requests except the session carrier's backing store.
///
/// # Example
/// ```
/// use authwall::request::Request;
/// use authwall::session::MemorySession;
///
/// let request = Request::from_uri(
///     "https://app.example.com/portal?code=abc",
///     Box::new(MemorySession::new()),
/// )?;
/// assert_eq!(request.query("code"), Some("abc"));
/// # Ok::<(), authwall::Error>(())
/// ```
pub struct Request {
    uri: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    pub route: RouteSettings,
    pub session: Box<dyn SessionCarrier>,
}

impl Request {
    /// Build a request from a full URI, parsing path and query out of it.
    pub fn from_uri(uri: impl Into<String>, session: Box<dyn SessionCarrier>) -> Result<Self> {
        let uri = uri.into();
        let parsed = Url::parse(&uri)?;
        let query = parsed
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        Ok(Self {
            path: parsed.path().to_string(),
            uri,
            query,
            headers: HashMap::new(),
            route: RouteSettings::default(),
            session,
        })
    }

    /// Same, backed by a fresh in-memory session (test and standalone use).
    pub fn with_memory_session(uri: impl Into<String>) -> Result<Self> {
        Self::from_uri(uri, Box::new(MemorySession::new()))
    }

    /// Attach a header; names are matched case-insensitively.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_route(mut self, route: RouteSettings) -> Self {
        self.route = route;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// The full inbound query map, as the remote-callback verification
    /// needs it.
    pub fn query_map(&self) -> &HashMap<String, String> {
        &self.query
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Content-negotiation heuristic: does the caller look like an API/XHR
    /// client rather than a browser that can follow a login redirect?
    pub fn wants_json(&self) -> bool {
        if self.header("x-requested-with") == Some("XMLHttpRequest") {
            return true;
        }
        self.header("accept")
            .is_some_and(|accept| accept.contains("application/json"))
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("uri", &self.uri)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}
