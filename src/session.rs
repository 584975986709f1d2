//! Session carrier contract and the authenticated-identity accessor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};
use crate::request::Request;
use crate::token::Token;

/// Session key holding the identity record.
const AUTH_KEY: &str = "auth";

/// Query marker appended by [`retry_redirect`]; a request already carrying
/// it is treated as a broken redirect chain.
const RETRY_MARKER: &str = "retry";

/// One request's view of the persistent session.
///
/// Implemented by the host transport's session plumbing; persisted across
/// requests by the host. [`MemorySession`] is the in-crate reference
/// implementation.
pub trait SessionCarrier: Send {
    /// Read a value, optionally deleting it in the same step.
    fn get(&mut self, key: &str, delete_after_read: bool) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value);
    fn clear(&mut self, key: &str);
    /// Mark the session dirty so its idle-expiry clock resets.
    fn touch(&mut self);
    /// Drop every session value (logout).
    fn reset(&mut self);
}

/// The authenticated-identity record attached to a session.
///
/// Owned exclusively by the current session and mutated only through
/// [`set_authentication`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub credentials: Credentials,
    pub artifacts: Artifacts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Provider user claims; a record authenticates iff this is non-null.
    pub user: Value,
    /// Resource token attached by a resource strategy, request-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Token>,
    /// Whatever else a credentials transform chose to carry along.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    /// Strategy kind that produced the record ("session", "entity",
    /// "resource").
    pub kind: String,
    /// Strategy name.
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Read the identity record, if any.
pub fn get_authentication(request: &mut Request) -> Option<IdentityRecord> {
    let raw = request.session.get(AUTH_KEY, false)?;
    serde_json::from_value(raw).ok()
}

/// True iff a record exists and its `credentials.user` is set.
pub fn is_authenticated(request: &mut Request) -> bool {
    get_authentication(request).is_some_and(|record| !record.credentials.user.is_null())
}

pub fn get_user(request: &mut Request) -> Option<Value> {
    get_authentication(request).map(|record| record.credentials.user)
}

/// Single choke point through which every strategy reports success.
///
/// Enforces the record invariants: never clears to empty, skips redundant
/// writes, and touches the session on genuine replacement unless the write
/// is flagged `temporary` (resource-token attachment must not reset the
/// session's idle-expiry clock). Returns the record now in effect.
pub fn set_authentication(
    request: &mut Request,
    record: Option<IdentityRecord>,
    temporary: bool,
) -> Result<IdentityRecord> {
    let stored = get_authentication(request);
    match (stored, record) {
        (None, None) => Err(Error::Validation("no authentication record to set".into())),
        (Some(stored), None) => Ok(stored),
        (Some(stored), Some(new)) if stored == new => Ok(stored),
        (stored, Some(new)) => {
            tracing::debug!(source = %new.artifacts.source, "storing identity record");
            request
                .session
                .set(AUTH_KEY, serde_json::to_value(&new)?);
            if stored.is_some() && !temporary {
                request.session.touch();
            }
            Ok(new)
        }
    }
}

/// Drop the identity record and everything else session-scoped (logout).
pub fn reset(request: &mut Request) {
    request.session.reset();
}

/// Recovery for a callback round-trip that arrived without its expected
/// session parameters (the session cookie was not yet set on the redirecting
/// hop). Returns the current URL with a one-shot retry marker appended; a
/// request already carrying the marker means the user agent's cookie
/// plumbing is broken, and the flow fails instead of looping.
pub fn retry_redirect(request: &Request) -> Result<String> {
    if request.query(RETRY_MARKER).is_some() {
        return Err(Error::BrokenRedirectChain(request.uri().to_string()));
    }
    let mut url = Url::parse(request.uri())?;
    url.query_pairs_mut().append_pair(RETRY_MARKER, "1");
    tracing::warn!(url = %url, "callback missing session parameters, retrying once");
    Ok(url.into())
}

/// In-memory session carrier.
///
/// Cloneable handle over shared state so tests (and standalone embedders)
/// can inspect the session after handing a clone to a [`Request`].
#[derive(Clone, Default)]
pub struct MemorySession {
    inner: Arc<Mutex<SessionState>>,
}

#[derive(Default)]
struct SessionState {
    values: HashMap<String, Value>,
    touched: bool,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the session has been dirty-marked since creation.
    pub fn touched(&self) -> bool {
        self.inner.lock().expect("session lock poisoned").touched
    }

    /// Direct read without the carrier's delete-after-read machinery.
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .values
            .get(key)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .values
            .is_empty()
    }
}

impl SessionCarrier for MemorySession {
    fn get(&mut self, key: &str, delete_after_read: bool) -> Option<Value> {
        let mut state = self.inner.lock().expect("session lock poisoned");
        if delete_after_read {
            state.values.remove(key)
        } else {
            state.values.get(key).cloned()
        }
    }

    fn set(&mut self, key: &str, value: Value) {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .values
            .insert(key.to_string(), value);
    }

    fn clear(&mut self, key: &str) {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .values
            .remove(key);
    }

    fn touch(&mut self) {
        self.inner.lock().expect("session lock poisoned").touched = true;
    }

    fn reset(&mut self) {
        let mut state = self.inner.lock().expect("session lock poisoned");
        state.values.clear();
        state.touched = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(user: &str, source: &str) -> IdentityRecord {
        IdentityRecord {
            credentials: Credentials {
                user: json!({ "sub": user }),
                token: None,
                resource: None,
                extra: serde_json::Map::new(),
            },
            artifacts: Artifacts {
                kind: "entity".to_string(),
                source: source.to_string(),
                tags: vec![],
            },
        }
    }

    fn request_with(session: &MemorySession) -> Request {
        Request::from_uri("https://app.example.com/", Box::new(session.clone())).unwrap()
    }

    #[test]
    fn set_authentication_rejects_clearing_to_empty() {
        let session = MemorySession::new();
        let mut request = request_with(&session);
        let result = set_authentication(&mut request, None, false);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn initial_set_stores_without_touch() {
        let session = MemorySession::new();
        let mut request = request_with(&session);

        let stored = set_authentication(&mut request, Some(record("u1", "portal")), false).unwrap();
        assert_eq!(stored, record("u1", "portal"));
        assert!(is_authenticated(&mut request));
        assert!(!session.touched());
    }

    #[test]
    fn identical_record_is_a_no_op() {
        let session = MemorySession::new();
        let mut request = request_with(&session);

        set_authentication(&mut request, Some(record("u1", "portal")), false).unwrap();
        set_authentication(&mut request, Some(record("u1", "portal")), false).unwrap();
        assert!(!session.touched());
    }

    #[test]
    fn differing_record_replaces_and_touches() {
        let session = MemorySession::new();
        let mut request = request_with(&session);

        set_authentication(&mut request, Some(record("u1", "portal")), false).unwrap();
        let current =
            set_authentication(&mut request, Some(record("u2", "portal")), false).unwrap();

        assert_eq!(current.credentials.user, json!({ "sub": "u2" }));
        assert_eq!(
            get_user(&mut request).unwrap(),
            json!({ "sub": "u2" }),
            "stored record must reflect the replacement"
        );
        assert!(session.touched());
    }

    #[test]
    fn temporary_replacement_does_not_touch() {
        let session = MemorySession::new();
        let mut request = request_with(&session);

        set_authentication(&mut request, Some(record("u1", "portal")), false).unwrap();
        set_authentication(&mut request, Some(record("u2", "portal")), true).unwrap();
        assert!(!session.touched());
    }

    #[test]
    fn reconfirm_with_none_returns_stored_record() {
        let session = MemorySession::new();
        let mut request = request_with(&session);

        set_authentication(&mut request, Some(record("u1", "portal")), false).unwrap();
        let current = set_authentication(&mut request, None, false).unwrap();
        assert_eq!(current, record("u1", "portal"));
    }

    #[test]
    fn retry_redirect_appends_marker_once_then_fails() {
        let session = MemorySession::new();
        let request =
            Request::from_uri("https://app.example.com/cb?code=c1", Box::new(session.clone()))
                .unwrap();
        let target = retry_redirect(&request).unwrap();
        assert!(target.contains("retry=1"));

        let retried = Request::from_uri(target, Box::new(session)).unwrap();
        assert!(matches!(
            retry_redirect(&retried),
            Err(Error::BrokenRedirectChain(_))
        ));
    }

    #[test]
    fn reset_drops_all_session_values() {
        let session = MemorySession::new();
        let mut request = request_with(&session);
        set_authentication(&mut request, Some(record("u1", "portal")), false).unwrap();

        reset(&mut request);
        assert!(session.is_empty());
        assert!(!is_authenticated(&mut request));
    }
}
