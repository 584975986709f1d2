//! CSRF parameter guard: session-bound nonce/state values.
//!
//! Values are keyed per `(parameter, client)` so concurrent in-flight
//! authorizations for different clients within one session cannot collide,
//! and are consumed once then wiped so a retried callback cannot replay a
//! completed exchange.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde_json::Value;

use crate::request::Request;

/// The two supported parameter kinds. Closed set: misuse with an unknown
/// parameter name is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// OIDC replay protection.
    Nonce,
    /// CSRF protection across the authorization redirect.
    State,
}

impl ParamKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Nonce => "nonce",
            Self::State => "state",
        }
    }

    /// Fresh cryptographically random value. The two kinds use distinct
    /// lengths and encodings for their different consumers: nonce a shorter
    /// hex value, state a longer URL-safe base64 value.
    fn generate(self) -> String {
        match self {
            Self::Nonce => {
                let mut bytes = [0u8; 24];
                rand::thread_rng().fill_bytes(&mut bytes);
                hex::encode(bytes)
            }
            Self::State => {
                let mut bytes = [0u8; 48];
                rand::thread_rng().fill_bytes(&mut bytes);
                URL_SAFE_NO_PAD.encode(bytes)
            }
        }
    }
}

/// Per-parameter configuration hint: enabled (random value), disabled, or a
/// caller-supplied deterministic generator.
#[derive(Clone, Default)]
pub enum ParamHint {
    #[default]
    Enabled,
    Disabled,
    Generator(Arc<dyn Fn(&Request) -> String + Send + Sync>),
}

impl ParamHint {
    pub fn generator<F>(f: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        Self::Generator(Arc::new(f))
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

impl fmt::Debug for ParamHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => f.write_str("Enabled"),
            Self::Disabled => f.write_str("Disabled"),
            Self::Generator(_) => f.write_str("Generator(..)"),
        }
    }
}

fn session_key(kind: ParamKind, client_id: &str) -> String {
    format!("{}:{client_id}", kind.name())
}

/// Generate a value for the outbound authorization URL and bind it to the
/// session. Returns `None` when the parameter is disabled; the caller then
/// omits it from the URL.
pub fn produce(
    kind: ParamKind,
    request: &mut Request,
    client_id: &str,
    hint: &ParamHint,
) -> Option<String> {
    let value = match hint {
        ParamHint::Disabled => return None,
        ParamHint::Generator(generate) => generate(request),
        ParamHint::Enabled => kind.generate(),
    };
    request
        .session
        .set(&session_key(kind, client_id), Value::String(value.clone()));
    Some(value)
}

/// Read the session-bound value at callback time, without clearing it.
///
/// When the parameter was disabled at produce time, falls back to whatever
/// the remote party echoed on the inbound request — trusted only because
/// the producer explicitly opted out.
pub fn consume(
    kind: ParamKind,
    request: &mut Request,
    client_id: &str,
    hint: &ParamHint,
) -> Option<String> {
    if hint.is_disabled() {
        return request.query(kind.name()).map(str::to_string);
    }
    match request.session.get(&session_key(kind, client_id), false) {
        Some(Value::String(value)) => Some(value),
        _ => None,
    }
}

/// Delete the session-bound value. Called after a successful
/// consume-and-compare so a retried callback cannot reuse it.
pub fn wipe(kind: ParamKind, request: &mut Request, client_id: &str) {
    request.session.clear(&session_key(kind, client_id));
}
