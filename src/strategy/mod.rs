//! The authentication strategy set.
//!
//! A closed variant set — session, OIDC entity, OAuth2 resource — sharing
//! one `authenticate(request) -> Outcome` capability. Composition (an
//! entity granting a secondary resource token in the same login) is an
//! explicit optional field on the entity, not a subclass.

pub mod entity;
pub mod resource;
pub mod session;

pub use entity::EntityStrategy;
pub use resource::ResourceStrategy;
pub use session::SessionStrategy;

use crate::error::Result;
use crate::request::Request;
use crate::session::{is_authenticated, IdentityRecord};

/// Effect a strategy asks the host to apply for this request.
///
/// Terminal variants end the request; `Authenticated` unblocks it with the
/// record now in effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Proceed; the request is authenticated as described.
    Authenticated(IdentityRecord),
    /// Send the browser to this URL (login form or authorization endpoint).
    Redirect(String),
    /// Answer 401 with the login form as a location hint.
    Unauthorized { location: String },
    /// Answer 403; the caller may follow the authorization URL to grant
    /// access to the resource.
    Forbidden { authorization_url: String },
    /// One-shot client-side retry of a callback that arrived without its
    /// session parameters.
    RetryRedirect(String),
}

/// One configured strategy.
#[derive(Debug)]
pub enum Strategy {
    Session(SessionStrategy),
    Entity(EntityStrategy),
    Resource(ResourceStrategy),
}

impl Strategy {
    pub fn name(&self) -> &str {
        match self {
            Self::Session(strategy) => strategy.name(),
            Self::Entity(strategy) => strategy.name(),
            Self::Resource(strategy) => strategy.name(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Session(_) => "session",
            Self::Entity(_) => "entity",
            Self::Resource(strategy) => strategy.kind(),
        }
    }

    /// Shared entry transition. Failures inside a flow are logged here and
    /// propagated for the host to answer with a generic error; no partial
    /// identity record is ever committed.
    pub async fn authenticate(&self, request: &mut Request) -> Result<Outcome> {
        let outcome = match self {
            Self::Session(strategy) => strategy.authenticate(request),
            Self::Entity(strategy) => strategy.authenticate(request).await,
            Self::Resource(strategy) => strategy.authenticate(request).await,
        };
        if let Err(error) = &outcome {
            tracing::error!(
                strategy = self.name(),
                kind = self.kind(),
                error = %error,
                "authentication failed"
            );
        }
        outcome
    }
}

/// The base gate every session-protected strategy applies when the request
/// is not yet authenticated: browsers are redirected to the login form,
/// API/XHR callers get a 401 with the form as a location hint.
pub(crate) fn login_gate(
    request: &mut Request,
    redirect: Option<bool>,
    login_form: &str,
) -> Option<Outcome> {
    if is_authenticated(request) {
        return None;
    }
    if redirect == Some(false) || request.wants_json() {
        return Some(Outcome::Unauthorized {
            location: login_form.to_string(),
        });
    }
    Some(Outcome::Redirect(login_form.to_string()))
}
