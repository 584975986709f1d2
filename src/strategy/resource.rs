//! The OAuth2 resource strategy: attaches a secondary access token to an
//! already-authenticated identity.

use std::sync::Arc;

use serde_json::Value;

use super::{login_gate, Outcome};
use crate::client::OauthClient;
use crate::config::ResourceConfig;
use crate::error::{Error, Result};
use crate::events::{AuthEvent, EventKind, EventSink};
use crate::params::{self, ParamKind};
use crate::request::Request;
use crate::session::{self, retry_redirect};
use crate::store::TokenStore;
use crate::token::Token;

/// Drives the authorization-code + refresh flow for a resource provider.
///
/// State per request: check for an existing stored token, then either
/// refresh it (when expired) or run the authorization branch, and finally
/// attach the token to the identity record without resetting the session's
/// idle-expiry clock.
pub struct ResourceStrategy {
    name: String,
    kind: String,
    login_form: String,
    config: ResourceConfig,
    callback_path: String,
    store: Arc<TokenStore>,
    client: Arc<dyn OauthClient>,
    events: EventSink,
}

impl ResourceStrategy {
    pub fn new(
        name: impl Into<String>,
        config: ResourceConfig,
        login_form: impl Into<String>,
        store: Arc<TokenStore>,
        client: Arc<dyn OauthClient>,
        events: EventSink,
    ) -> Result<Self> {
        let callback_path = config.auth_params.callback_path()?;
        Ok(Self {
            name: name.into(),
            kind: "resource".to_string(),
            login_form: login_form.into(),
            config,
            callback_path,
            store,
            client,
            events,
        })
    }

    /// Marks a strategy composed inside an entity login.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn client_id(&self) -> &str {
        &self.config.client.id
    }

    pub async fn authenticate(&self, request: &mut Request) -> Result<Outcome> {
        // The provider's redirect lands outside the primary session's
        // authentication gate; the configured callback path goes straight
        // to the exchange logic.
        if request.path() == self.callback_path {
            return self.do_authenticate(request).await;
        }
        if let Some(outcome) = login_gate(request, self.config.redirect.or(Some(false)), &self.login_form)
        {
            return Ok(outcome);
        }
        self.do_authenticate(request).await
    }

    pub(crate) async fn do_authenticate(&self, request: &mut Request) -> Result<Outcome> {
        let user = session::get_user(request)
            .ok_or_else(|| Error::Validation("no authenticated user for resource".into()))?;
        let existing = self
            .store
            .id(&user, &self.config.client.id)?
            .find()
            .await?;
        match existing {
            Some(token) => self.refresh(request, &user, token).await,
            None => self.authorize(request, &user).await,
        }
    }

    /// Refresh branch: renew only when the stored token is within the
    /// refresh-ahead window, then attach.
    async fn refresh(&self, request: &mut Request, user: &Value, token: Token) -> Result<Outcome> {
        if !token.expired(self.store.expiry_offset()) {
            return self.attach(request, token);
        }

        let refresh_token = token.refresh_token.clone().ok_or_else(|| {
            Error::Validation("stored token expired without a refresh_token".into())
        })?;
        tracing::debug!(strategy = %self.name, "refreshing expired resource token");
        let raw = self
            .client
            .access_token(
                &refresh_token,
                &[("grant_type".into(), "refresh_token".into())],
            )
            .await?;
        let renewed = Token::new(raw)?;
        let merged = token.merged_with(&renewed);
        let upserted = self
            .store
            .prepare(user, &self.config.client.id, &self.name, &merged)
            .await?
            .upsert()
            .await?;
        self.emit(EventKind::Refresh, user, &upserted);
        self.attach(request, upserted)
    }

    /// Authorize branch: build the authorization URL, or exchange the
    /// returned code after verifying state.
    async fn authorize(&self, request: &mut Request, user: &Value) -> Result<Outcome> {
        let client_id = self.config.client.id.clone();
        let auth_params = &self.config.auth_params;

        let Some(code) = request.query("code").map(str::to_string) else {
            let state = params::produce(ParamKind::State, request, &client_id, &auth_params.state);
            let url = self.client.authorize_url(&self.url_params(state))?;

            // Route settings win over the strategy default.
            let initiate = request.route.initiate.unwrap_or(self.config.initiate);
            if initiate {
                return Ok(Outcome::Redirect(url));
            }
            return Ok(Outcome::Forbidden {
                authorization_url: url,
            });
        };

        let expected = params::consume(ParamKind::State, request, &client_id, &auth_params.state);
        if expected.is_none() && !auth_params.state.is_disabled() {
            return Ok(Outcome::RetryRedirect(retry_redirect(request)?));
        }
        if let Some(expected) = &expected {
            if request.query("state") != Some(expected.as_str()) {
                return Err(Error::StateMismatch { client_id });
            }
        }
        params::wipe(ParamKind::State, request, &client_id);

        let raw = self
            .client
            .access_token(
                &code,
                &[
                    ("redirect_uri".into(), auth_params.redirect_uri.clone()),
                    ("grant_type".into(), "authorization_code".into()),
                ],
            )
            .await?;
        let token = Token::new(raw)?;
        let upserted = self
            .store
            .prepare(user, &client_id, &self.name, &token)
            .await?
            .upsert()
            .await?;
        self.emit(EventKind::Authorization, user, &upserted);
        self.attach(request, upserted)
    }

    /// Attach the resource token to a clone of the identity record. The
    /// write is temporary: it must not reset the primary session's
    /// idle-expiry clock.
    fn attach(&self, request: &mut Request, token: Token) -> Result<Outcome> {
        let mut record = session::get_authentication(request)
            .ok_or_else(|| Error::Validation("no authentication to attach the token to".into()))?;
        record.credentials.token = Some(token);
        let current = session::set_authentication(request, Some(record), true)?;
        Ok(Outcome::Authenticated(current))
    }

    fn url_params(&self, state: Option<String>) -> Vec<(String, String)> {
        let auth_params = &self.config.auth_params;
        let mut params = vec![
            ("response_type".to_string(), "code".to_string()),
            (
                "redirect_uri".to_string(),
                auth_params.redirect_uri.clone(),
            ),
        ];
        if let Some(scope) = &auth_params.scope {
            params.push(("scope".to_string(), scope.clone()));
        }
        if let Some(state) = state {
            params.push(("state".to_string(), state));
        }
        params
    }

    fn emit(&self, kind: EventKind, user: &Value, token: &Token) {
        self.events.emit(AuthEvent {
            kind,
            source: self.name.clone(),
            tags: self.config.tags.clone(),
            user: user.clone(),
            token: token.clone(),
        });
    }
}

impl std::fmt::Debug for ResourceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStrategy")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("client", &self.config.client.id)
            .field("callback_path", &self.callback_path)
            .finish_non_exhaustive()
    }
}
