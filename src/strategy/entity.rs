//! The OIDC entity strategy: establishes the primary user identity.

use std::sync::Arc;

use serde_json::{json, Value};

use super::{resource::ResourceStrategy, Outcome};
use crate::client::{CallbackChecks, OidcClient};
use crate::config::{EntityConfig, SourceMeta};
use crate::error::{Error, Result};
use crate::events::{AuthEvent, EventKind, EventSink};
use crate::params::{self, ParamKind};
use crate::request::Request;
use crate::session::{self, retry_redirect, Artifacts, Credentials, IdentityRecord};
use crate::store::TokenStore;
use crate::token::Token;

/// Drives the OIDC authorization-code flow: build the authorization URL,
/// exchange the returned code, fetch user info, persist the token, and
/// commit the identity record.
///
/// When composed with a nested resource strategy, an already-authenticated
/// request is handed to the resource flow instead of re-running sign-in —
/// one login grants both the identity and a secondary API token.
pub struct EntityStrategy {
    name: String,
    login_form: String,
    config: EntityConfig,
    store: Arc<TokenStore>,
    client: Arc<dyn OidcClient>,
    resource: Option<ResourceStrategy>,
    events: EventSink,
}

enum CallbackToken {
    Retry(String),
    Token(Token),
}

impl EntityStrategy {
    pub fn new(
        name: impl Into<String>,
        config: EntityConfig,
        login_form: impl Into<String>,
        store: Arc<TokenStore>,
        client: Arc<dyn OidcClient>,
        events: EventSink,
    ) -> Self {
        Self {
            name: name.into(),
            login_form: login_form.into(),
            config,
            store,
            client,
            resource: None,
            events,
        }
    }

    /// Compose a nested resource strategy into this login.
    pub fn with_resource(mut self, resource: ResourceStrategy) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn login_form(&self) -> &str {
        &self.login_form
    }

    pub fn client_id(&self) -> &str {
        &self.config.client.id
    }

    pub fn resource(&self) -> Option<&ResourceStrategy> {
        self.resource.as_ref()
    }

    pub async fn authenticate(&self, request: &mut Request) -> Result<Outcome> {
        if session::is_authenticated(request) {
            if let Some(resource) = &self.resource {
                return resource.authenticate(request).await;
            }
            let record = session::set_authentication(request, None, false)?;
            return Ok(Outcome::Authenticated(record));
        }
        self.do_authenticate(request).await
    }

    pub(crate) async fn do_authenticate(&self, request: &mut Request) -> Result<Outcome> {
        // Initialize sign-in: no code yet means this request starts the
        // flow; it resumes on a later request carrying the code.
        if request.query("code").is_none() {
            return Ok(Outcome::Redirect(self.authorization_url(request)?));
        }

        // Authorization callback.
        let token = match self.callback_token(request).await? {
            CallbackToken::Retry(url) => return Ok(Outcome::RetryRedirect(url)),
            CallbackToken::Token(token) => token,
        };
        let user_info = self.client.userinfo(&token.access_token).await?;
        let credentials = self.credentials(&token, &user_info)?;
        let artifacts = Artifacts {
            kind: "entity".to_string(),
            source: self.name.clone(),
            tags: self.config.tags.clone(),
        };

        let stored = self
            .store
            .prepare(
                &credentials.user,
                &self.config.client.id,
                &self.name,
                &token,
            )
            .await?
            .upsert()
            .await?;
        self.events.emit(AuthEvent {
            kind: EventKind::Profile,
            source: self.name.clone(),
            tags: self.config.tags.clone(),
            user: credentials.user.clone(),
            token: stored,
        });

        let record = IdentityRecord {
            credentials,
            artifacts,
        };
        let current = session::set_authentication(request, Some(record), false)?;
        Ok(Outcome::Authenticated(current))
    }

    fn authorization_url(&self, request: &mut Request) -> Result<String> {
        let client_id = &self.config.client.id;
        let auth_params = &self.config.auth_params;
        let nonce = params::produce(ParamKind::Nonce, request, client_id, &auth_params.nonce);
        let state = params::produce(ParamKind::State, request, client_id, &auth_params.state);

        let mut url_params = vec![
            ("response_type".to_string(), "code".to_string()),
            (
                "redirect_uri".to_string(),
                auth_params.redirect_uri.clone(),
            ),
        ];
        if let Some(scope) = &auth_params.scope {
            url_params.push(("scope".to_string(), scope.clone()));
        }
        if let Some(nonce) = nonce {
            url_params.push(("nonce".to_string(), nonce));
        }
        if let Some(state) = state {
            url_params.push(("state".to_string(), state));
        }
        let url = self.client.authorization_url(&url_params)?;
        tracing::debug!(strategy = %self.name, url = %url, "authorization URL");
        Ok(url)
    }

    /// Consume and wipe the session-bound parameters, then exchange the
    /// code. A required parameter missing from the session means the
    /// round-trip lost its cookie; retry the callback once.
    async fn callback_token(&self, request: &mut Request) -> Result<CallbackToken> {
        let client_id = self.config.client.id.clone();
        let auth_params = &self.config.auth_params;
        let nonce = params::consume(ParamKind::Nonce, request, &client_id, &auth_params.nonce);
        let state = params::consume(ParamKind::State, request, &client_id, &auth_params.state);

        if (nonce.is_none() && !auth_params.nonce.is_disabled())
            || (state.is_none() && !auth_params.state.is_disabled())
        {
            return Ok(CallbackToken::Retry(retry_redirect(request)?));
        }
        params::wipe(ParamKind::Nonce, request, &client_id);
        params::wipe(ParamKind::State, request, &client_id);

        let raw = self
            .client
            .authorization_callback(
                &auth_params.redirect_uri,
                request.query_map(),
                &CallbackChecks { nonce, state },
            )
            .await?;
        Ok(CallbackToken::Token(Token::new(raw)?))
    }

    /// Build application credentials, via the configured transform when one
    /// is set. The result must carry `user` and must not carry `token`.
    fn credentials(&self, token: &Token, user_info: &Value) -> Result<Credentials> {
        let value = match &self.config.credentials {
            Some(transform) => transform(
                token,
                user_info,
                &SourceMeta {
                    name: self.name.clone(),
                    tags: self.config.tags.clone(),
                },
            )?,
            None => json!({ "user": user_info }),
        };

        let Value::Object(fields) = &value else {
            return Err(Error::InvalidCredentials(
                "transform must return an object".into(),
            ));
        };
        if fields.contains_key("token") {
            return Err(Error::InvalidCredentials(
                "token is strategy-managed, not caller-managed".into(),
            ));
        }
        if !fields.get("user").is_some_and(|user| !user.is_null()) {
            return Err(Error::InvalidCredentials("user is undefined".into()));
        }
        serde_json::from_value(value)
            .map_err(|err| Error::InvalidCredentials(err.to_string()))
    }
}

impl std::fmt::Debug for EntityStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStrategy")
            .field("name", &self.name)
            .field("client", &self.config.client.id)
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}
