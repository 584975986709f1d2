//! Remote OIDC/OAuth2 procedure boundary and its reqwest implementations.
//!
//! Strategies only see the traits; the HTTP types are the defaults the
//! registry wires in, swappable for tests or other transports.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use url::Url;

use crate::config::{ClientConfig, ProviderConfig};
use crate::error::{Error, Result};

/// Session-bound values the callback exchange must verify.
#[derive(Debug, Clone, Default)]
pub struct CallbackChecks {
    pub nonce: Option<String>,
    pub state: Option<String>,
}

/// Remote OIDC procedures: authorization-URL construction, code exchange
/// with callback verification, and user-info retrieval.
#[async_trait]
pub trait OidcClient: Send + Sync {
    fn authorization_url(&self, params: &[(String, String)]) -> Result<String>;

    /// Verify the echoed callback against `checks`, then exchange the code
    /// for the raw token response. Fails on provider error or verification
    /// mismatch.
    async fn authorization_callback(
        &self,
        redirect_uri: &str,
        query: &HashMap<String, String>,
        checks: &CallbackChecks,
    ) -> Result<Value>;

    async fn userinfo(&self, access_token: &str) -> Result<Value>;
}

/// Remote generic-OAuth2 procedures for resource strategies.
#[async_trait]
pub trait OauthClient: Send + Sync {
    fn authorize_url(&self, params: &[(String, String)]) -> Result<String>;

    /// Exchange an authorization code or refresh token (the `actor`) at the
    /// token endpoint. `params` must carry `grant_type` and decides which
    /// form field the actor lands in.
    async fn access_token(&self, actor: &str, params: &[(String, String)]) -> Result<Value>;
}

/// reqwest-backed OIDC client.
pub struct HttpOidcClient {
    http: reqwest::Client,
    client: ClientConfig,
    provider: ProviderConfig,
}

impl HttpOidcClient {
    pub fn new(client: ClientConfig, provider: ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            client,
            provider,
        }
    }
}

#[async_trait]
impl OidcClient for HttpOidcClient {
    fn authorization_url(&self, params: &[(String, String)]) -> Result<String> {
        build_url(&self.provider.authorization_endpoint, &self.client.id, params)
    }

    async fn authorization_callback(
        &self,
        redirect_uri: &str,
        query: &HashMap<String, String>,
        checks: &CallbackChecks,
    ) -> Result<Value> {
        if let Some(expected) = &checks.state {
            if query.get("state") != Some(expected) {
                return Err(Error::StateMismatch {
                    client_id: self.client.id.clone(),
                });
            }
        }
        if let Some(error) = query.get("error") {
            let description = query
                .get("error_description")
                .map(String::as_str)
                .unwrap_or("authorization failed");
            return Err(Error::Provider(format!("{error}: {description}")));
        }
        let code = query
            .get("code")
            .ok_or_else(|| Error::Provider("callback query missing code".into()))?;

        let mut request = self
            .http
            .post(&self.provider.token_endpoint)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", redirect_uri),
                ("client_id", self.client.id.as_str()),
                ("client_secret", self.client.secret.as_str()),
            ]);
        for (name, value) in &self.provider.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Provider(format!(
                "code exchange failed with status {}",
                response.status()
            )));
        }
        let raw: Value = response.json().await?;

        // The issuer binds the nonce into the ID token; a mismatch means a
        // replayed or cross-wired callback.
        if let (Some(expected), Some(id_token)) =
            (&checks.nonce, raw.get("id_token").and_then(Value::as_str))
        {
            let claims = decode_jwt_claims(id_token)?;
            if claims.get("nonce").and_then(Value::as_str) != Some(expected.as_str()) {
                return Err(Error::Validation("id_token nonce mismatch".into()));
            }
        }
        Ok(raw)
    }

    async fn userinfo(&self, access_token: &str) -> Result<Value> {
        let endpoint = self.provider.userinfo_endpoint.as_ref().ok_or_else(|| {
            Error::Schema("userinfo_endpoint is not configured".into())
        })?;
        let response = self
            .http
            .get(endpoint)
            .header("Accept", "application/json")
            .header("Authorization", format!("Bearer {access_token}"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Provider(format!(
                "userinfo request failed with status {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

/// reqwest-backed generic OAuth2 client.
pub struct HttpOauthClient {
    http: reqwest::Client,
    client: ClientConfig,
    provider: ProviderConfig,
}

impl HttpOauthClient {
    pub fn new(client: ClientConfig, provider: ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            client,
            provider,
        }
    }
}

#[async_trait]
impl OauthClient for HttpOauthClient {
    fn authorize_url(&self, params: &[(String, String)]) -> Result<String> {
        build_url(&self.provider.authorization_endpoint, &self.client.id, params)
    }

    async fn access_token(&self, actor: &str, params: &[(String, String)]) -> Result<Value> {
        let grant_type = params
            .iter()
            .find(|(name, _)| name == "grant_type")
            .map(|(_, value)| value.as_str())
            .unwrap_or("authorization_code");
        let actor_field = if grant_type == "refresh_token" {
            "refresh_token"
        } else {
            "code"
        };

        let mut form: Vec<(&str, &str)> = vec![
            (actor_field, actor),
            ("client_id", self.client.id.as_str()),
            ("client_secret", self.client.secret.as_str()),
        ];
        for (name, value) in params {
            form.push((name.as_str(), value.as_str()));
        }

        let mut request = self
            .http
            .post(&self.provider.token_endpoint)
            .header("Accept", "application/json")
            .form(&form);
        for (name, value) in &self.provider.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Provider(format!(
                "token request failed with status {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

fn build_url(endpoint: &str, client_id: &str, params: &[(String, String)]) -> Result<String> {
    let mut url = Url::parse(endpoint)?;
    url.query_pairs_mut().append_pair("client_id", client_id);
    for (name, value) in params {
        url.query_pairs_mut().append_pair(name, value);
    }
    tracing::debug!(url = %url, "built authorization URL");
    Ok(url.into())
}

/// Decode the claims segment of a compact JWT without verifying the
/// signature; verification belongs to the issuer exchange itself.
fn decode_jwt_claims(token: &str) -> Result<Value> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Validation("malformed id_token".into()))?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| Error::Validation("malformed id_token payload".into()))?;
    Ok(serde_json::from_slice(&decoded)?)
}
