//! Strategy and store configuration surface with fail-fast validation.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::{Deserializer, Error as _};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};
use crate::params::ParamHint;
use crate::token::Token;

/// Metadata handed to a credentials transform about the strategy that ran.
#[derive(Debug, Clone)]
pub struct SourceMeta {
    pub name: String,
    pub tags: Vec<String>,
}

/// Caller-supplied transform building application credentials from the
/// exchanged token and the provider's user info. Must return an object with
/// a `user` field and without a `token` field (that field is
/// strategy-managed).
pub type CredentialsFn = Arc<dyn Fn(&Token, &Value, &SourceMeta) -> Result<Value> + Send + Sync>;

/// OAuth2/OIDC client credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub id: String,
    pub secret: String,
}

/// Remote provider endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Send the access token as a query parameter instead of an
    /// Authorization header on resource requests.
    #[serde(default = "default_true")]
    pub use_query_auth: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// Authorization-endpoint parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub redirect_uri: String,
    /// `true`/absent: random value; `false`: disabled. A generator function
    /// can be attached programmatically.
    #[serde(
        default,
        serialize_with = "serialize_hint",
        deserialize_with = "deserialize_hint"
    )]
    pub nonce: ParamHint,
    #[serde(
        default,
        serialize_with = "serialize_hint",
        deserialize_with = "deserialize_hint"
    )]
    pub state: ParamHint,
}

impl AuthParams {
    /// Path component of the configured redirect URI; the resource
    /// strategy's callback-path bypass matches against it.
    pub fn callback_path(&self) -> Result<String> {
        Ok(Url::parse(&self.redirect_uri)?.path().to_string())
    }
}

/// One OIDC entity strategy.
#[derive(Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub client: ClientConfig,
    pub provider: ProviderConfig,
    pub auth_params: AuthParams,
    /// Compose an internal resource strategy granting a secondary API token
    /// alongside the identity.
    #[serde(default)]
    pub resource: bool,
    /// Overrides the session-level redirect-to-login behavior when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip)]
    pub credentials: Option<CredentialsFn>,
}

impl std::fmt::Debug for EntityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityConfig")
            .field("name", &self.name)
            .field("client", &self.client.id)
            .field("resource", &self.resource)
            .field("tags", &self.tags)
            .field("credentials", &self.credentials.is_some())
            .finish_non_exhaustive()
    }
}

/// One OAuth2 resource strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub client: ClientConfig,
    pub provider: ProviderConfig,
    pub auth_params: AuthParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<bool>,
    /// Redirect the browser to the provider immediately instead of
    /// answering 403 with the authorization URL. Route settings override
    /// this default.
    #[serde(default)]
    pub initiate: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Session strategy and login-form settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub login_form: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logout: Option<LogoutConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutConfig {
    pub path: String,
    /// Redirect target after logout; defaults to the login form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackendKind,
    /// Enables at-rest sealing of stored token details when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// User claim carrying the stable identifier.
    #[serde(default = "default_user_key")]
    pub user_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_offset: Option<i64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::default(),
            secret: None,
            user_key: default_user_key(),
            expiry_offset: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackendKind {
    #[default]
    Memory,
    File {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dir: Option<PathBuf>,
    },
    /// Backend supplied programmatically through the registry builder.
    External,
}

/// Full gateway settings: one session strategy plus any number of entity
/// and resource strategies over one store.
///
/// # Example
/// ```
/// use authwall::config::Settings;
///
/// let settings = Settings::from_toml_str(r#"
///     [session]
///     login_form = "/login"
///
///     [store]
///     user_key = "sub"
///
///     [resource.calendar]
///     initiate = true
///     client = { id = "cal-client", secret = "cal-secret" }
///     provider = { authorization_endpoint = "https://cal.example.com/authorize", token_endpoint = "https://cal.example.com/token" }
///     auth_params = { redirect_uri = "https://app.example.com/cal/cb", scope = "calendar.read" }
/// "#)?;
/// assert_eq!(settings.resource.len(), 1);
/// # Ok::<(), authwall::Error>(())
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub session: SessionConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub entity: BTreeMap<String, EntityConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource: BTreeMap<String, ResourceConfig>,
    #[serde(default)]
    pub store: StoreConfig,
    /// Strategy the host should apply when a route names none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl Settings {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Fail-fast shape validation, run before any strategy is built.
    pub fn validate(&self) -> Result<()> {
        let mut names: Vec<String> = vec![self.session_name()];

        for (key, entity) in &self.entity {
            let name = entity.name.clone().unwrap_or_else(|| key.clone());
            let context = format!("entity strategy {name}");
            validate_client(&entity.client, &context)?;
            validate_provider(&entity.provider, &context)?;
            validate_auth_params(&entity.auth_params, &context)?;
            if entity.provider.userinfo_endpoint.is_none() {
                return Err(Error::Schema(format!(
                    "{context}: userinfo_endpoint is required"
                )));
            }
            names.push(name);
        }

        for (key, resource) in &self.resource {
            let name = resource.name.clone().unwrap_or_else(|| key.clone());
            let context = format!("resource strategy {name}");
            validate_client(&resource.client, &context)?;
            validate_provider(&resource.provider, &context)?;
            validate_auth_params(&resource.auth_params, &context)?;
            names.push(name);
        }

        for name in &names {
            if names.iter().filter(|other| *other == name).count() > 1 {
                return Err(Error::Schema(format!("duplicate strategy name {name}")));
            }
        }

        if let Some(default) = &self.default {
            if !names.iter().any(|name| name == default) {
                return Err(Error::Schema(format!(
                    "default names unknown strategy {default}"
                )));
            }
        }
        Ok(())
    }

    pub fn session_name(&self) -> String {
        self.session
            .name
            .clone()
            .unwrap_or_else(|| "session".to_string())
    }
}

fn validate_client(client: &ClientConfig, context: &str) -> Result<()> {
    if client.id.is_empty() || client.secret.is_empty() {
        return Err(Error::Schema(format!(
            "{context}: client id and secret are required"
        )));
    }
    Ok(())
}

fn validate_provider(provider: &ProviderConfig, context: &str) -> Result<()> {
    for (field, value) in [
        ("authorization_endpoint", Some(&provider.authorization_endpoint)),
        ("token_endpoint", Some(&provider.token_endpoint)),
        ("userinfo_endpoint", provider.userinfo_endpoint.as_ref()),
        ("issuer", provider.issuer.as_ref()),
    ] {
        if let Some(value) = value {
            Url::parse(value)
                .map_err(|_| Error::Schema(format!("{context}: {field} is not a valid URL")))?;
        }
    }
    Ok(())
}

fn validate_auth_params(params: &AuthParams, context: &str) -> Result<()> {
    Url::parse(&params.redirect_uri)
        .map_err(|_| Error::Schema(format!("{context}: redirect_uri is not a valid URL")))?;
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_user_key() -> String {
    "sub".to_string()
}

fn serialize_hint<S: Serializer>(hint: &ParamHint, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_bool(!hint.is_disabled())
}

fn deserialize_hint<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<ParamHint, D::Error> {
    match bool::deserialize(deserializer) {
        Ok(true) => Ok(ParamHint::Enabled),
        Ok(false) => Ok(ParamHint::Disabled),
        Err(err) => Err(D::Error::custom(format!(
            "nonce/state must be a boolean: {err}"
        ))),
    }
}
