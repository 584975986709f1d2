//! The owned strategy registry: construction from settings, dispatch, and
//! the host-facing operations.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::client::{HttpOauthClient, HttpOidcClient, OauthClient, OidcClient};
use crate::config::{LogoutConfig, ResourceConfig, Settings, StoreBackendKind};
use crate::error::{Error, Result};
use crate::events::{AuthEvent, EventSink};
use crate::request::Request;
use crate::session;
use crate::store::{FileBackend, MemoryBackend, StoreBackend, TokenStore};
use crate::strategy::{EntityStrategy, Outcome, ResourceStrategy, SessionStrategy, Strategy};
use crate::token::Token;

/// Explicitly constructed registry of strategies over one store; the value
/// the request-handling pipeline owns. No ambient global.
///
/// # Example
/// ```
/// use authwall::config::Settings;
/// use authwall::registry::Registry;
///
/// # fn demo() -> authwall::error::Result<()> {
/// let settings = Settings::from_toml_str(r#"
///     [session]
///     login_form = "/login"
/// "#)?;
/// let registry = Registry::build(settings)?;
/// assert!(registry.strategy("session").is_some());
/// # Ok(())
/// # }
/// ```
pub struct Registry {
    strategies: HashMap<String, Strategy>,
    store: Arc<TokenStore>,
    events: EventSink,
    login_form: String,
    logout: Option<LogoutConfig>,
    default: Option<String>,
}

impl Registry {
    /// Build from validated settings with the configured backend and the
    /// default HTTP remote clients.
    pub fn build(settings: Settings) -> Result<Self> {
        RegistryBuilder::new(settings).build()
    }

    pub fn builder(settings: Settings) -> RegistryBuilder {
        RegistryBuilder::new(settings)
    }

    /// Register a strategy built outside the settings surface.
    pub fn add(&mut self, strategy: Strategy) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    pub fn strategy(&self, name: &str) -> Option<&Strategy> {
        self.strategies.get(name)
    }

    pub fn default_strategy(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Observer seam for profile/authorization/refresh events.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// Run the named strategy for this request.
    pub async fn authenticate(&self, name: &str, request: &mut Request) -> Result<Outcome> {
        let strategy = self
            .strategies
            .get(name)
            .ok_or_else(|| Error::UnknownStrategy(name.to_string()))?;
        strategy.authenticate(request).await
    }

    /// Stored-token lookup for an entity or resource strategy.
    pub async fn token(&self, user: &Value, name: &str) -> Result<Option<Token>> {
        let strategy = self
            .strategies
            .get(name)
            .ok_or_else(|| Error::UnknownStrategy(name.to_string()))?;
        let client_id = match strategy {
            Strategy::Entity(entity) => entity.client_id(),
            Strategy::Resource(resource) => resource.client_id(),
            Strategy::Session(_) => {
                return Err(Error::Validation(format!(
                    "strategy {name} does not support tokens"
                )));
            }
        };
        self.store.id(user, client_id)?.find().await
    }

    /// Path the host should route to [`Registry::logout`], when configured.
    pub fn logout_path(&self) -> Option<&str> {
        self.logout.as_ref().map(|logout| logout.path.as_str())
    }

    /// Reset the session and redirect to the configured target or the login
    /// form.
    pub fn logout(&self, request: &mut Request) -> Outcome {
        session::reset(request);
        let target = self
            .logout
            .as_ref()
            .and_then(|logout| logout.target.clone())
            .unwrap_or_else(|| self.login_form.clone());
        Outcome::Redirect(target)
    }

    /// Release store resources; safe during shutdown.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}

/// Builder allowing tests and embedders to swap the backend or the remote
/// clients before construction.
pub struct RegistryBuilder {
    settings: Settings,
    backend: Option<Arc<dyn StoreBackend>>,
    oidc_clients: HashMap<String, Arc<dyn OidcClient>>,
    oauth_clients: HashMap<String, Arc<dyn OauthClient>>,
}

impl RegistryBuilder {
    fn new(settings: Settings) -> Self {
        Self {
            settings,
            backend: None,
            oidc_clients: HashMap::new(),
            oauth_clients: HashMap::new(),
        }
    }

    /// Use an externally constructed backend (e.g. a document-store
    /// adapter) instead of the configured kind.
    pub fn with_backend(mut self, backend: Arc<dyn StoreBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Override the OIDC client for one entity strategy.
    pub fn with_oidc_client(mut self, name: impl Into<String>, client: Arc<dyn OidcClient>) -> Self {
        self.oidc_clients.insert(name.into(), client);
        self
    }

    /// Override the OAuth2 client for one resource strategy (use
    /// `<entity>:INTERNAL` for a composed resource).
    pub fn with_oauth_client(
        mut self,
        name: impl Into<String>,
        client: Arc<dyn OauthClient>,
    ) -> Self {
        self.oauth_clients.insert(name.into(), client);
        self
    }

    pub fn build(mut self) -> Result<Registry> {
        self.settings.validate()?;
        let settings = self.settings;

        let backend: Arc<dyn StoreBackend> = match self.backend {
            Some(backend) => backend,
            None => match &settings.store.backend {
                StoreBackendKind::Memory => Arc::new(MemoryBackend::new()),
                StoreBackendKind::File { dir } => Arc::new(match dir {
                    Some(dir) => FileBackend::new(dir.clone()),
                    None => FileBackend::new_default(),
                }),
                StoreBackendKind::External => {
                    return Err(Error::Schema(
                        "external store backend requires with_backend".into(),
                    ));
                }
            },
        };
        let mut store = TokenStore::new(backend, settings.store.user_key.clone());
        if let Some(secret) = &settings.store.secret {
            store = store.with_secret(secret);
        }
        if let Some(offset) = settings.store.expiry_offset {
            store = store.with_expiry_offset(offset);
        }
        let store = Arc::new(store);
        tracing::info!(
            sealed = settings.store.secret.is_some(),
            "token store ready"
        );

        let events = EventSink::new();
        let login_form = settings.session.login_form.clone();
        let mut strategies = HashMap::new();

        let session_name = settings.session_name();
        strategies.insert(
            session_name.clone(),
            Strategy::Session(SessionStrategy::new(
                session_name,
                login_form.clone(),
                settings.session.redirect,
            )),
        );

        for (key, config) in &settings.entity {
            let name = config.name.clone().unwrap_or_else(|| key.clone());
            let oidc: Arc<dyn OidcClient> = match self.oidc_clients.remove(&name) {
                Some(client) => client,
                None => Arc::new(HttpOidcClient::new(
                    config.client.clone(),
                    config.provider.clone(),
                )),
            };
            let mut entity = EntityStrategy::new(
                name.clone(),
                config.clone(),
                login_form.clone(),
                store.clone(),
                oidc,
                events.clone(),
            );

            // entity + resource as one combined login: the internal
            // resource shares the entity's client and store entry.
            if config.resource {
                let internal_name = format!("{name}:INTERNAL");
                let oauth: Arc<dyn OauthClient> = match self.oauth_clients.remove(&internal_name) {
                    Some(client) => client,
                    None => Arc::new(HttpOauthClient::new(
                        config.client.clone(),
                        config.provider.clone(),
                    )),
                };
                let resource_config = ResourceConfig {
                    name: Some(internal_name.clone()),
                    client: config.client.clone(),
                    provider: config.provider.clone(),
                    auth_params: config.auth_params.clone(),
                    redirect: config.redirect,
                    initiate: false,
                    tags: config.tags.clone(),
                };
                let resource = ResourceStrategy::new(
                    internal_name,
                    resource_config,
                    login_form.clone(),
                    store.clone(),
                    oauth,
                    events.clone(),
                )?
                .with_kind("resource:INTERNAL");
                entity = entity.with_resource(resource);
            }

            tracing::info!(strategy = %name, kind = "entity", "strategy registered");
            strategies.insert(name, Strategy::Entity(entity));
        }

        for (key, config) in &settings.resource {
            let name = config.name.clone().unwrap_or_else(|| key.clone());
            let oauth: Arc<dyn OauthClient> = match self.oauth_clients.remove(&name) {
                Some(client) => client,
                None => Arc::new(HttpOauthClient::new(
                    config.client.clone(),
                    config.provider.clone(),
                )),
            };
            let resource = ResourceStrategy::new(
                name.clone(),
                config.clone(),
                login_form.clone(),
                store.clone(),
                oauth,
                events.clone(),
            )?;
            tracing::info!(strategy = %name, kind = "resource", "strategy registered");
            strategies.insert(name, Strategy::Resource(resource));
        }

        Ok(Registry {
            strategies,
            store,
            events,
            login_form,
            logout: settings.session.logout.clone(),
            default: settings.default.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySession;
    use serde_json::json;

    const SETTINGS: &str = r#"
        default = "session"

        [session]
        login_form = "/login"
        logout = { path = "/logout", target = "/bye" }

        [entity.portal]
        client = { id = "portal-client", secret = "portal-secret" }
        auth_params = { redirect_uri = "https://app.example.com/portal/cb", scope = "openid" }

        [entity.portal.provider]
        authorization_endpoint = "https://idp.example.com/authorize"
        token_endpoint = "https://idp.example.com/token"
        userinfo_endpoint = "https://idp.example.com/userinfo"

        [resource.calendar]
        client = { id = "cal-client", secret = "cal-secret" }
        provider = { authorization_endpoint = "https://cal.example.com/authorize", token_endpoint = "https://cal.example.com/token" }
        auth_params = { redirect_uri = "https://app.example.com/cal/cb" }
    "#;

    fn registry() -> Registry {
        Registry::build(Settings::from_toml_str(SETTINGS).unwrap()).unwrap()
    }

    #[test]
    fn builds_all_configured_strategies() {
        let registry = registry();
        assert!(matches!(
            registry.strategy("session"),
            Some(Strategy::Session(_))
        ));
        assert!(matches!(
            registry.strategy("portal"),
            Some(Strategy::Entity(_))
        ));
        assert!(matches!(
            registry.strategy("calendar"),
            Some(Strategy::Resource(_))
        ));
        assert_eq!(registry.default_strategy(), Some("session"));
    }

    #[test]
    fn entity_with_resource_composes_an_internal_strategy() {
        let raw = SETTINGS.replace(
            "[entity.portal]",
            "[entity.portal]\nresource = true",
        );
        let registry = Registry::build(Settings::from_toml_str(&raw).unwrap()).unwrap();
        let Some(Strategy::Entity(entity)) = registry.strategy("portal") else {
            panic!("portal must be an entity");
        };
        let resource = entity.resource().expect("internal resource composed");
        assert_eq!(resource.name(), "portal:INTERNAL");
        assert_eq!(resource.kind(), "resource:INTERNAL");
    }

    #[tokio::test]
    async fn authenticate_rejects_unknown_strategy() {
        let registry = registry();
        let mut request = Request::with_memory_session("https://app.example.com/").unwrap();
        let result = registry.authenticate("missing", &mut request).await;
        assert!(matches!(result, Err(Error::UnknownStrategy(_))));
    }

    #[tokio::test]
    async fn token_lookup_rejects_session_strategies() {
        let registry = registry();
        let user = json!({ "sub": "user-1" });
        assert!(matches!(
            registry.token(&user, "session").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            registry.token(&user, "missing").await,
            Err(Error::UnknownStrategy(_))
        ));
        // Known entity with nothing stored: cleanly None.
        assert!(registry.token(&user, "portal").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn logout_resets_the_session_and_redirects() {
        let registry = registry();
        let session = MemorySession::new();
        let mut request =
            Request::from_uri("https://app.example.com/logout", Box::new(session.clone()))
                .unwrap();
        request
            .session
            .set("auth", json!({ "credentials": { "user": { "sub": "u" } } }));

        let outcome = registry.logout(&mut request);
        assert_eq!(outcome, Outcome::Redirect("/bye".into()));
        assert!(session.is_empty());
        assert_eq!(registry.logout_path(), Some("/logout"));
    }

    #[tokio::test]
    async fn close_is_safe_immediately_after_build() {
        let registry = registry();
        registry.close().await.unwrap();
    }
}
