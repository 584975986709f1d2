#![allow(dead_code)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use authwall::config::Settings;
use authwall::registry::Registry;
use authwall::request::Request;
use authwall::session::MemorySession;

/// Settings with one entity (`portal`) and one resource (`calendar`)
/// strategy, every remote endpoint pointed at the given mock server.
pub fn settings(server_uri: &str) -> Settings {
    let raw = format!(
        r#"
        [session]
        login_form = "/login"
        logout = {{ path = "/logout" }}

        [store]
        user_key = "sub"

        [entity.portal]
        tags = ["sso"]
        client = {{ id = "portal-client", secret = "portal-secret" }}
        auth_params = {{ redirect_uri = "https://app.example.com/portal/cb", scope = "openid profile" }}

        [entity.portal.provider]
        issuer = "{server_uri}"
        authorization_endpoint = "{server_uri}/authorize"
        token_endpoint = "{server_uri}/token"
        userinfo_endpoint = "{server_uri}/userinfo"

        [resource.calendar]
        client = {{ id = "cal-client", secret = "cal-secret" }}
        provider = {{ authorization_endpoint = "{server_uri}/cal/authorize", token_endpoint = "{server_uri}/cal/token" }}
        auth_params = {{ redirect_uri = "https://app.example.com/cal/cb", scope = "calendar.read" }}
        "#
    );
    Settings::from_toml_str(&raw).expect("valid test settings")
}

pub fn registry(server_uri: &str) -> Registry {
    Registry::build(settings(server_uri)).expect("registry builds")
}

pub fn request(session: &MemorySession, uri: &str) -> Request {
    Request::from_uri(uri, Box::new(session.clone())).expect("valid request uri")
}

/// Value of one query parameter in a URL.
pub fn query_value(url: &str, name: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Unsigned compact JWT carrying the given claims, enough for the
/// nonce cross-check which never verifies signatures.
pub fn id_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims serialize"));
    format!("{header}.{payload}.")
}

/// The deterministic store id for a (user, client) pair.
pub fn store_id(user_sub: &str, client_id: &str) -> String {
    hex::encode(Sha256::digest(format!("{user_sub}>{client_id}").as_bytes()))
}

/// Token-endpoint payload for the portal entity, with the ID token bound to
/// `nonce`.
pub fn portal_token_response(nonce: &str) -> Value {
    json!({
        "access_token": "portal-at",
        "token_type": "Bearer",
        "refresh_token": "portal-rt",
        "expires_in": 3600,
        "id_token": id_token(&json!({ "sub": "user-1", "nonce": nonce }))
    })
}
