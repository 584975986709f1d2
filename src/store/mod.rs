//! Token persistence: identity derivation, optional sealing, and the
//! pluggable backend contract.

pub mod file;
pub mod memory;
pub mod seal;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::token::{Token, DEFAULT_EXPIRY_OFFSET};

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use seal::Sealer;

/// Key under which a wrapped token carries its owning strategy name.
const STRATEGY_FIELD: &str = "strategy";

/// One persisted token entry.
///
/// `details` holds the token's wire object, or its sealed string form when
/// the store is configured with a secret. `created_at`/`updated_at` are
/// backend-maintained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub id: String,
    pub user: String,
    pub client: String,
    pub strategy: String,
    /// Store schema version tag.
    pub number: String,
    pub details: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Persistence contract implemented by pluggable backends.
///
/// `find` answers `None` for a missing id (never an error), `upsert` is an
/// atomic find-and-replace-or-insert keyed by id that preserves `created_at`
/// and refreshes `updated_at`, `remove` is idempotent, and `close` must be
/// safe during shutdown even if the backend never successfully connected.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn find(&self, id: &str) -> Result<Option<StoredEntry>>;
    async fn list(&self, user: &str) -> Result<Vec<StoredEntry>>;
    async fn exists(&self, id: &str) -> Result<bool>;
    async fn upsert(&self, entry: StoredEntry) -> Result<StoredEntry>;
    async fn remove(&self, id: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Deterministic lookup key for a (user, client) pair, with convenience
/// lookups bound to the owning store.
pub struct StoreId<'a> {
    store: &'a TokenStore,
    pub value: String,
}

impl StoreId<'_> {
    pub async fn find(&self) -> Result<Option<Token>> {
        self.store.find(&self.value).await
    }

    pub async fn exists(&self) -> Result<bool> {
        self.store.backend.exists(&self.value).await
    }
}

/// Entry built by [`TokenStore::prepare`], sealed when configured, ready to
/// persist.
pub struct PreparedEntry<'a> {
    store: &'a TokenStore,
    pub data: StoredEntry,
}

impl PreparedEntry<'_> {
    /// Validate and persist the prepared entry, returning the wrapped token
    /// now in the store.
    pub async fn upsert(&self) -> Result<Token> {
        let stored = self.store.upsert_entry(self.data.clone()).await?;
        self.store.wrap(stored).await
    }
}

/// Token store: id derivation, prepare/validate/wrap, and sealing over a
/// pluggable backend.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use authwall::store::{MemoryBackend, TokenStore};
///
/// let store = TokenStore::new(Arc::new(MemoryBackend::new()), "sub")
///     .with_secret("at-rest-secret");
/// # let _ = store;
/// ```
pub struct TokenStore {
    backend: Arc<dyn StoreBackend>,
    /// Claim naming the user's stable identifier, e.g. `sub`.
    user_key: String,
    number: String,
    sealer: Option<Sealer>,
    expiry_offset: i64,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn StoreBackend>, user_key: impl Into<String>) -> Self {
        Self {
            backend,
            user_key: user_key.into(),
            number: env!("CARGO_PKG_VERSION").to_string(),
            sealer: None,
            expiry_offset: DEFAULT_EXPIRY_OFFSET,
        }
    }

    /// Enable at-rest sealing of `details` with a store-wide secret.
    pub fn with_secret(mut self, secret: &str) -> Self {
        self.sealer = Some(Sealer::new(secret));
        self
    }

    pub fn with_number(mut self, number: impl Into<String>) -> Self {
        self.number = number.into();
        self
    }

    /// Refresh-ahead tolerance applied by strategies when they test expiry.
    pub fn with_expiry_offset(mut self, offset: i64) -> Self {
        self.expiry_offset = offset;
        self
    }

    pub fn expiry_offset(&self) -> i64 {
        self.expiry_offset
    }

    /// Derive the opaque id binding a (user, client) pair:
    /// `hex(sha256("<user-key-value>><client-id>"))`.
    pub fn id<'a>(&'a self, user: &Value, client_id: &str) -> Result<StoreId<'a>> {
        let value = self.derive_id(user, client_id)?;
        Ok(StoreId { store: self, value })
    }

    /// Build the exact persisted shape for a token, sealing `details` first
    /// when a secret is configured.
    pub async fn prepare<'a>(
        &'a self,
        user: &Value,
        client_id: &str,
        strategy: &str,
        token: &Token,
    ) -> Result<PreparedEntry<'a>> {
        let id = self.derive_id(user, client_id)?;
        let mut details = token.denormalize();
        if let Some(fields) = details.as_object_mut() {
            // Strip the strategy marker wrap() adds so it is not duplicated
            // inside the persisted details.
            fields.remove(STRATEGY_FIELD);
        }
        let details = match &self.sealer {
            Some(sealer) => Value::String(sealer.seal(&details)?),
            None => details,
        };
        let data = StoredEntry {
            id,
            user: self.user_value(user)?,
            client: client_id.to_string(),
            strategy: strategy.to_string(),
            number: self.number.clone(),
            details,
            created_at: None,
            updated_at: None,
        };
        Ok(PreparedEntry { store: self, data })
    }

    /// Enforce the stored-entry schema.
    pub fn validate(entry: &StoredEntry) -> Result<()> {
        for (name, value) in [
            ("id", &entry.id),
            ("user", &entry.user),
            ("client", &entry.client),
            ("strategy", &entry.strategy),
            ("number", &entry.number),
        ] {
            if value.is_empty() {
                return Err(Error::Schema(format!("stored entry field {name} is empty")));
            }
        }
        match &entry.details {
            Value::String(sealed) if Sealer::is_sealed(sealed) => Ok(()),
            Value::String(_) => Err(Error::Schema(
                "stored entry details string is not in sealed form".into(),
            )),
            Value::Object(fields) => {
                if !fields.get("access_token").is_some_and(Value::is_string) {
                    return Err(Error::Schema(
                        "stored entry details missing access_token".into(),
                    ));
                }
                if !fields.get("expires_at").is_some_and(Value::is_i64) {
                    return Err(Error::Schema(
                        "stored entry details missing expires_at".into(),
                    ));
                }
                Ok(())
            }
            _ => Err(Error::Schema("stored entry details malformed".into())),
        }
    }

    /// Validate and persist an entry through the backend.
    pub async fn upsert_entry(&self, entry: StoredEntry) -> Result<StoredEntry> {
        Self::validate(&entry)?;
        self.backend.upsert(entry).await
    }

    /// Reconstruct a token from one persisted entry, unsealing first when
    /// configured. The wrapped token carries its strategy name as an extra
    /// field.
    pub async fn wrap(&self, entry: StoredEntry) -> Result<Token> {
        let details = match entry.details {
            Value::String(sealed) => match &self.sealer {
                Some(sealer) => sealer.unseal(&sealed)?,
                None => {
                    return Err(Error::Decryption(
                        "stored details are sealed but no secret is configured".into(),
                    ));
                }
            },
            details => details,
        };
        let Value::Object(mut fields) = details else {
            return Err(Error::Validation("stored details must be an object".into()));
        };
        fields.insert(STRATEGY_FIELD.into(), Value::String(entry.strategy));
        Token::new(Value::Object(fields))
    }

    /// Wrap a batch of persisted entries; any unsealing failure aborts the
    /// whole batch rather than returning partial data.
    pub async fn wrap_many(&self, entries: Vec<StoredEntry>) -> Result<Vec<Token>> {
        let mut tokens = Vec::with_capacity(entries.len());
        for entry in entries {
            tokens.push(self.wrap(entry).await?);
        }
        Ok(tokens)
    }

    /// Find and wrap the token stored under `id`, if any.
    pub async fn find(&self, id: &str) -> Result<Option<Token>> {
        match self.backend.find(id).await? {
            Some(entry) => Ok(Some(self.wrap(entry).await?)),
            None => Ok(None),
        }
    }

    /// All of a user's stored tokens, wrapped.
    pub async fn list(&self, user: &Value) -> Result<Vec<Token>> {
        let user = self.user_value(user)?;
        let entries = self.backend.list(&user).await?;
        self.wrap_many(entries).await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.backend.remove(id).await
    }

    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }

    fn user_value(&self, user: &Value) -> Result<String> {
        match user.get(&self.user_key) {
            Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
            Some(Value::Number(value)) => Ok(value.to_string()),
            _ => Err(Error::Validation(format!(
                "provided user must have a {} key",
                self.user_key
            ))),
        }
    }

    fn derive_id(&self, user: &Value, client_id: &str) -> Result<String> {
        if client_id.is_empty() {
            return Err(Error::Validation("provided client must have an id".into()));
        }
        let user = self.user_value(user)?;
        let digest = Sha256::digest(format!("{user}>{client_id}").as_bytes());
        Ok(hex::encode(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> TokenStore {
        TokenStore::new(Arc::new(MemoryBackend::new()), "sub")
    }

    fn token() -> Token {
        Token::new(json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "expires_at": 1_900_000_000,
            "scope": "openid"
        }))
        .unwrap()
    }

    #[test]
    fn id_is_sha256_of_user_and_client() {
        let store = store();
        let id = store.id(&json!({ "sub": "user-1" }), "client-1").unwrap();
        let expected = hex::encode(Sha256::digest(b"user-1>client-1"));
        assert_eq!(id.value, expected);
    }

    #[test]
    fn id_requires_user_key_and_client_id() {
        let store = store();
        assert!(store.id(&json!({ "email": "x" }), "client-1").is_err());
        assert!(store.id(&json!({ "sub": "user-1" }), "").is_err());
    }

    #[tokio::test]
    async fn prepare_builds_persisted_shape() {
        let store = store();
        let prepared = store
            .prepare(&json!({ "sub": "user-1" }), "client-1", "portal", &token())
            .await
            .unwrap();

        assert_eq!(prepared.data.user, "user-1");
        assert_eq!(prepared.data.client, "client-1");
        assert_eq!(prepared.data.strategy, "portal");
        assert_eq!(prepared.data.number, env!("CARGO_PKG_VERSION"));
        assert_eq!(prepared.data.details, token().denormalize());
    }

    #[tokio::test]
    async fn prepare_strips_strategy_marker_from_details() {
        let store = store();
        let prepared = store
            .prepare(&json!({ "sub": "user-1" }), "client-1", "portal", &token())
            .await
            .unwrap();
        let upserted = prepared.upsert().await.unwrap();

        // The wrapped token carries the marker...
        assert_eq!(upserted.extra.get(STRATEGY_FIELD), Some(&json!("portal")));

        // ...but persisting it again must not duplicate it into details.
        let again = store
            .prepare(&json!({ "sub": "user-1" }), "client-1", "portal", &upserted)
            .await
            .unwrap();
        assert!(again.data.details.get(STRATEGY_FIELD).is_none());
    }

    #[tokio::test]
    async fn upsert_then_find_round_trips() {
        let store = store();
        let user = json!({ "sub": "user-1" });
        store
            .prepare(&user, "client-1", "portal", &token())
            .await
            .unwrap()
            .upsert()
            .await
            .unwrap();

        let found = store.id(&user, "client-1").unwrap().find().await.unwrap();
        let found = found.expect("token stored");
        assert_eq!(found.access_token, "at-1");
        assert_eq!(found.refresh_token.as_deref(), Some("rt-1"));
    }

    #[tokio::test]
    async fn sealed_prepare_persists_only_the_sealed_form() {
        let store = store().with_secret("at-rest");
        let user = json!({ "sub": "user-1" });
        let prepared = store
            .prepare(&user, "client-1", "portal", &token())
            .await
            .unwrap();

        let Value::String(sealed) = &prepared.data.details else {
            panic!("details must be sealed");
        };
        assert!(Sealer::is_sealed(sealed));
        assert!(!sealed.contains("at-1"));

        prepared.upsert().await.unwrap();
        let found = store.id(&user, "client-1").unwrap().find().await.unwrap();
        assert_eq!(found.unwrap().access_token, "at-1");
    }

    #[tokio::test]
    async fn wrap_fails_on_wrong_secret() {
        let writer = store().with_secret("right");
        let user = json!({ "sub": "user-1" });
        let entry = writer
            .prepare(&user, "client-1", "portal", &token())
            .await
            .unwrap()
            .data;

        let reader = store().with_secret("wrong");
        assert!(matches!(
            reader.wrap(entry).await,
            Err(Error::Decryption(_))
        ));
    }

    #[tokio::test]
    async fn wrap_fails_on_sealed_details_without_secret() {
        let writer = store().with_secret("right");
        let user = json!({ "sub": "user-1" });
        let entry = writer
            .prepare(&user, "client-1", "portal", &token())
            .await
            .unwrap()
            .data;

        assert!(matches!(store().wrap(entry).await, Err(Error::Decryption(_))));
    }

    #[test]
    fn validate_rejects_missing_fields_and_malformed_details() {
        let mut entry = StoredEntry {
            id: "id".into(),
            user: "user".into(),
            client: "client".into(),
            strategy: "portal".into(),
            number: "1".into(),
            details: json!({ "access_token": "at", "expires_at": 1_900_000_000 }),
            created_at: None,
            updated_at: None,
        };
        assert!(TokenStore::validate(&entry).is_ok());

        entry.user = String::new();
        assert!(matches!(
            TokenStore::validate(&entry),
            Err(Error::Schema(_))
        ));

        entry.user = "user".into();
        entry.details = json!("not-sealed");
        assert!(matches!(
            TokenStore::validate(&entry),
            Err(Error::Schema(_))
        ));

        entry.details = json!({ "expires_at": 1_900_000_000 });
        assert!(matches!(
            TokenStore::validate(&entry),
            Err(Error::Schema(_))
        ));
    }

    #[tokio::test]
    async fn list_wraps_every_entry_for_the_user() {
        let store = store();
        let user = json!({ "sub": "user-1" });
        for client in ["client-1", "client-2"] {
            store
                .prepare(&user, client, "portal", &token())
                .await
                .unwrap()
                .upsert()
                .await
                .unwrap();
        }

        let tokens = store.list(&user).await.unwrap();
        assert_eq!(tokens.len(), 2);
    }
}
