//! Normalized OAuth2 token with expiry computation.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Refresh-ahead tolerance in seconds. A token reports itself expired this
/// many seconds before literal expiry so refresh wins the race against
/// in-flight requests.
pub const DEFAULT_EXPIRY_OFFSET: i64 = 10;

/// Wire field names the token normalizes; everything else is carried
/// verbatim in `extra`.
const ACCESS_TOKEN: &str = "access_token";
const TOKEN_TYPE: &str = "token_type";
const REFRESH_TOKEN: &str = "refresh_token";
const EXPIRES_AT: &str = "expires_at";
const EXPIRES_IN: &str = "expires_in";

/// A single validated OAuth2 token.
///
/// Constructed fresh from a raw provider response on every authorization,
/// refresh, or store read; immutable once constructed. A refresh produces a
/// new token via [`Token::merged_with`].
///
/// # Example
/// ```
/// use authwall::token::Token;
/// use serde_json::json;
///
/// let token = Token::new(json!({
///     "access_token": "at-1",
///     "token_type": "Bearer",
///     "expires_in": 3600
/// }))?;
/// assert!(!token.expired(10));
/// # Ok::<(), authwall::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub access_token: String,
    pub token_type: Option<String>,
    pub refresh_token: Option<String>,
    /// Absolute expiry instant. `expires_in` inputs are converted at
    /// construction and discarded.
    pub expires_at: DateTime<Utc>,
    /// Provider-specific fields preserved verbatim, wire-keyed.
    pub extra: Map<String, Value>,
}

impl Token {
    /// Validate and normalize a raw wire object into a token.
    ///
    /// Requires `access_token` and exactly one of `expires_at` (unix
    /// seconds) / `expires_in` (positive seconds from now).
    pub fn new(raw: Value) -> Result<Self> {
        let Value::Object(mut fields) = raw else {
            return Err(Error::Validation("token payload must be an object".into()));
        };

        let access_token = match fields.remove(ACCESS_TOKEN) {
            Some(Value::String(value)) if !value.is_empty() => value,
            Some(_) => {
                return Err(Error::Validation("access_token must be a string".into()));
            }
            None => return Err(Error::Validation("access_token is required".into())),
        };

        let token_type = take_optional_string(&mut fields, TOKEN_TYPE)?;
        let refresh_token = take_optional_string(&mut fields, REFRESH_TOKEN)?;

        let expires_at = fields.remove(EXPIRES_AT);
        let expires_in = fields.remove(EXPIRES_IN);
        let expires_at = match (expires_at, expires_in) {
            (Some(at), None) => parse_unix_seconds(&at)?,
            (None, Some(within)) => {
                let seconds = within.as_i64().filter(|value| *value > 0).ok_or_else(|| {
                    Error::Validation("expires_in must be a positive integer".into())
                })?;
                timestamp(now() + seconds)?
            }
            (Some(_), Some(_)) => {
                return Err(Error::Validation(
                    "expires_at and expires_in are mutually exclusive".into(),
                ));
            }
            (None, None) => {
                return Err(Error::Validation(
                    "one of expires_at or expires_in is required".into(),
                ));
            }
        };

        for (key, value) in &fields {
            if !matches!(
                value,
                Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Object(_)
            ) {
                return Err(Error::Validation(format!(
                    "unsupported value for token field {key}"
                )));
            }
        }

        Ok(Self {
            access_token,
            token_type,
            refresh_token,
            expires_at,
            extra: fields,
        })
    }

    /// True when the token is within `offset` seconds of expiry (boundary
    /// inclusive).
    pub fn expired(&self, offset: i64) -> bool {
        self.expires_at.timestamp() - (now() + offset) <= 0
    }

    /// Pure projection back to the wire object.
    ///
    /// Lossless for every field the raw input carried, modulo the
    /// intentional `expires_in → expires_at` substitution.
    pub fn denormalize(&self) -> Value {
        let mut fields = Map::new();
        fields.insert(ACCESS_TOKEN.into(), Value::String(self.access_token.clone()));
        if let Some(token_type) = &self.token_type {
            fields.insert(TOKEN_TYPE.into(), Value::String(token_type.clone()));
        }
        if let Some(refresh_token) = &self.refresh_token {
            fields.insert(REFRESH_TOKEN.into(), Value::String(refresh_token.clone()));
        }
        fields.insert(EXPIRES_AT.into(), Value::from(self.expires_at.timestamp()));
        for (key, value) in &self.extra {
            fields.insert(key.clone(), value.clone());
        }
        Value::Object(fields)
    }

    /// Merge a renewal response over this token: this token's fields are the
    /// base, `newer` wins on conflict. Keeps the old `refresh_token` when
    /// the renewal omitted it.
    pub fn merged_with(&self, newer: &Token) -> Token {
        let mut extra = self.extra.clone();
        for (key, value) in &newer.extra {
            extra.insert(key.clone(), value.clone());
        }
        Token {
            access_token: newer.access_token.clone(),
            token_type: newer.token_type.clone().or_else(|| self.token_type.clone()),
            refresh_token: newer
                .refresh_token
                .clone()
                .or_else(|| self.refresh_token.clone()),
            expires_at: newer.expires_at,
            extra,
        }
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.denormalize().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Token::new(raw).map_err(D::Error::custom)
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| Error::Validation(format!("expiry timestamp {seconds} out of range")))
}

fn parse_unix_seconds(value: &Value) -> Result<DateTime<Utc>> {
    let seconds = value
        .as_i64()
        .ok_or_else(|| Error::Validation("expires_at must be a unix timestamp".into()))?;
    timestamp(seconds)
}

fn take_optional_string(fields: &mut Map<String, Value>, key: &str) -> Result<Option<String>> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(Error::Validation(format!("{key} must be a string"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn construct_requires_access_token() {
        let result = Token::new(json!({ "expires_in": 60 }));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn construct_requires_exactly_one_expiry_field() {
        let neither = Token::new(json!({ "access_token": "at" }));
        assert!(matches!(neither, Err(Error::Validation(_))));

        let both = Token::new(json!({
            "access_token": "at",
            "expires_at": 1_900_000_000,
            "expires_in": 60
        }));
        assert!(matches!(both, Err(Error::Validation(_))));
    }

    #[test]
    fn expires_in_converts_to_absolute_expiry() {
        let before = now();
        let token = Token::new(json!({ "access_token": "at", "expires_in": 3600 })).unwrap();
        let after = now();

        assert!(token.expires_at.timestamp() >= before + 3600);
        assert!(token.expires_at.timestamp() <= after + 3600);
        assert!(!token.extra.contains_key(EXPIRES_IN));
    }

    #[test]
    fn rejects_non_positive_expires_in() {
        let result = Token::new(json!({ "access_token": "at", "expires_in": 0 }));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_array_valued_extra_field() {
        let result = Token::new(json!({
            "access_token": "at",
            "expires_in": 60,
            "amr": ["pwd"]
        }));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn denormalize_round_trips_wire_fields() {
        let raw = json!({
            "access_token": "at-1",
            "token_type": "Bearer",
            "refresh_token": "rt-1",
            "expires_at": 1_900_000_000,
            "scope": "openid profile",
            "session_state": "abc"
        });
        let token = Token::new(raw.clone()).unwrap();
        assert_eq!(token.denormalize(), raw);
    }

    #[test]
    fn round_trip_replaces_expires_in_with_computed_expires_at() {
        let t0 = now();
        let token = Token::new(json!({ "access_token": "at", "expires_in": 120 })).unwrap();
        let wire = token.denormalize();

        assert!(wire.get(EXPIRES_IN).is_none());
        let at = wire.get(EXPIRES_AT).and_then(Value::as_i64).unwrap();
        assert!((at - (t0 + 120)).abs() <= 1);
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let at_boundary = Token::new(json!({
            "access_token": "at",
            "expires_at": now() + 10
        }))
        .unwrap();
        assert!(at_boundary.expired(DEFAULT_EXPIRY_OFFSET));

        let beyond = Token::new(json!({
            "access_token": "at",
            "expires_at": now() + 11
        }))
        .unwrap();
        assert!(!beyond.expired(DEFAULT_EXPIRY_OFFSET));
    }

    #[test]
    fn merged_with_keeps_old_refresh_token_when_renewal_omits_it() {
        let old = Token::new(json!({
            "access_token": "old",
            "refresh_token": "rt-keep",
            "expires_at": now() - 60,
            "scope": "openid",
            "realm": "legacy"
        }))
        .unwrap();
        let renewed = Token::new(json!({
            "access_token": "new",
            "expires_in": 3600,
            "scope": "openid profile"
        }))
        .unwrap();

        let merged = old.merged_with(&renewed);
        assert_eq!(merged.access_token, "new");
        assert_eq!(merged.refresh_token.as_deref(), Some("rt-keep"));
        assert_eq!(merged.expires_at, renewed.expires_at);
        assert_eq!(merged.extra.get("scope"), Some(&json!("openid profile")));
        assert_eq!(merged.extra.get("realm"), Some(&json!("legacy")));
    }

    #[test]
    fn serde_round_trip_uses_wire_shape() {
        let token = Token::new(json!({
            "access_token": "at",
            "expires_at": 1_900_000_000,
            "id_token": "header.payload.sig"
        }))
        .unwrap();
        let encoded = serde_json::to_value(&token).unwrap();
        assert_eq!(encoded, token.denormalize());

        let decoded: Token = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, token);
    }
}
