//! Error types for authwall.

use thiserror::Error;

/// Convenience result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for all authwall operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A raw token or stored entry failed validation before persistence.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A configuration or stored-record shape violation.
    #[error("Schema error: {0}")]
    Schema(String),

    /// The caller-supplied credentials transform returned a malformed result.
    #[error("Invalid credentials object: {0}")]
    InvalidCredentials(String),

    /// The state value echoed at callback does not match the session-bound one.
    #[error("State mismatch for client {client_id}")]
    StateMismatch { client_id: String },

    /// A callback round-trip arrived without its session parameters twice in
    /// a row; the user agent's cookie plumbing is broken.
    #[error("Redirect chain broken after retry: {0}")]
    BrokenRedirectChain(String),

    /// Sealed token details could not be unsealed (tampered data or wrong
    /// secret). Fatal for the record; never yields partial data.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// The remote provider answered with an error or an unusable payload.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Unknown strategy name, or an operation the strategy kind does not
    /// support.
    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Self::Schema(error.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(error: toml::ser::Error) -> Self {
        Self::Schema(error.to_string())
    }
}

impl Error {
    /// True for failures the host should answer with a generic server error
    /// rather than an auth-specific response.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Provider(_)
                | Self::Io(_)
                | Self::Serialization(_)
                | Self::Decryption(_)
        )
    }
}
