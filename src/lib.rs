//! Authwall — multi-strategy authentication gateway core.
//!
//! Mediates session-bound identity, OAuth2/OIDC delegated authorization,
//! and token lifecycle (issuance, refresh, expiry, at-rest sealing) behind
//! a closed set of strategies: plain session, OIDC entity, and OAuth2
//! resource. Host-framework-neutral: strategies consume a [`request::Request`]
//! and produce an [`strategy::Outcome`] effect the host turns into a
//! response.
//!
//! # Quick Start
//!
//! ```no_run
//! use authwall::config::Settings;
//! use authwall::registry::Registry;
//! use authwall::request::Request;
//!
//! # async fn example() -> authwall::error::Result<()> {
//! let settings = Settings::from_toml_str(r#"
//!     [session]
//!     login_form = "/login"
//! "#)?;
//! let registry = Registry::build(settings)?;
//!
//! let mut request = Request::with_memory_session("https://app.example.com/portal")?;
//! let outcome = registry.authenticate("session", &mut request).await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod params;
pub mod registry;
pub mod request;
pub mod session;
pub mod store;
pub mod strategy;
pub mod token;

pub use error::{Error, Result};
pub use events::{AuthEvent, EventKind};
pub use registry::Registry;
pub use request::Request;
pub use session::{IdentityRecord, MemorySession, SessionCarrier};
pub use store::{StoreBackend, TokenStore};
pub use strategy::{Outcome, Strategy};
pub use token::Token;
