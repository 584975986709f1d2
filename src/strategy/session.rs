//! The session strategy: establishes that a carrier session exists.

use super::{login_gate, Outcome};
use crate::error::Result;
use crate::request::Request;
use crate::session::set_authentication;

/// Gates every other strategy: once a session carries an identity record,
/// this strategy re-confirms it and lets the request proceed.
#[derive(Debug)]
pub struct SessionStrategy {
    name: String,
    login_form: String,
    redirect: Option<bool>,
}

impl SessionStrategy {
    pub fn new(name: impl Into<String>, login_form: impl Into<String>, redirect: Option<bool>) -> Self {
        Self {
            name: name.into(),
            login_form: login_form.into(),
            redirect,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn authenticate(&self, request: &mut Request) -> Result<Outcome> {
        if let Some(outcome) = login_gate(request, self.redirect, &self.login_form) {
            return Ok(outcome);
        }
        let record = set_authentication(request, None, false)?;
        Ok(Outcome::Authenticated(record))
    }
}
