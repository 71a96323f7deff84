//! Binary allow/deny check run before any handler is instantiated.
//!
//! Reads are open to every principal. Writes, actions and bulk requests require one of the
//! configured write roles when authorization is enabled.


use tracing::debug;

use crate::config::AuthConfig;
use crate::handler::Verb;
use crate::AppError;
use crate::Result;

/// Identity of the northbound caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    pub user: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(
        user: impl Into<String>,
        roles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            user: user.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_role(
        &self,
        role: &str,
    ) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Debug, Clone)]
pub struct Authorizer {
    config: AuthConfig,
}

impl Authorizer {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    pub fn authorize(
        &self,
        principal: &Principal,
        verb: Verb,
    ) -> Result<()> {
        if !requires_write_role(verb) {
            return Ok(());
        }
        self.check(principal, verb.as_str())
    }

    /// A bulk request needs the write role once, whatever verbs it carries.
    pub fn authorize_bulk(
        &self,
        principal: &Principal,
    ) -> Result<()> {
        self.check(principal, "bulk")
    }

    fn check(
        &self,
        principal: &Principal,
        operation: &'static str,
    ) -> Result<()> {
        if !self.config.enabled || self.config.write_roles.iter().any(|role| principal.has_role(role)) {
            return Ok(());
        }

        debug!(user = %principal.user, operation, "Authorization denied");
        Err(AppError::Unauthorized {
            user: principal.user.clone(),
            operation,
        }
        .into())
    }
}

fn requires_write_role(verb: Verb) -> bool {
    verb.is_write() || verb == Verb::Action
}
