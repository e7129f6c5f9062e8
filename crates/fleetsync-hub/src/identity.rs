use crate::config::{HubConfig, TokenEntry};
use fleetsync_core::sync_ipc::HelloPayload;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub const LOOPBACK_ORGANIZATION: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedIdentity {
    pub identity: String,
    pub organization: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("hello is missing a client id")]
    MissingClientId,
    #[error("hello is missing a token")]
    MissingToken,
    #[error("token is not recognised")]
    UnknownToken,
}

impl IdentityError {
    pub fn code(&self) -> &'static str {
        match self {
            IdentityError::MissingClientId => "missing_client_id",
            IdentityError::MissingToken => "missing_token",
            IdentityError::UnknownToken => "unknown_token",
        }
    }
}

/// Maps a channel's `hello` onto the identity whose schedule it joins.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, hello: &HelloPayload) -> Result<ResolvedIdentity, IdentityError>;
}

/// Static bearer tokens from the config file.
pub struct TokenTable {
    tokens: HashMap<String, ResolvedIdentity>,
}

impl TokenTable {
    pub fn new(entries: &[TokenEntry]) -> Self {
        let tokens = entries
            .iter()
            .map(|entry| {
                (
                    entry.token.clone(),
                    ResolvedIdentity {
                        identity: entry.identity.clone(),
                        organization: entry.organization.clone(),
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityResolver for TokenTable {
    fn resolve(&self, hello: &HelloPayload) -> Result<ResolvedIdentity, IdentityError> {
        let token = hello
            .token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(IdentityError::MissingToken)?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or(IdentityError::UnknownToken)
    }
}

/// Trusts the caller's own client id. Only suitable when the hub is bound
/// to loopback.
pub struct LoopbackTrust;

impl IdentityResolver for LoopbackTrust {
    fn resolve(&self, hello: &HelloPayload) -> Result<ResolvedIdentity, IdentityError> {
        let client_id = hello.client_id.trim();
        if client_id.is_empty() {
            return Err(IdentityError::MissingClientId);
        }
        Ok(ResolvedIdentity {
            identity: client_id.to_string(),
            organization: LOOPBACK_ORGANIZATION.to_string(),
        })
    }
}

pub fn resolver_from_config(config: &HubConfig) -> Arc<dyn IdentityResolver> {
    if config.tokens.is_empty() {
        Arc::new(LoopbackTrust)
    } else {
        Arc::new(TokenTable::new(&config.tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(client_id: &str, token: Option<&str>) -> HelloPayload {
        HelloPayload {
            client_id: client_id.to_string(),
            token: token.map(str::to_string),
        }
    }

    #[test]
    fn loopback_trusts_client_id() {
        let resolved = LoopbackTrust.resolve(&hello("dash-1", None)).expect("resolved");
        assert_eq!(resolved.identity, "dash-1");
        assert_eq!(resolved.organization, LOOPBACK_ORGANIZATION);
        assert_eq!(
            LoopbackTrust.resolve(&hello("  ", None)),
            Err(IdentityError::MissingClientId)
        );
    }

    #[test]
    fn token_table_maps_tokens_to_identities() {
        let table = TokenTable::new(&[TokenEntry {
            token: "s3cret".to_string(),
            identity: "alice".to_string(),
            organization: "acme".to_string(),
        }]);
        let resolved = table
            .resolve(&hello("ignored", Some("s3cret")))
            .expect("resolved");
        assert_eq!(resolved.identity, "alice");
        assert_eq!(resolved.organization, "acme");

        assert_eq!(
            table.resolve(&hello("x", None)),
            Err(IdentityError::MissingToken)
        );
        assert_eq!(
            table.resolve(&hello("x", Some("nope"))),
            Err(IdentityError::UnknownToken)
        );
    }

    #[test]
    fn config_without_tokens_falls_back_to_loopback() {
        let resolver = resolver_from_config(&HubConfig::default());
        let resolved = resolver.resolve(&hello("cli", None)).expect("resolved");
        assert_eq!(resolved.organization, LOOPBACK_ORGANIZATION);
    }
}
