//! Identity providers consulted when a CSR request authenticates.

use crate::config::{IdentityProviderConfig, UserConfig};
use crate::error::{Result, TokenBridgeError};
use crate::security::auth::UserPrincipal;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use subtle::ConstantTimeEq;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub principal: UserPrincipal,
    pub account_expires: Option<DateTime<Utc>>,
}

/// A directory of users able to authenticate with a login and password.
///
/// `authenticate` returns `Ok(None)` when the provider does not know the
/// user or the password is wrong, so callers can try every provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    async fn authenticate(&self, login: &str, password: &str) -> Result<Option<AuthenticatedUser>>;
}

/// Base64 SHA-256 digest in the form stored in `password_sha256`
pub fn hash_password(password: &str) -> String {
    general_purpose::STANDARD.encode(Sha256::digest(password.as_bytes()))
}

fn digests_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

pub struct InMemoryIdentityProvider {
    id: String,
    name: String,
    users: HashMap<String, UserConfig>,
}

impl InMemoryIdentityProvider {
    pub fn from_config(config: &IdentityProviderConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            users: config
                .users
                .iter()
                .map(|user| (user.login.clone(), user.clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self, login: &str, password: &str) -> Result<Option<AuthenticatedUser>> {
        let user = match self.users.get(login) {
            Some(user) => user,
            None => return Ok(None),
        };

        let stored = general_purpose::STANDARD
            .decode(user.password_sha256.trim())
            .map_err(|e| {
                TokenBridgeError::Config(format!(
                    "password digest of '{}' in provider '{}' is not base64: {}",
                    login, self.id, e
                ))
            })?;
        let presented = Sha256::digest(password.as_bytes());
        if !digests_match(&stored, &presented) {
            debug!("Password mismatch for {} in provider {}", login, self.id);
            return Ok(None);
        }

        if let Some(expires) = user.account_expires {
            if expires <= Utc::now() {
                return Err(TokenBridgeError::BadCredentials(format!(
                    "account '{}' expired at {}",
                    login, expires
                )));
            }
        }

        Ok(Some(AuthenticatedUser {
            principal: UserPrincipal::new(self.id.clone(), user.user_id.clone(), login),
            account_expires: user.account_expires,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn provider(expires: Option<DateTime<Utc>>) -> InMemoryIdentityProvider {
        InMemoryIdentityProvider::from_config(&IdentityProviderConfig {
            id: "internal".to_string(),
            name: "Internal".to_string(),
            users: vec![UserConfig {
                user_id: "u-1".to_string(),
                login: "alice".to_string(),
                password_sha256: hash_password("wonderland"),
                account_expires: expires,
            }],
        })
    }

    #[tokio::test]
    async fn test_authenticates_known_user() {
        let user = provider(None)
            .authenticate("alice", "wonderland")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.principal, UserPrincipal::new("internal", "u-1", "alice"));
    }

    #[tokio::test]
    async fn test_wrong_password_or_unknown_user() {
        let provider = provider(None);
        assert!(provider.authenticate("alice", "nope").await.unwrap().is_none());
        assert!(provider.authenticate("mallory", "wonderland").await.unwrap().is_none());
    }

    #[test]
    fn test_digest_comparison() {
        let digest = Sha256::digest(b"wonderland");
        assert!(digests_match(&digest, &Sha256::digest(b"wonderland")));
        assert!(!digests_match(&digest, &Sha256::digest(b"wonderlanD")));
        assert!(!digests_match(&digest, &digest[..16]));
        assert!(!digests_match(&[], &digest));
    }

    #[tokio::test]
    async fn test_expired_account_is_rejected() {
        let provider = provider(Some(Utc::now() - Duration::days(1)));
        assert!(matches!(
            provider.authenticate("alice", "wonderland").await,
            Err(TokenBridgeError::BadCredentials(_))
        ));
    }
}
