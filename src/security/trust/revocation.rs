//! Revocation check policies and revocation status lookup.

use crate::error::{Result, TokenBridgeError};
use crate::security::auth::certificates::normalize_dn;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevocationCheckStep {
    CrlFromCertificate,
    CrlFromUrl(String),
    OcspFromAia,
    OcspFromUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationCheckPolicy {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub steps: Vec<RevocationCheckStep>,
    /// Treat an unreachable CRL/OCSP source as "not revoked" and move on
    pub continue_on_server_unavailable: bool,
}

impl RevocationCheckPolicy {
    pub fn new(name: impl Into<String>, steps: Vec<RevocationCheckStep>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            is_default: false,
            steps,
            continue_on_server_unavailable: false,
        }
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// Holds revocation check policies; at most one of them is the default.
#[derive(Default)]
pub struct RevocationPolicyManager {
    policies: Mutex<HashMap<String, RevocationCheckPolicy>>,
}

impl RevocationPolicyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a policy. Saving a default policy clears the flag on
    /// every other policy under the same lock.
    pub fn save(&self, policy: RevocationCheckPolicy) -> String {
        let mut policies = self.policies.lock();
        if policy.is_default {
            for other in policies.values_mut().filter(|p| p.id != policy.id) {
                if other.is_default {
                    debug!("Policy '{}' is no longer the default", other.name);
                    other.is_default = false;
                }
            }
        }
        info!("Saved revocation check policy '{}'", policy.name);
        let id = policy.id.clone();
        policies.insert(id.clone(), policy);
        id
    }

    pub fn find(&self, id: &str) -> Option<RevocationCheckPolicy> {
        self.policies.lock().get(id).cloned()
    }

    pub fn find_default(&self) -> Option<RevocationCheckPolicy> {
        self.policies.lock().values().find(|p| p.is_default).cloned()
    }

    pub fn find_all(&self) -> Vec<RevocationCheckPolicy> {
        self.policies.lock().values().cloned().collect()
    }

    pub fn delete(&self, id: &str) -> bool {
        self.policies.lock().remove(id).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevocationStatus {
    Good,
    Revoked { reason: String, revoked_at: DateTime<Utc> },
    /// The source for this step could not be consulted
    Unavailable(String),
}

/// Evaluates a single revocation check step for one certificate
#[async_trait]
pub trait RevocationChecker: Send + Sync {
    async fn check(
        &self,
        step: &RevocationCheckStep,
        issuer_dn: &str,
        serial_number: &str,
    ) -> Result<RevocationStatus>;
}

#[derive(Debug, Clone)]
pub struct RevokedEntry {
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
}

/// In-memory revocation list keyed by issuer DN and serial number.
///
/// Every step kind is answered from the same list; URLs listed in
/// `unreachable_sources` report the source as unavailable.
#[derive(Default)]
pub struct RevocationList {
    revoked: DashMap<(String, String), RevokedEntry>,
    unreachable_sources: DashMap<String, ()>,
}

impl RevocationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self, issuer_dn: &str, serial_number: &str, reason: &str) {
        self.revoked.insert(
            (normalize_dn(issuer_dn), serial_number.to_ascii_lowercase()),
            RevokedEntry {
                reason: reason.to_string(),
                revoked_at: Utc::now(),
            },
        );
    }

    pub fn is_revoked(&self, issuer_dn: &str, serial_number: &str) -> bool {
        self.revoked
            .contains_key(&(normalize_dn(issuer_dn), serial_number.to_ascii_lowercase()))
    }

    pub fn mark_unreachable(&self, url: &str) {
        self.unreachable_sources.insert(url.to_string(), ());
    }
}

#[async_trait]
impl RevocationChecker for RevocationList {
    async fn check(
        &self,
        step: &RevocationCheckStep,
        issuer_dn: &str,
        serial_number: &str,
    ) -> Result<RevocationStatus> {
        if let RevocationCheckStep::CrlFromUrl(url) | RevocationCheckStep::OcspFromUrl(url) = step {
            if self.unreachable_sources.contains_key(url) {
                return Ok(RevocationStatus::Unavailable(url.clone()));
            }
        }

        let key = (normalize_dn(issuer_dn), serial_number.to_ascii_lowercase());
        Ok(match self.revoked.get(&key) {
            Some(entry) => RevocationStatus::Revoked {
                reason: entry.reason.clone(),
                revoked_at: entry.revoked_at,
            },
            None => RevocationStatus::Good,
        })
    }
}

/// Run every step of `policy` in order.
///
/// A revoked answer from any step fails the check. An unavailable source
/// fails it too unless the policy says to continue.
pub async fn evaluate_policy(
    checker: &dyn RevocationChecker,
    policy: &RevocationCheckPolicy,
    issuer_dn: &str,
    serial_number: &str,
) -> Result<()> {
    for step in &policy.steps {
        match checker.check(step, issuer_dn, serial_number).await? {
            RevocationStatus::Good => {}
            RevocationStatus::Revoked { reason, .. } => {
                return Err(TokenBridgeError::InvalidCertificate {
                    reason: format!("certificate {} revoked: {}", serial_number, reason),
                });
            }
            RevocationStatus::Unavailable(source) => {
                if !policy.continue_on_server_unavailable {
                    return Err(TokenBridgeError::InvalidCertificate {
                        reason: format!("revocation source {} unavailable", source),
                    });
                }
                debug!("Revocation source {} unavailable, continuing", source);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saving_default_unsets_previous_default() {
        let manager = RevocationPolicyManager::new();
        let first = manager.save(RevocationCheckPolicy::new("first", vec![]).as_default());
        let second = manager.save(RevocationCheckPolicy::new("second", vec![]).as_default());

        let defaults: Vec<_> = manager.find_all().into_iter().filter(|p| p.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, second);
        assert!(!manager.find(&first).unwrap().is_default);
        assert_eq!(manager.find_default().unwrap().name, "second");
    }

    #[test]
    fn test_resaving_default_keeps_it_default() {
        let manager = RevocationPolicyManager::new();
        let id = manager.save(RevocationCheckPolicy::new("only", vec![]).as_default());
        let policy = manager.find(&id).unwrap();
        manager.save(policy);
        assert_eq!(manager.find_default().unwrap().id, id);
    }

    #[test]
    fn test_no_default_configured() {
        let manager = RevocationPolicyManager::new();
        manager.save(RevocationCheckPolicy::new("plain", vec![]));
        assert!(manager.find_default().is_none());
    }

    #[tokio::test]
    async fn test_revoked_serial_fails_policy() {
        let list = RevocationList::new();
        list.revoke("CN=Root CA", "1A", "key compromise");
        let policy = RevocationCheckPolicy::new("crl", vec![RevocationCheckStep::CrlFromCertificate]);

        assert!(evaluate_policy(&list, &policy, "cn=root ca", "1a").await.is_err());
        assert!(evaluate_policy(&list, &policy, "CN=Root CA", "2b").await.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_source_respects_policy() {
        let list = RevocationList::new();
        list.mark_unreachable("http://ocsp.example.com");
        let mut policy = RevocationCheckPolicy::new(
            "ocsp",
            vec![RevocationCheckStep::OcspFromUrl("http://ocsp.example.com".to_string())],
        );

        assert!(evaluate_policy(&list, &policy, "CN=Root CA", "1").await.is_err());

        policy.continue_on_server_unavailable = true;
        assert!(evaluate_policy(&list, &policy, "CN=Root CA", "1").await.is_ok());
    }
}
