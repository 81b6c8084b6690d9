//! Certificate path validation against the trust store.

use super::revocation::{evaluate_policy, RevocationChecker, RevocationPolicyManager};
use super::store::{RevocationPolicyRef, TrustStore, TrustedCertificateRecord};
use crate::error::{Result, TokenBridgeError};
use crate::security::auth::certificates::{verify_issued_by, CertificateFacts};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// How much validation a presented certificate receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertificateValidationType {
    /// Validity window only
    CertificateOnly,
    /// Validity window plus a trusted issuer whose key verifies the signature
    PathValidation,
    /// Path validation plus the issuer's revocation policy
    RevocationCheck,
}

#[async_trait]
pub trait CertificatePathValidator: Send + Sync {
    async fn validate(
        &self,
        cert_der: &[u8],
        validation_type: CertificateValidationType,
    ) -> Result<()>;
}

pub struct TrustAnchorValidator {
    trust_store: Arc<TrustStore>,
    policies: Arc<RevocationPolicyManager>,
    revocation: Arc<dyn RevocationChecker>,
}

impl TrustAnchorValidator {
    pub fn new(
        trust_store: Arc<TrustStore>,
        policies: Arc<RevocationPolicyManager>,
        revocation: Arc<dyn RevocationChecker>,
    ) -> Self {
        Self {
            trust_store,
            policies,
            revocation,
        }
    }

    async fn find_issuer(
        &self,
        cert_der: &[u8],
        facts: &CertificateFacts,
    ) -> Result<Arc<TrustedCertificateRecord>> {
        let now = Utc::now();
        let mut candidates: Vec<_> = self
            .trust_store
            .by_subject_dn(&facts.issuer_dn)
            .await?
            .into_iter()
            .filter(|anchor| anchor.can_sign_client_certs())
            .filter(|anchor| anchor.not_before <= now && now <= anchor.not_after)
            .collect();

        if candidates.is_empty() {
            return Err(TokenBridgeError::InvalidCertificate {
                reason: format!("no trusted issuer '{}'", facts.issuer_dn),
            });
        }

        // Anchors whose key identifier matches the AKI go first
        if let Some(aki) = &facts.authority_key_id {
            candidates.sort_by_key(|anchor| anchor.ski.as_ref() != Some(aki));
        }

        for anchor in candidates {
            match verify_issued_by(cert_der, &anchor.der) {
                Ok(()) => return Ok(anchor),
                Err(e) => debug!("Anchor '{}' did not verify: {}", anchor.name, e),
            }
        }

        Err(TokenBridgeError::InvalidCertificate {
            reason: format!("signature not verified by any trusted '{}'", facts.issuer_dn),
        })
    }

    async fn check_revocation(
        &self,
        anchor: &TrustedCertificateRecord,
        facts: &CertificateFacts,
    ) -> Result<()> {
        let policy = match &anchor.revocation_policy {
            RevocationPolicyRef::None => return Ok(()),
            RevocationPolicyRef::UseDefault => self.policies.find_default().ok_or_else(|| {
                TokenBridgeError::InvalidCertificate {
                    reason: "no default revocation check policy configured".to_string(),
                }
            })?,
            RevocationPolicyRef::Specified(id) => self.policies.find(id).ok_or_else(|| {
                TokenBridgeError::InvalidCertificate {
                    reason: format!("revocation check policy {} not found", id),
                }
            })?,
        };

        evaluate_policy(
            self.revocation.as_ref(),
            &policy,
            &facts.issuer_dn,
            &facts.serial_number,
        )
        .await
    }
}

#[async_trait]
impl CertificatePathValidator for TrustAnchorValidator {
    async fn validate(
        &self,
        cert_der: &[u8],
        validation_type: CertificateValidationType,
    ) -> Result<()> {
        let facts = CertificateFacts::from_der(cert_der)?;

        let now = Utc::now();
        if now < facts.not_before {
            return Err(TokenBridgeError::InvalidCertificate {
                reason: "certificate is not yet valid".to_string(),
            });
        }
        if now > facts.not_after {
            return Err(TokenBridgeError::InvalidCertificate {
                reason: "certificate has expired".to_string(),
            });
        }

        if validation_type == CertificateValidationType::CertificateOnly {
            return Ok(());
        }

        let anchor = self.find_issuer(cert_der, &facts).await?;
        debug!("Certificate {} issued by trusted '{}'", facts.subject_dn, anchor.name);

        if validation_type == CertificateValidationType::RevocationCheck {
            self.check_revocation(&anchor, &facts).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::metrics::SecurityMetrics;
    use crate::security::trust::revocation::{RevocationCheckPolicy, RevocationCheckStep, RevocationList};
    use crate::security::trust::store::{InMemoryTrustAnchorRepository, TrustFlag};
    use rcgen::{BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa};
    use std::time::Duration;

    struct Fixture {
        validator: TrustAnchorValidator,
        store: Arc<TrustStore>,
        policies: Arc<RevocationPolicyManager>,
        revocation: Arc<RevocationList>,
        ca: Certificate,
    }

    fn ca(cn: &str) -> Certificate {
        let mut params = CertificateParams::new(vec![]);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        Certificate::from_params(params).unwrap()
    }

    fn client_cert(cn: &str, signer: &Certificate) -> Vec<u8> {
        let mut params = CertificateParams::new(vec![]);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.use_authority_key_identifier_extension = true;
        Certificate::from_params(params)
            .unwrap()
            .serialize_der_with_signer(signer)
            .unwrap()
    }

    async fn fixture(flags: Vec<TrustFlag>, policy: RevocationPolicyRef) -> Fixture {
        let ca = ca("Client CA");
        let repo = Arc::new(InMemoryTrustAnchorRepository::new());
        let store = Arc::new(TrustStore::new(
            repo,
            Duration::from_secs(5),
            Arc::new(SecurityMetrics::new()),
        ));
        let record = TrustedCertificateRecord::from_der("client-ca", &ca.serialize_der().unwrap(), flags)
            .unwrap()
            .with_revocation_policy(policy);
        store.save(record).await.unwrap();

        let policies = Arc::new(RevocationPolicyManager::new());
        let revocation = Arc::new(RevocationList::new());
        let validator = TrustAnchorValidator::new(store.clone(), policies.clone(), revocation.clone());
        Fixture {
            validator,
            store,
            policies,
            revocation,
            ca,
        }
    }

    #[tokio::test]
    async fn test_path_validation_with_trusted_issuer() {
        let f = fixture(vec![TrustFlag::SigningClientCerts], RevocationPolicyRef::None).await;
        let cert = client_cert("alice", &f.ca);
        f.validator
            .validate(&cert, CertificateValidationType::PathValidation)
            .await
            .unwrap();
        assert_eq!(f.store.by_name("client-ca").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_anchor_without_client_signing_flag_is_not_trusted() {
        let f = fixture(vec![TrustFlag::Ssl], RevocationPolicyRef::None).await;
        let cert = client_cert("alice", &f.ca);
        assert!(f
            .validator
            .validate(&cert, CertificateValidationType::PathValidation)
            .await
            .is_err());
        // Certificate-only validation does not look at issuers
        assert!(f
            .validator
            .validate(&cert, CertificateValidationType::CertificateOnly)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_impostor_issuer_with_same_name_fails_signature() {
        let f = fixture(vec![TrustFlag::TrustAnchor], RevocationPolicyRef::None).await;
        let impostor = ca("Client CA");
        let cert = client_cert("alice", &impostor);
        let err = f
            .validator
            .validate(&cert, CertificateValidationType::PathValidation)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenBridgeError::InvalidCertificate { .. }));
    }

    #[tokio::test]
    async fn test_revocation_without_default_policy_fails_closed() {
        let f = fixture(vec![TrustFlag::TrustAnchor], RevocationPolicyRef::UseDefault).await;
        let cert = client_cert("alice", &f.ca);
        assert!(f
            .validator
            .validate(&cert, CertificateValidationType::RevocationCheck)
            .await
            .is_err());

        f.policies.save(
            RevocationCheckPolicy::new("crl", vec![RevocationCheckStep::CrlFromCertificate]).as_default(),
        );
        assert!(f
            .validator
            .validate(&cert, CertificateValidationType::RevocationCheck)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_revoked_certificate_is_rejected() {
        let f = fixture(vec![TrustFlag::TrustAnchor], RevocationPolicyRef::UseDefault).await;
        f.policies.save(
            RevocationCheckPolicy::new("crl", vec![RevocationCheckStep::CrlFromCertificate]).as_default(),
        );
        let cert = client_cert("alice", &f.ca);
        let facts = CertificateFacts::from_der(&cert).unwrap();
        f.revocation.revoke(&facts.issuer_dn, &facts.serial_number, "superseded");

        assert!(f
            .validator
            .validate(&cert, CertificateValidationType::RevocationCheck)
            .await
            .is_err());
        // Path validation alone ignores revocation
        assert!(f
            .validator
            .validate(&cert, CertificateValidationType::PathValidation)
            .await
            .is_ok());
    }
}
