//! Signing of user-submitted certificate signing requests.

use super::identity::{AuthenticatedUser, IdentityProvider};
use crate::audit::{AuditActor, AuditEvent, AuditScope, AuditSink};
use crate::config::CsrConfig;
use crate::error::{Result, TokenBridgeError};
use crate::security::auth::certificates::decode_pem_or_der;
use crate::security::auth::{CertificateFacts, ClientCertificateRegistry, UserPrincipal};
use crate::security::metrics::SecurityMetrics;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rcgen::{
    Certificate as RcgenCertificate, CertificateParams, CertificateSigningRequest,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The CA that signs client certificates
pub struct CsrSigner {
    ca: RcgenCertificate,
    ca_der: Vec<u8>,
    ca_facts: CertificateFacts,
    /// Only emitted when the key identifier rcgen derives is the one in the CA certificate
    emit_authority_key_id: bool,
    validity_days: u32,
}

impl CsrSigner {
    pub fn from_config(config: &CsrConfig) -> Result<Self> {
        match (&config.ca_cert_path, &config.ca_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert_pem = std::fs::read_to_string(cert_path)?;
                let key_pem = std::fs::read_to_string(key_path)?;
                info!("Loading signing CA from {}", cert_path.display());
                Self::from_pem(&cert_pem, &key_pem, config.cert_validity_days)
            }
            _ => {
                warn!("No signing CA configured, generating an ephemeral one");
                Self::ephemeral(&config.ca_common_name, config.cert_validity_days)
            }
        }
    }

    /// A fresh self-signed CA that lives as long as the process
    pub fn ephemeral(common_name: &str, validity_days: u32) -> Result<Self> {
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, common_name);

        let mut params = CertificateParams::new(vec![]);
        params.distinguished_name = distinguished_name;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = ::time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + ::time::Duration::days(3650);

        let ca = RcgenCertificate::from_params(params).map_err(|e| {
            TokenBridgeError::CertificateGeneration {
                reason: format!("Failed to generate signing CA: {}", e),
            }
        })?;
        let ca_der = ca.serialize_der()?;
        Self::assemble(ca, ca_der, true, validity_days)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str, validity_days: u32) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem).map_err(|e| TokenBridgeError::InvalidCertificate {
            reason: format!("Failed to parse CA private key: {}", e),
        })?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair).map_err(|e| {
            TokenBridgeError::InvalidCertificate {
                reason: format!("Failed to parse CA certificate: {}", e),
            }
        })?;
        let ca = RcgenCertificate::from_params(params)?;
        let ca_der = decode_pem_or_der(cert_pem.as_bytes());
        Self::assemble(ca, ca_der, false, validity_days)
    }

    fn assemble(
        ca: RcgenCertificate,
        ca_der: Vec<u8>,
        emit_authority_key_id: bool,
        validity_days: u32,
    ) -> Result<Self> {
        let ca_facts = CertificateFacts::from_der(&ca_der)?;
        if !ca_facts.is_ca {
            return Err(TokenBridgeError::InvalidCertificate {
                reason: format!("{} is not a CA certificate", ca_facts.subject_dn),
            });
        }
        Ok(Self {
            ca,
            ca_der,
            ca_facts,
            emit_authority_key_id,
            validity_days,
        })
    }

    pub fn ca_certificate_der(&self) -> &[u8] {
        &self.ca_der
    }

    pub fn ca_facts(&self) -> &CertificateFacts {
        &self.ca_facts
    }

    /// Sign `csr` (PEM or DER) for `login`. The subject is always `CN=login`
    /// whatever the request asked for, and the certificate ends no later
    /// than `account_expires`.
    pub fn sign(
        &self,
        csr: &[u8],
        login: &str,
        account_expires: Option<DateTime<Utc>>,
    ) -> Result<Vec<u8>> {
        let der = decode_pem_or_der(csr);
        let mut request = CertificateSigningRequest::from_der(&der).map_err(|e| {
            TokenBridgeError::InvalidCertificate {
                reason: format!("unreadable certificate signing request: {}", e),
            }
        })?;

        let mut subject = DistinguishedName::new();
        subject.push(DnType::CommonName, login);
        request.params.distinguished_name = subject;
        request.params.subject_alt_names.clear();
        request.params.is_ca = IsCa::NoCa;
        request.params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        request.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        request.params.use_authority_key_identifier_extension = self.emit_authority_key_id;

        let not_before = ::time::OffsetDateTime::now_utc();
        let mut not_after = not_before + ::time::Duration::days(self.validity_days as i64);
        if let Some(expires) = account_expires {
            let expires = ::time::OffsetDateTime::from_unix_timestamp(expires.timestamp()).map_err(|e| {
                TokenBridgeError::CertificateGeneration {
                    reason: format!("account expiry out of range: {}", e),
                }
            })?;
            if expires < not_after {
                debug!("Clamping certificate for {} to account expiry {}", login, expires);
                not_after = expires;
            }
        }
        request.params.not_before = not_before;
        request.params.not_after = not_after;

        request.serialize_der_with_signer(&self.ca).map_err(|e| {
            TokenBridgeError::CertificateGeneration {
                reason: format!("Failed to sign certificate for {}: {}", login, e),
            }
        })
    }
}

pub struct CsrSigningService {
    enabled: bool,
    providers: Vec<Arc<dyn IdentityProvider>>,
    registry: Arc<ClientCertificateRegistry>,
    signer: CsrSigner,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<SecurityMetrics>,
}

impl CsrSigningService {
    pub fn new(
        enabled: bool,
        providers: Vec<Arc<dyn IdentityProvider>>,
        registry: Arc<ClientCertificateRegistry>,
        signer: CsrSigner,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<SecurityMetrics>,
    ) -> Self {
        registry.set_signing_ca(Some(signer.ca_facts().clone()));
        Self {
            enabled,
            providers,
            registry,
            signer,
            audit,
            metrics,
        }
    }

    pub fn ca_certificate_der(&self) -> &[u8] {
        self.signer.ca_certificate_der()
    }

    pub fn registry(&self) -> &Arc<ClientCertificateRegistry> {
        &self.registry
    }

    async fn authenticate(&self, login: &str, password: &str) -> Result<AuthenticatedUser> {
        // Every provider is asked; a login valid in two of them is ambiguous
        let attempts = self
            .providers
            .iter()
            .map(|provider| async move { (provider.name(), provider.authenticate(login, password).await) });
        let mut matches = Vec::new();
        for (name, outcome) in join_all(attempts).await {
            if let Some(user) = outcome? {
                debug!("{} authenticated by provider {}", login, name);
                matches.push(user);
            }
        }

        match matches.len() {
            0 => Err(TokenBridgeError::BadCredentials(format!(
                "invalid credentials for {}",
                login
            ))),
            1 => Ok(matches.remove(0)),
            n => {
                warn!("{} is valid in {} identity providers", login, n);
                Err(TokenBridgeError::AmbiguousIdentity {
                    login: login.to_string(),
                })
            }
        }
    }

    fn deny(
        &self,
        login: &str,
        principal: Option<&UserPrincipal>,
        error: TokenBridgeError,
    ) -> TokenBridgeError {
        self.metrics.record_csr_denied();
        let actor = match principal {
            Some(p) => AuditActor::User {
                provider_id: p.provider_id.clone(),
                login: p.login.clone(),
            },
            None => AuditActor::Anonymous,
        };
        self.audit.record(
            AuditEvent::new(actor, "csr.sign", "DENIED")
                .with_subject(login)
                .with_detail("reason", error.to_string()),
        );
        error
    }

    /// Authenticate the requestor and sign their CSR, returning the DER
    /// certificate
    pub async fn handle_csr_request(
        &self,
        transport_is_secure: bool,
        basic_credentials: Option<(String, String)>,
        csr_bytes: &[u8],
    ) -> Result<Vec<u8>> {
        if !self.enabled {
            return Err(TokenBridgeError::ServiceUnavailable(
                "certificate signing is disabled".to_string(),
            ));
        }
        if !transport_is_secure {
            info!("Rejecting CSR request received over an insecure transport");
            return Err(self.deny("", None, TokenBridgeError::Forbidden("CSR requests must use SSL".to_string())));
        }
        let (login, password) = basic_credentials.ok_or_else(|| {
            TokenBridgeError::MissingCredentials("CSR requests require HTTP basic credentials".to_string())
        })?;

        let user = match self.authenticate(&login, &password).await {
            Ok(user) => user,
            Err(e) => return Err(self.deny(&login, None, e)),
        };
        let principal = user.principal;

        if !self.registry.user_can_generate_cert(&principal, None) {
            info!("{} is not entitled to another certificate", principal);
            return Err(self.deny(
                &login,
                Some(&principal),
                TokenBridgeError::QuotaExceeded {
                    login: login.clone(),
                },
            ));
        }

        let cert_der = self.signer.sign(csr_bytes, &principal.login, user.account_expires)?;

        let scope = AuditScope::system(self.audit.clone(), "csr.sign");
        if let Err(e) = self.registry.record_new_cert(&principal, None, &cert_der, &scope) {
            if matches!(e, TokenBridgeError::QuotaExceeded { .. }) {
                return Err(self.deny(&login, Some(&principal), e));
            }
            warn!("Certificate for {} was signed but could not be recorded: {}", principal, e);
            return Err(e);
        }

        self.metrics.record_csr_issued();
        info!("Issued client certificate to {}", principal);
        Ok(cert_der)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::config::{IdentityProviderConfig, UserConfig};
    use crate::csr::identity::{hash_password, InMemoryIdentityProvider};
    use crate::security::auth::certificates::verify_issued_by;
    use crate::security::auth::{ClientCertState, InMemoryClientCertStore};

    fn csr_for(cn: &str) -> Vec<u8> {
        let mut params = CertificateParams::new(vec![]);
        params.distinguished_name.push(DnType::CommonName, cn);
        let cert = RcgenCertificate::from_params(params).unwrap();
        cert.serialize_request_der().unwrap()
    }

    fn provider(id: &str) -> Arc<dyn IdentityProvider> {
        Arc::new(InMemoryIdentityProvider::from_config(&IdentityProviderConfig {
            id: id.to_string(),
            name: id.to_string(),
            users: vec![UserConfig {
                user_id: format!("{}-alice", id),
                login: "alice".to_string(),
                password_sha256: hash_password("pw"),
                account_expires: None,
            }],
        }))
    }

    fn service(
        providers: Vec<Arc<dyn IdentityProvider>>,
        store: Arc<InMemoryClientCertStore>,
    ) -> CsrSigningService {
        let registry = Arc::new(ClientCertificateRegistry::new(store).unwrap());
        CsrSigningService::new(
            true,
            providers,
            registry,
            CsrSigner::ephemeral("Test CA", 30).unwrap(),
            Arc::new(InMemoryAuditSink::new(100)),
            Arc::new(SecurityMetrics::new()),
        )
    }

    fn alice() -> Option<(String, String)> {
        Some(("alice".to_string(), "pw".to_string()))
    }

    #[tokio::test]
    async fn test_subject_is_authenticated_login() {
        let service = service(vec![provider("internal")], Arc::new(InMemoryClientCertStore::new()));
        let der = service.handle_csr_request(true, alice(), &csr_for("bob")).await.unwrap();

        let facts = CertificateFacts::from_der(&der).unwrap();
        assert_eq!(facts.subject_cn().as_deref(), Some("alice"));
        assert!(!facts.subject_dn.contains("bob"));
        verify_issued_by(&der, service.ca_certificate_der()).unwrap();

        let principal = UserPrincipal::new("internal", "internal-alice", "alice");
        assert_eq!(service.registry().state_of(&principal), ClientCertState::Issued);
    }

    #[tokio::test]
    async fn test_check_order() {
        let service = service(vec![provider("internal")], Arc::new(InMemoryClientCertStore::new()));

        assert!(matches!(
            service.handle_csr_request(false, None, b"junk").await,
            Err(TokenBridgeError::Forbidden(_))
        ));
        assert!(matches!(
            service.handle_csr_request(true, None, b"junk").await,
            Err(TokenBridgeError::MissingCredentials(_))
        ));
        assert!(matches!(
            service
                .handle_csr_request(true, Some(("alice".to_string(), "bad".to_string())), b"junk")
                .await,
            Err(TokenBridgeError::BadCredentials(_))
        ));
    }

    #[tokio::test]
    async fn test_ambiguous_identity() {
        let service = service(
            vec![provider("internal"), provider("ldap")],
            Arc::new(InMemoryClientCertStore::new()),
        );
        assert!(matches!(
            service.handle_csr_request(true, alice(), &csr_for("alice")).await,
            Err(TokenBridgeError::AmbiguousIdentity { .. })
        ));
    }

    #[tokio::test]
    async fn test_locked_user_is_refused() {
        let service = service(vec![provider("internal")], Arc::new(InMemoryClientCertStore::new()));
        service.handle_csr_request(true, alice(), &csr_for("alice")).await.unwrap();

        let principal = UserPrincipal::new("internal", "internal-alice", "alice");
        let scope = AuditScope::system(Arc::new(InMemoryAuditSink::new(10)), "test");
        service.registry().forbid_cert_reset(&principal, &scope).unwrap();

        assert!(matches!(
            service.handle_csr_request(true, alice(), &csr_for("alice")).await,
            Err(TokenBridgeError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_persistence_failure_returns_no_certificate() {
        let store = Arc::new(InMemoryClientCertStore::new());
        let service = service(vec![provider("internal")], store.clone());
        store.set_read_only(true);

        assert!(service.handle_csr_request(true, alice(), &csr_for("alice")).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_service() {
        let registry = Arc::new(ClientCertificateRegistry::new(Arc::new(InMemoryClientCertStore::new())).unwrap());
        let service = CsrSigningService::new(
            false,
            vec![provider("internal")],
            registry,
            CsrSigner::ephemeral("Test CA", 30).unwrap(),
            Arc::new(InMemoryAuditSink::new(10)),
            Arc::new(SecurityMetrics::new()),
        );
        assert!(matches!(
            service.handle_csr_request(true, alice(), &csr_for("alice")).await,
            Err(TokenBridgeError::ServiceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_pem_csr_is_accepted() {
        let service = service(vec![provider("internal")], Arc::new(InMemoryClientCertStore::new()));
        let pem = crate::security::auth::certificates::der_to_pem("CERTIFICATE REQUEST", &csr_for("x"));
        let der = service.handle_csr_request(true, alice(), pem.as_bytes()).await.unwrap();
        assert!(CertificateFacts::from_der(&der).is_ok());
    }

    #[test]
    fn test_validity_ends_at_account_expiry() {
        let signer = CsrSigner::ephemeral("Test CA", 365).unwrap();
        let now = Utc::now();

        let expiry = now + chrono::Duration::days(10);
        let der = signer.sign(&csr_for("alice"), "alice", Some(expiry)).unwrap();
        let facts = CertificateFacts::from_der(&der).unwrap();
        assert!(facts.not_after <= expiry);
        assert!(facts.not_after > now + chrono::Duration::days(9));

        let distant = now + chrono::Duration::days(2000);
        let der = signer.sign(&csr_for("alice"), "alice", Some(distant)).unwrap();
        let facts = CertificateFacts::from_der(&der).unwrap();
        assert!(facts.not_after <= now + chrono::Duration::days(366));
        assert!(facts.not_after > now + chrono::Duration::days(364));
    }
}
