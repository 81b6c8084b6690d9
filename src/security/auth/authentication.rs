//! Certificate Authenticator
//!
//! Authenticates a user by the X.509 certificate presented with the request:
//! the certificate must be byte-identical to the known-good certificate on
//! record and must pass the configured path/revocation validation. Successful
//! authentication with a gateway-issued certificate locks that certificate
//! against further regeneration.

use super::registry::ClientCertificateRegistry;
use super::UserPrincipal;
use crate::audit::{AuditActor, AuditEvent, AuditScope, AuditSink};
use crate::error::{Result, TokenBridgeError};
use crate::policy::credentials::LoginCredentials;
use crate::security::auth::certificates::certificates_match;
use crate::security::metrics::SecurityMetrics;
use crate::security::trust::validation::{CertificatePathValidator, CertificateValidationType};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AuthenticationResult {
    pub principal: UserPrincipal,
    pub certificate: Vec<u8>,
    /// Signed by a CA key that has since been rotated
    pub cert_possibly_stale: bool,
    pub authenticated_at: DateTime<Utc>,
}

pub struct CertificateAuthenticator {
    validator: Arc<dyn CertificatePathValidator>,
    registry: Arc<ClientCertificateRegistry>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<SecurityMetrics>,
}

impl CertificateAuthenticator {
    pub fn new(
        validator: Arc<dyn CertificatePathValidator>,
        registry: Arc<ClientCertificateRegistry>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<SecurityMetrics>,
    ) -> Self {
        Self {
            validator,
            registry,
            audit,
            metrics,
        }
    }

    pub async fn authenticate(
        &self,
        credentials: &LoginCredentials,
        known_good: Option<&[u8]>,
        principal: &UserPrincipal,
        validation_type: CertificateValidationType,
        is_internal_cert: bool,
    ) -> Result<AuthenticationResult> {
        let start_time = Instant::now();
        let result = self
            .authenticate_internal(credentials, known_good, principal, validation_type, is_internal_cert)
            .await;

        let actor = AuditActor::User {
            provider_id: principal.provider_id.clone(),
            login: principal.login.clone(),
        };
        match &result {
            Ok(_) => {
                self.metrics.record_authentication_success(start_time.elapsed());
                self.audit.record(
                    AuditEvent::new(actor, "auth.client_cert", "SUCCESS")
                        .with_subject(principal.login.clone()),
                );
            }
            Err(e) => {
                self.metrics.record_authentication_failure(&e.to_string());
                self.audit.record(
                    AuditEvent::new(actor, "auth.client_cert", "FAILURE")
                        .with_subject(principal.login.clone())
                        .with_detail("reason", e.to_string()),
                );
            }
        }
        result
    }

    async fn authenticate_internal(
        &self,
        credentials: &LoginCredentials,
        known_good: Option<&[u8]>,
        principal: &UserPrincipal,
        validation_type: CertificateValidationType,
        is_internal_cert: bool,
    ) -> Result<AuthenticationResult> {
        let presented = credentials.client_certificate().ok_or_else(|| {
            TokenBridgeError::MissingCredentials(format!(
                "no client certificate presented for {}",
                principal.login
            ))
        })?;

        let known_good = known_good.ok_or_else(|| {
            info!("No certificate on record for {}", principal);
            TokenBridgeError::InvalidCertificate {
                reason: format!("no certificate on record for {}", principal.login),
            }
        })?;

        if !certificates_match(presented, known_good) {
            info!("Presented certificate does not match the one on record for {}", principal);
            return Err(TokenBridgeError::InvalidCertificate {
                reason: "certificate does not match".to_string(),
            });
        }

        self.validator
            .validate(presented, validation_type)
            .await
            .map_err(|e| TokenBridgeError::InvalidCertificate {
                reason: format!("certificate validation failed: {}", e),
            })?;

        let mut cert_possibly_stale = false;
        if is_internal_cert {
            cert_possibly_stale = self.registry.is_cert_possibly_stale(presented);
            let scope = AuditScope::system(self.audit.clone(), "client cert first use");
            self.registry.forbid_cert_reset(principal, &scope)?;
        }

        debug!(
            "Authenticated {} by client certificate (possibly stale: {})",
            principal, cert_possibly_stale
        );

        Ok(AuthenticationResult {
            principal: principal.clone(),
            certificate: presented.to_vec(),
            cert_possibly_stale,
            authenticated_at: credentials.authenticated_at(),
        })
    }
}
