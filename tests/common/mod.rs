//! Shared fixtures for integration tests: SAML documents, STS responses and
//! gateway components wired with in-memory collaborators.

#![allow(dead_code)]

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::sync::Arc;
use tokenbridge::audit::{AuditSink, InMemoryAuditSink};
use tokenbridge::config::{IdentityProviderConfig, TokenExchangeConfig, UserConfig};
use tokenbridge::csr::{hash_password, CsrSigner, CsrSigningService, IdentityProvider, InMemoryIdentityProvider};
use tokenbridge::exchange::TokenExchangeEngine;
use tokenbridge::security::{ClientCertificateRegistry, InMemoryClientCertStore, SecurityMetrics};

pub const WST_NS: &str = "http://schemas.xmlsoap.org/ws/2005/02/trust";

pub fn saml2_assertion(id: &str, subject: &str, not_on_or_after: DateTime<Utc>) -> String {
    let not_before = Utc::now() - Duration::minutes(1);
    format!(
        r#"<saml2:Assertion xmlns:saml2="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" IssueInstant="{nb}"><saml2:Issuer>sts.example.com</saml2:Issuer><saml2:Subject><saml2:NameID>{subject}</saml2:NameID></saml2:Subject><saml2:Conditions NotBefore="{nb}" NotOnOrAfter="{noa}"/></saml2:Assertion>"#,
        id = id,
        subject = subject,
        nb = not_before.to_rfc3339_opts(SecondsFormat::Secs, true),
        noa = not_on_or_after.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

pub fn rstr_envelope(token_xml: &str) -> String {
    format!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><wst:RequestSecurityTokenResponse xmlns:wst="{ns}"><wst:RequestedSecurityToken>{token}</wst:RequestedSecurityToken></wst:RequestSecurityTokenResponse></soap:Body></soap:Envelope>"#,
        ns = WST_NS,
        token = token_xml
    )
}

pub fn soap_fault(reason: &str) -> String {
    format!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><soap:Fault><faultcode>soap:Server</faultcode><faultstring>{}</faultstring></soap:Fault></soap:Body></soap:Envelope>"#,
        reason
    )
}

/// The HTML auto-post form an IP-STS returns, carrying `rstr` in `wresult`
pub fn signin_form(action: &str, rstr: &str) -> String {
    let escaped = rstr
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;");
    format!(
        r#"<html><body onload="document.forms[0].submit()"><form method="POST" action="{action}"><input type="hidden" name="wa" value="wsignin1.0" /><input type="hidden" name="wresult" value="{escaped}" /><noscript><input type="submit" value="Continue" /></noscript></form></body></html>"#,
        action = action,
        escaped = escaped
    )
}

pub fn engine(metrics: Arc<SecurityMetrics>) -> TokenExchangeEngine {
    let config = TokenExchangeConfig {
        request_timeout_ms: 5_000,
        ..TokenExchangeConfig::default()
    };
    TokenExchangeEngine::new(config, metrics).expect("engine")
}

pub fn identity_provider(id: &str, users: &[(&str, &str)]) -> Arc<dyn IdentityProvider> {
    Arc::new(InMemoryIdentityProvider::from_config(&IdentityProviderConfig {
        id: id.to_string(),
        name: format!("{} provider", id),
        users: users
            .iter()
            .map(|(login, password)| UserConfig {
                user_id: format!("{}:{}", id, login),
                login: login.to_string(),
                password_sha256: hash_password(password),
                account_expires: None,
            })
            .collect(),
    }))
}

pub struct CsrFixture {
    pub service: Arc<CsrSigningService>,
    pub registry: Arc<ClientCertificateRegistry>,
    pub store: Arc<InMemoryClientCertStore>,
    pub audit: Arc<InMemoryAuditSink>,
    pub metrics: Arc<SecurityMetrics>,
}

pub fn csr_fixture(enabled: bool, providers: Vec<Arc<dyn IdentityProvider>>) -> CsrFixture {
    let store = Arc::new(InMemoryClientCertStore::new());
    let registry = Arc::new(ClientCertificateRegistry::new(store.clone()).expect("registry"));
    let audit = Arc::new(InMemoryAuditSink::new(1_000));
    let metrics = Arc::new(SecurityMetrics::new());
    let service = Arc::new(CsrSigningService::new(
        enabled,
        providers,
        registry.clone(),
        CsrSigner::ephemeral("Integration CA", 90).expect("signer"),
        audit.clone() as Arc<dyn AuditSink>,
        metrics.clone(),
    ));
    CsrFixture {
        service,
        registry,
        store,
        audit,
        metrics,
    }
}

pub fn csr_der(common_name: &str) -> Vec<u8> {
    let mut params = rcgen::CertificateParams::new(vec![]);
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    rcgen::Certificate::from_params(params)
        .expect("key")
        .serialize_request_der()
        .expect("csr")
}
