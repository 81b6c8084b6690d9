mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokenbridge::admin::{CsrApi, CSR_CONTENT_TYPE};
use tokenbridge::audit::AuditSink;
use tokenbridge::policy::credentials::encode_basic_authorization;
use tokenbridge::policy::{CredentialSourceKind, LoginCredentials};
use tokenbridge::security::trust::RevocationCheckStep;
use tokenbridge::security::{
    CertificateAuthenticator, CertificateFacts, CertificateValidationType, ClientCertState,
    InMemoryTrustAnchorRepository, RevocationCheckPolicy, RevocationList, RevocationPolicyManager,
    TrustAnchorValidator, TrustFlag, TrustStore, TrustedCertificateRecord, UserPrincipal,
};
use tokenbridge::TokenBridgeError;
use warp::http::StatusCode;
use warp::test;

async fn post_csr(
    api: &CsrApi,
    authorization: Option<String>,
    body: Vec<u8>,
) -> warp::http::Response<bytes::Bytes> {
    let mut request = test::request().method("POST").path("/ssg/csr").body(body);
    if let Some(value) = authorization {
        request = request.header("authorization", value);
    }
    request.reply(&api.routes()).await
}

#[tokio::test]
async fn test_issued_certificate_names_the_authenticated_user() {
    let fixture = csr_fixture(true, vec![identity_provider("internal", &[("alice", "pw")])]);
    let api = CsrApi::new(fixture.service.clone(), fixture.metrics.clone(), true);

    let response = post_csr(&api, Some(encode_basic_authorization("alice", "pw")), csr_der("bob")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], CSR_CONTENT_TYPE);

    let facts = CertificateFacts::from_der(response.body()).unwrap();
    assert_eq!(facts.subject_cn().as_deref(), Some("alice"));
    assert!(!facts.subject_dn.contains("bob"));

    let principal = UserPrincipal::new("internal", "internal:alice", "alice");
    assert_eq!(fixture.registry.state_of(&principal), ClientCertState::Issued);
    assert_eq!(
        fixture.registry.find_user_cert(&principal).as_deref(),
        Some(response.body().as_ref())
    );
    assert_eq!(fixture.store.len(), 1);
    assert_eq!(fixture.metrics.snapshot().csr_issued_count, 1);
    assert_eq!(fixture.audit.events_for("client_cert.issue").len(), 1);
}

#[tokio::test]
async fn test_refusals_map_to_http_statuses() {
    let fixture = csr_fixture(
        true,
        vec![
            identity_provider("internal", &[("alice", "pw"), ("carol", "pw")]),
            identity_provider("ldap", &[("carol", "pw")]),
        ],
    );
    let api = CsrApi::new(fixture.service.clone(), fixture.metrics.clone(), true);

    let response = post_csr(&api, None, csr_der("alice")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()["www-authenticate"], "Basic realm=\"tokenbridge\"");

    let response = post_csr(&api, Some(encode_basic_authorization("alice", "wrong")), csr_der("alice")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = post_csr(&api, Some(encode_basic_authorization("carol", "pw")), csr_der("carol")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = post_csr(
        &api,
        Some(encode_basic_authorization("alice", "pw")),
        b"not a certificate request".to_vec(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let insecure = CsrApi::new(fixture.service.clone(), fixture.metrics.clone(), false);
    let response = post_csr(&insecure, Some(encode_basic_authorization("alice", "pw")), csr_der("alice")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    assert_eq!(fixture.store.len(), 0);
    assert_eq!(fixture.metrics.snapshot().csr_issued_count, 0);
    let denials = fixture.audit.events_for("csr.sign");
    assert!(denials.iter().all(|e| e.result == "DENIED"));
    assert!(denials.iter().any(|e| e.subject.as_deref() == Some("carol")));
}

#[tokio::test]
async fn test_disabled_service_is_unavailable() {
    let fixture = csr_fixture(false, vec![identity_provider("internal", &[("alice", "pw")])]);
    let api = CsrApi::new(fixture.service.clone(), fixture.metrics.clone(), true);

    let response = post_csr(&api, Some(encode_basic_authorization("alice", "pw")), csr_der("alice")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(fixture.store.is_empty());
}

#[tokio::test]
async fn test_read_only_store_issues_nothing() {
    let fixture = csr_fixture(true, vec![identity_provider("internal", &[("alice", "pw")])]);
    fixture.store.set_read_only(true);
    let api = CsrApi::new(fixture.service.clone(), fixture.metrics.clone(), true);

    let response = post_csr(&api, Some(encode_basic_authorization("alice", "pw")), csr_der("alice")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["error"], "Internal Server Error");

    let principal = UserPrincipal::new("internal", "internal:alice", "alice");
    assert_eq!(fixture.registry.state_of(&principal), ClientCertState::None);
}

struct Authentication {
    authenticator: CertificateAuthenticator,
    revocations: Arc<RevocationList>,
}

async fn authentication_for(fixture: &CsrFixture) -> Authentication {
    let store = Arc::new(TrustStore::new(
        Arc::new(InMemoryTrustAnchorRepository::new()),
        Duration::from_secs(60),
        fixture.metrics.clone(),
    ));
    let anchor = TrustedCertificateRecord::from_der(
        "Integration CA",
        fixture.service.ca_certificate_der(),
        [TrustFlag::SigningClientCerts],
    )
    .unwrap();
    store.save(anchor).await.unwrap();

    let policies = Arc::new(RevocationPolicyManager::new());
    policies.save(RevocationCheckPolicy::new("crl", vec![RevocationCheckStep::CrlFromCertificate]).as_default());
    let revocations = Arc::new(RevocationList::new());
    let validator = Arc::new(TrustAnchorValidator::new(store, policies, revocations.clone()));

    Authentication {
        authenticator: CertificateAuthenticator::new(
            validator,
            fixture.registry.clone(),
            fixture.audit.clone() as Arc<dyn AuditSink>,
            fixture.metrics.clone(),
        ),
        revocations,
    }
}

#[tokio::test]
async fn test_issued_certificate_authenticates_once_then_locks_regeneration() {
    let fixture = csr_fixture(true, vec![identity_provider("internal", &[("alice", "pw")])]);
    let api = CsrApi::new(fixture.service.clone(), fixture.metrics.clone(), true);
    let principal = UserPrincipal::new("internal", "internal:alice", "alice");

    let response = post_csr(&api, Some(encode_basic_authorization("alice", "pw")), csr_der("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let cert = response.body().to_vec();

    let auth = authentication_for(&fixture).await;
    let credentials = LoginCredentials::client_cert(cert.clone(), CredentialSourceKind::SslClientCert);
    let known_good = fixture.registry.find_user_cert(&principal);
    let result = auth
        .authenticator
        .authenticate(
            &credentials,
            known_good.as_deref(),
            &principal,
            CertificateValidationType::RevocationCheck,
            true,
        )
        .await
        .unwrap();
    assert_eq!(result.principal, principal);
    assert!(!result.cert_possibly_stale);

    // First use forbids regeneration
    assert_eq!(fixture.registry.state_of(&principal), ClientCertState::Locked);
    let response = post_csr(&api, Some(encode_basic_authorization("alice", "pw")), csr_der("alice")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(fixture.registry.find_user_cert(&principal), Some(cert.clone()));

    // Revoked certificates no longer authenticate
    let facts = CertificateFacts::from_der(&cert).unwrap();
    auth.revocations.revoke(&facts.issuer_dn, &facts.serial_number, "keyCompromise");
    let denied = auth
        .authenticator
        .authenticate(
            &credentials,
            Some(&cert),
            &principal,
            CertificateValidationType::RevocationCheck,
            true,
        )
        .await;
    assert!(matches!(denied, Err(TokenBridgeError::InvalidCertificate { .. })));
    assert_eq!(fixture.metrics.snapshot().auth_failure_count, 1);
}

#[tokio::test]
async fn test_presented_certificate_must_match_record() {
    let fixture = csr_fixture(true, vec![identity_provider("internal", &[("alice", "pw"), ("dave", "pw")])]);
    let api = CsrApi::new(fixture.service.clone(), fixture.metrics.clone(), true);

    let alice = post_csr(&api, Some(encode_basic_authorization("alice", "pw")), csr_der("alice")).await;
    let dave = post_csr(&api, Some(encode_basic_authorization("dave", "pw")), csr_der("dave")).await;
    assert_eq!(alice.status(), StatusCode::OK);
    assert_eq!(dave.status(), StatusCode::OK);

    let auth = authentication_for(&fixture).await;
    let principal = UserPrincipal::new("internal", "internal:alice", "alice");
    let credentials = LoginCredentials::client_cert(dave.body().to_vec(), CredentialSourceKind::SslClientCert);
    let result = auth
        .authenticator
        .authenticate(
            &credentials,
            Some(alice.body().as_ref()),
            &principal,
            CertificateValidationType::PathValidation,
            true,
        )
        .await;
    assert!(matches!(result, Err(TokenBridgeError::InvalidCertificate { .. })));
    assert_eq!(fixture.registry.state_of(&principal), ClientCertState::Issued);
}
