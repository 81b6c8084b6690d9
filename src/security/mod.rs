//! TokenBridge Security Module
//!
//! Client-certificate authentication and the trust material it depends on.
//!
//! ## Key Components
//!
//! - **Authentication**: known-good certificate comparison with path and revocation validation
//! - **Client certificate registry**: per-user issued certificate and reset-counter quota
//! - **Trust store**: TTL-bounded read-through cache of trust anchors
//! - **Expiry checker**: periodic sweep warning about anchors close to expiry
//! - **Revocation policies**: CRL/OCSP step lists with a single default policy

pub mod auth;
pub mod metrics;
pub mod trust;

pub use auth::{
    AuthenticationResult, CertificateAuthenticator, CertificateFacts, ClientCertEntry,
    ClientCertState, ClientCertStore, ClientCertificateRegistry, InMemoryClientCertStore,
    UserPrincipal,
};
pub use metrics::{SecurityMetrics, SecurityMetricsSnapshot};
pub use trust::{
    CertificateExpiryChecker, CertificatePathValidator, CertificateValidationType,
    InMemoryTrustAnchorRepository, RevocationCheckPolicy, RevocationCheckStep,
    RevocationChecker, RevocationList, RevocationPolicyManager, RevocationPolicyRef,
    TrustAnchorRepository, TrustAnchorValidator, TrustFlag, TrustStore,
    TrustedCertificateRecord,
};
