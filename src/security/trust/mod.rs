//! Trust anchors, revocation policies and certificate path validation.

pub mod expiry;
pub mod revocation;
pub mod store;
pub mod validation;

pub use expiry::{CertificateExpiryChecker, ExpiryFinding, ExpirySeverity};
pub use revocation::{
    RevocationCheckPolicy, RevocationCheckStep, RevocationChecker, RevocationList,
    RevocationPolicyManager, RevocationStatus,
};
pub use store::{
    InMemoryTrustAnchorRepository, RevocationPolicyRef, TrustAnchorRepository, TrustFlag,
    TrustStore, TrustedCertificateRecord,
};
pub use validation::{CertificatePathValidator, CertificateValidationType, TrustAnchorValidator};
