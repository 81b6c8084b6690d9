//! Client Certificate Authentication Module
//!
//! Certificate fact extraction, the authenticator that checks a presented
//! certificate against the one on record for a user, and the registry that
//! tracks issued client certificates.

pub mod authentication;
pub mod certificates;
pub mod registry;

pub use authentication::{AuthenticationResult, CertificateAuthenticator};
pub use certificates::CertificateFacts;
pub use registry::{
    ClientCertEntry, ClientCertState, ClientCertStore, ClientCertificateRegistry,
    InMemoryClientCertStore, MAX_RESET_COUNT,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// A user as known to a particular identity provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserPrincipal {
    pub provider_id: String,
    pub user_id: String,
    pub login: String,
}

impl UserPrincipal {
    pub fn new(
        provider_id: impl Into<String>,
        user_id: impl Into<String>,
        login: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            user_id: user_id.into(),
            login: login.into(),
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.provider_id.clone(), self.user_id.clone())
    }
}

impl fmt::Display for UserPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.login, self.provider_id)
    }
}
