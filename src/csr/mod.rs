//! Client certificate issuance: users authenticate with a login and password
//! and receive a certificate for the key in their CSR.

pub mod identity;
pub mod service;

pub use identity::{hash_password, AuthenticatedUser, IdentityProvider, InMemoryIdentityProvider};
pub use service::{CsrSigner, CsrSigningService};
