//! Policy evaluation plumbing consumed by the token exchange engine:
//! the request message, per-request token cache, credentials and routing hooks.

pub mod cache;
pub mod context;
pub mod credentials;
pub mod message;
pub mod xpath;

pub use cache::{CachedValue, PolicyContextCache};
pub use context::{PolicyContext, RouteDecision, Router, RoutingEvent, RoutingListener};
pub use credentials::{
    Challenge, CredentialPayload, CredentialSource, CredentialSourceKind, HttpBasicSource,
    LoginCredentials, SamlTokenSource, SslClientCertSource, WssUsernameTokenSource,
    XPathCredentialSource,
};
pub use message::{HttpCookie, Message, SecurityHeader, SecurityHeaderElement, TransportInfo};
