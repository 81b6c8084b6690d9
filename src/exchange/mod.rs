pub mod engine;
pub mod wsfed;
pub mod wstrust;

pub use engine::{
    cache_key, decorate_request, ExchangeOutcome, ExchangeState, TokenExchangeEngine,
    WsFederationExchange, WsTrustExchange,
};
pub use wsfed::{FederationResponse, WsFedClient};
pub use wstrust::{RequestSecurityToken, StsClient, StsResponse, WsTrustRequestType};
