pub mod admin;
pub mod audit;
pub mod config;
pub mod csr;
pub mod error;
pub mod exchange;
pub mod policy;
pub mod security;
pub mod token;
pub mod xml;

pub use config::Config;
pub use error::{Result, TokenBridgeError};
