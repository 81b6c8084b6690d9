use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub trust_store: TrustStoreConfig,
    pub expiry_check: ExpiryCheckConfig,
    pub token_exchange: TokenExchangeConfig,
    pub csr: CsrConfig,
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustStoreConfig {
    /// How long a lookup result may be served before the repository is consulted again
    pub cache_ttl_ms: u64,
}

impl Default for TrustStoreConfig {
    fn default() -> Self {
        Self { cache_ttl_ms: 5_000 }
    }
}

impl TrustStoreConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiryCheckConfig {
    pub enabled: bool,
    pub period_hours: u64,
    pub warning_days: u32,
    pub info_days: u32,
    pub fine_days: u32,
}

impl Default for ExpiryCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_hours: 12,
            warning_days: 7,
            info_days: 30,
            fine_days: 60,
        }
    }
}

impl ExpiryCheckConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_hours.saturating_mul(3600))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenExchangeConfig {
    /// Upper bound on a single STS or federation round trip
    pub request_timeout_ms: u64,
    /// Subtracted from a SAML token's NotOnOrAfter before caching it
    pub saml_expiry_margin_secs: i64,
    /// Cache lifetime for username tokens, which carry no expiry of their own
    pub username_token_max_age_secs: i64,
    /// Reroutes allowed per request after a deferred federation login
    pub max_reroutes: u32,
}

impl Default for TokenExchangeConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            saml_expiry_margin_secs: 30,
            username_token_max_age_secs: 300,
            max_reroutes: 1,
        }
    }
}

impl TokenExchangeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    /// Signing CA; an ephemeral CA is generated when unset
    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,
    pub ca_common_name: String,
    pub cert_validity_days: u32,
}

impl Default for CsrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:8443".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
            ca_cert_path: None,
            ca_key_path: None,
            ca_common_name: "TokenBridge Client CA".to_string(),
            cert_validity_days: 365,
        }
    }
}

impl CsrConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub providers: Vec<IdentityProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityProviderConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub user_id: String,
    pub login: String,
    /// Base64 of the SHA-256 digest of the password
    pub password_sha256: String,
    #[serde(default)]
    pub account_expires: Option<DateTime<Utc>>,
}

impl TrustStoreConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.cache_ttl_ms == 0 {
            return Err(crate::error::TokenBridgeError::InvalidConfig(
                "trust_store.cache_ttl_ms must be greater than 0".to_string(),
            ));
        }
        if self.cache_ttl_ms > 60_000 {
            return Err(crate::error::TokenBridgeError::InvalidConfig(
                "trust_store.cache_ttl_ms should not exceed 60000".to_string(),
            ));
        }
        Ok(())
    }
}

/// One year
const MAX_EXPIRY_PERIOD_HOURS: u64 = 24 * 366;

impl ExpiryCheckConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.period_hours == 0 {
            return Err(crate::error::TokenBridgeError::InvalidConfig(
                "expiry_check.period_hours must be greater than 0".to_string(),
            ));
        }
        if self.period_hours > MAX_EXPIRY_PERIOD_HOURS {
            return Err(crate::error::TokenBridgeError::InvalidConfig(format!(
                "expiry_check.period_hours should not exceed {}",
                MAX_EXPIRY_PERIOD_HOURS
            )));
        }
        if !(self.warning_days <= self.info_days && self.info_days <= self.fine_days) {
            return Err(crate::error::TokenBridgeError::InvalidConfig(
                "expiry_check thresholds must satisfy warning_days <= info_days <= fine_days"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

impl TokenExchangeConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(crate::error::TokenBridgeError::InvalidConfig(
                "token_exchange.request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.saml_expiry_margin_secs < 0 {
            return Err(crate::error::TokenBridgeError::InvalidConfig(
                "token_exchange.saml_expiry_margin_secs cannot be negative".to_string(),
            ));
        }
        if self.username_token_max_age_secs <= 0 {
            return Err(crate::error::TokenBridgeError::InvalidConfig(
                "token_exchange.username_token_max_age_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl CsrConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.cert_validity_days == 0 {
            return Err(crate::error::TokenBridgeError::InvalidConfig(
                "csr.cert_validity_days must be greater than 0".to_string(),
            ));
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(crate::error::TokenBridgeError::InvalidConfig(
                "csr.tls_cert_path and csr.tls_key_path must be set together".to_string(),
            ));
        }
        if self.ca_cert_path.is_some() != self.ca_key_path.is_some() {
            return Err(crate::error::TokenBridgeError::InvalidConfig(
                "csr.ca_cert_path and csr.ca_key_path must be set together".to_string(),
            ));
        }
        if self.ca_common_name.is_empty() {
            return Err(crate::error::TokenBridgeError::InvalidConfig(
                "csr.ca_common_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl IdentityConfig {
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(crate::error::TokenBridgeError::InvalidConfig(format!(
                    "identity provider id '{}' is declared twice",
                    provider.id
                )));
            }
        }
        Ok(())
    }
}

impl Config {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::error::TokenBridgeError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.trust_store.validate()?;
        self.expiry_check.validate()?;
        self.token_exchange.validate()?;
        self.csr.validate()?;
        self.identity.validate()?;
        Ok(())
    }
}
