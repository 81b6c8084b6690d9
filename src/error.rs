use thiserror::Error;

pub type Result<T> = std::result::Result<T, TokenBridgeError>;

#[derive(Error, Debug)]
pub enum TokenBridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No credentials presented: {0}")]
    MissingCredentials(String),

    #[error("Bad credentials: {0}")]
    BadCredentials(String),

    #[error("Invalid certificate: {reason}")]
    InvalidCertificate { reason: String },

    #[error("Authentication required: {0}")]
    AuthRequired(String),

    #[error("Certificate quota exceeded for {login}")]
    QuotaExceeded { login: String },

    #[error("Credentials for {login} are valid in more than one identity provider")]
    AmbiguousIdentity { login: String },

    #[error("Transport failure talking to {endpoint}: {reason}")]
    TransportFailure { endpoint: String, reason: String },

    #[error("Protocol violation from {endpoint}: {reason}")]
    ProtocolViolation { endpoint: String, reason: String },

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Certificate generation failed: {reason}")]
    CertificateGeneration { reason: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Operation timeout")]
    Timeout,
}

impl TokenBridgeError {
    /// HTTP status code used when this error is surfaced by an HTTP endpoint.
    pub fn http_status(&self) -> u16 {
        match self {
            TokenBridgeError::MissingCredentials(_)
            | TokenBridgeError::BadCredentials(_)
            | TokenBridgeError::AuthRequired(_) => 401,
            TokenBridgeError::InvalidCertificate { .. }
            | TokenBridgeError::QuotaExceeded { .. }
            | TokenBridgeError::Forbidden(_) => 403,
            TokenBridgeError::AmbiguousIdentity { .. } | TokenBridgeError::Conflict(_) => 409,
            TokenBridgeError::NotFound(_) => 404,
            TokenBridgeError::ServiceUnavailable(_) => 503,
            TokenBridgeError::TransportFailure { .. }
            | TokenBridgeError::ProtocolViolation { .. }
            | TokenBridgeError::Timeout => 502,
            TokenBridgeError::Io(_)
            | TokenBridgeError::Config(_)
            | TokenBridgeError::InvalidConfig(_)
            | TokenBridgeError::Xml(_)
            | TokenBridgeError::Storage(_)
            | TokenBridgeError::CertificateGeneration { .. } => 500,
        }
    }

    /// Errors caused by what the client presented, as opposed to gateway faults.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }
}

impl From<rcgen::RcgenError> for TokenBridgeError {
    fn from(e: rcgen::RcgenError) -> Self {
        TokenBridgeError::CertificateGeneration {
            reason: e.to_string(),
        }
    }
}

impl From<quick_xml::Error> for TokenBridgeError {
    fn from(e: quick_xml::Error) -> Self {
        TokenBridgeError::Xml(e.to_string())
    }
}
