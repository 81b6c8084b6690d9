//! Login credentials and the sources that extract them from a request.

use super::message::Message;
use super::xpath::ElementPath;
use crate::error::{Result, TokenBridgeError};
use crate::security::auth::certificates::CertificateFacts;
use crate::token::{SamlAssertion, SecurityToken, UsernameToken};

use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// Where a set of credentials came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CredentialSourceKind {
    HttpBasic,
    SslClientCert,
    WssUsernameToken,
    SamlToken,
    XPath,
    /// Derived from a token obtained by a token exchange
    TokenExchange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialPayload {
    Cleartext { login: String, password: String },
    ClientCert(Vec<u8>),
    SamlToken(SamlAssertion),
    UsernameToken(UsernameToken),
}

/// Immutable credentials presented by (or derived for) a requestor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginCredentials {
    payload: CredentialPayload,
    source: CredentialSourceKind,
    authenticated_at: DateTime<Utc>,
}

impl LoginCredentials {
    fn new(payload: CredentialPayload, source: CredentialSourceKind) -> Self {
        Self {
            payload,
            source,
            authenticated_at: Utc::now(),
        }
    }

    pub fn cleartext(
        login: impl Into<String>,
        password: impl Into<String>,
        source: CredentialSourceKind,
    ) -> Self {
        Self::new(
            CredentialPayload::Cleartext {
                login: login.into(),
                password: password.into(),
            },
            source,
        )
    }

    pub fn client_cert(der: Vec<u8>, source: CredentialSourceKind) -> Self {
        Self::new(CredentialPayload::ClientCert(der), source)
    }

    pub fn saml(assertion: SamlAssertion, source: CredentialSourceKind) -> Self {
        Self::new(CredentialPayload::SamlToken(assertion), source)
    }

    pub fn username_token(token: UsernameToken, source: CredentialSourceKind) -> Self {
        Self::new(CredentialPayload::UsernameToken(token), source)
    }

    pub fn from_token(token: &SecurityToken, source: CredentialSourceKind) -> Self {
        match token {
            SecurityToken::Saml(a) => Self::saml(a.clone(), source),
            SecurityToken::Username(u) => Self::username_token(u.clone(), source),
        }
    }

    pub fn payload(&self) -> &CredentialPayload {
        &self.payload
    }

    pub fn source(&self) -> CredentialSourceKind {
        self.source
    }

    pub fn authenticated_at(&self) -> DateTime<Utc> {
        self.authenticated_at
    }

    /// Login name the credentials claim, if they carry one
    pub fn login(&self) -> Option<String> {
        match &self.payload {
            CredentialPayload::Cleartext { login, .. } => Some(login.clone()),
            CredentialPayload::ClientCert(der) => CertificateFacts::from_der(der)
                .ok()
                .and_then(|facts| facts.subject_cn()),
            CredentialPayload::SamlToken(a) => a.name_id.clone(),
            CredentialPayload::UsernameToken(u) => Some(u.username.clone()),
        }
    }

    pub fn password(&self) -> Option<&str> {
        match &self.payload {
            CredentialPayload::Cleartext { password, .. } => Some(password.as_str()),
            CredentialPayload::UsernameToken(u) => u.password.as_deref(),
            _ => None,
        }
    }

    /// The X.509 certificate proving possession: a direct client certificate
    /// or the holder-of-key certificate of a SAML assertion
    pub fn client_certificate(&self) -> Option<&[u8]> {
        match &self.payload {
            CredentialPayload::ClientCert(der) => Some(der.as_slice()),
            CredentialPayload::SamlToken(a) => a.subject_certificate.as_deref(),
            _ => None,
        }
    }

    /// The security token these credentials were extracted from, if any
    pub fn security_token(&self) -> Option<SecurityToken> {
        match &self.payload {
            CredentialPayload::SamlToken(a) => Some(SecurityToken::Saml(a.clone())),
            CredentialPayload::UsernameToken(u) => Some(SecurityToken::Username(u.clone())),
            _ => None,
        }
    }
}

/// What a source asks the client for when no credentials were found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    HttpBasic { realm: String },
    ClientCertificate,
    WsSecurity,
}

impl Challenge {
    pub fn www_authenticate(&self) -> Option<String> {
        match self {
            Challenge::HttpBasic { realm } => Some(format!("Basic realm=\"{}\"", realm)),
            _ => None,
        }
    }
}

/// Extracts credentials of one format from an inbound message.
///
/// `Ok(None)` means this source found nothing; `Err` means something was
/// present but unusable.
pub trait CredentialSource: Send + Sync {
    fn kind(&self) -> CredentialSourceKind;

    fn extract(&self, message: &Message) -> Result<Option<LoginCredentials>>;

    fn challenge(&self) -> Option<Challenge> {
        None
    }
}

/// Run each source in order and return the first credentials found
pub fn extract_first(
    sources: &[Box<dyn CredentialSource>],
    message: &Message,
) -> Result<Option<LoginCredentials>> {
    for source in sources {
        if let Some(credentials) = source.extract(message)? {
            debug!("Credentials found by {:?}", source.kind());
            return Ok(Some(credentials));
        }
    }
    Ok(None)
}

/// Decode an `Authorization: Basic` header value into login and password
pub fn decode_basic_authorization(value: &str) -> Result<(String, String)> {
    let encoded = basic_credentials(value)
        .ok_or_else(|| TokenBridgeError::BadCredentials("not a Basic authorization".to_string()))?;

    let decoded = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| TokenBridgeError::BadCredentials("malformed Basic credentials".to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| TokenBridgeError::BadCredentials("Basic credentials are not UTF-8".to_string()))?;

    let (login, password) = decoded
        .split_once(':')
        .ok_or_else(|| TokenBridgeError::BadCredentials("Basic credentials lack a password".to_string()))?;
    Ok((login.to_string(), password.to_string()))
}

/// The credentials part of an `Authorization` value whose scheme is Basic, in any letter case
fn basic_credentials(value: &str) -> Option<&str> {
    let (scheme, credentials) = value.trim().split_once(char::is_whitespace)?;
    scheme.eq_ignore_ascii_case("basic").then_some(credentials)
}

pub fn encode_basic_authorization(login: &str, password: &str) -> String {
    format!(
        "Basic {}",
        general_purpose::STANDARD.encode(format!("{}:{}", login, password))
    )
}

pub struct HttpBasicSource {
    realm: String,
}

impl HttpBasicSource {
    pub fn new(realm: impl Into<String>) -> Self {
        Self { realm: realm.into() }
    }
}

impl CredentialSource for HttpBasicSource {
    fn kind(&self) -> CredentialSourceKind {
        CredentialSourceKind::HttpBasic
    }

    fn extract(&self, message: &Message) -> Result<Option<LoginCredentials>> {
        let header = match message.header("Authorization") {
            Some(header) if basic_credentials(header).is_some() => header,
            _ => return Ok(None),
        };
        let (login, password) = decode_basic_authorization(header)?;
        Ok(Some(LoginCredentials::cleartext(login, password, self.kind())))
    }

    fn challenge(&self) -> Option<Challenge> {
        Some(Challenge::HttpBasic {
            realm: self.realm.clone(),
        })
    }
}

#[derive(Default)]
pub struct SslClientCertSource;

impl CredentialSource for SslClientCertSource {
    fn kind(&self) -> CredentialSourceKind {
        CredentialSourceKind::SslClientCert
    }

    fn extract(&self, message: &Message) -> Result<Option<LoginCredentials>> {
        let transport = message.transport();
        match (&transport.client_certificate, transport.secure) {
            (Some(der), true) => Ok(Some(LoginCredentials::client_cert(der.clone(), self.kind()))),
            _ => Ok(None),
        }
    }

    fn challenge(&self) -> Option<Challenge> {
        Some(Challenge::ClientCertificate)
    }
}

#[derive(Default)]
pub struct WssUsernameTokenSource;

impl CredentialSource for WssUsernameTokenSource {
    fn kind(&self) -> CredentialSourceKind {
        CredentialSourceKind::WssUsernameToken
    }

    fn extract(&self, message: &Message) -> Result<Option<LoginCredentials>> {
        let element = message
            .security_header()
            .and_then(|h| h.elements().iter().find(|e| e.local_name == "UsernameToken"));
        match element {
            Some(element) => Ok(UsernameToken::find_in(&element.xml)?
                .map(|token| LoginCredentials::username_token(token, self.kind()))),
            None => Ok(None),
        }
    }

    fn challenge(&self) -> Option<Challenge> {
        Some(Challenge::WsSecurity)
    }
}

#[derive(Default)]
pub struct SamlTokenSource;

impl CredentialSource for SamlTokenSource {
    fn kind(&self) -> CredentialSourceKind {
        CredentialSourceKind::SamlToken
    }

    fn extract(&self, message: &Message) -> Result<Option<LoginCredentials>> {
        let element = message
            .security_header()
            .and_then(|h| h.elements().iter().find(|e| e.local_name == "Assertion"));
        match element {
            Some(element) => {
                let assertion = SamlAssertion::parse(&element.xml)?;
                Ok(Some(LoginCredentials::saml(assertion, self.kind())))
            }
            None => Ok(None),
        }
    }

    fn challenge(&self) -> Option<Challenge> {
        Some(Challenge::WsSecurity)
    }
}

/// Login and password taken from elements of the request envelope
pub struct XPathCredentialSource {
    login_path: ElementPath,
    password_path: ElementPath,
}

impl XPathCredentialSource {
    pub fn new(login_expression: &str, password_expression: &str) -> Result<Self> {
        Ok(Self {
            login_path: ElementPath::parse(login_expression)?,
            password_path: ElementPath::parse(password_expression)?,
        })
    }
}

impl CredentialSource for XPathCredentialSource {
    fn kind(&self) -> CredentialSourceKind {
        CredentialSourceKind::XPath
    }

    fn extract(&self, message: &Message) -> Result<Option<LoginCredentials>> {
        let document = message.render_soap()?;
        let login = match self.login_path.select_text(&document)? {
            Some(login) if !login.trim().is_empty() => login.trim().to_string(),
            _ => return Ok(None),
        };
        let password = self
            .password_path
            .select_text(&document)?
            .ok_or_else(|| TokenBridgeError::BadCredentials(format!("no password found for {}", login)))?;
        Ok(Some(LoginCredentials::cleartext(login, password, self.kind())))
    }
}
