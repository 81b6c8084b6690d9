//! Security tokens carried in WS-Security headers.

pub mod saml;

pub use saml::{SamlAssertion, SamlVersion};

use crate::error::{Result, TokenBridgeError};
use crate::xml;

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::Event;
use serde::Serialize;

pub const TOKEN_TYPE_SAML11: &str =
    "http://docs.oasis-open.org/wss/oasis-wss-saml-token-profile-1.1#SAMLV1.1";
pub const TOKEN_TYPE_SAML20: &str =
    "http://docs.oasis-open.org/wss/oasis-wss-saml-token-profile-1.1#SAMLV2.0";
pub const TOKEN_TYPE_USERNAME: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#UsernameToken";
const PASSWORD_TEXT: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SecurityTokenType {
    Saml11,
    Saml20,
    Username,
}

impl SecurityTokenType {
    pub fn uri(&self) -> &'static str {
        match self {
            SecurityTokenType::Saml11 => TOKEN_TYPE_SAML11,
            SecurityTokenType::Saml20 => TOKEN_TYPE_SAML20,
            SecurityTokenType::Username => TOKEN_TYPE_USERNAME,
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            TOKEN_TYPE_SAML11 => Some(SecurityTokenType::Saml11),
            TOKEN_TYPE_SAML20 => Some(SecurityTokenType::Saml20),
            TOKEN_TYPE_USERNAME => Some(SecurityTokenType::Username),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernameToken {
    pub username: String,
    pub password: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

impl UsernameToken {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
            created: Some(Utc::now()),
        }
    }

    pub fn to_xml(&self) -> String {
        let mut out = format!(
            r#"<wsse:UsernameToken xmlns:wsse="{}" xmlns:wsu="{}"><wsse:Username>{}</wsse:Username>"#,
            xml::NS_WSSE,
            xml::NS_WSU,
            xml::escape(&self.username)
        );
        if let Some(password) = &self.password {
            out.push_str(&format!(
                r#"<wsse:Password Type="{}">{}</wsse:Password>"#,
                PASSWORD_TEXT,
                xml::escape(password)
            ));
        }
        if let Some(created) = &self.created {
            out.push_str(&format!(
                "<wsu:Created>{}</wsu:Created>",
                created.to_rfc3339_opts(SecondsFormat::Millis, true)
            ));
        }
        out.push_str("</wsse:UsernameToken>");
        out
    }

    /// Locate and parse the first `UsernameToken` element in `document`
    pub fn find_in(document: &str) -> Result<Option<Self>> {
        let mut reader = xml::reader(document);
        let mut inside = false;
        let mut current = String::new();
        let mut token: Option<UsernameToken> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = xml::local_name(&e);
                    if name == "UsernameToken" && token.is_none() {
                        inside = true;
                        token = Some(UsernameToken {
                            username: String::new(),
                            password: None,
                            created: None,
                        });
                    }
                    current = name;
                }
                Event::Text(t) if inside => {
                    let text = t.unescape()?.trim().to_string();
                    if let Some(token) = token.as_mut() {
                        match current.as_str() {
                            "Username" => token.username = text,
                            "Password" => token.password = Some(text),
                            "Created" => {
                                token.created = Some(
                                    DateTime::parse_from_rfc3339(&text)
                                        .map(|t| t.with_timezone(&Utc))
                                        .map_err(|e| {
                                            TokenBridgeError::Xml(format!("bad Created timestamp: {}", e))
                                        })?,
                                );
                            }
                            _ => {}
                        }
                    }
                }
                Event::End(e) if inside && e.local_name().as_ref() == b"UsernameToken" => break,
                Event::Eof => break,
                _ => {}
            }
        }

        match token {
            Some(token) if token.username.is_empty() => Err(TokenBridgeError::Xml(
                "UsernameToken has no Username".to_string(),
            )),
            other => Ok(other),
        }
    }
}

/// A token the gateway can present downstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityToken {
    Saml(SamlAssertion),
    Username(UsernameToken),
}

impl SecurityToken {
    pub fn token_type(&self) -> SecurityTokenType {
        match self {
            SecurityToken::Saml(a) => match a.version {
                SamlVersion::V1_1 => SecurityTokenType::Saml11,
                SamlVersion::V2_0 => SecurityTokenType::Saml20,
            },
            SecurityToken::Username(_) => SecurityTokenType::Username,
        }
    }

    pub fn to_xml(&self) -> String {
        match self {
            SecurityToken::Saml(a) => a.xml.clone(),
            SecurityToken::Username(u) => u.to_xml(),
        }
    }

    /// Name of the subject the token speaks for
    pub fn subject(&self) -> Option<&str> {
        match self {
            SecurityToken::Saml(a) => a.name_id.as_deref(),
            SecurityToken::Username(u) => Some(u.username.as_str()),
        }
    }

    /// Parse the first SAML assertion or username token found in `document`
    pub fn find_in(document: &str) -> Result<Option<Self>> {
        if let Some(assertion) = SamlAssertion::find_in(document)? {
            return Ok(Some(SecurityToken::Saml(assertion)));
        }
        Ok(UsernameToken::find_in(document)?.map(SecurityToken::Username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_token_xml_is_parseable() {
        let token = UsernameToken::new("alice", Some("s3cr<et".to_string()));
        let xml = token.to_xml();
        assert!(xml.contains("s3cr&lt;et"));

        let parsed = UsernameToken::find_in(&xml).unwrap().unwrap();
        assert_eq!(parsed.username, "alice");
        assert_eq!(parsed.password.as_deref(), Some("s3cr<et"));
        assert!(parsed.created.is_some());
    }

    #[test]
    fn test_token_type_uris() {
        for t in [SecurityTokenType::Saml11, SecurityTokenType::Saml20, SecurityTokenType::Username] {
            assert_eq!(SecurityTokenType::from_uri(t.uri()), Some(t));
        }
        assert_eq!(SecurityTokenType::from_uri("urn:other"), None);
    }

    #[test]
    fn test_username_token_without_username_is_rejected() {
        let xml = format!(r#"<wsse:UsernameToken xmlns:wsse="{}"></wsse:UsernameToken>"#, xml::NS_WSSE);
        assert!(UsernameToken::find_in(&xml).is_err());
    }
}
