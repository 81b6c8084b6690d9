//! SAML 1.1 / 2.0 assertion parsing.
//!
//! Only the fields the gateway acts on are extracted; the raw XML of the
//! assertion is kept so it can be re-inserted into an outbound security header
//! unchanged.

use crate::error::{Result, TokenBridgeError};
use crate::xml;

use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SamlVersion {
    V1_1,
    V2_0,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamlAssertion {
    pub id: String,
    pub version: SamlVersion,
    pub issuer: String,
    pub name_id: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// Holder-of-key certificate from the subject confirmation, DER
    pub subject_certificate: Option<Vec<u8>>,
    pub xml: String,
}

impl SamlAssertion {
    /// Parse a document whose first assertion is the one wanted
    pub fn parse(document: &str) -> Result<Self> {
        Self::find_in(document)?
            .ok_or_else(|| TokenBridgeError::Xml("no SAML assertion found".to_string()))
    }

    /// Locate and parse the first `Assertion` element anywhere in `document`
    pub fn find_in(document: &str) -> Result<Option<Self>> {
        let mut reader = xml::reader(document);
        loop {
            let start = xml::position(&reader);
            match reader.read_event()? {
                Event::Start(e) if e.local_name().as_ref() == b"Assertion" => {
                    return parse_assertion(&mut reader, &e, document, start).map(Some);
                }
                Event::Eof => return Ok(None),
                _ => {}
            }
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let started = self.not_before.map(|nb| nb <= now).unwrap_or(true);
        let not_ended = self.not_on_or_after.map(|noa| now < noa).unwrap_or(true);
        started && not_ended
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TokenBridgeError::Xml(format!("bad SAML timestamp '{}': {}", value, e)))
}

fn parse_assertion(
    reader: &mut quick_xml::Reader<&[u8]>,
    root: &BytesStart<'_>,
    document: &str,
    start: usize,
) -> Result<SamlAssertion> {
    let version = match xml::attribute(root, "Version")?.as_deref() {
        Some("2.0") => SamlVersion::V2_0,
        Some(other) => {
            return Err(TokenBridgeError::Xml(format!("unsupported SAML version {}", other)));
        }
        None => match xml::attribute(root, "MajorVersion")?.as_deref() {
            Some("1") => SamlVersion::V1_1,
            _ => return Err(TokenBridgeError::Xml("assertion has no version".to_string())),
        },
    };

    let id = xml::attribute(root, "ID")?
        .or(xml::attribute(root, "AssertionID")?)
        .ok_or_else(|| TokenBridgeError::Xml("assertion has no ID".to_string()))?;

    let mut assertion = SamlAssertion {
        id,
        version,
        issuer: xml::attribute(root, "Issuer")?.unwrap_or_default(),
        name_id: None,
        not_before: None,
        not_on_or_after: None,
        subject_certificate: None,
        xml: String::new(),
    };

    let mut stack: Vec<String> = vec!["Assertion".to_string()];
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if e.local_name().as_ref() == b"Conditions" {
                    read_conditions(&e, &mut assertion)?;
                }
                stack.push(xml::local_name(&e));
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"Conditions" {
                    read_conditions(&e, &mut assertion)?;
                }
            }
            Event::Text(t) => {
                let text = t.unescape()?;
                let current = stack.last().map(String::as_str).unwrap_or_default();
                match current {
                    "Issuer" if assertion.issuer.is_empty() => {
                        assertion.issuer = text.trim().to_string();
                    }
                    "NameID" | "NameIdentifier" if assertion.name_id.is_none() => {
                        assertion.name_id = Some(text.trim().to_string());
                    }
                    "X509Certificate"
                        if assertion.subject_certificate.is_none()
                            && stack.iter().any(|s| s == "SubjectConfirmation") =>
                    {
                        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                        let der = general_purpose::STANDARD.decode(compact).map_err(|e| {
                            TokenBridgeError::Xml(format!("bad subject confirmation certificate: {}", e))
                        })?;
                        assertion.subject_certificate = Some(der);
                    }
                    _ => {}
                }
            }
            Event::End(_) => {
                stack.pop();
                if stack.is_empty() {
                    break;
                }
            }
            Event::Eof => {
                return Err(TokenBridgeError::Xml("unterminated SAML assertion".to_string()));
            }
            _ => {}
        }
    }

    let end = xml::position(reader);
    assertion.xml = document
        .get(start..end)
        .map(|raw| raw.trim().to_string())
        .ok_or_else(|| TokenBridgeError::Xml("assertion offsets out of range".to_string()))?;
    Ok(assertion)
}

fn read_conditions(e: &BytesStart<'_>, assertion: &mut SamlAssertion) -> Result<()> {
    if let Some(nb) = xml::attribute(e, "NotBefore")? {
        assertion.not_before = Some(parse_time(&nb)?);
    }
    if let Some(noa) = xml::attribute(e, "NotOnOrAfter")? {
        assertion.not_on_or_after = Some(parse_time(&noa)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAML2: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>
  <saml2:Assertion xmlns:saml2="urn:oasis:names:tc:SAML:2.0:assertion" ID="_a1" Version="2.0" IssueInstant="2026-01-01T00:00:00Z">
    <saml2:Issuer>sts.example.com</saml2:Issuer>
    <saml2:Subject>
      <saml2:NameID>alice</saml2:NameID>
      <saml2:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:holder-of-key">
        <saml2:SubjectConfirmationData>
          <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:X509Data><ds:X509Certificate>AQID
BA==</ds:X509Certificate></ds:X509Data></ds:KeyInfo>
        </saml2:SubjectConfirmationData>
      </saml2:SubjectConfirmation>
    </saml2:Subject>
    <saml2:Conditions NotBefore="2026-01-01T00:00:00Z" NotOnOrAfter="2026-01-01T01:00:00Z"/>
  </saml2:Assertion>
</soap:Body></soap:Envelope>"#;

    const SAML1: &str = r#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:1.0:assertion" MajorVersion="1" MinorVersion="1" AssertionID="legacy-1" Issuer="idp.example.com">
  <saml:Conditions NotBefore="2026-02-01T00:00:00Z" NotOnOrAfter="2026-02-01T00:10:00Z"></saml:Conditions>
  <saml:AuthenticationStatement><saml:Subject><saml:NameIdentifier>bob</saml:NameIdentifier></saml:Subject></saml:AuthenticationStatement>
</saml:Assertion>"#;

    #[test]
    fn test_parse_saml2_assertion() {
        let assertion = SamlAssertion::parse(SAML2).unwrap();
        assert_eq!(assertion.id, "_a1");
        assert_eq!(assertion.version, SamlVersion::V2_0);
        assert_eq!(assertion.issuer, "sts.example.com");
        assert_eq!(assertion.name_id.as_deref(), Some("alice"));
        assert_eq!(
            assertion.not_on_or_after,
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap())
        );
        assert_eq!(assertion.subject_certificate, Some(vec![1, 2, 3, 4]));
        assert!(assertion.xml.starts_with("<saml2:Assertion"));
        assert!(assertion.xml.ends_with("</saml2:Assertion>"));
    }

    #[test]
    fn test_parse_saml11_assertion() {
        let assertion = SamlAssertion::parse(SAML1).unwrap();
        assert_eq!(assertion.id, "legacy-1");
        assert_eq!(assertion.version, SamlVersion::V1_1);
        assert_eq!(assertion.issuer, "idp.example.com");
        assert_eq!(assertion.name_id.as_deref(), Some("bob"));
        assert!(assertion.subject_certificate.is_none());
        assert!(assertion.is_valid_at(Utc.with_ymd_and_hms(2026, 2, 1, 0, 5, 0).unwrap()));
        assert!(!assertion.is_valid_at(Utc.with_ymd_and_hms(2026, 2, 1, 0, 10, 0).unwrap()));
    }

    #[test]
    fn test_missing_assertion() {
        assert!(SamlAssertion::find_in("<a><b/></a>").unwrap().is_none());
        assert!(SamlAssertion::parse("<a/>").is_err());
    }
}
