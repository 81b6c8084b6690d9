//! Certificate parsing and comparison utilities
//!
//! Extracts the handful of X.509 facts the gateway reasons about (names,
//! serial, validity, key identifiers, thumbprint) from DER, and implements the
//! key-rotation staleness check used by the client certificate registry.

use crate::error::{Result, TokenBridgeError};

use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, TimeZone, Utc};
use ring::digest;
use subtle::ConstantTimeEq;
use x509_parser::prelude::*;

/// Facts extracted from a parsed X.509 certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFacts {
    pub subject_dn: String,
    pub issuer_dn: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subject_key_id: Option<Vec<u8>>,
    pub authority_key_id: Option<Vec<u8>>,
    pub thumbprint_sha1: String,
    pub public_key: Vec<u8>,
    pub is_ca: bool,
}

impl CertificateFacts {
    pub fn from_der(cert_der: &[u8]) -> Result<Self> {
        let cert = parse_certificate(cert_der)?;

        let mut subject_key_id = None;
        let mut authority_key_id = None;
        let mut is_ca = false;
        for ext in cert.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(ki) => {
                    subject_key_id = Some(ki.0.to_vec());
                }
                ParsedExtension::AuthorityKeyIdentifier(aki) => {
                    authority_key_id = aki.key_identifier.as_ref().map(|ki| ki.0.to_vec());
                }
                ParsedExtension::BasicConstraints(bc) => {
                    is_ca = bc.ca;
                }
                _ => {}
            }
        }

        Ok(Self {
            subject_dn: cert.subject().to_string(),
            issuer_dn: cert.issuer().to_string(),
            serial_number: cert.tbs_certificate.serial.to_str_radix(16),
            not_before: asn1_to_utc(cert.validity().not_before.timestamp())?,
            not_after: asn1_to_utc(cert.validity().not_after.timestamp())?,
            subject_key_id,
            authority_key_id,
            thumbprint_sha1: thumbprint_sha1(cert_der),
            public_key: cert.public_key().raw.to_vec(),
            is_ca,
        })
    }

    /// Common name of the subject, if present
    pub fn subject_cn(&self) -> Option<String> {
        dn_attribute(&self.subject_dn, "cn")
    }

    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }
}

fn asn1_to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| TokenBridgeError::InvalidCertificate {
            reason: format!("Certificate validity timestamp {} out of range", timestamp),
        })
}

/// Parse DER into an x509-parser certificate, rejecting trailing data
pub fn parse_certificate(cert_der: &[u8]) -> Result<X509Certificate<'_>> {
    let (remaining, parsed) =
        X509Certificate::from_der(cert_der).map_err(|e| TokenBridgeError::InvalidCertificate {
            reason: format!("Certificate parsing failed: {}", e),
        })?;

    if !remaining.is_empty() {
        return Err(TokenBridgeError::InvalidCertificate {
            reason: "Certificate contains trailing data".to_string(),
        });
    }

    Ok(parsed)
}

/// Base64 SHA-1 thumbprint of the DER encoding
pub fn thumbprint_sha1(cert_der: &[u8]) -> String {
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, cert_der);
    general_purpose::STANDARD.encode(hash.as_ref())
}

/// Verify that `cert_der` carries a valid signature by the key of `issuer_der`
pub fn verify_issued_by(cert_der: &[u8], issuer_der: &[u8]) -> Result<()> {
    let cert = parse_certificate(cert_der)?;
    let issuer = parse_certificate(issuer_der)?;
    cert.verify_signature(Some(issuer.public_key()))
        .map_err(|e| TokenBridgeError::InvalidCertificate {
            reason: format!("Certificate signature verification failed: {}", e),
        })
}

/// Canonical form of a distinguished name for equality checks
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| {
            let mut parts = rdn.splitn(2, '=');
            let key = parts.next().unwrap_or("").trim().to_ascii_lowercase();
            match parts.next() {
                Some(value) => format!("{}={}", key, value.trim().to_lowercase()),
                None => key,
            }
        })
        .filter(|rdn| !rdn.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn dn_equals(a: &str, b: &str) -> bool {
    normalize_dn(a) == normalize_dn(b)
}

/// First value of `attribute` (case-insensitive) in a distinguished name
pub fn dn_attribute(dn: &str, attribute: &str) -> Option<String> {
    dn.split(',').find_map(|rdn| {
        let mut parts = rdn.splitn(2, '=');
        let key = parts.next()?.trim();
        let value = parts.next()?.trim();
        key.eq_ignore_ascii_case(attribute).then(|| value.to_string())
    })
}

/// Byte-for-byte comparison that does not reveal where two encodings differ
pub fn certificates_match(presented: &[u8], known_good: &[u8]) -> bool {
    presented.len() == known_good.len() && bool::from(presented.ct_eq(known_good))
}

/// Whether a client certificate was signed by a CA key that has since been
/// rotated: same issuer name as the current CA, but an authority key
/// identifier that no longer matches the CA's subject key identifier.
pub fn is_possibly_stale(
    presented: &CertificateFacts,
    current_ca: Option<&CertificateFacts>,
) -> bool {
    let ca = match current_ca {
        Some(ca) => ca,
        None => return false,
    };

    if !dn_equals(&presented.issuer_dn, &ca.subject_dn) {
        return false;
    }

    let aki = match &presented.authority_key_id {
        Some(aki) => aki,
        None => return false,
    };

    match &ca.subject_key_id {
        Some(ski) => aki != ski,
        None => true,
    }
}

/// Accept PEM or raw DER; anything that does not decode as PEM is returned as-is
pub fn decode_pem_or_der(bytes: &[u8]) -> Vec<u8> {
    match ::pem::parse(bytes) {
        Ok(pem) => pem.contents().to_vec(),
        Err(_) => bytes.to_vec(),
    }
}

pub fn der_to_pem(tag: &str, der: &[u8]) -> String {
    ::pem::encode(&::pem::Pem::new(tag, der.to_vec()))
}
