//! Small helpers over `quick-xml` shared by the message and token parsers.

use crate::error::{Result, TokenBridgeError};

use quick_xml::events::BytesStart;
use quick_xml::Reader;

pub const NS_SOAP11: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const NS_WSSE: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const NS_WSU: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
pub const NS_WST: &str = "http://schemas.xmlsoap.org/ws/2005/02/trust";
pub const NS_WSP: &str = "http://schemas.xmlsoap.org/ws/2004/09/policy";
pub const NS_WSA: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
pub const NS_SAML1: &str = "urn:oasis:names:tc:SAML:1.0:assertion";
pub const NS_SAML2: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const NS_DSIG: &str = "http://www.w3.org/2000/09/xmldsig#";

pub fn reader(xml: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    reader
}

/// Local part of an element name, namespace prefix dropped
pub fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// Value of the attribute with the given local name, prefix ignored
pub fn attribute(e: &BytesStart<'_>, local: &str) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| TokenBridgeError::Xml(e.to_string()))?;
        if attr.key.local_name().as_ref() == local.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|e| TokenBridgeError::Xml(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

pub fn escape(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}

/// Byte offset reported by the reader, as an index into the source string
pub fn position(reader: &Reader<&[u8]>) -> usize {
    reader.buffer_position() as usize
}
