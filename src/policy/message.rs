//! The request message as seen by policy evaluation.

use crate::error::{Result, TokenBridgeError};
use crate::token::SecurityToken;
use crate::xml;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
}

impl HttpCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
        }
    }

    /// Parse a `Set-Cookie` header value; attributes other than Domain and
    /// Path are ignored.
    pub fn parse_set_cookie(header: &str) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = HttpCookie::new(name, value.trim());
        for attribute in parts {
            if let Some((key, value)) = attribute.split_once('=') {
                match key.trim().to_ascii_lowercase().as_str() {
                    "domain" => cookie.domain = Some(value.trim().to_string()),
                    "path" => cookie.path = Some(value.trim().to_string()),
                    _ => {}
                }
            }
        }
        Some(cookie)
    }

    pub fn to_cookie_pair(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportInfo {
    pub secure: bool,
    pub client_certificate: Option<Vec<u8>>,
    pub remote_addr: Option<String>,
}

/// One child element of the WS-Security header, kept as raw XML
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityHeaderElement {
    pub local_name: String,
    pub xml: String,
}

impl SecurityHeaderElement {
    pub fn is_token(&self) -> bool {
        matches!(self.local_name.as_str(), "Assertion" | "UsernameToken")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityHeader {
    elements: Vec<SecurityHeaderElement>,
}

impl SecurityHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elements(&self) -> &[SecurityHeaderElement] {
        &self.elements
    }

    pub fn push(&mut self, element: SecurityHeaderElement) {
        self.elements.push(element);
    }

    pub fn push_token(&mut self, token: &SecurityToken) {
        let local_name = match token {
            SecurityToken::Saml(_) => "Assertion",
            SecurityToken::Username(_) => "UsernameToken",
        };
        self.elements.push(SecurityHeaderElement {
            local_name: local_name.to_string(),
            xml: token.to_xml(),
        });
    }

    /// Remove the element whose XML matches `xml`; returns whether one was found
    pub fn remove_xml(&mut self, xml: &str) -> bool {
        let wanted = xml.trim();
        match self.elements.iter().position(|e| e.xml.trim() == wanted) {
            Some(index) => {
                self.elements.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove the first token element that parses to `token`
    pub fn remove_token(&mut self, token: &SecurityToken) -> bool {
        let found = self.elements.iter().position(|e| {
            e.is_token()
                && SecurityToken::find_in(&e.xml)
                    .ok()
                    .flatten()
                    .map(|parsed| &parsed == token)
                    .unwrap_or(false)
        });
        match found {
            Some(index) => {
                self.elements.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn token_elements(&self) -> impl Iterator<Item = &SecurityHeaderElement> {
        self.elements.iter().filter(|e| e.is_token())
    }

    pub fn token_count(&self) -> usize {
        self.token_elements().count()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Message {
    headers: Vec<(String, String)>,
    cookies: Vec<HttpCookie>,
    transport: TransportInfo,
    security_header: Option<SecurityHeader>,
    body: String,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// A message whose SOAP body holds `body_xml`
    pub fn soap(body_xml: impl Into<String>) -> Self {
        Self {
            body: body_xml.into(),
            ..Self::default()
        }
    }

    pub fn with_transport(mut self, transport: TransportInfo) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn cookies(&self) -> &[HttpCookie] {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&HttpCookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// Add or replace a cookie by name
    pub fn add_cookie(&mut self, cookie: HttpCookie) {
        self.cookies.retain(|c| c.name != cookie.name);
        self.cookies.push(cookie);
    }

    pub fn remove_cookie(&mut self, name: &str) -> Option<HttpCookie> {
        let at = self.cookies.iter().position(|c| c.name == name)?;
        Some(self.cookies.remove(at))
    }

    pub fn transport(&self) -> &TransportInfo {
        &self.transport
    }

    pub fn security_header(&self) -> Option<&SecurityHeader> {
        self.security_header.as_ref()
    }

    pub fn security_header_mut(&mut self) -> Option<&mut SecurityHeader> {
        self.security_header.as_mut()
    }

    pub fn ensure_security_header(&mut self) -> &mut SecurityHeader {
        self.security_header.get_or_insert_with(SecurityHeader::new)
    }

    pub fn remove_security_header(&mut self) -> Option<SecurityHeader> {
        self.security_header.take()
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Parse a SOAP 1.1 envelope. The WS-Security header children and the
    /// body content are kept verbatim.
    pub fn parse_soap(document: &str) -> Result<Self> {
        let mut reader = xml::reader(document);
        let mut message = Message::new();
        let mut path: Vec<String> = Vec::new();
        let mut saw_body = false;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = xml::local_name(&e);
                    let parent = path.last().cloned();
                    match (parent.as_deref(), name.as_str()) {
                        (Some("Header"), "Security") => {
                            message.security_header = Some(read_security_children(&mut reader, document)?);
                        }
                        (Some("Envelope"), "Body") => {
                            let start = xml::position(&reader);
                            let end = skip_to_end(&mut reader)?;
                            message.body = slice(document, start, end)?.trim().to_string();
                            saw_body = true;
                        }
                        (None, "Envelope") | (Some("Envelope"), "Header") => path.push(name.clone()),
                        _ => {
                            skip_to_end(&mut reader)?;
                        }
                    }
                }
                Event::Empty(e) => {
                    let name = xml::local_name(&e);
                    if path.last().map(String::as_str) == Some("Header") && name == "Security" {
                        message.security_header = Some(SecurityHeader::new());
                    } else if path.last().map(String::as_str) == Some("Envelope") && name == "Body" {
                        saw_body = true;
                    }
                }
                Event::End(_) => {
                    path.pop();
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !saw_body {
            return Err(TokenBridgeError::Xml("message is not a SOAP envelope".to_string()));
        }
        Ok(message)
    }

    pub fn render_soap(&self) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        let mut envelope = BytesStart::new("soapenv:Envelope");
        envelope.push_attribute(("xmlns:soapenv", xml::NS_SOAP11));
        write(&mut writer, Event::Start(envelope))?;

        if let Some(security) = &self.security_header {
            write(&mut writer, Event::Start(BytesStart::new("soapenv:Header")))?;
            let mut sec = BytesStart::new("wsse:Security");
            sec.push_attribute(("xmlns:wsse", xml::NS_WSSE));
            sec.push_attribute(("xmlns:wsu", xml::NS_WSU));
            write(&mut writer, Event::Start(sec))?;
            for element in security.elements() {
                write(&mut writer, Event::Text(BytesText::from_escaped(element.xml.as_str())))?;
            }
            write(&mut writer, Event::End(BytesEnd::new("wsse:Security")))?;
            write(&mut writer, Event::End(BytesEnd::new("soapenv:Header")))?;
        }

        write(&mut writer, Event::Start(BytesStart::new("soapenv:Body")))?;
        write(&mut writer, Event::Text(BytesText::from_escaped(self.body.as_str())))?;
        write(&mut writer, Event::End(BytesEnd::new("soapenv:Body")))?;
        write(&mut writer, Event::End(BytesEnd::new("soapenv:Envelope")))?;

        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|e| TokenBridgeError::Xml(e.to_string()))
    }
}

fn write(writer: &mut Writer<Cursor<Vec<u8>>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| TokenBridgeError::Xml(e.to_string()))
}

fn slice(document: &str, start: usize, end: usize) -> Result<&str> {
    document
        .get(start..end)
        .ok_or_else(|| TokenBridgeError::Xml("element offsets out of range".to_string()))
}

/// Consume events up to the end tag closing the element just opened.
/// Returns the offset where that end tag begins.
fn skip_to_end(reader: &mut quick_xml::Reader<&[u8]>) -> Result<usize> {
    let mut depth = 1usize;
    loop {
        let before = xml::position(reader);
        match reader.read_event()? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(before);
                }
            }
            Event::Eof => return Err(TokenBridgeError::Xml("unexpected end of document".to_string())),
            _ => {}
        }
    }
}

fn read_security_children(
    reader: &mut quick_xml::Reader<&[u8]>,
    document: &str,
) -> Result<SecurityHeader> {
    let mut header = SecurityHeader::new();
    loop {
        let before = xml::position(reader);
        match reader.read_event()? {
            Event::Start(e) => {
                let local_name = xml::local_name(&e);
                skip_to_end(reader)?;
                let end = xml::position(reader);
                header.push(SecurityHeaderElement {
                    local_name,
                    xml: slice(document, before, end)?.trim().to_string(),
                });
            }
            Event::Empty(e) => {
                let end = xml::position(reader);
                header.push(SecurityHeaderElement {
                    local_name: xml::local_name(&e),
                    xml: slice(document, before, end)?.trim().to_string(),
                });
            }
            Event::End(_) => return Ok(header),
            Event::Eof => return Err(TokenBridgeError::Xml("unterminated Security header".to_string())),
            _ => {}
        }
    }
}
