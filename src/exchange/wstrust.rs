//! WS-Trust RequestSecurityToken / RequestSecurityTokenResponse client.

use crate::error::{Result, TokenBridgeError};
use crate::policy::credentials::encode_basic_authorization;
use crate::policy::message::Message;
use crate::policy::xpath::ElementPath;
use crate::token::{SecurityToken, SecurityTokenType};
use crate::xml;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::redirect::Policy;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CERT_STATUS_HEADER: &str = "Cert-Status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsTrustRequestType {
    Issue,
    Validate,
}

impl WsTrustRequestType {
    pub fn uri(&self) -> String {
        match self {
            WsTrustRequestType::Issue => format!("{}/Issue", xml::NS_WST),
            WsTrustRequestType::Validate => format!("{}/Validate", xml::NS_WST),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestSecurityToken {
    pub token_type: SecurityTokenType,
    pub request_type: WsTrustRequestType,
    /// `wsa:Address` placed in `wsp:AppliesTo`
    pub applies_to: Option<String>,
    /// `wsa:Address` placed in `wst:Issuer`
    pub issuer: Option<String>,
    pub base: Option<SecurityToken>,
}

impl RequestSecurityToken {
    pub fn to_envelope(&self) -> String {
        let mut rst = format!(
            r#"<wst:RequestSecurityToken xmlns:wst="{}"><wst:TokenType>{}</wst:TokenType><wst:RequestType>{}</wst:RequestType>"#,
            xml::NS_WST,
            self.token_type.uri(),
            self.request_type.uri()
        );
        if let Some(base) = &self.base {
            rst.push_str("<wst:Base>");
            rst.push_str(&base.to_xml());
            rst.push_str("</wst:Base>");
        }
        if let Some(applies_to) = &self.applies_to {
            rst.push_str(&format!(
                r#"<wsp:AppliesTo xmlns:wsp="{}"><wsa:EndpointReference xmlns:wsa="{}"><wsa:Address>{}</wsa:Address></wsa:EndpointReference></wsp:AppliesTo>"#,
                xml::NS_WSP,
                xml::NS_WSA,
                xml::escape(applies_to)
            ));
        }
        if let Some(issuer) = &self.issuer {
            rst.push_str(&format!(
                r#"<wst:Issuer><wsa:Address xmlns:wsa="{}">{}</wsa:Address></wst:Issuer>"#,
                xml::NS_WSA,
                xml::escape(issuer)
            ));
        }
        rst.push_str("</wst:RequestSecurityToken>");

        format!(
            r#"<soapenv:Envelope xmlns:soapenv="{}"><soapenv:Body>{}</soapenv:Body></soapenv:Envelope>"#,
            xml::NS_SOAP11,
            rst
        )
    }
}

/// A `wst:RequestSecurityTokenResponse` carrying `token`, as used for the
/// WS-Federation `wresult` parameter
pub fn rstr_for(token: &SecurityToken) -> String {
    format!(
        r#"<wst:RequestSecurityTokenResponse xmlns:wst="{}"><wst:TokenType>{}</wst:TokenType><wst:RequestedSecurityToken>{}</wst:RequestedSecurityToken></wst:RequestSecurityTokenResponse>"#,
        xml::NS_WST,
        token.token_type().uri(),
        token.to_xml()
    )
}

fn protocol_violation(endpoint: &str, reason: impl Into<String>) -> TokenBridgeError {
    TokenBridgeError::ProtocolViolation {
        endpoint: endpoint.to_string(),
        reason: reason.into(),
    }
}

fn soap_body(document: &str) -> String {
    match Message::parse_soap(document) {
        Ok(message) => message.body().to_string(),
        Err(_) => document.to_string(),
    }
}

/// The `faultcode: faultstring` of a SOAP fault, if `content` is one
fn fault_in(content: &str) -> Result<Option<String>> {
    if ElementPath::parse("//Fault")?.select_text(content).ok().flatten().is_none() {
        return Ok(None);
    }
    let code = ElementPath::parse("//Fault/faultcode")?
        .select_text(content)
        .ok()
        .flatten()
        .unwrap_or_default();
    let reason = ElementPath::parse("//Fault/faultstring")?
        .select_text(content)
        .ok()
        .flatten()
        .unwrap_or_default();
    Ok(Some(format!("{}: {}", code.trim(), reason.trim())))
}

/// Pull the issued token out of an RSTR, which may be bare or wrapped in a
/// SOAP envelope
pub fn parse_rstr(endpoint: &str, document: &str) -> Result<SecurityToken> {
    let content = soap_body(document);

    if let Some(fault) = fault_in(&content)? {
        return Err(protocol_violation(
            endpoint,
            format!("SOAP fault from token service: {}", fault),
        ));
    }

    let requested = ElementPath::parse("//RequestSecurityTokenResponse/RequestedSecurityToken")?
        .select_text(&content)
        .map_err(|e| protocol_violation(endpoint, format!("malformed response: {}", e)))?;
    if requested.is_none() {
        return Err(protocol_violation(
            endpoint,
            "response contained no RequestedSecurityToken",
        ));
    }

    SecurityToken::find_in(&content)
        .map_err(|e| protocol_violation(endpoint, format!("malformed token: {}", e)))?
        .ok_or_else(|| protocol_violation(endpoint, "token server returned an unrecognized security token"))
}

#[derive(Debug, Clone)]
pub enum StsResponse {
    Token(SecurityToken),
    /// The STS refused the request; the requestor must authenticate differently
    AuthRequired { status: u16 },
}

pub struct StsClient {
    http: reqwest::Client,
}

impl StsClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|e| TokenBridgeError::Config(format!("failed to build STS client: {}", e)))?;
        Ok(Self { http })
    }

    pub async fn request(
        &self,
        endpoint: &str,
        rst: &RequestSecurityToken,
        basic: Option<(&str, &str)>,
    ) -> Result<StsResponse> {
        info!("Applying for a {:?} token at {}", rst.token_type, endpoint);

        let mut request = self
            .http
            .post(endpoint)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", "\"\"")
            .body(rst.to_envelope());
        if let Some((login, password)) = basic {
            request = request.header(AUTHORIZATION, encode_basic_authorization(login, password));
        }

        let response = request.send().await.map_err(|e| {
            warn!("Token service {} unreachable: {}", endpoint, e);
            TokenBridgeError::TransportFailure {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            }
        })?;

        let cert_status = response
            .headers()
            .get(CERT_STATUS_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if cert_status.as_deref().map(|s| s.eq_ignore_ascii_case("invalid")).unwrap_or(false) {
            info!("Token service {} rejected the client certificate", endpoint);
            return Err(TokenBridgeError::InvalidCertificate {
                reason: "client certificate invalid".to_string(),
            });
        }

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| TokenBridgeError::TransportFailure {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        if status == 200 {
            return parse_rstr(endpoint, &body).map(StsResponse::Token);
        }

        // SOAP 1.1 faults arrive as 500
        if status == 500 {
            if let Some(fault) = fault_in(&soap_body(&body))? {
                warn!("Token service {} returned a fault: {}", endpoint, fault);
                return Err(protocol_violation(
                    endpoint,
                    format!("SOAP fault from token service: {}", fault),
                ));
            }
        }

        debug!("Token service {} answered {}", endpoint, status);
        Ok(StsResponse::AuthRequired { status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::UsernameToken;

    const RSTR: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>
<wst:RequestSecurityTokenResponse xmlns:wst="http://schemas.xmlsoap.org/ws/2005/02/trust">
  <wst:RequestedSecurityToken>
    <saml2:Assertion xmlns:saml2="urn:oasis:names:tc:SAML:2.0:assertion" ID="_x" Version="2.0"><saml2:Issuer>sts</saml2:Issuer></saml2:Assertion>
  </wst:RequestedSecurityToken>
</wst:RequestSecurityTokenResponse></soap:Body></soap:Envelope>"#;

    #[test]
    fn test_rst_contains_all_parts() {
        let rst = RequestSecurityToken {
            token_type: SecurityTokenType::Saml20,
            request_type: WsTrustRequestType::Issue,
            applies_to: Some("https://service.example.com/".to_string()),
            issuer: Some("https://issuer.example.com/".to_string()),
            base: Some(SecurityToken::Username(UsernameToken::new("alice", Some("pw".to_string())))),
        };
        let envelope = rst.to_envelope();

        assert!(envelope.contains(crate::token::TOKEN_TYPE_SAML20));
        assert!(envelope.contains("/trust/Issue</wst:RequestType>"));
        assert!(envelope.contains("<wsa:Address>https://service.example.com/</wsa:Address>"));
        assert!(envelope.contains("https://issuer.example.com/</wsa:Address></wst:Issuer>"));
        assert!(envelope.contains("<wst:Base><wsse:UsernameToken"));
        assert!(Message::parse_soap(&envelope).is_ok());
    }

    #[test]
    fn test_parse_rstr_with_saml() {
        match parse_rstr("sts", RSTR).unwrap() {
            SecurityToken::Saml(a) => assert_eq!(a.id, "_x"),
            other => panic!("unexpected token {:?}", other),
        }
    }

    #[test]
    fn test_parse_rstr_fault() {
        let fault = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><soap:Fault><faultcode>soap:Server</faultcode><faultstring>no such user</faultstring></soap:Fault></soap:Body></soap:Envelope>"#;
        let err = parse_rstr("sts", fault).unwrap_err();
        match err {
            TokenBridgeError::ProtocolViolation { reason, .. } => assert!(reason.contains("no such user")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_parse_rstr_without_token() {
        let empty = r#"<wst:RequestSecurityTokenResponse xmlns:wst="urn:wst"><wst:Lifetime/></wst:RequestSecurityTokenResponse>"#;
        assert!(matches!(
            parse_rstr("sts", empty),
            Err(TokenBridgeError::ProtocolViolation { .. })
        ));

        let unknown = r#"<wst:RequestSecurityTokenResponse xmlns:wst="urn:wst"><wst:RequestedSecurityToken><x:Custom xmlns:x="urn:x"/></wst:RequestedSecurityToken></wst:RequestSecurityTokenResponse>"#;
        assert!(matches!(
            parse_rstr("sts", unknown),
            Err(TokenBridgeError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_rstr_for_round_trips() {
        let token = SecurityToken::Username(UsernameToken::new("alice", None));
        let parsed = parse_rstr("rp", &rstr_for(&token)).unwrap();
        assert_eq!(parsed, token);
    }
}
