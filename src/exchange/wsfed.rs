//! WS-Federation passive requestor profile client.
//!
//! Tokens are obtained from an IP-STS with `wa=wsignin1.0`, either by
//! presenting HTTP basic credentials or by posting an existing token. The
//! IP-STS answers with an HTML form whose `wresult` field holds the RSTR.
//! Posting that form to a relying party yields session cookies.

use super::wstrust::{parse_rstr, rstr_for};
use crate::error::{Result, TokenBridgeError};
use crate::policy::credentials::encode_basic_authorization;
use crate::policy::message::HttpCookie;
use crate::token::SecurityToken;

use reqwest::header::{AUTHORIZATION, LOCATION, SET_COOKIE};
use reqwest::redirect::Policy;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

pub const WSIGNIN: &str = "wsignin1.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FederationResponse<T> {
    Success(T),
    AuthRequired(String),
}

fn transport_failure(endpoint: &str, e: reqwest::Error) -> TokenBridgeError {
    warn!("Federation endpoint {} unreachable: {}", endpoint, e);
    TokenBridgeError::TransportFailure {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    }
}

/// Value of the `wresult` input of an HTML sign-in form, entity-decoded
pub fn extract_wresult(html: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets, so positions found in `lower` index `html`
    let lower = html.to_ascii_lowercase();
    let mut from = 0;
    while let Some(found) = lower[from..].find("<input") {
        let start = from + found;
        let end = start + lower[start..].find('>')?;
        let tag = &html[start..end];
        if attribute_value(tag, "name").as_deref() == Some("wresult") {
            let raw = attribute_value(tag, "value")?;
            return quick_xml::escape::unescape(&raw).ok().map(|v| v.into_owned());
        }
        from = end;
    }
    None
}

fn attribute_value(tag: &str, name: &str) -> Option<String> {
    let lower = tag.to_ascii_lowercase();
    let mut from = 0;
    while let Some(found) = lower[from..].find(name) {
        let at = from + found;
        from = at + name.len();
        let preceded = at > 0 && lower.as_bytes()[at - 1].is_ascii_whitespace();
        let after = lower[from..].trim_start();
        if !preceded || !after.starts_with('=') {
            continue;
        }
        let value = tag[tag.len() - after.len() + 1..].trim_start();
        let quote = value.chars().next()?;
        if quote == '"' || quote == '\'' {
            let inner = &value[1..];
            return inner.find(quote).map(|close| inner[..close].to_string());
        }
        let close = value
            .find(|c: char| c.is_ascii_whitespace() || c == '/' || c == '>')
            .unwrap_or(value.len());
        return Some(value[..close].to_string());
    }
    None
}

/// Whether `location`, resolved against `base`, points at `login_url`
/// (query and fragment ignored)
pub fn is_login_redirect(base: &str, location: &str, login_url: &str) -> bool {
    let resolved = match Url::parse(base).and_then(|b| b.join(location)) {
        Ok(url) => url,
        Err(_) => return false,
    };
    let login = match Url::parse(login_url) {
        Ok(url) => url,
        Err(_) => return false,
    };
    resolved.scheme() == login.scheme()
        && resolved.host_str() == login.host_str()
        && resolved.port_or_known_default() == login.port_or_known_default()
        && resolved.path().trim_end_matches('/') == login.path().trim_end_matches('/')
}

pub struct WsFedClient {
    http: reqwest::Client,
}

impl WsFedClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|e| TokenBridgeError::Config(format!("failed to build federation client: {}", e)))?;
        Ok(Self { http })
    }

    fn sign_in_query(realm: Option<&str>, context: Option<&str>) -> Vec<(&'static str, String)> {
        let mut query = vec![("wa", WSIGNIN.to_string())];
        if let Some(realm) = realm {
            query.push(("wtrealm", realm.to_string()));
        }
        if let Some(context) = context {
            query.push(("wctx", context.to_string()));
        }
        query
    }

    async fn token_from_form(
        &self,
        endpoint: &str,
        response: reqwest::Response,
    ) -> Result<FederationResponse<SecurityToken>> {
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| transport_failure(endpoint, e))?;
        if status != 200 {
            debug!("IP-STS {} answered {}", endpoint, status);
            return Ok(FederationResponse::AuthRequired(format!(
                "federation token request failed with status {}",
                status
            )));
        }

        let wresult = extract_wresult(&body).ok_or_else(|| TokenBridgeError::ProtocolViolation {
            endpoint: endpoint.to_string(),
            reason: "response has no wresult form field".to_string(),
        })?;
        parse_rstr(endpoint, &wresult).map(FederationResponse::Success)
    }

    /// Request a token from the IP-STS using HTTP basic credentials
    pub async fn request_token(
        &self,
        ip_sts_url: &str,
        realm: Option<&str>,
        context: Option<&str>,
        basic: Option<(&str, &str)>,
    ) -> Result<FederationResponse<SecurityToken>> {
        info!("Requesting federation token from {}", ip_sts_url);
        let mut request = self
            .http
            .get(ip_sts_url)
            .query(&Self::sign_in_query(realm, context));
        if let Some((login, password)) = basic {
            request = request.header(AUTHORIZATION, encode_basic_authorization(login, password));
        }
        let response = request.send().await.map_err(|e| transport_failure(ip_sts_url, e))?;
        self.token_from_form(ip_sts_url, response).await
    }

    /// Trade an existing token at the IP-STS for one scoped to `realm`
    pub async fn exchange_token(
        &self,
        ip_sts_url: &str,
        token: &SecurityToken,
        realm: Option<&str>,
        context: Option<&str>,
    ) -> Result<FederationResponse<SecurityToken>> {
        info!("Exchanging {:?} token at {}", token.token_type(), ip_sts_url);
        let mut form = Self::sign_in_query(realm, context);
        form.push(("wresult", rstr_for(token)));
        let response = self
            .http
            .post(ip_sts_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_failure(ip_sts_url, e))?;
        self.token_from_form(ip_sts_url, response).await
    }

    /// Post `token` to the relying party and collect the session cookies it
    /// sets. Success is a 2xx, or a redirect anywhere but `login_url`.
    pub async fn authenticate(
        &self,
        relying_party_url: &str,
        login_url: Option<&str>,
        token: &SecurityToken,
        context: Option<&str>,
    ) -> Result<FederationResponse<Vec<HttpCookie>>> {
        let mut form = Self::sign_in_query(None, context);
        form.push(("wresult", rstr_for(token)));
        let response = self
            .http
            .post(relying_party_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_failure(relying_party_url, e))?;

        let status = response.status();
        let cookies: Vec<HttpCookie> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(HttpCookie::parse_set_cookie)
            .collect();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if let Some(login_url) = login_url {
                if is_login_redirect(relying_party_url, location, login_url) {
                    debug!("Relying party {} redirected to login", relying_party_url);
                    return Ok(FederationResponse::AuthRequired(
                        "relying party rejected the federation token".to_string(),
                    ));
                }
            }
        } else if !status.is_success() {
            debug!("Relying party {} answered {}", relying_party_url, status);
            return Ok(FederationResponse::AuthRequired(format!(
                "relying party answered {}",
                status.as_u16()
            )));
        }

        info!(
            "Authenticated at {} ({} cookies)",
            relying_party_url,
            cookies.len()
        );
        Ok(FederationResponse::Success(cookies))
    }
}
