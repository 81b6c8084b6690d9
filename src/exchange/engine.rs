//! Token exchange driven from policy evaluation.
//!
//! Each exchange looks in the request's [`PolicyContextCache`] first and only
//! calls out to the STS or IP-STS on a miss. A successful exchange replaces
//! the inbound token in the request's security header and the gathered
//! credentials, and registers routing listeners that evict the cached token
//! when the downstream service rejects it.
//!
//! [`PolicyContextCache`]: crate::policy::PolicyContextCache

use super::wsfed::{is_login_redirect, FederationResponse, WsFedClient};
use super::wstrust::{RequestSecurityToken, StsClient, StsResponse, WsTrustRequestType};
use crate::config::TokenExchangeConfig;
use crate::error::{Result, TokenBridgeError};
use crate::policy::cache::{now_millis, CachedValue, PolicyContextCache};
use crate::policy::context::{PolicyContext, RouteDecision, RoutingEvent, RoutingListener};
use crate::policy::credentials::{CredentialSourceKind, LoginCredentials};
use crate::policy::message::{HttpCookie, Message};
use crate::security::metrics::SecurityMetrics;
use crate::token::{SecurityToken, SecurityTokenType, UsernameToken};

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const WS_TRUST_KIND: &str = "ws-trust";
pub const WS_FEDERATION_KIND: &str = "ws-federation";
pub const WS_FEDERATION_COOKIES_KIND: &str = "ws-federation-cookies";

const ANONYMOUS: &str = "anonymous";

pub fn cache_key(kind: &str, endpoint: &str, principal: &str) -> String {
    format!("{}:{}:{}", kind, endpoint, principal)
}

/// Parameters of one WS-Trust exchange
#[derive(Debug, Clone)]
pub struct WsTrustExchange {
    pub endpoint: String,
    pub token_type: SecurityTokenType,
    pub request_type: WsTrustRequestType,
    pub applies_to: Option<String>,
    pub issuer: Option<String>,
    /// Credentials presented to the STS itself
    pub basic_credentials: Option<(String, String)>,
}

impl WsTrustExchange {
    pub fn new(endpoint: impl Into<String>, token_type: SecurityTokenType) -> Self {
        Self {
            endpoint: endpoint.into(),
            token_type,
            request_type: WsTrustRequestType::Issue,
            applies_to: None,
            issuer: None,
            basic_credentials: None,
        }
    }

    pub fn with_request_type(mut self, request_type: WsTrustRequestType) -> Self {
        self.request_type = request_type;
        self
    }

    pub fn with_applies_to(mut self, address: impl Into<String>) -> Self {
        self.applies_to = Some(address.into());
        self
    }

    pub fn with_issuer(mut self, address: impl Into<String>) -> Self {
        self.issuer = Some(address.into());
        self
    }

    pub fn with_basic_credentials(
        mut self,
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.basic_credentials = Some((login.into(), password.into()));
        self
    }
}

/// Parameters of one WS-Federation exchange. Without a relying party the
/// obtained token decorates the request; with one, the token is posted there
/// and the resulting session cookies are sent instead.
#[derive(Debug, Clone)]
pub struct WsFederationExchange {
    pub ip_sts_url: String,
    pub realm: Option<String>,
    pub context: Option<String>,
    pub relying_party_url: Option<String>,
    /// Where an unauthenticated requestor is sent; a redirect here means
    /// authentication is required
    pub login_url: Option<String>,
}

impl WsFederationExchange {
    pub fn new(ip_sts_url: impl Into<String>) -> Self {
        Self {
            ip_sts_url: ip_sts_url.into(),
            realm: None,
            context: None,
            relying_party_url: None,
            login_url: None,
        }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_relying_party(
        mut self,
        relying_party_url: impl Into<String>,
        login_url: impl Into<String>,
    ) -> Self {
        self.relying_party_url = Some(relying_party_url.into());
        self.login_url = Some(login_url.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeState {
    CacheHit,
    Success,
    AuthRequired(String),
}

#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub state: ExchangeState,
    pub token: Option<SecurityToken>,
}

impl ExchangeOutcome {
    fn auth_required(reason: impl Into<String>) -> Self {
        Self {
            state: ExchangeState::AuthRequired(reason.into()),
            token: None,
        }
    }

    pub fn is_authorized(&self) -> bool {
        !matches!(self.state, ExchangeState::AuthRequired(_))
    }
}

/// Evicts `key` when the downstream service did not accept the request
struct CacheInvalidationListener {
    key: String,
    metrics: Arc<SecurityMetrics>,
}

#[async_trait]
impl RoutingListener for CacheInvalidationListener {
    async fn on_routing(
        &self,
        event: &RoutingEvent,
        context: &mut PolicyContext,
    ) -> Result<RouteDecision> {
        if !event.is_success() && context.cache().get(&self.key).is_some() {
            debug!("Evicting {} after routing outcome {:?}", self.key, event);
            context.cache_mut().invalidate(&self.key);
            self.metrics.record_token_cache_invalidation();
        }
        Ok(RouteDecision::Continue)
    }
}

/// Performs the relying party login that was skipped in favour of cached
/// cookies, once the downstream service sends the requestor to log in
struct DeferredAuthenticationListener {
    client: Arc<WsFedClient>,
    relying_party_url: String,
    login_url: String,
    wctx: Option<String>,
    token: SecurityToken,
    cookie_key: String,
    /// Names of the cached cookies attached when the login was deferred
    attached_cookies: Vec<String>,
    expires_at_millis: i64,
    timeout: Duration,
    attempted: AtomicBool,
}

#[async_trait]
impl RoutingListener for DeferredAuthenticationListener {
    async fn on_routing(
        &self,
        event: &RoutingEvent,
        context: &mut PolicyContext,
    ) -> Result<RouteDecision> {
        let location = match event.location() {
            Some(location) if event.is_redirect() => location,
            _ => return Ok(RouteDecision::Continue),
        };
        if !is_login_redirect(&self.relying_party_url, location, &self.login_url) {
            return Ok(RouteDecision::Continue);
        }
        if self.attempted.swap(true, Ordering::SeqCst) {
            return Ok(RouteDecision::Continue);
        }

        info!("Session at {} expired, authenticating again", self.relying_party_url);
        let call = self.client.authenticate(
            &self.relying_party_url,
            Some(&self.login_url),
            &self.token,
            self.wctx.as_deref(),
        );
        let response = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| TokenBridgeError::Timeout)??;

        match response {
            FederationResponse::AuthRequired(reason) => {
                debug!("Deferred authentication refused: {}", reason);
                Ok(RouteDecision::Continue)
            }
            FederationResponse::Success(cookies) => {
                context.cache_mut().put(
                    self.cookie_key.clone(),
                    Some(CachedValue::Cookies(cookies.clone())),
                    self.expires_at_millis,
                );
                let request = context.request_mut();
                for name in &self.attached_cookies {
                    request.remove_cookie(name);
                }
                attach_cookies(context, cookies);
                Ok(RouteDecision::Retry)
            }
        }
    }
}

fn attach_cookies(context: &mut PolicyContext, cookies: Vec<HttpCookie>) {
    let request = context.request_mut();
    for cookie in cookies {
        request.add_cookie(cookie);
    }
}

/// Swap `inbound` for `token` in the request: drop the old token (and the
/// security header if nothing else is left in it), attach the new one, then
/// re-derive the credentials from it.
pub fn decorate_request(
    context: &mut PolicyContext,
    inbound: Option<&SecurityToken>,
    token: &SecurityToken,
) {
    let request = context.request_mut();
    if let Some(old) = inbound {
        let emptied = match request.security_header_mut() {
            Some(header) => {
                header.remove_token(old);
                header.is_empty()
            }
            None => false,
        };
        if emptied {
            request.remove_security_header();
        }
    }
    request.ensure_security_header().push_token(token);
    context.replace_credentials(LoginCredentials::from_token(token, CredentialSourceKind::TokenExchange));
}

pub struct TokenExchangeEngine {
    sts: StsClient,
    federation: Arc<WsFedClient>,
    config: TokenExchangeConfig,
    metrics: Arc<SecurityMetrics>,
}

impl TokenExchangeEngine {
    pub fn new(config: TokenExchangeConfig, metrics: Arc<SecurityMetrics>) -> Result<Self> {
        Ok(Self {
            sts: StsClient::new(config.request_timeout())?,
            federation: Arc::new(WsFedClient::new(config.request_timeout())?),
            config,
            metrics,
        })
    }

    pub fn config(&self) -> &TokenExchangeConfig {
        &self.config
    }

    /// Policy context for one request, carrying the cache left by the
    /// previous request of the same session
    pub fn new_context(
        &self,
        request: Message,
        cache: Option<PolicyContextCache>,
    ) -> PolicyContext {
        PolicyContext::with_cache(request, cache.unwrap_or_default())
            .with_max_reroutes(self.config.max_reroutes)
            .with_metrics(self.metrics.clone())
    }

    /// Absolute cache expiry for `token`
    pub fn token_expiry_millis(&self, token: &SecurityToken) -> i64 {
        let max_age = now_millis() + self.config.username_token_max_age_secs * 1000;
        match token {
            SecurityToken::Saml(assertion) => assertion
                .not_on_or_after
                .map(|noa| noa.timestamp_millis() - self.config.saml_expiry_margin_secs * 1000)
                .unwrap_or(max_age),
            SecurityToken::Username(_) => max_age,
        }
    }

    async fn bounded<T>(&self, endpoint: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        let result = match tokio::time::timeout(self.config.request_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(TokenBridgeError::Timeout),
        };
        if let Err(e) = &result {
            self.metrics.record_exchange_failure();
            warn!("Token exchange with {} failed: {}", endpoint, e);
        }
        result
    }

    fn cached_token(&self, context: &PolicyContext, key: &str) -> Option<SecurityToken> {
        match context.cache().get(key) {
            Some(CachedValue::Token(token)) => {
                self.metrics.record_token_cache_hit();
                Some(token.clone())
            }
            _ => {
                self.metrics.record_token_cache_miss();
                None
            }
        }
    }

    fn cache_token(&self, context: &mut PolicyContext, key: &str, token: &SecurityToken) -> i64 {
        let expires_at = self.token_expiry_millis(token);
        context
            .cache_mut()
            .put(key, Some(CachedValue::Token(token.clone())), expires_at);
        expires_at
    }

    fn watch(&self, context: &mut PolicyContext, key: String) {
        context.register_listener(Box::new(CacheInvalidationListener {
            key,
            metrics: self.metrics.clone(),
        }));
    }

    /// Exchange the request's credentials for a token issued by a WS-Trust STS
    pub async fn exchange_ws_trust(
        &self,
        context: &mut PolicyContext,
        exchange: &WsTrustExchange,
    ) -> Result<ExchangeOutcome> {
        let credentials = match context.credentials().first() {
            Some(credentials) => credentials.clone(),
            None => {
                debug!("No credentials to exchange at {}", exchange.endpoint);
                return Ok(ExchangeOutcome::auth_required("no credentials in request"));
            }
        };
        let principal = credentials.login().unwrap_or_else(|| ANONYMOUS.to_string());
        let inbound = credentials.security_token();
        let key = cache_key(WS_TRUST_KIND, &exchange.endpoint, &principal);

        if let Some(token) = self.cached_token(context, &key) {
            debug!("Using cached token for {}", principal);
            decorate_request(context, inbound.as_ref(), &token);
            self.watch(context, key);
            return Ok(ExchangeOutcome {
                state: ExchangeState::CacheHit,
                token: Some(token),
            });
        }

        let base = inbound.clone().or_else(|| {
            let login = credentials.login()?;
            credentials
                .password()
                .map(|password| SecurityToken::Username(UsernameToken::new(login, Some(password.to_string()))))
        });
        let rst = RequestSecurityToken {
            token_type: exchange.token_type,
            request_type: exchange.request_type,
            applies_to: exchange.applies_to.clone(),
            issuer: exchange.issuer.clone(),
            base,
        };
        let basic = exchange
            .basic_credentials
            .as_ref()
            .map(|(login, password)| (login.as_str(), password.as_str()));

        let started = Instant::now();
        let response = self
            .bounded(&exchange.endpoint, self.sts.request(&exchange.endpoint, &rst, basic))
            .await?;

        match response {
            StsResponse::AuthRequired { status } => {
                self.metrics.record_exchange_auth_required(started.elapsed());
                debug!("STS {} requires authentication (status {})", exchange.endpoint, status);
                Ok(ExchangeOutcome::auth_required(format!(
                    "token service answered {}",
                    status
                )))
            }
            StsResponse::Token(token) => {
                self.metrics.record_exchange_success(started.elapsed());
                self.cache_token(context, &key, &token);
                decorate_request(context, inbound.as_ref(), &token);
                self.watch(context, key);
                info!("Exchanged credentials of {} at {}", principal, exchange.endpoint);
                Ok(ExchangeOutcome {
                    state: ExchangeState::Success,
                    token: Some(token),
                })
            }
        }
    }

    /// Obtain a token from a WS-Federation IP-STS and either attach it or use
    /// it to log in at the relying party
    pub async fn exchange_ws_federation(
        &self,
        context: &mut PolicyContext,
        exchange: &WsFederationExchange,
    ) -> Result<ExchangeOutcome> {
        let credentials = match context.credentials().first() {
            Some(credentials) => credentials.clone(),
            None => {
                debug!("No credentials for federation at {}", exchange.ip_sts_url);
                return Ok(ExchangeOutcome::auth_required("no credentials in request"));
            }
        };
        let principal = credentials.login().unwrap_or_else(|| ANONYMOUS.to_string());
        let inbound = credentials.security_token();
        let token_key = cache_key(WS_FEDERATION_KIND, &exchange.ip_sts_url, &principal);
        let cached = self.cached_token(context, &token_key);

        if let (Some(rp), Some(login_url)) = (&exchange.relying_party_url, &exchange.login_url) {
            let cookie_key = cache_key(WS_FEDERATION_COOKIES_KIND, rp, &principal);
            let cookies = match context.cache().get(&cookie_key) {
                Some(CachedValue::Cookies(cookies)) => Some(cookies.clone()),
                _ => None,
            };
            if let (Some(cookies), Some(token)) = (cookies, cached.clone()) {
                debug!("Deferring login at {} for {}", rp, principal);
                let attached_cookies = cookies.iter().map(|c| c.name.clone()).collect();
                attach_cookies(context, cookies);
                self.watch(context, cookie_key.clone());
                let expires_at_millis = context
                    .cache()
                    .expiry_of(&token_key)
                    .unwrap_or_else(|| self.token_expiry_millis(&token));
                context.register_listener(Box::new(DeferredAuthenticationListener {
                    client: self.federation.clone(),
                    relying_party_url: rp.clone(),
                    login_url: login_url.clone(),
                    wctx: exchange.context.clone(),
                    token: token.clone(),
                    cookie_key,
                    attached_cookies,
                    expires_at_millis,
                    timeout: self.config.request_timeout(),
                    attempted: AtomicBool::new(false),
                }));
                return Ok(ExchangeOutcome {
                    state: ExchangeState::CacheHit,
                    token: Some(token),
                });
            }
        }

        let started = Instant::now();
        let mut state = ExchangeState::CacheHit;
        let (token, expires_at) = match cached {
            Some(token) => {
                let expires_at = context
                    .cache()
                    .expiry_of(&token_key)
                    .unwrap_or_else(|| self.token_expiry_millis(&token));
                (token, expires_at)
            }
            None => {
                let realm = exchange.realm.as_deref();
                let wctx = exchange.context.as_deref();
                let response = match &inbound {
                    Some(inbound) => {
                        self.bounded(
                            &exchange.ip_sts_url,
                            self.federation.exchange_token(&exchange.ip_sts_url, inbound, realm, wctx),
                        )
                        .await?
                    }
                    None => {
                        let login = credentials.login();
                        let basic = login.as_deref().zip(credentials.password());
                        self.bounded(
                            &exchange.ip_sts_url,
                            self.federation.request_token(&exchange.ip_sts_url, realm, wctx, basic),
                        )
                        .await?
                    }
                };
                match response {
                    FederationResponse::AuthRequired(reason) => {
                        self.metrics.record_exchange_auth_required(started.elapsed());
                        debug!("IP-STS {} requires authentication: {}", exchange.ip_sts_url, reason);
                        return Ok(ExchangeOutcome::auth_required(reason));
                    }
                    FederationResponse::Success(token) => {
                        state = ExchangeState::Success;
                        let expires_at = self.cache_token(context, &token_key, &token);
                        (token, expires_at)
                    }
                }
            }
        };

        let rp = match &exchange.relying_party_url {
            Some(rp) => rp,
            None => {
                if state == ExchangeState::Success {
                    self.metrics.record_exchange_success(started.elapsed());
                }
                decorate_request(context, inbound.as_ref(), &token);
                self.watch(context, token_key);
                return Ok(ExchangeOutcome {
                    state,
                    token: Some(token),
                });
            }
        };

        let response = self
            .bounded(
                rp,
                self.federation.authenticate(
                    rp,
                    exchange.login_url.as_deref(),
                    &token,
                    exchange.context.as_deref(),
                ),
            )
            .await?;

        match response {
            FederationResponse::AuthRequired(reason) => {
                self.metrics.record_exchange_auth_required(started.elapsed());
                debug!("Relying party {} refused the token: {}", rp, reason);
                context.cache_mut().invalidate(&token_key);
                Ok(ExchangeOutcome::auth_required(reason))
            }
            FederationResponse::Success(cookies) => {
                self.metrics.record_exchange_success(started.elapsed());
                let cookie_key = cache_key(WS_FEDERATION_COOKIES_KIND, rp, &principal);
                context
                    .cache_mut()
                    .put(cookie_key.clone(), Some(CachedValue::Cookies(cookies.clone())), expires_at);
                attach_cookies(context, cookies);
                self.watch(context, cookie_key);
                info!("Federated login of {} at {}", principal, rp);
                Ok(ExchangeOutcome {
                    state: ExchangeState::Success,
                    token: Some(token),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::message::Message;
    use crate::token::saml::{SamlAssertion, SamlVersion};
    use chrono::{Duration as ChronoDuration, Utc};

    fn engine() -> TokenExchangeEngine {
        TokenExchangeEngine::new(TokenExchangeConfig::default(), Arc::new(SecurityMetrics::new())).unwrap()
    }

    fn saml(id: &str, not_on_or_after: Option<chrono::DateTime<Utc>>) -> SecurityToken {
        SecurityToken::Saml(SamlAssertion {
            id: id.to_string(),
            version: SamlVersion::V2_0,
            issuer: "sts".to_string(),
            name_id: Some("alice".to_string()),
            not_before: None,
            not_on_or_after,
            subject_certificate: None,
            xml: format!(
                r#"<saml2:Assertion xmlns:saml2="urn:oasis:names:tc:SAML:2.0:assertion" ID="{}" Version="2.0"><saml2:Issuer>sts</saml2:Issuer><saml2:Subject><saml2:NameID>alice</saml2:NameID></saml2:Subject></saml2:Assertion>"#,
                id
            ),
        })
    }

    #[test]
    fn test_expiry_applies_margin_to_saml() {
        let engine = engine();
        let noa = Utc::now() + ChronoDuration::minutes(10);
        let expiry = engine.token_expiry_millis(&saml("_a", Some(noa)));
        assert_eq!(expiry, noa.timestamp_millis() - 30_000);

        let before = now_millis();
        let expiry = engine.token_expiry_millis(&SecurityToken::Username(UsernameToken::new("bob", None)));
        assert!(expiry >= before + 300_000);
        assert!(expiry <= now_millis() + 300_000);
    }

    #[test]
    fn test_decorate_replaces_inbound_token() {
        let inbound = SecurityToken::Username(UsernameToken::new("alice", Some("pw".to_string())));
        let mut message = Message::soap("<ping/>");
        message.ensure_security_header().push_token(&inbound);

        let mut context = PolicyContext::new(message);
        context.add_credentials(LoginCredentials::from_token(&inbound, CredentialSourceKind::WssUsernameToken));

        let issued = saml("_issued", None);
        decorate_request(&mut context, Some(&inbound), &issued);

        let header = context.request().security_header().unwrap();
        assert_eq!(header.token_count(), 1);
        assert_eq!(header.token_elements().next().unwrap().local_name, "Assertion");
        assert_eq!(context.credentials().len(), 1);
        assert_eq!(context.credentials()[0].source(), CredentialSourceKind::TokenExchange);
        assert_eq!(context.credentials()[0].security_token(), Some(issued));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let engine = engine();
        let mut context = PolicyContext::new(Message::soap("<ping/>"));
        context.add_credentials(LoginCredentials::cleartext("alice", "pw", CredentialSourceKind::HttpBasic));

        // Unroutable endpoint: a network call would fail
        let exchange = WsTrustExchange::new("http://127.0.0.1:1/sts", SecurityTokenType::Saml20);
        let key = cache_key(WS_TRUST_KIND, &exchange.endpoint, "alice");
        let token = saml("_cached", None);
        context
            .cache_mut()
            .put(key, Some(CachedValue::Token(token.clone())), now_millis() + 60_000);

        let outcome = engine.exchange_ws_trust(&mut context, &exchange).await.unwrap();
        assert_eq!(outcome.state, ExchangeState::CacheHit);
        assert_eq!(outcome.token, Some(token));
        assert_eq!(context.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_no_credentials_requires_auth() {
        let engine = engine();
        let mut context = PolicyContext::new(Message::new());
        let exchange = WsTrustExchange::new("http://127.0.0.1:1/sts", SecurityTokenType::Saml20);
        let outcome = engine.exchange_ws_trust(&mut context, &exchange).await.unwrap();
        assert!(!outcome.is_authorized());
        assert!(context.cache().is_empty());
    }

    #[tokio::test]
    async fn test_invalidation_listener_evicts_on_rejection() {
        let metrics = Arc::new(SecurityMetrics::new());
        let mut context = PolicyContext::new(Message::new());
        context.cache_mut().put(
            "ws-trust:sts:alice",
            Some(CachedValue::Token(saml("_a", None))),
            now_millis() + 60_000,
        );
        context.register_listener(Box::new(CacheInvalidationListener {
            key: "ws-trust:sts:alice".to_string(),
            metrics: metrics.clone(),
        }));

        context
            .dispatch_routing_event(&RoutingEvent::Routed { status: 200, location: None })
            .await
            .unwrap();
        assert!(context.cache().get("ws-trust:sts:alice").is_some());

        context
            .dispatch_routing_event(&RoutingEvent::Routed { status: 401, location: None })
            .await
            .unwrap();
        assert!(context.cache().get("ws-trust:sts:alice").is_none());
    }
}
