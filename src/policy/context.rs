//! Per-request policy evaluation context and routing hooks.

use super::cache::PolicyContextCache;
use super::credentials::LoginCredentials;
use super::message::Message;
use crate::error::Result;
use crate::security::metrics::SecurityMetrics;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of routing the decorated request downstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingEvent {
    Routed { status: u16, location: Option<String> },
    Failed { cause: String },
}

impl RoutingEvent {
    pub fn is_success(&self) -> bool {
        matches!(self, RoutingEvent::Routed { status, .. } if (200..300).contains(status))
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, RoutingEvent::Routed { status, .. } if (300..400).contains(status))
    }

    pub fn location(&self) -> Option<&str> {
        match self {
            RoutingEvent::Routed { location, .. } => location.as_deref(),
            RoutingEvent::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Continue,
    Retry,
}

/// Reacts to the outcome of routing. Listeners are called in registration
/// order and may mutate the context (cache, message) before deciding.
#[async_trait]
pub trait RoutingListener: Send + Sync {
    async fn on_routing(
        &self,
        event: &RoutingEvent,
        context: &mut PolicyContext,
    ) -> Result<RouteDecision>;
}

/// Sends a request downstream
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, request: &Message) -> RoutingEvent;
}

pub struct PolicyContext {
    request: Message,
    cache: PolicyContextCache,
    credentials: Vec<LoginCredentials>,
    listeners: Vec<Box<dyn RoutingListener>>,
    reroutes: u32,
    max_reroutes: u32,
    metrics: Option<Arc<SecurityMetrics>>,
}

impl PolicyContext {
    pub fn new(request: Message) -> Self {
        Self::with_cache(request, PolicyContextCache::new())
    }

    /// Start a context that inherits the cache of the previous request of
    /// the same client session
    pub fn with_cache(request: Message, cache: PolicyContextCache) -> Self {
        Self {
            request,
            cache,
            credentials: Vec::new(),
            listeners: Vec::new(),
            reroutes: 0,
            max_reroutes: 1,
            metrics: None,
        }
    }

    pub fn with_max_reroutes(mut self, max_reroutes: u32) -> Self {
        self.max_reroutes = max_reroutes;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SecurityMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// End the request, handing the cache on to the next one
    pub fn into_cache(self) -> PolicyContextCache {
        self.cache
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Message {
        &mut self.request
    }

    pub fn cache(&self) -> &PolicyContextCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut PolicyContextCache {
        &mut self.cache
    }

    pub fn credentials(&self) -> &[LoginCredentials] {
        &self.credentials
    }

    pub fn add_credentials(&mut self, credentials: LoginCredentials) {
        self.credentials.push(credentials);
    }

    /// Discard all gathered credentials in favour of `credentials`
    pub fn replace_credentials(&mut self, credentials: LoginCredentials) {
        self.credentials.clear();
        self.credentials.push(credentials);
    }

    pub fn register_listener(&mut self, listener: Box<dyn RoutingListener>) {
        self.listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn reroute_count(&self) -> u32 {
        self.reroutes
    }

    /// Deliver `event` to every listener. Returns `Retry` if any listener
    /// asked for one and the reroute budget is not spent.
    pub async fn dispatch_routing_event(&mut self, event: &RoutingEvent) -> Result<RouteDecision> {
        let listeners = std::mem::take(&mut self.listeners);
        let mut decision = RouteDecision::Continue;
        let mut outcome = Ok(());

        for listener in &listeners {
            match listener.on_routing(event, self).await {
                Ok(RouteDecision::Retry) => decision = RouteDecision::Retry,
                Ok(RouteDecision::Continue) => {}
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        // Listeners registered during dispatch run after the existing ones next time
        let added = std::mem::replace(&mut self.listeners, listeners);
        self.listeners.extend(added);
        outcome?;

        if decision == RouteDecision::Retry {
            if self.reroutes >= self.max_reroutes {
                warn!("Reroute requested but {} reroutes already used", self.reroutes);
                return Ok(RouteDecision::Continue);
            }
            self.reroutes += 1;
            if let Some(metrics) = &self.metrics {
                metrics.record_reroute();
            }
            debug!("Rerouting request (attempt {})", self.reroutes);
        }
        Ok(decision)
    }

    /// Route the request, rerouting for as long as listeners ask and the
    /// budget allows. Returns the last routing event.
    pub async fn route(&mut self, router: &dyn Router) -> Result<RoutingEvent> {
        loop {
            let event = router.route(&self.request).await;
            match self.dispatch_routing_event(&event).await? {
                RouteDecision::Retry => continue,
                RouteDecision::Continue => return Ok(event),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::cache::{now_millis, CachedValue};
    use crate::policy::credentials::CredentialSourceKind;
    use crate::token::{SecurityToken, UsernameToken};
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        decision: RouteDecision,
    }

    #[async_trait]
    impl RoutingListener for Recorder {
        async fn on_routing(
            &self,
            _event: &RoutingEvent,
            _context: &mut PolicyContext,
        ) -> Result<RouteDecision> {
            self.log.lock().push(self.name);
            Ok(self.decision)
        }
    }

    struct Evictor;

    #[async_trait]
    impl RoutingListener for Evictor {
        async fn on_routing(
            &self,
            event: &RoutingEvent,
            context: &mut PolicyContext,
        ) -> Result<RouteDecision> {
            if !event.is_success() {
                context.cache_mut().invalidate("token");
            }
            Ok(RouteDecision::Continue)
        }
    }

    struct FixedRouter(RoutingEvent);

    #[async_trait]
    impl Router for FixedRouter {
        async fn route(&self, _request: &Message) -> RoutingEvent {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_listeners_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut context = PolicyContext::new(Message::new());
        for name in ["first", "second", "third"] {
            context.register_listener(Box::new(Recorder {
                name,
                log: log.clone(),
                decision: RouteDecision::Continue,
            }));
        }

        let decision = context
            .dispatch_routing_event(&RoutingEvent::Routed { status: 200, location: None })
            .await
            .unwrap();
        assert_eq!(decision, RouteDecision::Continue);
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
        assert_eq!(context.listener_count(), 3);
    }

    #[tokio::test]
    async fn test_failure_event_lets_listener_evict() {
        let mut context = PolicyContext::new(Message::new());
        let token = CachedValue::Token(SecurityToken::Username(UsernameToken::new("alice", None)));
        context.cache_mut().put("token", Some(token), now_millis() + 60_000);
        context.register_listener(Box::new(Evictor));

        context
            .dispatch_routing_event(&RoutingEvent::Failed {
                cause: "connection refused".to_string(),
            })
            .await
            .unwrap();
        assert!(context.cache().get("token").is_none());
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut context = PolicyContext::new(Message::new()).with_max_reroutes(1);
        context.register_listener(Box::new(Recorder {
            name: "retry",
            log: log.clone(),
            decision: RouteDecision::Retry,
        }));

        let router = FixedRouter(RoutingEvent::Routed {
            status: 302,
            location: Some("https://idp/login".to_string()),
        });
        let event = context.route(&router).await.unwrap();

        assert!(event.is_redirect());
        assert_eq!(context.reroute_count(), 1);
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_cache_moves_between_requests() {
        let mut first = PolicyContext::new(Message::new());
        let token = CachedValue::Token(SecurityToken::Username(UsernameToken::new("alice", None)));
        first.cache_mut().put("token", Some(token), now_millis() + 60_000);
        first.replace_credentials(LoginCredentials::cleartext("a", "b", CredentialSourceKind::HttpBasic));

        let second = PolicyContext::with_cache(Message::new(), first.into_cache());
        assert!(second.cache().get("token").is_some());
        assert!(second.credentials().is_empty());
    }
}
