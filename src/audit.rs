//! Audit events and attribution scopes.
//!
//! Components hand structured events to an [`AuditSink`]; delivery is
//! fire-and-forget. Writes performed on behalf of the gateway itself (as opposed
//! to the requesting principal) run inside an [`AuditScope`] whose actor is
//! [`AuditActor::System`], passed explicitly to the code doing the write.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Who an audited action is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AuditActor {
    System,
    User { provider_id: String, login: String },
    Anonymous,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub actor: AuditActor,
    pub operation: String,
    pub subject: Option<String>,
    pub result: String,
    pub details: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(actor: AuditActor, operation: &str, result: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            actor,
            operation: operation.to_string(),
            subject: None,
            result: result.to_string(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Bounded in-memory audit log
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            max_events,
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, operation: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.operation == operation)
            .cloned()
            .collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.lock();
        let start = events.len().saturating_sub(limit);
        events[start..].to_vec()
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            warn!("Audit log reached {} entries, dropping oldest", self.max_events);
            events.remove(0);
        }
        events.push(event);
    }
}

/// Attribution scope for a group of audited writes.
///
/// The scope is a value: callers pass `&AuditScope` into the operation that
/// records events, so nothing global is toggled. Dropping the scope ends it.
pub struct AuditScope {
    sink: Arc<dyn AuditSink>,
    actor: AuditActor,
    label: &'static str,
}

impl AuditScope {
    pub fn system(sink: Arc<dyn AuditSink>, label: &'static str) -> Self {
        debug!("Entering system audit scope '{}'", label);
        Self {
            sink,
            actor: AuditActor::System,
            label,
        }
    }

    pub fn for_actor(sink: Arc<dyn AuditSink>, actor: AuditActor, label: &'static str) -> Self {
        Self { sink, actor, label }
    }

    pub fn actor(&self) -> &AuditActor {
        &self.actor
    }

    pub fn is_system(&self) -> bool {
        self.actor == AuditActor::System
    }

    pub fn record(&self, operation: &str, subject: &str, result: &str) {
        self.sink
            .record(AuditEvent::new(self.actor.clone(), operation, result).with_subject(subject));
    }

    pub fn record_event(&self, event: AuditEvent) {
        let mut event = event;
        event.actor = self.actor.clone();
        self.sink.record(event);
    }
}

impl Drop for AuditScope {
    fn drop(&mut self) {
        if self.actor == AuditActor::System {
            debug!("Leaving system audit scope '{}'", self.label);
        }
    }
}
