//! Client Certificate Registry
//!
//! Tracks the certificate issued to each user together with a reset counter.
//! Every issuance bumps the counter; the first successful authentication with
//! the issued certificate locks it at [`MAX_RESET_COUNT`], after which a new
//! certificate is only granted when the old one was signed by a rotated CA key
//! or after an administrative revoke.

use super::certificates::{is_possibly_stale, CertificateFacts};
use super::UserPrincipal;
use crate::audit::AuditScope;
use crate::error::{Result, TokenBridgeError};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counter value at which a user may no longer regenerate their certificate
pub const MAX_RESET_COUNT: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientCertState {
    None,
    Issued,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCertEntry {
    pub provider_id: String,
    pub user_id: String,
    pub login: String,
    pub certificate_der: Option<Vec<u8>>,
    pub reset_counter: u8,
    pub updated_at: DateTime<Utc>,
}

impl ClientCertEntry {
    fn empty(principal: &UserPrincipal) -> Self {
        Self {
            provider_id: principal.provider_id.clone(),
            user_id: principal.user_id.clone(),
            login: principal.login.clone(),
            certificate_der: None,
            reset_counter: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn state(&self) -> ClientCertState {
        match self.certificate_der {
            None => ClientCertState::None,
            Some(_) if self.reset_counter >= MAX_RESET_COUNT => ClientCertState::Locked,
            Some(_) => ClientCertState::Issued,
        }
    }

    fn key(&self) -> (String, String) {
        (self.provider_id.clone(), self.user_id.clone())
    }
}

/// Durable storage behind the registry.
///
/// `commit` is the transactional boundary: either the whole entry is written
/// or an error is returned and nothing changed.
pub trait ClientCertStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<ClientCertEntry>>;
    fn commit(&self, entry: &ClientCertEntry) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryClientCertStore {
    entries: Mutex<HashMap<(String, String), ClientCertEntry>>,
    read_only: AtomicBool,
}

impl InMemoryClientCertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A read-only store rejects every commit
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClientCertStore for InMemoryClientCertStore {
    fn load_all(&self) -> Result<Vec<ClientCertEntry>> {
        Ok(self.entries.lock().values().cloned().collect())
    }

    fn commit(&self, entry: &ClientCertEntry) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(TokenBridgeError::Storage(
                "client certificate store is read-only".to_string(),
            ));
        }
        self.entries.lock().insert(entry.key(), entry.clone());
        Ok(())
    }
}

pub struct ClientCertificateRegistry {
    entries: DashMap<(String, String), ClientCertEntry>,
    store: Arc<dyn ClientCertStore>,
    signing_ca: RwLock<Option<CertificateFacts>>,
}

impl ClientCertificateRegistry {
    /// Build the registry, warming it from whatever the store already holds
    pub fn new(store: Arc<dyn ClientCertStore>) -> Result<Self> {
        let entries = DashMap::new();
        for entry in store.load_all()? {
            entries.insert(entry.key(), entry);
        }
        debug!("Loaded {} client certificate entries", entries.len());

        Ok(Self {
            entries,
            store,
            signing_ca: RwLock::new(None),
        })
    }

    /// Set the CA currently used to sign client certificates
    pub fn set_signing_ca(&self, ca: Option<CertificateFacts>) {
        *self.signing_ca.write() = ca;
    }

    pub fn signing_ca(&self) -> Option<CertificateFacts> {
        self.signing_ca.read().clone()
    }

    pub fn find_user_cert(&self, principal: &UserPrincipal) -> Option<Vec<u8>> {
        self.entries
            .get(&principal.key())
            .and_then(|entry| entry.certificate_der.clone())
    }

    pub fn find_entry(&self, principal: &UserPrincipal) -> Option<ClientCertEntry> {
        self.entries.get(&principal.key()).map(|e| e.clone())
    }

    pub fn find_all(&self) -> Vec<ClientCertEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn state_of(&self, principal: &UserPrincipal) -> ClientCertState {
        self.entries
            .get(&principal.key())
            .map(|e| e.state())
            .unwrap_or(ClientCertState::None)
    }

    /// Whether `cert_der` was signed by a CA key other than the current one
    pub fn is_cert_possibly_stale(&self, cert_der: &[u8]) -> bool {
        let facts = match CertificateFacts::from_der(cert_der) {
            Ok(facts) => facts,
            Err(e) => {
                debug!("Unable to parse certificate for staleness check: {}", e);
                return false;
            }
        };
        let ca = self.signing_ca.read();
        is_possibly_stale(&facts, ca.as_ref())
    }

    /// Whether the user is entitled to a new certificate right now.
    ///
    /// `requesting_cert` is the certificate presented with the request, if
    /// any; otherwise the certificate on record is checked for staleness.
    pub fn user_can_generate_cert(
        &self,
        principal: &UserPrincipal,
        requesting_cert: Option<&[u8]>,
    ) -> bool {
        match self.entries.get(&principal.key()) {
            Some(entry) => self.entry_allows_issue(&entry, requesting_cert),
            None => true,
        }
    }

    fn entry_allows_issue(&self, entry: &ClientCertEntry, requesting_cert: Option<&[u8]>) -> bool {
        match entry.state() {
            ClientCertState::None | ClientCertState::Issued => true,
            ClientCertState::Locked => {
                let candidate = requesting_cert.or(entry.certificate_der.as_deref());
                candidate
                    .map(|cert| self.is_cert_possibly_stale(cert))
                    .unwrap_or(false)
            }
        }
    }

    /// Record a freshly issued certificate.
    ///
    /// Eligibility is re-checked while the user's entry is held, so two
    /// concurrent issuances cannot both slip past the quota. A user without
    /// an entry only gets one once the store accepted the commit.
    pub fn record_new_cert(
        &self,
        principal: &UserPrincipal,
        requesting_cert: Option<&[u8]>,
        cert_der: &[u8],
        scope: &AuditScope,
    ) -> Result<()> {
        match self.entries.entry(principal.key()) {
            Entry::Occupied(mut occupied) => {
                let updated =
                    self.commit_issue(occupied.get(), principal, requesting_cert, cert_der, scope)?;
                *occupied.get_mut() = updated;
            }
            Entry::Vacant(vacant) => {
                let empty = ClientCertEntry::empty(principal);
                let updated =
                    self.commit_issue(&empty, principal, requesting_cert, cert_der, scope)?;
                vacant.insert(updated);
            }
        }
        Ok(())
    }

    fn commit_issue(
        &self,
        current: &ClientCertEntry,
        principal: &UserPrincipal,
        requesting_cert: Option<&[u8]>,
        cert_der: &[u8],
        scope: &AuditScope,
    ) -> Result<ClientCertEntry> {
        if !self.entry_allows_issue(current, requesting_cert) {
            warn!(
                "Certificate reset counter exhausted for {} ({} resets)",
                principal, current.reset_counter
            );
            scope.record("client_cert.issue", &principal.login, "DENIED");
            return Err(TokenBridgeError::QuotaExceeded {
                login: principal.login.clone(),
            });
        }

        let mut updated = current.clone();
        updated.login = principal.login.clone();
        updated.certificate_der = Some(cert_der.to_vec());
        updated.reset_counter = updated.reset_counter.saturating_add(1).min(MAX_RESET_COUNT);
        updated.updated_at = Utc::now();

        if let Err(e) = self.store.commit(&updated) {
            warn!("Failed to persist certificate for {}: {}", principal, e);
            scope.record("client_cert.issue", &principal.login, "FAILURE");
            return Err(e);
        }

        info!(
            "Recorded new client certificate for {} (reset counter {})",
            principal, updated.reset_counter
        );
        scope.record("client_cert.issue", &principal.login, "SUCCESS");
        Ok(updated)
    }

    /// Lock the user's certificate so it can no longer be regenerated
    pub fn forbid_cert_reset(&self, principal: &UserPrincipal, scope: &AuditScope) -> Result<()> {
        let mut slot = self.entries.get_mut(&principal.key()).ok_or_else(|| {
            TokenBridgeError::NotFound(format!("no client certificate recorded for {}", principal))
        })?;

        if slot.reset_counter >= MAX_RESET_COUNT {
            return Ok(());
        }

        let mut updated = slot.clone();
        updated.reset_counter = MAX_RESET_COUNT;
        updated.updated_at = Utc::now();
        self.store.commit(&updated)?;

        debug!("Certificate reset forbidden for {}", principal);
        scope.record("client_cert.forbid_reset", &principal.login, "SUCCESS");
        *slot = updated;
        Ok(())
    }

    /// Administrative revoke: clears the certificate and the counter.
    /// Returns whether a certificate was on record.
    pub fn revoke_user_cert(&self, principal: &UserPrincipal, scope: &AuditScope) -> Result<bool> {
        let mut slot = match self.entries.get_mut(&principal.key()) {
            Some(slot) => slot,
            None => return Ok(false),
        };

        let had_cert = slot.certificate_der.is_some();
        let mut updated = slot.clone();
        updated.certificate_der = None;
        updated.reset_counter = 0;
        updated.updated_at = Utc::now();
        self.store.commit(&updated)?;

        info!("Revoked client certificate for {}", principal);
        scope.record("client_cert.revoke", &principal.login, "SUCCESS");
        *slot = updated;
        Ok(had_cert)
    }
}
