//! Trust anchor storage and the read-through trust store cache.

use crate::error::{Result, TokenBridgeError};
use crate::security::auth::certificates::{normalize_dn, CertificateFacts};
use crate::security::metrics::SecurityMetrics;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What a trusted certificate may be relied upon for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrustFlag {
    Ssl,
    SigningServerCerts,
    SigningClientCerts,
    SamlIssuer,
    SamlAttestingEntity,
    TrustAnchor,
}

/// Which revocation policy applies to certificates issued by an anchor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevocationPolicyRef {
    None,
    UseDefault,
    Specified(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedCertificateRecord {
    pub id: String,
    pub name: String,
    pub subject_dn: String,
    pub issuer_dn: String,
    pub serial_number: String,
    pub public_key: Vec<u8>,
    pub trust_flags: BTreeSet<TrustFlag>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub thumbprint_sha1: String,
    pub ski: Option<Vec<u8>>,
    pub aki: Option<Vec<u8>>,
    pub revocation_policy: RevocationPolicyRef,
    pub der: Vec<u8>,
}

impl TrustedCertificateRecord {
    pub fn from_der(
        name: impl Into<String>,
        der: &[u8],
        flags: impl IntoIterator<Item = TrustFlag>,
    ) -> Result<Self> {
        let facts = CertificateFacts::from_der(der)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            subject_dn: facts.subject_dn,
            issuer_dn: facts.issuer_dn,
            serial_number: facts.serial_number,
            public_key: facts.public_key,
            trust_flags: flags.into_iter().collect(),
            not_before: facts.not_before,
            not_after: facts.not_after,
            thumbprint_sha1: facts.thumbprint_sha1,
            ski: facts.subject_key_id,
            aki: facts.authority_key_id,
            revocation_policy: RevocationPolicyRef::UseDefault,
            der: der.to_vec(),
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_revocation_policy(mut self, policy: RevocationPolicyRef) -> Self {
        self.revocation_policy = policy;
        self
    }

    pub fn has_flag(&self, flag: TrustFlag) -> bool {
        self.trust_flags.contains(&flag)
    }

    pub fn can_sign_client_certs(&self) -> bool {
        self.has_flag(TrustFlag::SigningClientCerts) || self.has_flag(TrustFlag::TrustAnchor)
    }
}

/// Persistence for trusted certificates
#[async_trait]
pub trait TrustAnchorRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<TrustedCertificateRecord>>;
    async fn find_by_subject_dn(&self, subject_dn: &str) -> Result<Vec<TrustedCertificateRecord>>;
    async fn find_by_name(&self, name: &str) -> Result<Vec<TrustedCertificateRecord>>;
    async fn find_by_thumbprint(
        &self,
        thumbprint_sha1: &str,
    ) -> Result<Option<TrustedCertificateRecord>>;
    async fn find_by_ski(&self, ski: &[u8]) -> Result<Option<TrustedCertificateRecord>>;
    async fn find_all(&self) -> Result<Vec<TrustedCertificateRecord>>;
    /// Insert or update; a thumbprint already held by another record is a conflict
    async fn save(&self, record: TrustedCertificateRecord) -> Result<String>;
    async fn delete(&self, id: &str) -> Result<bool>;
}

#[derive(Default)]
pub struct InMemoryTrustAnchorRepository {
    records: RwLock<HashMap<String, TrustedCertificateRecord>>,
}

impl InMemoryTrustAnchorRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn filter(
        &self,
        predicate: impl Fn(&TrustedCertificateRecord) -> bool,
    ) -> Vec<TrustedCertificateRecord> {
        self.records
            .read()
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TrustAnchorRepository for InMemoryTrustAnchorRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<TrustedCertificateRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn find_by_subject_dn(&self, subject_dn: &str) -> Result<Vec<TrustedCertificateRecord>> {
        let wanted = normalize_dn(subject_dn);
        Ok(self.filter(|r| normalize_dn(&r.subject_dn) == wanted))
    }

    async fn find_by_name(&self, name: &str) -> Result<Vec<TrustedCertificateRecord>> {
        Ok(self.filter(|r| r.name == name))
    }

    async fn find_by_thumbprint(
        &self,
        thumbprint_sha1: &str,
    ) -> Result<Option<TrustedCertificateRecord>> {
        Ok(self.filter(|r| r.thumbprint_sha1 == thumbprint_sha1).into_iter().next())
    }

    async fn find_by_ski(&self, ski: &[u8]) -> Result<Option<TrustedCertificateRecord>> {
        Ok(self
            .filter(|r| r.ski.as_deref() == Some(ski))
            .into_iter()
            .next())
    }

    async fn find_all(&self) -> Result<Vec<TrustedCertificateRecord>> {
        Ok(self.filter(|_| true))
    }

    async fn save(&self, record: TrustedCertificateRecord) -> Result<String> {
        let mut records = self.records.write();
        if let Some(existing) = records
            .values()
            .find(|r| r.thumbprint_sha1 == record.thumbprint_sha1 && r.id != record.id)
        {
            return Err(TokenBridgeError::Conflict(format!(
                "certificate with thumbprint {} is already trusted as '{}'",
                record.thumbprint_sha1, existing.name
            )));
        }
        let id = record.id.clone();
        records.insert(id.clone(), record);
        Ok(id)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.write().remove(id).is_some())
    }
}

struct CacheSlot<T> {
    value: T,
    loaded_at: Instant,
}

impl<T: Clone> CacheSlot<T> {
    fn fresh(&self, ttl: Duration) -> Option<T> {
        (self.loaded_at.elapsed() < ttl).then(|| self.value.clone())
    }
}

type Anchor = Arc<TrustedCertificateRecord>;

/// Read-through cache over a [`TrustAnchorRepository`].
///
/// Each lookup index is cached independently for `ttl`; a record changed in
/// the repository behind the store's back becomes visible within one TTL.
pub struct TrustStore {
    repository: Arc<dyn TrustAnchorRepository>,
    ttl: Duration,
    by_id: DashMap<String, CacheSlot<Option<Anchor>>>,
    by_subject_dn: DashMap<String, CacheSlot<Vec<Anchor>>>,
    by_name: DashMap<String, CacheSlot<Vec<Anchor>>>,
    metrics: Arc<SecurityMetrics>,
}

impl TrustStore {
    pub fn new(
        repository: Arc<dyn TrustAnchorRepository>,
        ttl: Duration,
        metrics: Arc<SecurityMetrics>,
    ) -> Self {
        Self {
            repository,
            ttl,
            by_id: DashMap::new(),
            by_subject_dn: DashMap::new(),
            by_name: DashMap::new(),
            metrics,
        }
    }

    pub fn repository(&self) -> &Arc<dyn TrustAnchorRepository> {
        &self.repository
    }

    pub async fn by_id(&self, id: &str) -> Result<Option<Anchor>> {
        if let Some(hit) = self.by_id.get(id).and_then(|slot| slot.fresh(self.ttl)) {
            self.metrics.record_trust_cache_hit();
            return Ok(hit);
        }
        self.metrics.record_trust_cache_miss();

        let loaded = self.repository.find_by_id(id).await?.map(Arc::new);
        self.by_id.insert(
            id.to_string(),
            CacheSlot {
                value: loaded.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(loaded)
    }

    pub async fn by_subject_dn(&self, subject_dn: &str) -> Result<Vec<Anchor>> {
        let key = normalize_dn(subject_dn);
        if let Some(hit) = self.by_subject_dn.get(&key).and_then(|slot| slot.fresh(self.ttl)) {
            self.metrics.record_trust_cache_hit();
            return Ok(hit);
        }
        self.metrics.record_trust_cache_miss();

        let loaded: Vec<Anchor> = self
            .repository
            .find_by_subject_dn(subject_dn)
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();
        self.by_subject_dn.insert(
            key,
            CacheSlot {
                value: loaded.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(loaded)
    }

    pub async fn by_name(&self, name: &str) -> Result<Vec<Anchor>> {
        if let Some(hit) = self.by_name.get(name).and_then(|slot| slot.fresh(self.ttl)) {
            self.metrics.record_trust_cache_hit();
            return Ok(hit);
        }
        self.metrics.record_trust_cache_miss();

        let loaded: Vec<Anchor> = self
            .repository
            .find_by_name(name)
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();
        self.by_name.insert(
            name.to_string(),
            CacheSlot {
                value: loaded.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(loaded)
    }

    pub async fn by_thumbprint(&self, thumbprint_sha1: &str) -> Result<Option<Anchor>> {
        Ok(self
            .repository
            .find_by_thumbprint(thumbprint_sha1)
            .await?
            .map(Arc::new))
    }

    pub async fn by_ski(&self, ski: &[u8]) -> Result<Option<Anchor>> {
        Ok(self.repository.find_by_ski(ski).await?.map(Arc::new))
    }

    /// Uncached snapshot of every anchor
    pub async fn all(&self) -> Result<Vec<Anchor>> {
        Ok(self
            .repository
            .find_all()
            .await?
            .into_iter()
            .map(Arc::new)
            .collect())
    }

    pub async fn save(&self, record: TrustedCertificateRecord) -> Result<String> {
        let previous = self.repository.find_by_id(&record.id).await?;
        let (dn, name) = (record.subject_dn.clone(), record.name.clone());

        let id = self.repository.save(record).await?;
        self.evict(&id, &dn, &name);
        if let Some(previous) = previous {
            self.evict(&previous.id, &previous.subject_dn, &previous.name);
        }

        info!("Saved trusted certificate '{}' ({})", name, id);
        Ok(id)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let previous = self.repository.find_by_id(id).await?;
        let removed = self.repository.delete(id).await?;

        self.by_id.remove(id);
        if let Some(previous) = previous {
            self.evict(&previous.id, &previous.subject_dn, &previous.name);
            info!("Deleted trusted certificate '{}' ({})", previous.name, id);
        }
        Ok(removed)
    }

    fn evict(&self, id: &str, subject_dn: &str, name: &str) {
        debug!("Evicting trust store entries for {}", id);
        self.by_id.remove(id);
        self.by_subject_dn.remove(&normalize_dn(subject_dn));
        self.by_name.remove(name);
    }
}
