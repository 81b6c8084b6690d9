//! Request-scoped token cache.
//!
//! One instance belongs to one policy evaluation. Entries carry an absolute
//! expiry in epoch milliseconds; anything at or past its expiry is invisible
//! to lookups. Writing a past expiry is how an entry is cleared.

use super::message::HttpCookie;
use crate::token::SecurityToken;

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    Token(SecurityToken),
    Cookies(Vec<HttpCookie>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Option<CachedValue>,
    expires_at_millis: i64,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Default)]
pub struct PolicyContextCache {
    entries: HashMap<String, CacheEntry>,
}

impl PolicyContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&CachedValue> {
        self.get_at(key, now_millis())
    }

    /// Lookup as of `now_millis`
    pub fn get_at(&self, key: &str, now_millis: i64) -> Option<&CachedValue> {
        self.entries
            .get(key)
            .filter(|entry| entry.expires_at_millis > now_millis)
            .and_then(|entry| entry.value.as_ref())
    }

    /// Store `value` until `expires_at_millis`. A zero, negative or past
    /// expiry leaves the key immediately expired.
    pub fn put(
        &mut self,
        key: impl Into<String>,
        value: Option<CachedValue>,
        expires_at_millis: i64,
    ) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at_millis,
            },
        );
    }

    pub fn invalidate(&mut self, key: &str) {
        self.put(key, None, 1);
    }

    pub fn expiry_of(&self, key: &str) -> Option<i64> {
        self.entries.get(key).map(|entry| entry.expires_at_millis)
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&mut self) -> usize {
        let now = now_millis();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.expires_at_millis > now && entry.value.is_some());
        before - self.entries.len()
    }

    /// Number of stored keys, expired or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
