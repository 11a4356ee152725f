//! Caller identity as seen by the dispatcher.
//!
//! Account management lives outside this service. The dispatcher only needs
//! to turn an API key into a [`CallerContext`]; the [`CallerDirectory`] trait
//! is that seam.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::api_keys::{hash_api_key, plausible_key, MIN_KEY_LENGTH};
use crate::error::CoreError;
use crate::tier::Tier;
use crate::types::{CallerId, PartitionKey};

/// Resolved identity and entitlements of an authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerContext {
    pub caller_id: CallerId,
    pub name: String,
    pub tier: Tier,
    /// Renders allowed per billing period.
    pub monthly_quota: i64,
}

impl CallerContext {
    pub fn new(caller_id: CallerId, name: impl Into<String>, tier: Tier) -> Self {
        Self {
            caller_id,
            name: name.into(),
            tier,
            monthly_quota: tier.default_monthly_quota(),
        }
    }

    pub fn with_quota(mut self, monthly_quota: i64) -> Self {
        self.monthly_quota = monthly_quota;
        self
    }

    pub fn partition(&self) -> PartitionKey {
        PartitionKey::for_caller(self.caller_id)
    }
}

/// Looks up callers by the SHA-256 hex digest of their API key.
#[async_trait]
pub trait CallerDirectory: Send + Sync {
    async fn resolve(&self, key_hash: &str) -> Result<Option<CallerContext>, CoreError>;
}

/// Fixed set of keys loaded from configuration. Intended for development and
/// tests; production deployments use the database directory.
#[derive(Debug, Default, Clone)]
pub struct StaticCallerDirectory {
    by_hash: HashMap<String, CallerContext>,
}

impl StaticCallerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plaintext key.
    pub fn insert(&mut self, plaintext_key: &str, caller: CallerContext) {
        self.by_hash.insert(hash_api_key(plaintext_key), caller);
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Parse `key:tier[:quota],...`. Caller ids are assigned from 1 in
    /// declaration order.
    pub fn parse(keys: &str) -> Result<Self, CoreError> {
        let mut directory = Self::new();
        let entries = keys.split(',').map(str::trim).filter(|e| !e.is_empty());

        for (index, entry) in entries.enumerate() {
            let mut parts = entry.split(':');
            let key = parts.next().unwrap_or_default();
            let tier_name = parts.next().ok_or_else(|| {
                CoreError::Validation(format!("entry {index}: expected key:tier[:quota]"))
            })?;
            let tier = Tier::from_name(tier_name).map_err(|_| {
                CoreError::Validation(format!("entry {index}: unknown tier '{tier_name}'"))
            })?;
            let quota = match parts.next() {
                Some(raw) => raw.parse::<i64>().ok().filter(|q| *q >= 0).ok_or_else(|| {
                    CoreError::Validation(format!("entry {index}: invalid quota '{raw}'"))
                })?,
                None => tier.default_monthly_quota(),
            };
            if parts.next().is_some() {
                return Err(CoreError::Validation(format!(
                    "entry {index}: too many fields"
                )));
            }
            if plausible_key(key) != Some(key) {
                return Err(CoreError::Validation(format!(
                    "entry {index}: keys need at least {MIN_KEY_LENGTH} non-blank characters"
                )));
            }

            let caller_id = index as CallerId + 1;
            let caller =
                CallerContext::new(caller_id, format!("static-{caller_id}"), tier).with_quota(quota);
            directory.insert(key, caller);
        }

        Ok(directory)
    }
}

#[async_trait]
impl CallerDirectory for StaticCallerDirectory {
    async fn resolve(&self, key_hash: &str) -> Result<Option<CallerContext>, CoreError> {
        Ok(self.by_hash.get(key_hash).cloned())
    }
}
