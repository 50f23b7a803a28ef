//! Phone-number ↔ hidden-identifier resolution.
//!
//! Mappings are learned from pairing and protocol lookups, persisted in the
//! chat store's side table, and served through a TTL cache. Absence of a
//! mapping is never an error; inputs pass through unchanged.

use gowa_core::cache::TtlCache;
use gowa_core::{GatewayError, Jid};
use gowa_storage::ChatStorage;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct LidResolver {
    device_id: String,
    storage: ChatStorage,
    cache: Arc<TtlCache<String, String>>,
}

impl LidResolver {
    pub fn new(device_id: impl Into<String>, storage: ChatStorage, ttl: Duration) -> Self {
        Self {
            device_id: device_id.into(),
            storage,
            cache: Arc::new(TtlCache::new(ttl)),
        }
    }

    /// Start the cache sweeper. Call once per resolver.
    pub fn spawn_sweeper(&self) {
        TtlCache::spawn_sweeper(&self.cache);
    }

    fn pn_key(user: &str) -> String {
        format!("pn:{user}")
    }

    fn lid_key(user: &str) -> String {
        format!("lid:{user}")
    }

    /// Record a learned pair in the side-store and both cache directions.
    pub async fn learn(&self, pn_user: &str, lid_user: &str) -> Result<(), GatewayError> {
        self.storage
            .store_lid_mapping(&self.device_id, pn_user, lid_user)
            .await?;
        self.cache
            .insert(Self::pn_key(pn_user), lid_user.to_string())
            .await;
        self.cache
            .insert(Self::lid_key(lid_user), pn_user.to_string())
            .await;
        debug!(pn_user, lid_user, "learned lid mapping");
        Ok(())
    }

    /// Canonical form for an individual JID: the hidden identifier when a
    /// mapping exists, otherwise the input unchanged.
    pub async fn resolve_to_lid(&self, jid: &Jid) -> Jid {
        if !jid.is_individual() || jid.is_hidden() || jid.user.is_empty() {
            return jid.clone();
        }
        if let Some(lid_user) = self.lookup_lid_user(&jid.user).await {
            return Jid::lid(lid_user);
        }
        jid.clone()
    }

    /// `(phone_jid, lid_jid_if_any)` for outbound payload enrichment.
    pub async fn resolve_to_pn_for_webhook(&self, jid: &Jid) -> (Jid, Option<Jid>) {
        if jid.is_hidden() {
            match self.lookup_pn_user(&jid.user).await {
                Some(pn_user) => (Jid::pn(pn_user), Some(jid.clone())),
                None => (jid.clone(), Some(jid.clone())),
            }
        } else {
            let lid = self.lookup_lid_user(&jid.user).await.map(Jid::lid);
            (jid.clone(), lid)
        }
    }

    async fn lookup_lid_user(&self, pn_user: &str) -> Option<String> {
        let key = Self::pn_key(pn_user);
        if let Some(hit) = self.cache.get(&key).await {
            return Some(hit);
        }
        let found = self
            .storage
            .lookup_lid(&self.device_id, pn_user)
            .await
            .ok()
            .flatten()?;
        self.cache.insert(key, found.clone()).await;
        Some(found)
    }

    async fn lookup_pn_user(&self, lid_user: &str) -> Option<String> {
        let key = Self::lid_key(lid_user);
        if let Some(hit) = self.cache.get(&key).await {
            return Some(hit);
        }
        let found = self
            .storage
            .lookup_pn(&self.device_id, lid_user)
            .await
            .ok()
            .flatten()?;
        self.cache.insert(key, found.clone()).await;
        Some(found)
    }
}
