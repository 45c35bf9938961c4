//! Store doubles for failure-path tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::model::{
    ConsumeOutcome, NewSecretRecord, SecretMetadata, SecretRecord, SecretState, SecretUpdate,
};
use super::{MemoryStore, SecretStore};

/// Never answers.
pub(crate) struct HangingStore;

#[async_trait]
impl SecretStore for HangingStore {
    async fn insert_secret(&self, _: NewSecretRecord) -> Result<SecretRecord> {
        std::future::pending().await
    }
    async fn insert_metadata(&self, _: SecretMetadata) -> Result<()> {
        std::future::pending().await
    }
    async fn get_secret_by_key(&self, _: &str) -> Result<Option<SecretRecord>> {
        std::future::pending().await
    }
    async fn update_secret(&self, _: &str, _: SecretUpdate) -> Result<bool> {
        std::future::pending().await
    }
    async fn delete_secret(&self, _: &str) -> Result<bool> {
        std::future::pending().await
    }
    async fn update_metadata(&self, _: &str, _: SecretState, _: DateTime<Utc>) -> Result<bool> {
        std::future::pending().await
    }
    async fn get_metadata(&self, _: &str) -> Result<Option<SecretMetadata>> {
        std::future::pending().await
    }
    async fn consume_view(
        &self,
        _: &str,
        _: DateTime<Utc>,
        _: Option<&str>,
        _: Instant,
    ) -> Result<ConsumeOutcome> {
        std::future::pending().await
    }
    async fn prune(&self, _: DateTime<Utc>) -> Result<Vec<String>> {
        std::future::pending().await
    }
}

/// A [`MemoryStore`] with injectable faults.
#[derive(Default)]
pub(crate) struct FaultyStore {
    pub(crate) inner: MemoryStore,
    /// Sleep this long before the first `consume_view` reaches `inner`.
    pub(crate) first_consume_delay: Option<Duration>,
    pub(crate) fail_metadata_insert: bool,
    pub(crate) fail_reads: bool,
    pub(crate) delayed_once: AtomicBool,
}

#[async_trait]
impl SecretStore for FaultyStore {
    async fn insert_secret(&self, new: NewSecretRecord) -> Result<SecretRecord> {
        self.inner.insert_secret(new).await
    }
    async fn insert_metadata(&self, metadata: SecretMetadata) -> Result<()> {
        if self.fail_metadata_insert {
            anyhow::bail!("metadata table locked by /var/lib/ots/ots.db");
        }
        self.inner.insert_metadata(metadata).await
    }
    async fn get_secret_by_key(&self, key: &str) -> Result<Option<SecretRecord>> {
        if self.fail_reads {
            anyhow::bail!("redb: i/o error reading /var/lib/ots/ots.db");
        }
        self.inner.get_secret_by_key(key).await
    }
    async fn update_secret(&self, key: &str, update: SecretUpdate) -> Result<bool> {
        self.inner.update_secret(key, update).await
    }
    async fn delete_secret(&self, key: &str) -> Result<bool> {
        self.inner.delete_secret(key).await
    }
    async fn update_metadata(
        &self,
        key: &str,
        state: SecretState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.update_metadata(key, state, now).await
    }
    async fn get_metadata(&self, key: &str) -> Result<Option<SecretMetadata>> {
        self.inner.get_metadata(key).await
    }
    async fn consume_view(
        &self,
        key: &str,
        now: DateTime<Utc>,
        ip: Option<&str>,
        deadline: Instant,
    ) -> Result<ConsumeOutcome> {
        if let Some(delay) = self.first_consume_delay {
            if !self.delayed_once.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(delay).await;
            }
        }
        self.inner.consume_view(key, now, ip, deadline).await
    }
    async fn prune(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.inner.prune(now).await
    }
}
