use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time;
use tracing::debug;

use super::model::{
    ConsumeOutcome, NewSecretRecord, SecretMetadata, SecretRecord, SecretState, SecretUpdate,
};
use super::{DeadlineExceeded, SecretStore};

#[derive(Default)]
struct Inner {
    secrets: HashMap<String, SecretRecord>,
    metadata: HashMap<String, SecretMetadata>,
    next_id: u64,
}

/// Non-durable store for tests and single-process development.
///
/// Every operation runs under one lock acquisition, which makes `consume_view`
/// atomic with respect to all other calls.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn insert_secret(&self, new: NewSecretRecord) -> Result<SecretRecord> {
        let mut inner = self.inner.lock().await;
        if inner.secrets.contains_key(&new.key) {
            anyhow::bail!("secret key already exists");
        }
        inner.next_id += 1;
        let record = new.into_record(inner.next_id);
        inner.secrets.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn insert_metadata(&self, metadata: SecretMetadata) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.metadata.insert(metadata.key.clone(), metadata);
        Ok(())
    }

    async fn get_secret_by_key(&self, key: &str) -> Result<Option<SecretRecord>> {
        Ok(self.inner.lock().await.secrets.get(key).cloned())
    }

    async fn update_secret(&self, key: &str, update: SecretUpdate) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.secrets.get_mut(key) {
            Some(record) => {
                record.apply(update);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_secret(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().await.secrets.remove(key).is_some())
    }

    async fn update_metadata(
        &self,
        key: &str,
        state: SecretState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .metadata
            .get_mut(key)
            .is_some_and(|m| m.advance(state, now)))
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<SecretMetadata>> {
        Ok(self.inner.lock().await.metadata.get(key).cloned())
    }

    async fn consume_view(
        &self,
        key: &str,
        now: DateTime<Utc>,
        ip: Option<&str>,
        deadline: Instant,
    ) -> Result<ConsumeOutcome> {
        let Ok(mut inner) = time::timeout_at(deadline.into(), self.inner.lock()).await else {
            return Err(DeadlineExceeded.into());
        };
        if Instant::now() >= deadline {
            return Err(DeadlineExceeded.into());
        }
        let Some(record) = inner.secrets.get_mut(key) else {
            return Ok(ConsumeOutcome::NotFound);
        };

        let outcome = record.try_consume(now, ip);
        match &outcome {
            ConsumeOutcome::Consumed(receipt) => {
                let destroyed = receipt.destroyed;
                if destroyed {
                    inner.secrets.remove(key);
                    debug!(key = %key, "destroyed after final view");
                }
                if let Some(meta) = inner.metadata.get_mut(key) {
                    meta.advance(SecretState::Viewed, now);
                    if destroyed {
                        meta.advance(SecretState::Destroyed, now);
                    }
                }
            }
            ConsumeOutcome::Expired | ConsumeOutcome::Exhausted => {
                inner.secrets.remove(key);
                debug!(key = %key, "lazy-evicted unviewable secret");
            }
            ConsumeOutcome::NotFound => {}
        }
        Ok(outcome)
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let stale: Vec<String> = inner
            .secrets
            .values()
            .filter(|r| !r.is_viewable(now))
            .map(|r| r.key.clone())
            .collect();
        for key in &stale {
            inner.secrets.remove(key);
        }
        Ok(stale)
    }
}
