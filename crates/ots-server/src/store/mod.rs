pub mod crypto;
pub mod db;
pub mod memory;
pub mod model;
#[cfg(test)]
pub(crate) mod testing;

use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use crypto::{CryptoEngine, CryptoError};
pub use db::RedbStore;
pub use memory::MemoryStore;
pub use model::{
    ConsumeOutcome, NewSecretRecord, SecretMetadata, SecretRecord, SecretState, SecretUpdate,
    ViewReceipt,
};

/// Returned by [`SecretStore::consume_view`] when its deadline passed before
/// anything was committed. The caller may retry.
#[derive(Debug, thiserror::Error)]
#[error("store deadline passed before commit")]
pub struct DeadlineExceeded;

/// Persistence for secret rows and their metadata.
///
/// `consume_view` is the only operation that touches the view counter on the
/// reveal path and must run as a single atomic step: re-check the row, count the
/// view, and delete the row on the last view, with no other writer interleaving.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Insert a new secret and return it with its assigned id.
    /// Fails if the key already exists.
    async fn insert_secret(&self, new: NewSecretRecord) -> Result<SecretRecord>;

    async fn insert_metadata(&self, metadata: SecretMetadata) -> Result<()>;

    async fn get_secret_by_key(&self, key: &str) -> Result<Option<SecretRecord>>;

    /// Returns false if the row does not exist.
    async fn update_secret(&self, key: &str, update: SecretUpdate) -> Result<bool>;

    /// Returns true if the row existed.
    async fn delete_secret(&self, key: &str) -> Result<bool>;

    /// Forward-only state change. Returns true if the state moved.
    async fn update_metadata(
        &self,
        key: &str,
        state: SecretState,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get_metadata(&self, key: &str) -> Result<Option<SecretMetadata>>;

    /// Atomically count one view of `key` as of `now`.
    ///
    /// If `deadline` has passed by the time the change would be committed,
    /// nothing is written and the call fails with [`DeadlineExceeded`].
    async fn consume_view(
        &self,
        key: &str,
        now: DateTime<Utc>,
        ip: Option<&str>,
        deadline: Instant,
    ) -> Result<ConsumeOutcome>;

    /// Delete every row that is no longer viewable at `now`. Returns removed keys.
    async fn prune(&self, now: DateTime<Utc>) -> Result<Vec<String>>;
}
