use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use super::model::{
    ConsumeOutcome, NewSecretRecord, SecretMetadata, SecretRecord, SecretState, SecretUpdate,
};
use super::{DeadlineExceeded, SecretStore};

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");
const METADATA: TableDefinition<&str, &[u8]> = TableDefinition::new("secret_metadata");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const SECRET_SEQ_KEY: &str = "secret_seq";

/// Leading byte of every stored value, so the layout can change later without
/// guessing at old rows.
const RECORD_FORMAT: u8 = 0x01;

/// Thread-safe handle to the redb store.
///
/// redb admits one write transaction at a time, so every read-check-write
/// sequence done inside a single `begin_write` is serialised against all other
/// writers, across tasks and threads.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(METADATA)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Run a blocking redb operation off the async executor.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RedbStore) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .context("store task failed")?
    }

    fn insert_secret_sync(&self, new: NewSecretRecord) -> Result<SecretRecord> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut secrets = write_txn.open_table(SECRETS)?;
            if secrets.get(new.key.as_str())?.is_some() {
                anyhow::bail!("secret key already exists");
            }

            let mut counters = write_txn.open_table(COUNTERS)?;
            let id = counters.get(SECRET_SEQ_KEY)?.map(|g| g.value()).unwrap_or(0) + 1;
            counters.insert(SECRET_SEQ_KEY, id)?;

            let record = new.into_record(id);
            let bytes = encode(&record)?;
            secrets.insert(record.key.as_str(), bytes.as_slice())?;
            record
        };
        write_txn.commit()?;

        debug!(key = %record.key, id = record.id, "stored secret");
        Ok(record)
    }

    fn insert_metadata_sync(&self, metadata: SecretMetadata) -> Result<()> {
        let bytes = encode(&metadata)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(METADATA)?;
            table.insert(metadata.key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_secret_sync(&self, key: &str) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        let raw: Option<Vec<u8>> = table.get(key)?.map(|guard| guard.value().to_vec());
        raw.map(|bytes| decode(&bytes)).transpose()
    }

    fn update_secret_sync(&self, key: &str, update: SecretUpdate) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(SECRETS)?;
            let raw: Option<Vec<u8>> = table.get(key)?.map(|guard| guard.value().to_vec());
            match raw {
                None => false,
                Some(bytes) => {
                    let mut record: SecretRecord = decode(&bytes)?;
                    record.apply(update);
                    let bytes = encode(&record)?;
                    table.insert(key, bytes.as_slice())?;
                    true
                }
            }
        };
        write_txn.commit()?;
        Ok(updated)
    }

    fn delete_secret_sync(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SECRETS)?;
            let existed = table.remove(key)?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn update_metadata_sync(
        &self,
        key: &str,
        state: SecretState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let moved = {
            let mut table = write_txn.open_table(METADATA)?;
            advance_metadata(&mut table, key, state, now)?
        };
        write_txn.commit()?;
        Ok(moved)
    }

    fn get_metadata_sync(&self, key: &str) -> Result<Option<SecretMetadata>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(METADATA)?;
        let raw: Option<Vec<u8>> = table.get(key)?.map(|guard| guard.value().to_vec());
        raw.map(|bytes| decode(&bytes)).transpose()
    }

    fn consume_view_sync(
        &self,
        key: &str,
        now: DateTime<Utc>,
        ip: Option<&str>,
        deadline: Instant,
    ) -> Result<ConsumeOutcome> {
        // Read, check and write in one write transaction.
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut secrets = write_txn.open_table(SECRETS)?;
            let mut metadata = write_txn.open_table(METADATA)?;

            // Copy the bytes out so the guard's borrow of `secrets` ends before mutation.
            let raw: Option<Vec<u8>> = secrets.get(key)?.map(|guard| guard.value().to_vec());

            match raw {
                None => ConsumeOutcome::NotFound,
                Some(bytes) => {
                    let mut record: SecretRecord = decode(&bytes)?;
                    let outcome = record.try_consume(now, ip);
                    match &outcome {
                        ConsumeOutcome::Consumed(receipt) => {
                            advance_metadata(&mut metadata, key, SecretState::Viewed, now)?;
                            if receipt.destroyed {
                                secrets.remove(key)?;
                                let destroyed = SecretState::Destroyed;
                                advance_metadata(&mut metadata, key, destroyed, now)?;
                                debug!(key = %key, "destroyed after final view");
                            } else {
                                let updated = encode(&record)?;
                                secrets.insert(key, updated.as_slice())?;
                            }
                        }
                        ConsumeOutcome::Expired | ConsumeOutcome::Exhausted => {
                            secrets.remove(key)?;
                            debug!(key = %key, "lazy-evicted unviewable secret");
                        }
                        ConsumeOutcome::NotFound => {}
                    }
                    outcome
                }
            }
        };
        // The caller stops waiting at the deadline; a view it never sees must
        // not be counted.
        if Instant::now() >= deadline {
            write_txn.abort()?;
            debug!(key = %key, "consume_view aborted at deadline");
            return Err(DeadlineExceeded.into());
        }
        write_txn.commit()?;
        Ok(outcome)
    }

    fn prune_sync(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        // Collect and delete inside one write transaction so a key that is
        // revealed concurrently is judged on its latest state.
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SECRETS)?;
            let mut stale = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                let record: SecretRecord = decode(v.value())?;
                if !record.is_viewable(now) {
                    stale.push(k.value().to_owned());
                }
            }
            for key in &stale {
                table.remove(key.as_str())?;
            }
            stale
        };
        write_txn.commit()?;

        if !removed.is_empty() {
            info!(removed = removed.len(), "pruned unviewable secrets");
        }
        Ok(removed)
    }
}

#[async_trait]
impl SecretStore for RedbStore {
    async fn insert_secret(&self, new: NewSecretRecord) -> Result<SecretRecord> {
        self.blocking(move |s| s.insert_secret_sync(new)).await
    }

    async fn insert_metadata(&self, metadata: SecretMetadata) -> Result<()> {
        self.blocking(move |s| s.insert_metadata_sync(metadata)).await
    }

    async fn get_secret_by_key(&self, key: &str) -> Result<Option<SecretRecord>> {
        let key = key.to_owned();
        self.blocking(move |s| s.get_secret_sync(&key)).await
    }

    async fn update_secret(&self, key: &str, update: SecretUpdate) -> Result<bool> {
        let key = key.to_owned();
        self.blocking(move |s| s.update_secret_sync(&key, update)).await
    }

    async fn delete_secret(&self, key: &str) -> Result<bool> {
        let key = key.to_owned();
        self.blocking(move |s| s.delete_secret_sync(&key)).await
    }

    async fn update_metadata(
        &self,
        key: &str,
        state: SecretState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let key = key.to_owned();
        self.blocking(move |s| s.update_metadata_sync(&key, state, now))
            .await
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<SecretMetadata>> {
        let key = key.to_owned();
        self.blocking(move |s| s.get_metadata_sync(&key)).await
    }

    async fn consume_view(
        &self,
        key: &str,
        now: DateTime<Utc>,
        ip: Option<&str>,
        deadline: Instant,
    ) -> Result<ConsumeOutcome> {
        let key = key.to_owned();
        let ip = ip.map(str::to_owned);
        self.blocking(move |s| s.consume_view_sync(&key, now, ip.as_deref(), deadline))
            .await
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.blocking(move |s| s.prune_sync(now)).await
    }
}

fn advance_metadata(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    state: SecretState,
    now: DateTime<Utc>,
) -> Result<bool> {
    let raw: Option<Vec<u8>> = table.get(key)?.map(|guard| guard.value().to_vec());
    let Some(bytes) = raw else {
        return Ok(false);
    };
    let mut metadata: SecretMetadata = decode(&bytes)?;
    if !metadata.advance(state, now) {
        return Ok(false);
    }
    let updated = encode(&metadata)?;
    table.insert(key, updated.as_slice())?;
    Ok(true)
}

/// Encode as `[RECORD_FORMAT] + bincode(value)`.
fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_FORMAT);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    match bytes.split_first() {
        Some((&RECORD_FORMAT, payload)) => {
            let (value, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .context("bincode decode")?;
            Ok(value)
        }
        Some((marker, _)) => anyhow::bail!("unknown record format {marker:#04x}"),
        None => anyhow::bail!("empty record"),
    }
}
