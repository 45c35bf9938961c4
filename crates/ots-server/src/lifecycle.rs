//! Secret lifecycle: create, inspect, reveal, destroy.
//!
//! A key is either absent or active. A row stays in the store only while it
//! can still be viewed; expiry and view exhaustion are discovered lazily on the
//! next `status` or `reveal` and end in deletion. The periodic sweep only
//! reclaims space.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::store::{
    crypto, ConsumeOutcome, CryptoEngine, CryptoError, DeadlineExceeded, NewSecretRecord,
    SecretMetadata, SecretRecord, SecretStore,
};

pub const MIN_TTL_SECONDS: i64 = 60;
pub const MAX_TTL_SECONDS: i64 = 604_800;
pub const DEFAULT_TTL_SECONDS: i64 = 86_400;
pub const MAX_VIEWS_LIMIT: i64 = 100;
pub const DEFAULT_MAX_VIEWS: i64 = 1;
pub const MAX_SECRET_CHARS: usize = 10_000;
const MAX_EMAIL_LEN: usize = 254;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Input rejected before anything was stored.
    #[error("{message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("secret not found")]
    NotFound,
    #[error("secret has expired")]
    Expired,
    #[error("secret has already been viewed")]
    AlreadyViewed,
    #[error("passphrase required")]
    PassphraseRequired,
    #[error("invalid passphrase")]
    InvalidPassphrase,
    #[error("failed to decrypt secret")]
    Decryption,
    /// A store call did not finish in time. Safe to retry.
    #[error("store unavailable")]
    StoreUnavailable,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LifecycleError {
    fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Public base URL that share links are built on.
    pub base_url: String,
    /// Upper bound for every individual store call.
    pub store_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// Request to create a secret, as received from the client.
#[derive(Debug, Clone)]
pub struct NewSecret {
    pub plaintext: String,
    pub passphrase: Option<String>,
    pub ttl_seconds: i64,
    pub max_views: i64,
    pub recipient_email: Option<String>,
    pub client_ip: Option<String>,
}

impl NewSecret {
    /// A secret with default TTL and a single view.
    pub fn new(plaintext: impl Into<String>) -> Self {
        Self {
            plaintext: plaintext.into(),
            passphrase: None,
            ttl_seconds: DEFAULT_TTL_SECONDS,
            max_views: DEFAULT_MAX_VIEWS,
            recipient_email: None,
            client_ip: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub key: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub needs_passphrase: bool,
    pub expires_at: DateTime<Utc>,
    pub views_remaining: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Revealed {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
    pub views_remaining: u32,
}

/// Validated form of [`NewSecret`].
struct CheckedSecret {
    plaintext: String,
    passphrase: Option<String>,
    ttl_seconds: i64,
    max_views: u32,
    recipient_email: Option<String>,
}

fn check(req: NewSecret) -> Result<CheckedSecret, LifecycleError> {
    let chars = req.plaintext.chars().count();
    if chars == 0 || chars > MAX_SECRET_CHARS {
        return Err(LifecycleError::validation(
            "secret",
            format!("secret must be between 1 and {MAX_SECRET_CHARS} characters"),
        ));
    }
    if !(MIN_TTL_SECONDS..=MAX_TTL_SECONDS).contains(&req.ttl_seconds) {
        return Err(LifecycleError::validation(
            "ttl",
            format!("ttl must be between {MIN_TTL_SECONDS} and {MAX_TTL_SECONDS} seconds"),
        ));
    }
    if !(1..=MAX_VIEWS_LIMIT).contains(&req.max_views) {
        return Err(LifecycleError::validation(
            "maxViews",
            format!("maxViews must be between 1 and {MAX_VIEWS_LIMIT}"),
        ));
    }
    if let Some(email) = req.recipient_email.as_deref() {
        if !is_valid_email(email) {
            return Err(LifecycleError::validation(
                "recipientEmail",
                "recipientEmail must be a valid email address",
            ));
        }
    }

    Ok(CheckedSecret {
        plaintext: req.plaintext,
        // An empty passphrase protects nothing; treat it as absent.
        passphrase: req.passphrase.filter(|p| !p.is_empty()),
        ttl_seconds: req.ttl_seconds,
        max_views: req.max_views as u32,
        recipient_email: req.recipient_email,
    })
}

fn is_valid_email(email: &str) -> bool {
    if email.len() > MAX_EMAIL_LEN || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && domain.split('.').all(|label| !label.is_empty())
}

/// Owns every mutation of secrets and their metadata.
#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn SecretStore>,
    crypto: Arc<CryptoEngine>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl Lifecycle {
    pub fn new(
        store: Arc<dyn SecretStore>,
        crypto: Arc<CryptoEngine>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            crypto,
            clock,
            config,
        }
    }

    pub fn share_url(&self, key: &str) -> String {
        format!("{}/secret/{}", self.config.base_url.trim_end_matches('/'), key)
    }

    pub async fn create(&self, req: NewSecret) -> Result<Created, LifecycleError> {
        let client_ip = req.client_ip.clone();
        let input = check(req)?;
        let has_passphrase = input.passphrase.is_some();

        let passphrase_hash = input.passphrase.as_deref().map(crypto::hash);
        let (plaintext, passphrase) = (input.plaintext, input.passphrase);
        let encrypted_content = self
            .with_crypto(move |c| c.encrypt(&plaintext, passphrase.as_deref()))
            .await?
            .map_err(|e| {
                LifecycleError::Internal(anyhow::Error::new(e).context("encrypt secret"))
            })?;

        let now = self.clock.now();
        let expires_at = now + chrono::Duration::seconds(input.ttl_seconds);
        let record = self
            .guard(self.store.insert_secret(NewSecretRecord {
                key: crypto::generate_key(),
                encrypted_content,
                passphrase_hash,
                max_views: input.max_views,
                expires_at,
                created_at: now,
                created_ip: client_ip,
                recipient_email: input.recipient_email,
            }))
            .await?;
        if let Err(e) = self
            .guard(self.store.insert_metadata(SecretMetadata::new(&record)))
            .await
        {
            // The caller never learns this key, so the row must not outlive the error.
            match self.guard(self.store.delete_secret(&record.key)).await {
                Ok(_) => debug!(key = %record.key, "rolled back secret without metadata"),
                Err(cleanup) => {
                    warn!(key = %record.key, error = %cleanup, "failed to roll back secret")
                }
            }
            return Err(e);
        }

        info!(
            key = %record.key,
            ttl_seconds = input.ttl_seconds,
            max_views = input.max_views,
            has_passphrase,
            "secret created"
        );

        Ok(Created {
            url: self.share_url(&record.key),
            key: record.key,
            expires_at,
        })
    }

    /// Describe a viewable secret without decrypting it or counting a view.
    pub async fn status(&self, key: &str) -> Result<Status, LifecycleError> {
        let record = self.fetch_viewable(key, self.clock.now()).await?;
        Ok(Status {
            needs_passphrase: record.has_passphrase,
            expires_at: record.expires_at,
            views_remaining: record.views_remaining(),
        })
    }

    /// Decrypt and return the secret, counting one view.
    ///
    /// Plaintext is handed out only if the store's atomic `consume_view`
    /// accepted the view, so at most `max_views` calls ever succeed per key.
    pub async fn reveal(
        &self,
        key: &str,
        passphrase: Option<&str>,
        client_ip: Option<&str>,
    ) -> Result<Revealed, LifecycleError> {
        let record = self.fetch_viewable(key, self.clock.now()).await?;

        let derivation = if record.has_passphrase {
            let candidate = passphrase
                .filter(|p| !p.is_empty())
                .ok_or(LifecycleError::PassphraseRequired)?;
            let stored = record.passphrase_hash.as_deref().ok_or_else(|| {
                LifecycleError::Internal(anyhow::anyhow!("passphrase hash missing for {key}"))
            })?;
            if !crypto::verify_passphrase(candidate, stored) {
                debug!(key = %key, "passphrase rejected");
                return Err(LifecycleError::InvalidPassphrase);
            }
            Some(candidate.to_owned())
        } else {
            None
        };

        let ciphertext = record.encrypted_content;
        let plaintext = self
            .with_crypto(move |c| c.decrypt(&ciphertext, derivation.as_deref()))
            .await?
            .map_err(|_: CryptoError| {
                error!(key = %key, "stored secret failed to decrypt");
                LifecycleError::Decryption
            })?;

        // Not wrapped in `guard`: a write abandoned mid-flight could still
        // commit. The store itself gives up at the deadline without writing.
        let deadline = Instant::now() + self.config.store_timeout;
        let outcome = self
            .store
            .consume_view(key, self.clock.now(), client_ip, deadline)
            .await
            .map_err(|e| self.store_error(e))?;
        match outcome {
            ConsumeOutcome::Consumed(receipt) => {
                info!(
                    key = %key,
                    views = receipt.current_views,
                    max_views = receipt.max_views,
                    destroyed = receipt.destroyed,
                    "secret revealed"
                );
                Ok(Revealed {
                    secret: plaintext,
                    expires_at: receipt.expires_at,
                    views_remaining: receipt.views_remaining(),
                })
            }
            // Lost a race with another reveal or with the clock.
            ConsumeOutcome::NotFound => Err(LifecycleError::NotFound),
            ConsumeOutcome::Expired => Err(LifecycleError::Expired),
            ConsumeOutcome::Exhausted => Err(LifecycleError::AlreadyViewed),
        }
    }

    /// Audit trail for `key`, available after the secret itself is gone.
    pub async fn metadata(&self, key: &str) -> Result<Option<SecretMetadata>, LifecycleError> {
        self.guard(self.store.get_metadata(key)).await
    }

    /// Delete every secret that can no longer be viewed. Returns how many.
    pub async fn sweep(&self) -> Result<usize, LifecycleError> {
        let removed = self.guard(self.store.prune(self.clock.now())).await?;
        Ok(removed.len())
    }

    /// Spawn a background Tokio task that calls `sweep()` every `interval`.
    pub fn spawn_sweep(self, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                match self.sweep().await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "background sweep removed secrets"),
                    Err(e) => warn!(error = %e, "background sweep error"),
                }
            }
        });
    }

    /// Fetch `key` and enforce expiry and view exhaustion, deleting the row if
    /// either has been reached.
    async fn fetch_viewable(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<SecretRecord, LifecycleError> {
        let record = self
            .guard(self.store.get_secret_by_key(key))
            .await?
            .ok_or(LifecycleError::NotFound)?;

        if record.is_expired(now) {
            self.guard(self.store.delete_secret(key)).await?;
            debug!(key = %key, "lazy-evicted expired secret");
            return Err(LifecycleError::Expired);
        }
        if record.is_exhausted() {
            self.guard(self.store.delete_secret(key)).await?;
            debug!(key = %key, "lazy-evicted exhausted secret");
            return Err(LifecycleError::AlreadyViewed);
        }
        Ok(record)
    }

    /// Bound a store call by the configured timeout.
    async fn guard<T>(
        &self,
        op: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, LifecycleError> {
        match time::timeout(self.config.store_timeout, op).await {
            Ok(result) => result.map_err(|e| self.store_error(e)),
            Err(_) => {
                let timeout_ms = self.config.store_timeout.as_millis() as u64;
                warn!(timeout_ms, "store call timed out");
                Err(LifecycleError::StoreUnavailable)
            }
        }
    }

    fn store_error(&self, e: anyhow::Error) -> LifecycleError {
        if e.is::<DeadlineExceeded>() {
            warn!("store gave up at its deadline");
            return LifecycleError::StoreUnavailable;
        }
        LifecycleError::Internal(e.context("store operation failed"))
    }

    /// Key derivation is CPU-bound; keep it off the async workers.
    async fn with_crypto<T, F>(&self, f: F) -> Result<Result<T, CryptoError>, LifecycleError>
    where
        T: Send + 'static,
        F: FnOnce(&CryptoEngine) -> Result<T, CryptoError> + Send + 'static,
    {
        let crypto = Arc::clone(&self.crypto);
        tokio::task::spawn_blocking(move || f(&crypto))
            .await
            .map_err(|e| {
                LifecycleError::Internal(anyhow::Error::new(e).context("crypto task failed"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::{FaultyStore, HangingStore};
    use crate::store::{
        crypto::MIN_PBKDF2_ITERATIONS, MemoryStore, RedbStore, SecretState, SecretUpdate,
    };
    use chrono::Duration as ChronoDuration;

    struct Harness {
        lifecycle: Lifecycle,
        store: Arc<dyn SecretStore>,
        clock: ManualClock,
    }

    fn harness_with(store: Arc<dyn SecretStore>) -> Harness {
        harness_timed(store, Duration::from_secs(5))
    }

    fn harness_timed(store: Arc<dyn SecretStore>, store_timeout: Duration) -> Harness {
        let clock = ManualClock::default();
        let crypto = CryptoEngine::new("lifecycle-test-key")
            .unwrap()
            .with_iterations(MIN_PBKDF2_ITERATIONS);
        let lifecycle = Lifecycle::new(
            Arc::clone(&store),
            Arc::new(crypto),
            Arc::new(clock.clone()),
            LifecycleConfig {
                base_url: "https://ots.example.com/".into(),
                store_timeout,
            },
        );
        Harness {
            lifecycle,
            store,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryStore::new()))
    }

    fn secret(text: &str) -> NewSecret {
        NewSecret::new(text)
    }

    #[tokio::test]
    async fn create_builds_share_url_and_metadata() {
        let h = harness();
        let now = h.clock.now();
        let created = h.lifecycle.create(secret("hunter2")).await.unwrap();

        assert_eq!(
            created.url,
            format!("https://ots.example.com/secret/{}", created.key)
        );
        assert_eq!(created.expires_at, now + ChronoDuration::seconds(DEFAULT_TTL_SECONDS));

        let record = h.store.get_secret_by_key(&created.key).await.unwrap().unwrap();
        assert_ne!(record.encrypted_content, "hunter2");
        assert_eq!(record.max_views, 1);
        assert_eq!(record.current_views, 0);

        let meta = h.lifecycle.metadata(&created.key).await.unwrap().unwrap();
        assert_eq!(meta.state, SecretState::New);
        assert_eq!(meta.secret_id, record.id);
    }

    #[tokio::test]
    async fn create_validates_bounds() {
        let h = harness();
        let cases = [
            (NewSecret::new(""), "secret"),
            (NewSecret::new("x".repeat(MAX_SECRET_CHARS + 1)), "secret"),
            (NewSecret { ttl_seconds: 59, ..secret("s") }, "ttl"),
            (NewSecret { ttl_seconds: 604_801, ..secret("s") }, "ttl"),
            (NewSecret { max_views: 0, ..secret("s") }, "maxViews"),
            (NewSecret { max_views: 101, ..secret("s") }, "maxViews"),
            (
                NewSecret {
                    recipient_email: Some("not-an-email".into()),
                    ..secret("s")
                },
                "recipientEmail",
            ),
        ];
        for (req, expected) in cases {
            match h.lifecycle.create(req).await {
                Err(LifecycleError::Validation { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected validation error on {expected}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn create_accepts_boundaries() {
        let h = harness();
        let ok = [
            NewSecret::new("é".repeat(MAX_SECRET_CHARS)),
            NewSecret { ttl_seconds: MIN_TTL_SECONDS, ..secret("s") },
            NewSecret { ttl_seconds: MAX_TTL_SECONDS, ..secret("s") },
            NewSecret { max_views: MAX_VIEWS_LIMIT, ..secret("s") },
            NewSecret {
                recipient_email: Some("alice@example.org".into()),
                ..secret("s")
            },
        ];
        for req in ok {
            h.lifecycle.create(req).await.unwrap();
        }
    }

    #[tokio::test]
    async fn single_view_secret_is_destroyed_after_reveal() {
        let h = harness();
        let created = h.lifecycle.create(secret("burn me")).await.unwrap();

        let revealed = h
            .lifecycle
            .reveal(&created.key, None, Some("203.0.113.7"))
            .await
            .unwrap();
        assert_eq!(revealed.secret, "burn me");
        assert_eq!(revealed.views_remaining, 0);
        assert_eq!(revealed.expires_at, created.expires_at);

        assert!(h.store.get_secret_by_key(&created.key).await.unwrap().is_none());
        assert!(matches!(
            h.lifecycle.reveal(&created.key, None, None).await,
            Err(LifecycleError::NotFound)
        ));
        assert!(matches!(
            h.lifecycle.status(&created.key).await,
            Err(LifecycleError::NotFound)
        ));
        let meta = h.lifecycle.metadata(&created.key).await.unwrap().unwrap();
        assert_eq!(meta.state, SecretState::Destroyed);
    }

    #[tokio::test]
    async fn views_remaining_tracks_each_reveal() {
        let h = harness();
        let created = h
            .lifecycle
            .create(NewSecret { max_views: 2, ..secret("twice") })
            .await
            .unwrap();

        assert_eq!(h.lifecycle.status(&created.key).await.unwrap().views_remaining, 2);

        let first = h.lifecycle.reveal(&created.key, None, None).await.unwrap();
        assert_eq!(first.views_remaining, 1);
        assert_eq!(h.lifecycle.status(&created.key).await.unwrap().views_remaining, 1);
        assert_eq!(
            h.lifecycle.metadata(&created.key).await.unwrap().unwrap().state,
            SecretState::Viewed
        );

        let second = h.lifecycle.reveal(&created.key, None, None).await.unwrap();
        assert_eq!(second.secret, "twice");
        assert_eq!(second.views_remaining, 0);

        assert!(matches!(
            h.lifecycle.status(&created.key).await,
            Err(LifecycleError::NotFound)
        ));
        assert!(matches!(
            h.lifecycle.reveal(&created.key, None, None).await,
            Err(LifecycleError::NotFound)
        ));
    }

    #[tokio::test]
    async fn status_never_counts_a_view() {
        let h = harness();
        let created = h.lifecycle.create(secret("peek")).await.unwrap();
        for _ in 0..5 {
            let status = h.lifecycle.status(&created.key).await.unwrap();
            assert_eq!(status.views_remaining, 1);
            assert!(!status.needs_passphrase);
        }
        assert_eq!(h.lifecycle.reveal(&created.key, None, None).await.unwrap().secret, "peek");
    }

    #[tokio::test]
    async fn expired_secret_is_never_revealed() {
        let h = harness();
        let created = h
            .lifecycle
            .create(NewSecret { ttl_seconds: 60, ..secret("short lived") })
            .await
            .unwrap();

        h.clock.advance(ChronoDuration::seconds(61));
        assert!(matches!(
            h.lifecycle.reveal(&created.key, None, None).await,
            Err(LifecycleError::Expired)
        ));
        assert!(h.store.get_secret_by_key(&created.key).await.unwrap().is_none());
        assert!(matches!(
            h.lifecycle.reveal(&created.key, None, None).await,
            Err(LifecycleError::NotFound)
        ));
        // Never viewed: the audit trail keeps saying so.
        assert_eq!(
            h.lifecycle.metadata(&created.key).await.unwrap().unwrap().state,
            SecretState::New
        );
    }

    #[tokio::test]
    async fn expiry_instant_is_exclusive() {
        let h = harness();
        let created = h
            .lifecycle
            .create(NewSecret { ttl_seconds: 60, ..secret("edge") })
            .await
            .unwrap();

        h.clock.advance(ChronoDuration::seconds(60));
        assert!(matches!(
            h.lifecycle.status(&created.key).await,
            Err(LifecycleError::Expired)
        ));
        assert!(h.store.get_secret_by_key(&created.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn passphrase_gates_reveal_without_mutation() {
        let h = harness();
        let created = h
            .lifecycle
            .create(NewSecret {
                passphrase: Some("let me in".into()),
                ..secret("guarded")
            })
            .await
            .unwrap();

        let status = h.lifecycle.status(&created.key).await.unwrap();
        assert!(status.needs_passphrase);

        assert!(matches!(
            h.lifecycle.reveal(&created.key, None, None).await,
            Err(LifecycleError::PassphraseRequired)
        ));
        assert!(matches!(
            h.lifecycle.reveal(&created.key, Some(""), None).await,
            Err(LifecycleError::PassphraseRequired)
        ));
        assert!(matches!(
            h.lifecycle.reveal(&created.key, Some("wrong"), None).await,
            Err(LifecycleError::InvalidPassphrase)
        ));

        let record = h.store.get_secret_by_key(&created.key).await.unwrap().unwrap();
        assert_eq!(record.current_views, 0);
        assert!(record.viewed_at.is_none());
        assert_eq!(
            h.lifecycle.metadata(&created.key).await.unwrap().unwrap().state,
            SecretState::New
        );

        let revealed = h
            .lifecycle
            .reveal(&created.key, Some("let me in"), None)
            .await
            .unwrap();
        assert_eq!(revealed.secret, "guarded");
    }

    #[tokio::test]
    async fn empty_passphrase_on_create_means_none() {
        let h = harness();
        let created = h
            .lifecycle
            .create(NewSecret {
                passphrase: Some(String::new()),
                ..secret("open")
            })
            .await
            .unwrap();
        assert!(!h.lifecycle.status(&created.key).await.unwrap().needs_passphrase);
        assert_eq!(h.lifecycle.reveal(&created.key, None, None).await.unwrap().secret, "open");
    }

    #[tokio::test]
    async fn corrupt_ciphertext_fails_without_counting() {
        let h = harness();
        let now = h.clock.now();
        h.store
            .insert_secret(NewSecretRecord {
                key: "corrupt".into(),
                encrypted_content: "bm90IGFuIGVudmVsb3Bl".into(),
                passphrase_hash: None,
                max_views: 1,
                expires_at: now + ChronoDuration::seconds(600),
                created_at: now,
                created_ip: None,
                recipient_email: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            h.lifecycle.reveal("corrupt", None, None).await,
            Err(LifecycleError::Decryption)
        ));
        let record = h.store.get_secret_by_key("corrupt").await.unwrap().unwrap();
        assert_eq!(record.current_views, 0);
    }

    #[tokio::test]
    async fn exhausted_row_is_deleted_on_read() {
        let h = harness();
        let created = h.lifecycle.create(secret("stale")).await.unwrap();
        // A row left behind at its view ceiling, e.g. by an older writer.
        h.store
            .update_secret(
                &created.key,
                SecretUpdate {
                    current_views: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            h.lifecycle.status(&created.key).await,
            Err(LifecycleError::AlreadyViewed)
        ));
        assert!(h.store.get_secret_by_key(&created.key).await.unwrap().is_none());
    }

    async fn race_reveals(h: &Harness, max_views: i64, callers: usize) {
        let created = h
            .lifecycle
            .create(NewSecret { max_views, ..secret("only so many") })
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..callers {
            let lifecycle = h.lifecycle.clone();
            let key = created.key.clone();
            handles.push(tokio::spawn(async move {
                lifecycle.reveal(&key, None, None).await
            }));
        }

        let mut successes = 0;
        let mut losers = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(r) => {
                    assert_eq!(r.secret, "only so many");
                    successes += 1;
                }
                Err(LifecycleError::AlreadyViewed | LifecycleError::NotFound) => losers += 1,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert_eq!(successes, max_views as usize);
        assert_eq!(losers, callers - max_views as usize);
        assert!(h.store.get_secret_by_key(&created.key).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reveals_succeed_at_most_max_views_times() {
        let h = harness();
        race_reveals(&h, 1, 8).await;
        race_reveals(&h, 3, 10).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reveals_on_redb() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(&dir.path().join("race.db")).unwrap();
        let h = harness_with(Arc::new(store));
        race_reveals(&h, 1, 6).await;
        race_reveals(&h, 2, 6).await;
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_rows() {
        let h = harness();
        let short = h
            .lifecycle
            .create(NewSecret { ttl_seconds: 60, ..secret("a") })
            .await
            .unwrap();
        let long = h
            .lifecycle
            .create(NewSecret { ttl_seconds: 3600, ..secret("b") })
            .await
            .unwrap();

        h.clock.advance(ChronoDuration::seconds(120));
        assert_eq!(h.lifecycle.sweep().await.unwrap(), 1);
        assert!(h.store.get_secret_by_key(&short.key).await.unwrap().is_none());
        assert!(h.store.get_secret_by_key(&long.key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn slow_store_surfaces_as_unavailable() {
        let crypto = CryptoEngine::new("k").unwrap();
        let lifecycle = Lifecycle::new(
            Arc::new(HangingStore),
            Arc::new(crypto),
            Arc::new(ManualClock::default()),
            LifecycleConfig {
                base_url: "http://localhost".into(),
                store_timeout: Duration::from_millis(50),
            },
        );
        assert!(matches!(
            lifecycle.status("anything").await,
            Err(LifecycleError::StoreUnavailable)
        ));
        assert!(matches!(
            lifecycle.create(secret("x")).await,
            Err(LifecycleError::StoreUnavailable)
        ));
    }

    #[tokio::test]
    async fn late_reveal_leaves_secret_for_retry() {
        let faulty = Arc::new(FaultyStore {
            first_consume_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let h = harness_timed(faulty.clone(), Duration::from_millis(50));
        let created = h.lifecycle.create(secret("one shot")).await.unwrap();

        assert!(matches!(
            h.lifecycle.reveal(&created.key, None, None).await,
            Err(LifecycleError::StoreUnavailable)
        ));
        let record = faulty
            .inner
            .get_secret_by_key(&created.key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.current_views, 0);
        assert_eq!(
            h.lifecycle.metadata(&created.key).await.unwrap().unwrap().state,
            SecretState::New
        );

        let revealed = h.lifecycle.reveal(&created.key, None, None).await.unwrap();
        assert_eq!(revealed.secret, "one shot");
        assert_eq!(revealed.views_remaining, 0);
    }

    #[tokio::test]
    async fn failed_metadata_insert_rolls_back_secret() {
        let faulty = Arc::new(FaultyStore {
            fail_metadata_insert: true,
            ..Default::default()
        });
        let h = harness_with(faulty.clone());

        assert!(matches!(
            h.lifecycle.create(secret("orphan")).await,
            Err(LifecycleError::Internal(_))
        ));
        // Everything is expired a month out, so prune lists every remaining row.
        let leftovers = faulty
            .inner
            .prune(h.clock.now() + ChronoDuration::days(30))
            .await
            .unwrap();
        assert!(leftovers.is_empty(), "orphaned rows: {leftovers:?}");
    }

    #[test]
    fn email_check() {
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("@b.co"));
        assert!(!is_valid_email("a@@b.co"));
        assert!(!is_valid_email("a b@c.co"));
        assert!(!is_valid_email("a@b..co"));
    }
}
