use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored in redb as bincode-encoded bytes.
/// `encrypted_content` is the base64 envelope produced by `CryptoEngine::encrypt`.
/// All lifecycle fields are plaintext so expiry and view checks never decrypt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretRecord {
    /// Store-assigned row id.
    pub id: u64,
    /// Public URL-safe identifier.
    pub key: String,
    pub encrypted_content: String,
    pub has_passphrase: bool,
    /// Hex SHA-256 of the passphrase; `Some` iff `has_passphrase`.
    pub passphrase_hash: Option<String>,
    pub max_views: u32,
    pub current_views: u32,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub created_ip: Option<String>,
    pub viewed_ip: Option<String>,
    /// Informational only; nothing is ever sent to it.
    pub recipient_email: Option<String>,
}

impl SecretRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_views >= self.max_views
    }

    /// A row that fails this check must be deleted, not kept.
    pub fn is_viewable(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && !self.is_exhausted()
    }

    pub fn views_remaining(&self) -> u32 {
        self.max_views.saturating_sub(self.current_views)
    }

    /// Count one view if the record is still viewable at `now`.
    ///
    /// Callers must hold whatever exclusive access their backend provides for the
    /// whole read-check-write sequence; this only does the arithmetic.
    pub fn try_consume(&mut self, now: DateTime<Utc>, ip: Option<&str>) -> ConsumeOutcome {
        if self.is_expired(now) {
            return ConsumeOutcome::Expired;
        }
        if self.is_exhausted() {
            return ConsumeOutcome::Exhausted;
        }

        self.current_views += 1;
        self.viewed_at = Some(now);
        self.viewed_ip = ip.map(str::to_owned);

        ConsumeOutcome::Consumed(ViewReceipt {
            current_views: self.current_views,
            max_views: self.max_views,
            expires_at: self.expires_at,
            destroyed: self.is_exhausted(),
        })
    }

    /// Apply a plain field update. View counts only move forward and never
    /// past `max_views`.
    pub fn apply(&mut self, update: SecretUpdate) {
        if let Some(views) = update.current_views {
            if views > self.current_views {
                self.current_views = views.min(self.max_views);
            }
        }
        if let Some(at) = update.viewed_at {
            self.viewed_at = Some(at);
        }
        if let Some(ip) = update.viewed_ip {
            self.viewed_ip = Some(ip);
        }
    }
}

/// Everything needed to insert a secret; the store assigns `id`.
#[derive(Debug, Clone)]
pub struct NewSecretRecord {
    pub key: String,
    pub encrypted_content: String,
    pub passphrase_hash: Option<String>,
    pub max_views: u32,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub created_ip: Option<String>,
    pub recipient_email: Option<String>,
}

impl NewSecretRecord {
    pub fn into_record(self, id: u64) -> SecretRecord {
        SecretRecord {
            id,
            key: self.key,
            encrypted_content: self.encrypted_content,
            has_passphrase: self.passphrase_hash.is_some(),
            passphrase_hash: self.passphrase_hash,
            max_views: self.max_views,
            current_views: 0,
            expires_at: self.expires_at,
            created_at: self.created_at,
            viewed_at: None,
            created_ip: self.created_ip,
            viewed_ip: None,
            recipient_email: self.recipient_email,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SecretUpdate {
    pub current_views: Option<u32>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub viewed_ip: Option<String>,
}

/// Lifecycle state of a key. Ordered so that progress is `New < Viewed < Destroyed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretState {
    New,
    Viewed,
    Destroyed,
}

impl SecretState {
    /// Move towards `next`; a regression leaves the state unchanged.
    pub fn advance(self, next: SecretState) -> SecretState {
        self.max(next)
    }
}

/// Audit trail for a key. Outlives the secret row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretMetadata {
    pub secret_id: u64,
    pub key: String,
    pub state: SecretState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SecretMetadata {
    pub fn new(record: &SecretRecord) -> Self {
        Self {
            secret_id: record.id,
            key: record.key.clone(),
            state: SecretState::New,
            created_at: record.created_at,
            updated_at: record.created_at,
        }
    }

    /// Returns true if the state actually moved.
    pub fn advance(&mut self, next: SecretState, now: DateTime<Utc>) -> bool {
        let advanced = self.state.advance(next);
        if advanced == self.state {
            return false;
        }
        self.state = advanced;
        self.updated_at = now;
        true
    }
}

/// Result of one atomic conditional view.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    /// The view was counted. The row is gone if `receipt.destroyed`.
    Consumed(ViewReceipt),
    NotFound,
    /// Expired at the time of the call; the row has been deleted.
    Expired,
    /// Views were already used up; the row has been deleted.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewReceipt {
    pub current_views: u32,
    pub max_views: u32,
    pub expires_at: DateTime<Utc>,
    /// This view was the last one.
    pub destroyed: bool,
}

impl ViewReceipt {
    pub fn views_remaining(&self) -> u32 {
        self.max_views.saturating_sub(self.current_views)
    }
}
