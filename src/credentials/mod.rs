//! Encrypted credential repository.
//!
//! Records for every provider live in one file. The file is a single
//! [`EncryptedPayload`] whose plaintext is the whole [`CredentialStoreState`]
//! as camelCase JSON; each record additionally carries its own encrypted
//! payload (API key, OAuth tokens, ...).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - set / get / list / revoke             │
//! │  - typed payload decryption              │
//! │  - sync envelope (checksum, version)     │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt + schema check)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       crypto                             │
//! │  - AES-256-GCM, PBKDF2 key derivation    │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       credentials.enc (0600, dir 0700)   │
//! │  - temp file + fsync + rename            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use reins_auth::credentials::{CredentialInput, CredentialQuery, CredentialStore, CredentialType};
//!
//! # async fn run() -> reins_auth::Result<()> {
//! let store = CredentialStore::new("/tmp/reins/credentials.enc", "correct horse")?;
//!
//! let record = store
//!     .set(CredentialInput::new(
//!         "acme",
//!         CredentialType::ApiKey,
//!         serde_json::json!({ "apiKey": "sk-123" }),
//!     ))
//!     .await?;
//!
//! let found = store.get(&CredentialQuery::default().provider("acme")).await?;
//! assert_eq!(found.map(|r| r.id), Some(record.id.clone()));
//!
//! store.revoke(&record.id).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::EncryptedPayload;
use crate::error::Result;
use crate::registry::normalize_provider_id;

mod checksum;
mod schema;
mod storage;


pub use checksum::{record_checksum, state_checksum};
pub use schema::SchemaViolation;
pub use storage::CredentialStore;

/// Store-state format version
pub const STORE_VERSION: u32 = 1;

/// Account used when the caller does not name one
pub const DEFAULT_ACCOUNT: &str = "default";

/// Kind of secret a record holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
    Token,
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialType::ApiKey => write!(f, "api_key"),
            CredentialType::OAuth => write!(f, "oauth"),
            CredentialType::Token => write!(f, "token"),
        }
    }
}

/// Per-record sync metadata. Excluded from checksums.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSync {
    pub version: u64,
    pub checksum: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl RecordSync {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            version: 0,
            checksum: String::new(),
            updated_at: now,
            synced_at: None,
        }
    }
}

/// One stored credential
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub id: String,

    /// Normalized provider id
    pub provider: String,

    #[serde(rename = "type")]
    pub credential_type: CredentialType,

    /// Normalized account id, `default` unless the caller names one
    pub account_id: String,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    pub encrypted_payload: EncryptedPayload,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,

    pub sync: RecordSync,
}

impl CredentialRecord {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Recomputes the record checksum, bumping the sync version on change.
    fn refresh_sync(&mut self, now: DateTime<Utc>) -> Result<()> {
        let checksum = record_checksum(self)?;
        if checksum != self.sync.checksum {
            self.sync.version += 1;
            self.sync.checksum = checksum;
            self.sync.updated_at = now;
        }
        Ok(())
    }
}

/// Store-wide sync metadata consumed by the sync client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    /// Bumped only when `checksum` changes
    pub version: u64,

    /// SHA-256 (hex) over the id-sorted records, sync fields excluded
    pub checksum: String,

    /// Moves only when `checksum` changes
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

/// Full decrypted contents of the store file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStoreState {
    pub version: u32,
    pub records: BTreeMap<String, CredentialRecord>,
    pub envelope: SyncEnvelope,
}

impl CredentialStoreState {
    /// Initialized state with no records
    pub fn empty() -> Result<Self> {
        let records = BTreeMap::new();
        let checksum = state_checksum(&records)?;
        Ok(Self {
            version: STORE_VERSION,
            records,
            envelope: SyncEnvelope {
                version: 0,
                checksum,
                updated_at: Utc::now(),
                synced_at: None,
            },
        })
    }
}

/// Input to [`CredentialStore::set`]
#[derive(Clone, Debug)]
pub struct CredentialInput {
    /// Existing record to replace; a `cred_<uuid>` id is generated when absent
    pub id: Option<String>,
    pub provider: String,
    pub credential_type: CredentialType,
    pub account_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Plaintext payload, encrypted before it touches disk
    pub payload: serde_json::Value,
}

impl CredentialInput {
    pub fn new(
        provider: impl Into<String>,
        credential_type: CredentialType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            provider: provider.into(),
            credential_type,
            account_id: None,
            metadata: BTreeMap::new(),
            payload,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Filter for [`CredentialStore::get`] and [`CredentialStore::list`]
#[derive(Clone, Debug, Default)]
pub struct CredentialQuery {
    pub id: Option<String>,
    pub provider: Option<String>,
    pub credential_type: Option<CredentialType>,
    pub account_id: Option<String>,
    pub include_revoked: bool,
}

impl CredentialQuery {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn credential_type(mut self, credential_type: CredentialType) -> Self {
        self.credential_type = Some(credential_type);
        self
    }

    pub fn account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn include_revoked(mut self) -> Self {
        self.include_revoked = true;
        self
    }

    pub(crate) fn matches(&self, record: &CredentialRecord) -> bool {
        if !self.include_revoked && record.is_revoked() {
            return false;
        }
        if let Some(id) = &self.id {
            if record.id != id.trim() {
                return false;
            }
        }
        if let Some(provider) = &self.provider {
            if record.provider != normalize_provider_id(provider) {
                return false;
            }
        }
        if let Some(credential_type) = self.credential_type {
            if record.credential_type != credential_type {
                return false;
            }
        }
        if let Some(account_id) = &self.account_id {
            if record.account_id != normalize_provider_id(account_id) {
                return false;
            }
        }
        true
    }
}

/// Most recently updated record, later entries winning ties.
pub fn latest(records: &[CredentialRecord]) -> Option<&CredentialRecord> {
    records.iter().max_by_key(|r| r.updated_at)
}

/// Shape check applied to a decrypted payload before it is handed out.
pub trait PayloadSchema {
    fn check(&self) -> std::result::Result<(), String>;
}

impl PayloadSchema for serde_json::Value {
    fn check(&self) -> std::result::Result<(), String> {
        if self.is_null() {
            return Err("payload is null".to_string());
        }
        Ok(())
    }
}
