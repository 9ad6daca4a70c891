//! File-backed encrypted credential store.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{
    schema, CredentialInput, CredentialQuery, CredentialRecord, CredentialStoreState,
    PayloadSchema, RecordSync, SyncEnvelope, DEFAULT_ACCOUNT,
};
use crate::crypto::{self, EncryptedPayload};
use crate::error::{AuthError, Result};
use crate::registry::normalize_provider_id;
use crate::telemetry::{AuthEvent, AuthEventSink, TracingEventSink};

/// Encrypted credential store backed by a single file.
///
/// # Concurrency
/// - Writes run `load -> mutate -> save` under an async write lock, so
///   concurrent `set()` calls on one instance never lose updates
/// - Reads decrypt the file without the lock; renames make them see either
///   the previous or the next state, never a partial one
///
/// # Security
/// - The secret stays in memory only and is zeroized on drop
/// - Directory `0700`, file `0600`, re-applied on every write
/// - A file that cannot be decrypted or validated is reported, never reset
pub struct CredentialStore {
    path: PathBuf,
    secret: Zeroizing<String>,
    write_lock: Mutex<()>,
    sink: Arc<dyn AuthEventSink>,
}

impl CredentialStore {
    /// Opens a store at `path`. Nothing is read until the first operation.
    ///
    /// # Arguments
    /// * `path` - Store file, created on first write
    /// * `secret` - Passphrase every key is derived from
    pub fn new(path: impl Into<PathBuf>, secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(AuthError::validation("credential store secret must not be empty"));
        }

        Ok(Self {
            path: path.into(),
            secret: Zeroizing::new(secret.to_string()),
            write_lock: Mutex::new(()),
            sink: Arc::new(TracingEventSink),
        })
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn AuthEventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates or replaces a credential and returns the stored record.
    ///
    /// Re-setting an id keeps its `createdAt` and clears `revokedAt`.
    pub async fn set(&self, input: CredentialInput) -> Result<CredentialRecord> {
        let provider = normalize_provider_id(&input.provider);
        if provider.is_empty() {
            return Err(AuthError::validation("provider must not be empty"));
        }

        let account_id = input
            .account_id
            .as_deref()
            .map(normalize_provider_id)
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| DEFAULT_ACCOUNT.to_string());

        let id = match input.id.as_deref().map(str::trim) {
            Some("") => return Err(AuthError::validation("credential id must not be empty")),
            Some(id) => id.to_string(),
            None => format!("cred_{}", Uuid::new_v4().simple()),
        };

        if input.payload.is_null() {
            return Err(AuthError::validation("credential payload must not be empty"));
        }

        let plaintext = Zeroizing::new(serde_json::to_string(&input.payload)?);
        let encrypted_payload = crypto::encrypt(&plaintext, &self.secret)?;

        let _guard = self.write_lock.lock().await;
        let mut state = self.load().await?;
        let now = Utc::now();

        let previous = state.records.get(&id);
        if let Some(existing) = previous {
            if existing.provider != provider {
                return Err(AuthError::validation(format!(
                    "credential '{}' belongs to provider '{}'",
                    id, existing.provider
                )));
            }
        }

        let created_at = previous.map(|r| r.created_at).unwrap_or(now);
        let sync = previous
            .map(|r| r.sync.clone())
            .unwrap_or_else(|| RecordSync::new(now));

        let mut record = CredentialRecord {
            id: id.clone(),
            provider,
            credential_type: input.credential_type,
            account_id,
            metadata: input.metadata,
            encrypted_payload,
            created_at,
            updated_at: now.max(created_at),
            revoked_at: None,
            sync,
        };
        record.refresh_sync(now)?;

        state.records.insert(id, record.clone());
        self.save(&mut state).await?;

        self.sink.record(AuthEvent::CredentialStored {
            id: record.id.clone(),
            provider: record.provider.clone(),
            credential_type: record.credential_type,
        });

        Ok(record)
    }

    /// First record matching `query`, in [`list`](Self::list) order.
    pub async fn get(&self, query: &CredentialQuery) -> Result<Option<CredentialRecord>> {
        Ok(self.list(query).await?.into_iter().next())
    }

    /// Records matching `query`, oldest first (ties broken by id).
    pub async fn list(&self, query: &CredentialQuery) -> Result<Vec<CredentialRecord>> {
        let state = self.load().await?;
        let mut records: Vec<CredentialRecord> = state
            .records
            .into_values()
            .filter(|r| query.matches(r))
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Marks a record revoked.
    ///
    /// Returns `false` when the record is missing or already revoked.
    pub async fn revoke(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.load().await?;
        let now = Utc::now();

        let Some(record) = state.records.get_mut(id.trim()) else {
            return Ok(false);
        };
        if record.is_revoked() {
            return Ok(false);
        }

        record.revoked_at = Some(now.max(record.created_at));
        record.updated_at = now.max(record.updated_at);
        record.refresh_sync(now)?;
        let event = AuthEvent::CredentialRevoked {
            id: record.id.clone(),
            provider: record.provider.clone(),
        };

        self.save(&mut state).await?;
        self.sink.record(event);
        Ok(true)
    }

    /// Decrypts a record's payload into `T` and checks its shape.
    pub async fn decrypt_payload<T>(&self, record: &CredentialRecord) -> Result<T>
    where
        T: DeserializeOwned + PayloadSchema,
    {
        let plaintext = Zeroizing::new(crypto::decrypt(&record.encrypted_payload, &self.secret)?);

        let payload: T = serde_json::from_str(&plaintext).map_err(|e| {
            AuthError::InvalidPayload(format!(
                "{} payload of '{}' is malformed: {}",
                record.credential_type, record.id, e
            ))
        })?;

        payload.check().map_err(|reason| {
            AuthError::InvalidPayload(format!(
                "{} payload of '{}': {}",
                record.credential_type, record.id, reason
            ))
        })?;

        Ok(payload)
    }

    /// Current sync envelope
    pub async fn envelope(&self) -> Result<SyncEnvelope> {
        Ok(self.load().await?.envelope)
    }

    /// Records a successful sync. Records and checksum are untouched.
    pub async fn mark_synced(&self, at: chrono::DateTime<Utc>) -> Result<SyncEnvelope> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.load().await?;
        state.envelope.synced_at = Some(at);
        self.save(&mut state).await?;
        Ok(state.envelope)
    }

    /// Reads and validates the store file. A missing file is an empty store.
    async fn load(&self) -> Result<CredentialStoreState> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Credential store not found, starting empty");
                return CredentialStoreState::empty();
            }
            Err(e) => return Err(AuthError::io("failed to read", &self.path, e)),
        };

        let payload: EncryptedPayload = serde_json::from_slice(&raw)
            .map_err(|e| self.corrupt("file is not an encrypted payload", Some(e.into())))?;

        let plaintext = Zeroizing::new(
            crypto::decrypt(&payload, &self.secret)
                .map_err(|e| self.corrupt("file could not be decrypted", Some(e)))?,
        );

        let state: CredentialStoreState = serde_json::from_str(&plaintext)
            .map_err(|e| self.corrupt("decrypted state is malformed", Some(e.into())))?;

        schema::validate_state(&state).map_err(|violation| self.corrupt(violation.to_string(), None))?;

        Ok(state)
    }

    /// Recomputes the envelope and writes the state atomically.
    async fn save(&self, state: &mut CredentialStoreState) -> Result<()> {
        let checksum = super::state_checksum(&state.records)?;
        if checksum != state.envelope.checksum {
            state.envelope.version += 1;
            state.envelope.checksum = checksum;
            state.envelope.updated_at = Utc::now();
        }

        let plaintext = Zeroizing::new(serde_json::to_string(state)?);
        let payload = crypto::encrypt(&plaintext, &self.secret)?;
        let bytes = serde_json::to_vec_pretty(&payload)?;

        self.write_atomic(&bytes).await
    }

    /// Temp file in the same directory, fsync, then rename over the target.
    async fn write_atomic(&self, bytes: &[u8]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        fs::create_dir_all(&dir)
            .await
            .map_err(|e| AuthError::io("failed to create directory", &dir, e))?;
        restrict_permissions(&dir, 0o700).await?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "credentials".to_string());
        let tmp_path = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

        if let Err(e) = write_synced(&tmp_path, bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&tmp_path, &self.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(AuthError::io("failed to replace", &self.path, e));
        }

        restrict_permissions(&self.path, 0o600).await
    }

    fn corrupt(&self, reason: impl Into<String>, source: Option<AuthError>) -> AuthError {
        let reason = reason.into();
        warn!(path = %self.path.display(), reason = %reason, "Credential store is unreadable; leaving file in place");
        AuthError::CorruptStore {
            path: self.path.clone(),
            reason,
            source: source.map(Box::new),
        }
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(path)
        .await
        .map_err(|e| AuthError::io("failed to create", path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| AuthError::io("failed to write", path, e))?;
    file.sync_all()
        .await
        .map_err(|e| AuthError::io("failed to sync", path, e))?;
    Ok(())
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| AuthError::io("failed to set permissions on", path, e))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
