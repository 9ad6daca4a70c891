//! Validation of decrypted store state before anything reads it.

use std::fmt;

use super::{CredentialRecord, CredentialStoreState, STORE_VERSION};
use crate::crypto::PAYLOAD_VERSION;
use crate::registry::normalize_provider_id;

/// First rule a decrypted state breaks
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Offending record key, if the violation is record-level
    pub record: Option<String>,
    pub message: String,
}

impl SchemaViolation {
    fn state(message: impl Into<String>) -> Self {
        Self {
            record: None,
            message: message.into(),
        }
    }

    fn record(key: &str, message: impl Into<String>) -> Self {
        Self {
            record: Some(key.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.record {
            Some(key) => write!(f, "record '{}': {}", key, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

pub(crate) fn validate_state(state: &CredentialStoreState) -> Result<(), SchemaViolation> {
    if state.version != STORE_VERSION {
        return Err(SchemaViolation::state(format!(
            "unsupported store version {} (expected {})",
            state.version, STORE_VERSION
        )));
    }

    if !is_hex_digest(&state.envelope.checksum) {
        return Err(SchemaViolation::state("envelope checksum is not a SHA-256 hex digest"));
    }

    for (key, record) in &state.records {
        validate_record(key, record)?;
    }

    Ok(())
}

fn validate_record(key: &str, record: &CredentialRecord) -> Result<(), SchemaViolation> {
    if record.id.trim().is_empty() {
        return Err(SchemaViolation::record(key, "id is empty"));
    }
    if record.id != key {
        return Err(SchemaViolation::record(
            key,
            format!("id '{}' does not match its key", record.id),
        ));
    }

    check_normalized(key, "provider", &record.provider)?;
    check_normalized(key, "accountId", &record.account_id)?;

    if record.metadata.keys().any(|k| k.trim().is_empty()) {
        return Err(SchemaViolation::record(key, "metadata contains an empty key"));
    }

    let payload = &record.encrypted_payload;
    if payload.v != PAYLOAD_VERSION {
        return Err(SchemaViolation::record(
            key,
            format!("unsupported payload version {}", payload.v),
        ));
    }
    if payload.salt.is_empty() || payload.iv.is_empty() || payload.ciphertext.is_empty() {
        return Err(SchemaViolation::record(key, "encrypted payload has empty fields"));
    }

    if record.updated_at < record.created_at {
        return Err(SchemaViolation::record(key, "updatedAt precedes createdAt"));
    }
    if let Some(revoked_at) = record.revoked_at {
        if revoked_at < record.created_at {
            return Err(SchemaViolation::record(key, "revokedAt precedes createdAt"));
        }
    }

    if record.sync.version == 0 || !is_hex_digest(&record.sync.checksum) {
        return Err(SchemaViolation::record(key, "sync metadata is incomplete"));
    }

    Ok(())
}

fn check_normalized(key: &str, field: &str, value: &str) -> Result<(), SchemaViolation> {
    if value.is_empty() {
        return Err(SchemaViolation::record(key, format!("{} is empty", field)));
    }
    if normalize_provider_id(value) != value {
        return Err(SchemaViolation::record(
            key,
            format!("{} '{}' is not normalized", field, value),
        ));
    }
    Ok(())
}

fn is_hex_digest(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}
