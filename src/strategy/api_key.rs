use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{latest_live, revoke_all, ApiKeyInput, ApiKeyStrategy};
use crate::credentials::{CredentialInput, CredentialStore, CredentialType, PayloadSchema};
use crate::error::{AuthError, Result};
use crate::registry::{normalize_provider_id, GATEWAY_PROVIDER};

/// Encrypted payload of an `api_key` record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyPayload {
    pub api_key: String,
}

impl PayloadSchema for ApiKeyPayload {
    fn check(&self) -> std::result::Result<(), String> {
        if self.api_key.trim().is_empty() {
            return Err("apiKey is empty".to_string());
        }
        Ok(())
    }
}

/// Provider-specific key shape
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyFormat {
    /// Key must start with one of these and continue past it
    pub prefixes: Vec<String>,
}

impl KeyFormat {
    pub fn prefixed(prefixes: &[&str]) -> Self {
        Self {
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn accepts(&self, key: &str) -> bool {
        self.prefixes.is_empty()
            || self
                .prefixes
                .iter()
                .any(|p| key.len() > p.len() && key.starts_with(p.as_str()))
    }
}

/// API keys stored as encrypted `api_key` records
pub struct StoreApiKeyStrategy {
    store: Arc<CredentialStore>,
    formats: HashMap<String, KeyFormat>,
}

impl StoreApiKeyStrategy {
    /// Default strategy; knows the gateway's `rk_live_` / `rk_test_` format.
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self {
            store,
            formats: HashMap::new(),
        }
        .with_format(GATEWAY_PROVIDER, KeyFormat::prefixed(&["rk_live_", "rk_test_"]))
    }

    pub fn with_format(mut self, provider: &str, format: KeyFormat) -> Self {
        self.formats.insert(normalize_provider_id(provider), format);
        self
    }
}

#[async_trait]
impl ApiKeyStrategy for StoreApiKeyStrategy {
    fn validate(&self, input: &ApiKeyInput) -> Result<String> {
        let provider = normalize_provider_id(&input.provider);
        if provider.is_empty() {
            return Err(AuthError::validation("provider must not be empty"));
        }

        let key = input.key.trim();
        if key.is_empty() {
            return Err(AuthError::validation("API key must not be empty"));
        }
        if key.chars().any(char::is_whitespace) {
            return Err(AuthError::validation("API key must not contain whitespace"));
        }

        if let Some(format) = self.formats.get(&provider) {
            if !format.accepts(key) {
                return Err(AuthError::validation(format!(
                    "API key for '{}' must start with {}",
                    provider,
                    format.prefixes.join(" or ")
                )));
            }
        }

        Ok(key.to_string())
    }

    async fn store(&self, provider: &str, key: &str) -> Result<()> {
        let payload = serde_json::to_value(ApiKeyPayload {
            api_key: key.to_string(),
        })?;

        let mut input = CredentialInput::new(provider, CredentialType::ApiKey, payload)
            .with_metadata("keyHint", key_hint(key));
        if let Some(existing) = latest_live(&self.store, provider, CredentialType::ApiKey).await? {
            input = input.with_id(existing.id);
        }

        self.store.set(input).await?;
        Ok(())
    }

    async fn retrieve(&self, provider: &str) -> Result<Option<String>> {
        match latest_live(&self.store, provider, CredentialType::ApiKey).await? {
            Some(record) => {
                let payload: ApiKeyPayload = self.store.decrypt_payload(&record).await?;
                Ok(Some(payload.api_key))
            }
            None => Ok(None),
        }
    }

    async fn revoke(&self, provider: &str) -> Result<bool> {
        revoke_all(&self.store, provider, CredentialType::ApiKey).await
    }
}

/// Last four characters, enough to tell keys apart in a UI.
fn key_hint(key: &str) -> String {
    let count = key.chars().count();
    if count <= 8 {
        return "...".to_string();
    }
    let tail: String = key.chars().skip(count - 4).collect();
    format!("...{}", tail)
}
