use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::error::{AuthError, Result};
use crate::oauth::CallbackServerOptions;
use crate::registry::{normalize_provider_id, ProviderDefinition, StaticProviderRegistry};

/// Complete auth configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub oauth: OAuthFlowConfig,
    /// Merged over the built-in providers
    #[serde(default)]
    pub providers: Vec<ProviderDefinition>,
}

/// Credential store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Environment variable holding the store secret
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".reins"))
        .unwrap_or_else(|| PathBuf::from(".reins"))
        .join("credentials.enc")
}

fn default_secret_env() -> String {
    "REINS_CREDENTIAL_SECRET".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            secret_env: default_secret_env(),
        }
    }
}

/// OAuth flow timing
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthFlowConfig {
    /// Refresh tokens this long before they expire
    #[serde(default = "default_refresh_buffer")]
    pub refresh_buffer_seconds: i64,
    /// Bounds both the callback wait and the listener lifetime
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_seconds: u64,
    #[serde(default = "default_callback_path")]
    pub callback_path: String,
    /// Unfinished flows older than this are pruned
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: i64,
}

/// Upper bound for `refresh_buffer_seconds` and `session_ttl_seconds` (one day)
const MAX_FLOW_SECONDS: i64 = 24 * 3600;

fn default_refresh_buffer() -> i64 {
    300
}

fn default_callback_timeout() -> u64 {
    300
}

fn default_callback_path() -> String {
    "/callback".to_string()
}

fn default_session_ttl() -> i64 {
    600
}

impl Default for OAuthFlowConfig {
    fn default() -> Self {
        Self {
            refresh_buffer_seconds: default_refresh_buffer(),
            callback_timeout_seconds: default_callback_timeout(),
            callback_path: default_callback_path(),
            session_ttl_seconds: default_session_ttl(),
        }
    }
}

impl OAuthFlowConfig {
    /// Clamped to `0..=1 day`.
    pub fn refresh_buffer(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.refresh_buffer_seconds.clamp(0, MAX_FLOW_SECONDS))
            .unwrap_or_else(chrono::Duration::zero)
    }

    /// Clamped to `0..=1 day`.
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.session_ttl_seconds.clamp(0, MAX_FLOW_SECONDS))
            .unwrap_or_else(chrono::Duration::zero)
    }

    /// Listener options; `port` is the provider's fixed callback port, if any.
    pub fn callback_options(&self, port: Option<u16>) -> CallbackServerOptions {
        CallbackServerOptions {
            port: port.unwrap_or(0),
            path: self.callback_path.clone(),
            timeout: Duration::from_secs(self.callback_timeout_seconds.clamp(1, MAX_FLOW_SECONDS as u64)),
            ..CallbackServerOptions::default()
        }
    }
}

impl AuthConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies `REINS_AUTH_*` overrides and per-provider OAuth client
    /// credentials (`REINS_OAUTH_<PROVIDER>_CLIENT_ID` / `_CLIENT_SECRET`).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("REINS_AUTH_STORE_PATH") {
            if !v.trim().is_empty() {
                self.store.path = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("REINS_AUTH_REFRESH_BUFFER_SECONDS") {
            if let Ok(n) = v.parse::<i64>() {
                self.oauth.refresh_buffer_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("REINS_AUTH_CALLBACK_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.oauth.callback_timeout_seconds = n;
            }
        }

        for provider in &mut self.providers {
            let Some(oauth) = provider.oauth.as_mut() else {
                continue;
            };
            let env_prefix = provider_env_prefix(&provider.id);
            if let Ok(client_id) = std::env::var(format!("REINS_OAUTH_{}_CLIENT_ID", env_prefix)) {
                oauth.client_id = client_id;
            }
            if let Ok(client_secret) = std::env::var(format!("REINS_OAUTH_{}_CLIENT_SECRET", env_prefix)) {
                oauth.client_secret = Some(client_secret);
            }
        }

        self
    }

    /// Built-in providers plus the configured ones (configured entries win).
    pub fn registry(&self) -> StaticProviderRegistry {
        self.providers
            .iter()
            .cloned()
            .fold(StaticProviderRegistry::with_builtins(), |registry, provider| {
                registry.with_provider(provider)
            })
    }

    /// Reads the store secret from the configured environment variable.
    pub fn resolve_secret(&self) -> Result<Zeroizing<String>> {
        match std::env::var(&self.store.secret_env) {
            Ok(secret) if !secret.is_empty() => Ok(Zeroizing::new(secret)),
            _ => Err(AuthError::validation(format!(
                "credential store secret is not set (export {})",
                self.store.secret_env
            ))),
        }
    }
}

/// `acme-ai` -> `ACME_AI`
fn provider_env_prefix(provider: &str) -> String {
    normalize_provider_id(provider)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// Load configuration from a TOML file, then apply environment overrides.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<AuthConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read auth config {}", path.display()))?;
    let config: AuthConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse auth config {}", path.display()))?;
    Ok(config.with_env_overrides())
}
