//! Provider registry - capabilities of every backend this client can talk to.
//!
//! The registry is an external collaborator: the orchestrator only reads
//! `requires_auth`, `auth_modes`, `env_vars`, `base_url`, `user_configurable`
//! and the optional OAuth configuration. [`StaticProviderRegistry`] is the
//! in-memory implementation, seeded with the built-in gateway provider.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::oauth::OAuthProviderConfig;

/// Built-in gateway provider id
pub const GATEWAY_PROVIDER: &str = "reins-gateway";

/// Authentication method a provider accepts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::ApiKey => write!(f, "api_key"),
            AuthMode::OAuth => write!(f, "oauth"),
        }
    }
}

/// Everything the auth layer needs to know about one provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderDefinition {
    /// Normalized provider id (lowercase)
    pub id: String,

    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default = "default_requires_auth")]
    pub requires_auth: bool,

    #[serde(default)]
    pub auth_modes: Vec<AuthMode>,

    /// Environment variables the provider reads credentials from
    #[serde(default)]
    pub env_vars: Vec<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    /// Whether users may configure credentials for this provider themselves
    #[serde(default = "default_user_configurable")]
    pub user_configurable: bool,

    #[serde(default)]
    pub oauth: Option<OAuthProviderConfig>,
}

fn default_requires_auth() -> bool {
    true
}

fn default_user_configurable() -> bool {
    true
}

impl ProviderDefinition {
    pub fn supports(&self, mode: AuthMode) -> bool {
        self.auth_modes.contains(&mode)
    }

    /// The built-in gateway: API key only, `rk_live_*` / `rk_test_*` keys.
    pub fn gateway() -> Self {
        Self {
            id: GATEWAY_PROVIDER.to_string(),
            display_name: Some("Reins Gateway".to_string()),
            requires_auth: true,
            auth_modes: vec![AuthMode::ApiKey],
            env_vars: vec!["REINS_GATEWAY_API_KEY".to_string()],
            base_url: Some("https://gateway.reins.dev".to_string()),
            user_configurable: true,
            oauth: None,
        }
    }
}

/// Source of provider capabilities
pub trait ProviderRegistry: Send + Sync {
    /// Looks up a provider by normalized id.
    fn get(&self, provider: &str) -> Option<ProviderDefinition>;

    /// All known providers, ordered by id.
    fn list(&self) -> Vec<ProviderDefinition>;
}

/// In-memory registry keyed by normalized provider id.
#[derive(Clone, Debug, Default)]
pub struct StaticProviderRegistry {
    providers: BTreeMap<String, ProviderDefinition>,
}

impl StaticProviderRegistry {
    /// Empty registry (no built-ins).
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry containing the built-in gateway provider.
    pub fn with_builtins() -> Self {
        Self::new().with_provider(ProviderDefinition::gateway())
    }

    /// Adds or replaces a provider definition. The id is normalized on insert.
    pub fn with_provider(mut self, mut definition: ProviderDefinition) -> Self {
        definition.id = normalize_provider_id(&definition.id);
        self.providers.insert(definition.id.clone(), definition);
        self
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl ProviderRegistry for StaticProviderRegistry {
    fn get(&self, provider: &str) -> Option<ProviderDefinition> {
        self.providers.get(&normalize_provider_id(provider)).cloned()
    }

    fn list(&self) -> Vec<ProviderDefinition> {
        self.providers.values().cloned().collect()
    }
}

/// Trims and lowercases a provider or account id.
pub fn normalize_provider_id(raw: &str) -> String {
    raw.trim().to_lowercase()
}
