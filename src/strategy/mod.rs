//! Per-provider authentication strategies.
//!
//! The orchestrator never touches the credential store directly; it asks
//! [`AuthStrategies`] for the strategy that handles a provider and mode.
//! Providers get the store-backed defaults unless an override is registered.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::credentials::{latest, CredentialQuery, CredentialRecord, CredentialStore, CredentialType};
use crate::error::{AuthError, Result};
use crate::oauth::OAuthTokens;
use crate::registry::{normalize_provider_id, AuthMode, ProviderDefinition};

mod api_key;
mod exchange;
mod oauth;

pub use api_key::{ApiKeyPayload, KeyFormat, StoreApiKeyStrategy};
pub use exchange::{CodeExchangeRequest, HttpTokenExchanger, TokenExchanger};
pub use oauth::StoreOAuthStrategy;

/// API key submitted for a provider
#[derive(Clone, Debug)]
pub struct ApiKeyInput {
    pub provider: String,
    pub key: String,
}

/// API-key lifecycle for one provider
#[async_trait]
pub trait ApiKeyStrategy: Send + Sync {
    /// Returns the canonical key or a validation error.
    fn validate(&self, input: &ApiKeyInput) -> Result<String>;

    /// Persists an already validated key.
    async fn store(&self, provider: &str, key: &str) -> Result<()>;

    async fn retrieve(&self, provider: &str) -> Result<Option<String>>;

    /// Returns `false` when there was nothing to revoke.
    async fn revoke(&self, provider: &str) -> Result<bool>;
}

#[derive(Clone, Debug)]
pub struct OAuthInitiateContext {
    pub provider: ProviderDefinition,
    /// Redirect the provider should use; set when the local listener is running
    pub redirect_uri: Option<String>,
    /// Replaces the provider's declared scopes
    pub scopes: Option<Vec<String>>,
}

#[derive(Clone, Debug)]
pub struct OAuthCallbackContext {
    pub provider: ProviderDefinition,
    pub code: String,
    pub state: String,
    pub code_verifier: Option<String>,
    pub redirect_uri: Option<String>,
}

#[derive(Clone, Debug)]
pub struct OAuthRefreshContext {
    pub provider: ProviderDefinition,
    pub tokens: OAuthTokens,
}

/// Authorization-code flow waiting on the user
#[derive(Clone, Debug)]
pub struct CodeFlowInitiation {
    pub authorization_url: String,
    pub state: String,
    pub code_verifier: Option<String>,
    pub redirect_uri: Option<String>,
}

/// Result of starting an OAuth flow
#[derive(Clone, Debug)]
pub enum OAuthInitiation {
    /// User must authorize in a browser, then the callback completes the flow
    CodeFlow(CodeFlowInitiation),
    /// Tokens issued without a redirect (device or token-paste flows)
    Direct(OAuthTokens),
}

/// OAuth lifecycle for one provider
#[async_trait]
pub trait OAuthStrategy: Send + Sync {
    async fn initiate(&self, context: &OAuthInitiateContext) -> Result<OAuthInitiation>;

    /// Exchanges the authorization code for tokens. Does not persist them.
    async fn handle_callback(&self, context: &OAuthCallbackContext) -> Result<OAuthTokens>;

    /// Exchanges the refresh token in `context.tokens`. Does not persist.
    async fn refresh(&self, context: &OAuthRefreshContext) -> Result<OAuthTokens>;

    async fn store_tokens(&self, provider: &str, tokens: &OAuthTokens) -> Result<()>;

    async fn retrieve_tokens(&self, provider: &str) -> Result<Option<OAuthTokens>>;

    async fn revoke(&self, provider: &str) -> Result<bool>;
}

/// Strategy lookup: per-provider overrides over store-backed defaults
pub struct AuthStrategies {
    default_api_key: Arc<dyn ApiKeyStrategy>,
    default_oauth: Arc<dyn OAuthStrategy>,
    api_key_overrides: HashMap<String, Arc<dyn ApiKeyStrategy>>,
    oauth_overrides: HashMap<String, Arc<dyn OAuthStrategy>>,
}

impl AuthStrategies {
    /// Store-backed defaults with the generic HTTP token exchanger.
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self::with_defaults(
            Arc::new(StoreApiKeyStrategy::new(Arc::clone(&store))),
            Arc::new(StoreOAuthStrategy::new(store)),
        )
    }

    pub fn with_defaults(
        default_api_key: Arc<dyn ApiKeyStrategy>,
        default_oauth: Arc<dyn OAuthStrategy>,
    ) -> Self {
        Self {
            default_api_key,
            default_oauth,
            api_key_overrides: HashMap::new(),
            oauth_overrides: HashMap::new(),
        }
    }

    pub fn with_api_key_strategy(mut self, provider: &str, strategy: Arc<dyn ApiKeyStrategy>) -> Self {
        self.api_key_overrides
            .insert(normalize_provider_id(provider), strategy);
        self
    }

    pub fn with_oauth_strategy(mut self, provider: &str, strategy: Arc<dyn OAuthStrategy>) -> Self {
        self.oauth_overrides
            .insert(normalize_provider_id(provider), strategy);
        self
    }

    /// API-key strategy for `definition`, if it declares the mode.
    pub fn api_key_for(&self, definition: &ProviderDefinition) -> Result<Arc<dyn ApiKeyStrategy>> {
        ensure_mode(definition, AuthMode::ApiKey)?;
        Ok(self
            .api_key_overrides
            .get(&definition.id)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_api_key)))
    }

    /// OAuth strategy for `definition`, if it declares the mode.
    pub fn oauth_for(&self, definition: &ProviderDefinition) -> Result<Arc<dyn OAuthStrategy>> {
        ensure_mode(definition, AuthMode::OAuth)?;
        Ok(self
            .oauth_overrides
            .get(&definition.id)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_oauth)))
    }
}

fn ensure_mode(definition: &ProviderDefinition, mode: AuthMode) -> Result<()> {
    if definition.supports(mode) {
        Ok(())
    } else {
        Err(AuthError::UnsupportedAuthMode {
            provider: definition.id.clone(),
            mode,
        })
    }
}

/// Most recently updated live record of `credential_type` for `provider`.
pub(crate) async fn latest_live(
    store: &CredentialStore,
    provider: &str,
    credential_type: CredentialType,
) -> Result<Option<CredentialRecord>> {
    let records = store
        .list(
            &CredentialQuery::default()
                .provider(provider)
                .credential_type(credential_type),
        )
        .await?;
    Ok(latest(&records).cloned())
}

/// Revokes every live record of `credential_type` for `provider`.
pub(crate) async fn revoke_all(
    store: &CredentialStore,
    provider: &str,
    credential_type: CredentialType,
) -> Result<bool> {
    let records = store
        .list(
            &CredentialQuery::default()
                .provider(provider)
                .credential_type(credential_type),
        )
        .await?;

    let mut revoked = false;
    for record in records {
        revoked |= store.revoke(&record.id).await?;
    }
    Ok(revoked)
}
