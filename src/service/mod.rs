//! Provider auth orchestrator.
//!
//! [`ProviderAuthService`] is the one entry point surfaces talk to. It
//! resolves providers in the registry, picks the strategy for the requested
//! mode, runs OAuth flows (listener, pending session, exchange) and derives
//! per-provider status.
//!
//! # Concurrency
//! - Writes and token refreshes for one provider are serialized through a
//!   per-provider async lock (`DashMap<String, Arc<Mutex<()>>>`)
//! - Waiting for an OAuth callback does not hold that lock, so a second
//!   `initiate_oauth` can replace a flow that is still waiting
//! - Status reads never refresh tokens

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{AuthConfig, OAuthFlowConfig};
use crate::credentials::CredentialStore;
use crate::error::{AuthError, AuthErrorKind, ProtocolError, Result};
use crate::oauth::{
    validate_callback, CallbackParams, CallbackQuery, OAuthCallbackServer, OAuthTokens,
    PendingOAuthSession, PendingOAuthSessions,
};
use crate::registry::{normalize_provider_id, AuthMode, ProviderDefinition, ProviderRegistry};
use crate::strategy::{
    ApiKeyInput, AuthStrategies, OAuthCallbackContext, OAuthInitiateContext, OAuthInitiation,
    OAuthRefreshContext, OAuthStrategy,
};
use crate::telemetry::{AuthEvent, AuthEventSink, TracingEventSink};

mod command;
mod status;


pub use command::{
    AuthGuidance, CommandOutcome, CommandSource, ConfigureCredential, GuidanceAction,
    ProviderAuthCommandPayload, ProviderAuthCommandResult,
};
pub use status::{evaluate, ConnectionState, CredentialSnapshot, ProviderAuthStatus};

/// Options for [`ProviderAuthService::initiate_oauth`]
#[derive(Clone, Debug, Default)]
pub struct InitiateOAuthOptions {
    /// Skip the loopback listener (the user pastes the code back instead)
    pub disable_local_callback: bool,
    /// Redirect to use instead of the loopback listener
    pub redirect_uri: Option<String>,
    /// Replaces the provider's declared scopes
    pub scopes: Option<Vec<String>>,
}

/// Options for [`ProviderAuthService::complete_oauth_callback`]
#[derive(Clone, Debug, Default)]
pub struct CompleteOAuthOptions {
    /// Code supplied by the caller; when absent the pending listener is awaited
    pub code: Option<String>,
    /// Required with `code`, checked against the pending session
    pub state: Option<String>,
}

/// Authorization the user still has to grant in a browser
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAuthorization {
    pub provider: String,
    pub authorization_url: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    /// The loopback listener is waiting for the redirect
    pub local_callback: bool,
}

/// Result of [`ProviderAuthService::initiate_oauth`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OAuthStart {
    CodeFlow(PendingAuthorization),
    /// Tokens were issued without a redirect and are already stored
    Direct(ProviderAuthStatus),
}

/// Result of [`ProviderAuthService::revoke_provider`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeOutcome {
    /// At least one credential was revoked by this call
    pub revoked: bool,
    pub status: ProviderAuthStatus,
}

/// Credential status and auth lifecycle for every registered provider
pub struct ProviderAuthService {
    registry: Arc<dyn ProviderRegistry>,
    strategies: AuthStrategies,
    sessions: PendingOAuthSessions,
    settings: OAuthFlowConfig,
    provider_locks: DashMap<String, Arc<Mutex<()>>>,
    sink: Arc<dyn AuthEventSink>,
}

impl ProviderAuthService {
    pub fn new(
        registry: Arc<dyn ProviderRegistry>,
        strategies: AuthStrategies,
        settings: OAuthFlowConfig,
    ) -> Self {
        Self {
            registry,
            strategies,
            sessions: PendingOAuthSessions::new(settings.session_ttl()),
            settings,
            provider_locks: DashMap::new(),
            sink: Arc::new(TracingEventSink),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn AuthEventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Opens the configured store with the secret from the environment and
    /// wires the default strategies.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let secret = config.resolve_secret()?;
        let store = Arc::new(CredentialStore::new(config.store.path.clone(), &secret)?);

        info!(path = %config.store.path.display(), "Provider auth service initialized");

        Ok(Self::new(
            Arc::new(config.registry()),
            AuthStrategies::new(store),
            config.oauth.clone(),
        ))
    }

    /// Validates and stores an API key.
    pub async fn set_api_key(&self, provider: &str, key: &str) -> Result<ProviderAuthStatus> {
        let definition = self.definition(provider)?;
        ensure_configurable(&definition)?;
        let strategy = self.strategies.api_key_for(&definition)?;

        let key = strategy.validate(&ApiKeyInput {
            provider: definition.id.clone(),
            key: key.to_string(),
        })?;

        {
            let lock = self.provider_lock(&definition.id);
            let _guard = lock.lock().await;
            strategy.store(&definition.id, &key).await?;
        }

        self.status_for(&definition).await
    }

    /// Stores tokens obtained outside the redirect flow.
    pub async fn set_oauth_tokens(&self, provider: &str, tokens: OAuthTokens) -> Result<ProviderAuthStatus> {
        let definition = self.definition(provider)?;
        ensure_configurable(&definition)?;
        let strategy = self.strategies.oauth_for(&definition)?;

        {
            let lock = self.provider_lock(&definition.id);
            let _guard = lock.lock().await;
            strategy.store_tokens(&definition.id, &tokens).await?;
        }

        self.status_for(&definition).await
    }

    /// Starts an OAuth flow, replacing any flow already pending for the provider.
    pub async fn initiate_oauth(&self, provider: &str, options: InitiateOAuthOptions) -> Result<OAuthStart> {
        let definition = self.definition(provider)?;
        ensure_configurable(&definition)?;
        let strategy = self.strategies.oauth_for(&definition)?;

        let lock = self.provider_lock(&definition.id);
        let _guard = lock.lock().await;

        self.sessions.prune_expired().await;
        if self.sessions.take(&definition.id).await.is_some() {
            self.sink.record(AuthEvent::OAuthSessionReplaced {
                provider: definition.id.clone(),
            });
        }

        let declared = definition.oauth.as_ref();
        let use_listener = !options.disable_local_callback
            && options.redirect_uri.is_none()
            && declared.map(|c| c.local_callback).unwrap_or(true);

        let listener = if use_listener {
            let port = declared.and_then(|c| c.callback_port);
            let server = OAuthCallbackServer::start(self.settings.callback_options(port)).await?;
            Some(Arc::new(server))
        } else {
            None
        };

        let context = OAuthInitiateContext {
            provider: definition.clone(),
            redirect_uri: listener
                .as_ref()
                .map(|l| l.redirect_uri().to_string())
                .or(options.redirect_uri),
            scopes: options.scopes,
        };

        let initiation = match strategy.initiate(&context).await {
            Ok(initiation) => initiation,
            Err(e) => {
                if let Some(listener) = &listener {
                    listener.stop().await;
                }
                self.sink.record(AuthEvent::OAuthFailed {
                    provider: definition.id.clone(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        match initiation {
            OAuthInitiation::CodeFlow(flow) => {
                let redirect_uri = flow.redirect_uri.or(context.redirect_uri);
                let local_callback = listener.is_some();

                let session = PendingOAuthSession::new(&definition.id, &flow.state)
                    .with_code_verifier(flow.code_verifier)
                    .with_redirect_uri(redirect_uri.clone())
                    .with_listener(listener);
                self.sessions.insert(session).await;

                self.sink.record(AuthEvent::OAuthInitiated {
                    provider: definition.id.clone(),
                    local_callback,
                });

                Ok(OAuthStart::CodeFlow(PendingAuthorization {
                    provider: definition.id.clone(),
                    authorization_url: flow.authorization_url,
                    state: flow.state,
                    redirect_uri,
                    local_callback,
                }))
            }
            OAuthInitiation::Direct(tokens) => {
                if let Some(listener) = &listener {
                    listener.stop().await;
                }
                strategy.store_tokens(&definition.id, &tokens).await?;
                self.sink.record(AuthEvent::OAuthCompleted {
                    provider: definition.id.clone(),
                });
                Ok(OAuthStart::Direct(self.status_for(&definition).await?))
            }
        }
    }

    /// Finishes the pending flow: explicit code or the listener's callback,
    /// then exchange and store.
    ///
    /// The flow is claimed first, so a concurrent completion fails with
    /// `AlreadyAwaited` and leaves it alone. Once claimed, the session is
    /// cleared on every exit.
    pub async fn complete_oauth_callback(
        &self,
        provider: &str,
        options: CompleteOAuthOptions,
    ) -> Result<ProviderAuthStatus> {
        let definition = self.definition(provider)?;
        let strategy = self.strategies.oauth_for(&definition)?;

        // Only the caller that claims the flow may finish or clear it
        let session = self.sessions.claim(&definition.id).await?;

        let result = self
            .finish_flow(&definition, strategy.as_ref(), &session, options)
            .await;

        self.sessions
            .remove_if_current(&definition.id, session.id)
            .await;

        match &result {
            Ok(_) => self.sink.record(AuthEvent::OAuthCompleted {
                provider: definition.id.clone(),
            }),
            Err(e) => self.sink.record(AuthEvent::OAuthFailed {
                provider: definition.id.clone(),
                reason: e.to_string(),
            }),
        }

        result
    }

    async fn finish_flow(
        &self,
        definition: &ProviderDefinition,
        strategy: &dyn OAuthStrategy,
        session: &PendingOAuthSession,
        options: CompleteOAuthOptions,
    ) -> Result<ProviderAuthStatus> {
        let explicit_code = options.code.filter(|c| !c.trim().is_empty());

        let CallbackParams { code, state } = match (explicit_code, &session.listener) {
            (Some(code), _) => validate_callback(
                CallbackQuery {
                    code: Some(code),
                    state: options.state,
                    ..CallbackQuery::default()
                },
                &session.state,
            )?,
            (None, Some(listener)) => {
                debug!(provider = %definition.id, "Waiting for OAuth callback");
                listener.wait_for_callback(&session.state).await?
            }
            (None, None) => return Err(ProtocolError::MissingCode.into()),
        };

        let tokens = strategy
            .handle_callback(&OAuthCallbackContext {
                provider: definition.clone(),
                code,
                state,
                code_verifier: session.code_verifier.clone(),
                redirect_uri: session.redirect_uri.clone(),
            })
            .await?;

        {
            let lock = self.provider_lock(&definition.id);
            let _guard = lock.lock().await;
            strategy.store_tokens(&definition.id, &tokens).await?;
        }

        self.status_for(definition).await
    }

    /// Current access token, refreshed and persisted first when it is inside
    /// the refresh buffer.
    pub async fn get_oauth_access_token(&self, provider: &str) -> Result<String> {
        let definition = self.definition(provider)?;
        let strategy = self.strategies.oauth_for(&definition)?;
        let buffer = self.settings.refresh_buffer();

        let tokens = strategy
            .retrieve_tokens(&definition.id)
            .await?
            .ok_or_else(|| AuthError::NotConfigured(definition.id.clone()))?;
        if !tokens.needs_refresh(Utc::now(), buffer) {
            return Ok(tokens.access_token);
        }

        let lock = self.provider_lock(&definition.id);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited
        let current = strategy
            .retrieve_tokens(&definition.id)
            .await?
            .ok_or_else(|| AuthError::NotConfigured(definition.id.clone()))?;
        if !current.needs_refresh(Utc::now(), buffer) {
            return Ok(current.access_token);
        }
        if !current.has_refresh_token() {
            return Err(ProtocolError::MissingRefreshToken(definition.id.clone()).into());
        }

        let mut refreshed = strategy
            .refresh(&OAuthRefreshContext {
                provider: definition.clone(),
                tokens: current.clone(),
            })
            .await?;

        // Keep the existing refresh token if the provider did not rotate it
        let rotated = refreshed.has_refresh_token() && refreshed.refresh_token != current.refresh_token;
        if !refreshed.has_refresh_token() {
            refreshed.refresh_token = current.refresh_token.clone();
        }
        if refreshed.scope.is_none() {
            refreshed.scope = current.scope.clone();
        }

        strategy.store_tokens(&definition.id, &refreshed).await?;
        self.sink.record(AuthEvent::TokenRefreshed {
            provider: definition.id.clone(),
            rotated,
        });

        Ok(refreshed.access_token)
    }

    /// Status of every registered provider, ordered by id.
    pub async fn list_providers(&self) -> Result<Vec<ProviderAuthStatus>> {
        let mut statuses = Vec::new();
        for definition in self.registry.list() {
            statuses.push(self.status_for(&definition).await?);
        }
        Ok(statuses)
    }

    pub async fn get_provider_auth_status(&self, provider: &str) -> Result<ProviderAuthStatus> {
        let definition = self.definition(provider)?;
        self.status_for(&definition).await
    }

    /// Revokes API-key and OAuth credentials (whichever the provider supports)
    /// and abandons any pending OAuth flow.
    pub async fn revoke_provider(&self, provider: &str) -> Result<RevokeOutcome> {
        let definition = self.definition(provider)?;

        if self.sessions.take(&definition.id).await.is_some() {
            debug!(provider = %definition.id, "Stopped pending OAuth flow on revoke");
        }

        let mut revoked = false;
        {
            let lock = self.provider_lock(&definition.id);
            let _guard = lock.lock().await;

            if definition.supports(AuthMode::ApiKey) {
                revoked |= self
                    .strategies
                    .api_key_for(&definition)?
                    .revoke(&definition.id)
                    .await?;
            }
            if definition.supports(AuthMode::OAuth) {
                revoked |= self
                    .strategies
                    .oauth_for(&definition)?
                    .revoke(&definition.id)
                    .await?;
            }
        }

        let status = self.status_for(&definition).await?;
        Ok(RevokeOutcome { revoked, status })
    }

    /// Providers with an OAuth flow in progress.
    pub async fn pending_oauth_providers(&self) -> Vec<String> {
        self.sessions.providers().await
    }

    /// Stops every pending callback listener.
    pub async fn shutdown(&self) {
        let pending = self.sessions.count().await;
        self.sessions.stop_all().await;
        info!(pending, "Provider auth service shut down");
    }

    fn definition(&self, provider: &str) -> Result<ProviderDefinition> {
        let id = normalize_provider_id(provider);
        if id.is_empty() {
            return Err(AuthError::validation("provider must not be empty"));
        }
        self.registry
            .get(&id)
            .ok_or(AuthError::UnknownProvider(id))
    }

    fn provider_lock(&self, provider: &str) -> Arc<Mutex<()>> {
        self.provider_locks
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn status_for(&self, definition: &ProviderDefinition) -> Result<ProviderAuthStatus> {
        let snapshot = self.snapshot(definition).await?;
        Ok(evaluate(
            definition,
            &snapshot,
            Utc::now(),
            self.settings.refresh_buffer(),
        ))
    }

    /// Newest live credential, API key first. Unreadable payloads are
    /// reported; store-level failures propagate.
    async fn snapshot(&self, definition: &ProviderDefinition) -> Result<CredentialSnapshot> {
        if definition.supports(AuthMode::ApiKey) {
            let strategy = self.strategies.api_key_for(definition)?;
            match strategy.retrieve(&definition.id).await {
                Ok(Some(_)) => return Ok(CredentialSnapshot::ApiKey),
                Ok(None) => {}
                Err(e) if e.kind() == AuthErrorKind::Crypto => {
                    return Ok(CredentialSnapshot::Unreadable {
                        mode: AuthMode::ApiKey,
                        reason: e.to_string(),
                    })
                }
                Err(e) => return Err(e),
            }
        }

        if definition.supports(AuthMode::OAuth) {
            let strategy = self.strategies.oauth_for(definition)?;
            match strategy.retrieve_tokens(&definition.id).await {
                Ok(Some(tokens)) => return Ok(CredentialSnapshot::OAuth(tokens)),
                Ok(None) => {}
                Err(e) if e.kind() == AuthErrorKind::Crypto => {
                    return Ok(CredentialSnapshot::Unreadable {
                        mode: AuthMode::OAuth,
                        reason: e.to_string(),
                    })
                }
                Err(e) => return Err(e),
            }
        }

        Ok(CredentialSnapshot::None)
    }
}

fn ensure_configurable(definition: &ProviderDefinition) -> Result<()> {
    if definition.user_configurable {
        Ok(())
    } else {
        Err(AuthError::validation(format!(
            "provider '{}' is managed by the host and cannot be configured",
            definition.id
        )))
    }
}
