use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::{
    latest_live, revoke_all, CodeExchangeRequest, CodeFlowInitiation, HttpTokenExchanger,
    OAuthCallbackContext, OAuthInitiateContext, OAuthInitiation, OAuthRefreshContext,
    OAuthStrategy, TokenExchanger,
};
use crate::credentials::{CredentialInput, CredentialStore, CredentialType, PayloadSchema};
use crate::error::{AuthError, ProtocolError, Result};
use crate::oauth::{OAuthProviderConfig, OAuthTokens, PkceChallenge};
use crate::registry::ProviderDefinition;

/// Authorization-code flow driven by the provider's declared OAuth config,
/// with tokens stored as encrypted `oauth` records.
pub struct StoreOAuthStrategy {
    store: Arc<CredentialStore>,
    exchanger: Arc<dyn TokenExchanger>,
}

impl StoreOAuthStrategy {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self::with_exchanger(store, Arc::new(HttpTokenExchanger::new()))
    }

    pub fn with_exchanger(store: Arc<CredentialStore>, exchanger: Arc<dyn TokenExchanger>) -> Self {
        Self { store, exchanger }
    }
}

fn oauth_config(definition: &ProviderDefinition) -> Result<&OAuthProviderConfig> {
    definition
        .oauth
        .as_ref()
        .ok_or_else(|| ProtocolError::MissingOAuthConfig(definition.id.clone()).into())
}

fn resolve_redirect_uri(
    definition: &ProviderDefinition,
    config: &OAuthProviderConfig,
    requested: Option<&str>,
) -> Result<String> {
    requested
        .or(config.redirect_uri.as_deref())
        .map(str::to_string)
        .ok_or_else(|| {
            AuthError::validation(format!(
                "provider '{}' has no redirect URI; enable the local callback or declare one",
                definition.id
            ))
        })
}

#[async_trait]
impl OAuthStrategy for StoreOAuthStrategy {
    async fn initiate(&self, context: &OAuthInitiateContext) -> Result<OAuthInitiation> {
        let declared = oauth_config(&context.provider)?;
        let redirect_uri = resolve_redirect_uri(&context.provider, declared, context.redirect_uri.as_deref())?;

        let mut config = declared.clone();
        if let Some(scopes) = &context.scopes {
            config.scopes = scopes.clone();
        }

        let state = Uuid::new_v4().simple().to_string();
        let pkce = config.use_pkce.then(PkceChallenge::generate);
        let authorization_url = config.build_auth_url(
            &state,
            &redirect_uri,
            pkce.as_ref().map(|p| p.challenge.as_str()),
        );

        debug!(provider = %context.provider.id, pkce = pkce.is_some(), "Built OAuth authorization URL");

        Ok(OAuthInitiation::CodeFlow(CodeFlowInitiation {
            authorization_url,
            state,
            code_verifier: pkce.map(|p| p.verifier),
            redirect_uri: Some(redirect_uri),
        }))
    }

    async fn handle_callback(&self, context: &OAuthCallbackContext) -> Result<OAuthTokens> {
        let config = oauth_config(&context.provider)?;
        let redirect_uri = resolve_redirect_uri(&context.provider, config, context.redirect_uri.as_deref())?;

        self.exchanger
            .exchange_code(
                config,
                &CodeExchangeRequest {
                    code: context.code.clone(),
                    redirect_uri,
                    code_verifier: context.code_verifier.clone(),
                },
            )
            .await
    }

    async fn refresh(&self, context: &OAuthRefreshContext) -> Result<OAuthTokens> {
        let config = oauth_config(&context.provider)?;
        let refresh_token = context
            .tokens
            .refresh_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ProtocolError::MissingRefreshToken(context.provider.id.clone()))?;

        self.exchanger.refresh(config, refresh_token).await
    }

    async fn store_tokens(&self, provider: &str, tokens: &OAuthTokens) -> Result<()> {
        tokens.check().map_err(AuthError::Validation)?;

        let mut input = CredentialInput::new(provider, CredentialType::OAuth, serde_json::to_value(tokens)?)
            .with_metadata("expiresAt", tokens.expires_at.to_rfc3339())
            .with_metadata("hasRefreshToken", tokens.has_refresh_token().to_string())
            .with_metadata("tokenType", tokens.token_type.clone());
        if let Some(existing) = latest_live(&self.store, provider, CredentialType::OAuth).await? {
            input = input.with_id(existing.id);
        }

        self.store.set(input).await?;
        Ok(())
    }

    async fn retrieve_tokens(&self, provider: &str) -> Result<Option<OAuthTokens>> {
        match latest_live(&self.store, provider, CredentialType::OAuth).await? {
            Some(record) => Ok(Some(self.store.decrypt_payload(&record).await?)),
            None => Ok(None),
        }
    }

    async fn revoke(&self, provider: &str) -> Result<bool> {
        revoke_all(&self.store, provider, CredentialType::OAuth).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    use super::*;
    use crate::oauth::pkce_challenge_for;
    use crate::registry::AuthMode;

    #[derive(Default)]
    struct FakeExchanger {
        requests: Mutex<Vec<CodeExchangeRequest>>,
    }

    #[async_trait]
    impl TokenExchanger for FakeExchanger {
        async fn exchange_code(
            &self,
            _config: &OAuthProviderConfig,
            request: &CodeExchangeRequest,
        ) -> Result<OAuthTokens> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(OAuthTokens::from_expires_in(
                format!("at-{}", request.code),
                Some("rt".to_string()),
                Some(3600),
            ))
        }

        async fn refresh(&self, _config: &OAuthProviderConfig, refresh_token: &str) -> Result<OAuthTokens> {
            Ok(OAuthTokens::from_expires_in(
                format!("refreshed-with-{}", refresh_token),
                None,
                Some(3600),
            ))
        }
    }

    fn acme() -> ProviderDefinition {
        ProviderDefinition {
            id: "acme".to_string(),
            display_name: Some("Acme".to_string()),
            requires_auth: true,
            auth_modes: vec![AuthMode::OAuth],
            env_vars: vec![],
            base_url: None,
            user_configurable: true,
            oauth: Some(OAuthProviderConfig {
                auth_url: "https://acme.test/authorize".to_string(),
                token_url: "https://acme.test/token".to_string(),
                scopes: vec!["chat".to_string()],
                client_id: "reins".to_string(),
                client_secret: None,
                use_pkce: true,
                local_callback: true,
                callback_port: None,
                redirect_uri: None,
                extra_auth_params: BTreeMap::new(),
            }),
        }
    }

    fn strategy() -> (TempDir, Arc<FakeExchanger>, StoreOAuthStrategy) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path().join("credentials.enc"), "secret").unwrap());
        let exchanger = Arc::new(FakeExchanger::default());
        let strategy = StoreOAuthStrategy::with_exchanger(store, exchanger.clone());
        (dir, exchanger, strategy)
    }

    #[tokio::test]
    async fn test_initiate_builds_pkce_url() {
        let (_dir, _exchanger, strategy) = strategy();

        let initiation = strategy
            .initiate(&OAuthInitiateContext {
                provider: acme(),
                redirect_uri: Some("http://127.0.0.1:4000/callback".to_string()),
                scopes: Some(vec!["chat".to_string(), "models".to_string()]),
            })
            .await
            .unwrap();

        let OAuthInitiation::CodeFlow(flow) = initiation else {
            panic!("expected code flow");
        };
        assert_eq!(flow.state.len(), 32);
        assert!(flow.authorization_url.contains(&format!("state={}", flow.state)));
        assert!(flow.authorization_url.contains("scope=chat%20models"));

        let verifier = flow.code_verifier.expect("pkce verifier missing");
        assert!(flow
            .authorization_url
            .contains(&format!("code_challenge={}", pkce_challenge_for(&verifier))));
    }

    #[tokio::test]
    async fn test_initiate_requires_redirect_uri() {
        let (_dir, _exchanger, strategy) = strategy();
        let result = strategy
            .initiate(&OAuthInitiateContext {
                provider: acme(),
                redirect_uri: None,
                scopes: None,
            })
            .await;
        assert!(matches!(result, Err(AuthError::Validation(_))));
    }

    #[tokio::test]
    async fn test_callback_passes_verifier() {
        let (_dir, exchanger, strategy) = strategy();

        let tokens = strategy
            .handle_callback(&OAuthCallbackContext {
                provider: acme(),
                code: "xyz".to_string(),
                state: "abc".to_string(),
                code_verifier: Some("v".to_string()),
                redirect_uri: Some("http://127.0.0.1:4000/callback".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "at-xyz");
        let requests = exchanger.requests.lock().unwrap();
        assert_eq!(requests[0].code_verifier.as_deref(), Some("v"));
        assert_eq!(requests[0].redirect_uri, "http://127.0.0.1:4000/callback");
    }

    #[tokio::test]
    async fn test_refresh_requires_refresh_token() {
        let (_dir, _exchanger, strategy) = strategy();
        let mut tokens = OAuthTokens::from_expires_in("at", None, Some(60));

        let err = strategy
            .refresh(&OAuthRefreshContext {
                provider: acme(),
                tokens: tokens.clone(),
            })
            .await
            .unwrap_err();
        assert!(err.requires_reauth());

        tokens.refresh_token = Some("rt".to_string());
        let refreshed = strategy
            .refresh(&OAuthRefreshContext {
                provider: acme(),
                tokens,
            })
            .await
            .unwrap();
        assert_eq!(refreshed.access_token, "refreshed-with-rt");
    }

    #[tokio::test]
    async fn test_token_persistence() {
        let (_dir, _exchanger, strategy) = strategy();
        let tokens = OAuthTokens {
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_at: Utc::now() + Duration::hours(1),
            scope: None,
            token_type: "Bearer".to_string(),
        };

        strategy.store_tokens("acme", &tokens).await.unwrap();
        assert_eq!(strategy.retrieve_tokens("acme").await.unwrap(), Some(tokens));

        assert!(strategy.revoke("acme").await.unwrap());
        assert!(strategy.retrieve_tokens("acme").await.unwrap().is_none());

        let empty = OAuthTokens::from_expires_in("", None, None);
        assert!(matches!(
            strategy.store_tokens("acme", &empty).await,
            Err(AuthError::Validation(_))
        ));
    }
}
