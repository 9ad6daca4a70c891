//! Single command entry point shared by the CLI, TUI, desktop app and API.
//!
//! Failures of `configure`, `oauth_initiate` and `oauth_callback` come back
//! as a successful result carrying [`AuthGuidance`]; `get`, `list` and
//! `revoke` propagate errors.

use serde::{Deserialize, Serialize};

use super::{
    CompleteOAuthOptions, InitiateOAuthOptions, OAuthStart, ProviderAuthService, ProviderAuthStatus,
};
use crate::error::{AuthError, AuthErrorKind, Result};
use crate::oauth::OAuthTokens;
use crate::registry::{normalize_provider_id, AuthMode};
use crate::telemetry::AuthEvent;

/// Surface a command came from; shapes guidance wording
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    Cli,
    Tui,
    Desktop,
    #[default]
    Api,
}

/// Credential supplied with a `configure` command
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConfigureCredential {
    ApiKey {
        key: String,
    },
    /// Stores `tokens` when given, otherwise starts the OAuth flow
    #[serde(rename = "oauth")]
    OAuth {
        #[serde(default)]
        tokens: Option<OAuthTokens>,
    },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProviderAuthCommandPayload {
    Configure {
        provider: String,
        #[serde(default)]
        source: CommandSource,
        credential: ConfigureCredential,
    },
    Get {
        provider: String,
        #[serde(default)]
        source: CommandSource,
    },
    List {
        #[serde(default)]
        source: CommandSource,
    },
    Revoke {
        provider: String,
        #[serde(default)]
        source: CommandSource,
    },
    OauthInitiate {
        provider: String,
        #[serde(default)]
        source: CommandSource,
        #[serde(default)]
        disable_local_callback: bool,
        #[serde(default)]
        redirect_uri: Option<String>,
        #[serde(default)]
        scopes: Option<Vec<String>>,
    },
    OauthCallback {
        provider: String,
        #[serde(default)]
        source: CommandSource,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        state: Option<String>,
    },
}

impl ProviderAuthCommandPayload {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Configure { .. } => "configure",
            Self::Get { .. } => "get",
            Self::List { .. } => "list",
            Self::Revoke { .. } => "revoke",
            Self::OauthInitiate { .. } => "oauth_initiate",
            Self::OauthCallback { .. } => "oauth_callback",
        }
    }

    pub fn source(&self) -> CommandSource {
        match self {
            Self::Configure { source, .. }
            | Self::Get { source, .. }
            | Self::List { source }
            | Self::Revoke { source, .. }
            | Self::OauthInitiate { source, .. }
            | Self::OauthCallback { source, .. } => *source,
        }
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::List { .. } => None,
            Self::Configure { provider, .. }
            | Self::Get { provider, .. }
            | Self::Revoke { provider, .. }
            | Self::OauthInitiate { provider, .. }
            | Self::OauthCallback { provider, .. } => Some(provider),
        }
    }

    /// Failures of this action become guidance instead of errors.
    fn downgrades_failures(&self) -> bool {
        matches!(
            self,
            Self::Configure { .. } | Self::OauthInitiate { .. } | Self::OauthCallback { .. }
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceAction {
    /// Supply or correct credentials
    Configure,
    /// Sign in again
    Reauth,
    /// Transient or flow failure; start over
    Retry,
}

/// What the user should do next after a failed command
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthGuidance {
    pub action: GuidanceAction,
    pub message: String,
    pub supported_modes: Vec<AuthMode>,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Status { status: ProviderAuthStatus },
    Providers { providers: Vec<ProviderAuthStatus> },
    OauthStarted { start: OAuthStart },
    Revoked { revoked: bool, status: ProviderAuthStatus },
    Guidance { guidance: AuthGuidance },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAuthCommandResult {
    pub action: &'static str,
    pub source: CommandSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(flatten)]
    pub outcome: CommandOutcome,
}

impl ProviderAuthService {
    /// Runs a command from any surface.
    pub async fn handle_command(
        &self,
        payload: ProviderAuthCommandPayload,
    ) -> Result<ProviderAuthCommandResult> {
        let action = payload.action();
        let source = payload.source();
        let provider = payload.provider().map(normalize_provider_id);
        let downgrades = payload.downgrades_failures();

        let outcome = match payload {
            ProviderAuthCommandPayload::Configure {
                provider,
                credential,
                ..
            } => match credential {
                ConfigureCredential::ApiKey { key } => self
                    .set_api_key(&provider, &key)
                    .await
                    .map(|status| CommandOutcome::Status { status }),
                ConfigureCredential::OAuth {
                    tokens: Some(tokens),
                } => self
                    .set_oauth_tokens(&provider, tokens)
                    .await
                    .map(|status| CommandOutcome::Status { status }),
                ConfigureCredential::OAuth { tokens: None } => self
                    .initiate_oauth(&provider, InitiateOAuthOptions::default())
                    .await
                    .map(|start| CommandOutcome::OauthStarted { start }),
            },
            ProviderAuthCommandPayload::Get { provider, .. } => self
                .get_provider_auth_status(&provider)
                .await
                .map(|status| CommandOutcome::Status { status }),
            ProviderAuthCommandPayload::List { .. } => self
                .list_providers()
                .await
                .map(|providers| CommandOutcome::Providers { providers }),
            ProviderAuthCommandPayload::Revoke { provider, .. } => {
                self.revoke_provider(&provider)
                    .await
                    .map(|outcome| CommandOutcome::Revoked {
                        revoked: outcome.revoked,
                        status: outcome.status,
                    })
            }
            ProviderAuthCommandPayload::OauthInitiate {
                provider,
                disable_local_callback,
                redirect_uri,
                scopes,
                ..
            } => self
                .initiate_oauth(
                    &provider,
                    InitiateOAuthOptions {
                        disable_local_callback,
                        redirect_uri,
                        scopes,
                    },
                )
                .await
                .map(|start| CommandOutcome::OauthStarted { start }),
            ProviderAuthCommandPayload::OauthCallback {
                provider,
                code,
                state,
                ..
            } => self
                .complete_oauth_callback(&provider, CompleteOAuthOptions { code, state })
                .await
                .map(|status| CommandOutcome::Status { status }),
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) if downgrades => {
                let provider_id = provider.clone().unwrap_or_default();
                self.sink.record(AuthEvent::CommandDowngraded {
                    provider: provider_id.clone(),
                    action: action.to_string(),
                    reason: e.to_string(),
                });
                CommandOutcome::Guidance {
                    guidance: self.guidance_for(&provider_id, source, &e),
                }
            }
            Err(e) => return Err(e),
        };

        Ok(ProviderAuthCommandResult {
            action,
            source,
            provider,
            outcome,
        })
    }

    fn guidance_for(&self, provider: &str, source: CommandSource, error: &AuthError) -> AuthGuidance {
        let definition = self.registry.get(provider);
        let supported_modes = definition
            .as_ref()
            .map(|d| d.auth_modes.clone())
            .unwrap_or_default();
        let name = definition
            .as_ref()
            .and_then(|d| d.display_name.clone())
            .unwrap_or_else(|| provider.to_string());

        let action = guidance_action(error);
        AuthGuidance {
            action,
            message: guidance_message(action, source, provider, &name),
            supported_modes,
            error: error.to_string(),
        }
    }
}

fn guidance_action(error: &AuthError) -> GuidanceAction {
    if error.requires_reauth() {
        return GuidanceAction::Reauth;
    }
    match error.kind() {
        AuthErrorKind::Validation | AuthErrorKind::Crypto => GuidanceAction::Configure,
        AuthErrorKind::Persistence | AuthErrorKind::Protocol => GuidanceAction::Retry,
    }
}

fn guidance_message(action: GuidanceAction, source: CommandSource, provider: &str, name: &str) -> String {
    let problem = match action {
        GuidanceAction::Configure => format!("{} credentials need to be configured.", name),
        GuidanceAction::Reauth => format!("{} needs you to sign in again.", name),
        GuidanceAction::Retry => format!("Signing in to {} did not finish.", name),
    };

    let next = match (source, action) {
        (CommandSource::Cli, GuidanceAction::Configure) => {
            format!("Run `reins auth configure {}` to continue.", provider)
        }
        (CommandSource::Cli, _) => format!("Run `reins auth login {}` to try again.", provider),
        (CommandSource::Tui, _) => format!("Open the Providers view and select {} to continue.", name),
        (CommandSource::Desktop, _) => {
            format!("Open Settings > Providers and select {} to continue.", name)
        }
        (CommandSource::Api, GuidanceAction::Configure) => {
            format!("Send a `configure` command for `{}`.", provider)
        }
        (CommandSource::Api, _) => format!("Send an `oauth_initiate` command for `{}`.", provider),
    };

    format!("{} {}", problem, next)
}
