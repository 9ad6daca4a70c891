//! Connection state derivation.
//!
//! Status is never stored: it is recomputed per query from the registry
//! definition, the newest live credential and token expiry.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::oauth::OAuthTokens;
use crate::registry::{AuthMode, ProviderDefinition};

/// Where a provider stands before it can be used
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Ready,
    RequiresAuth,
    RequiresReauth,
    Invalid,
}

/// Status of one provider as reported to every surface
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAuthStatus {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub requires_auth: bool,
    pub auth_modes: Vec<AuthMode>,
    pub env_vars: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub user_configurable: bool,
    pub connection_state: ConnectionState,
    /// A live credential exists (readable or not)
    pub configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_mode: Option<AuthMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// What the store holds for a provider
#[derive(Clone, Debug)]
pub enum CredentialSnapshot {
    None,
    ApiKey,
    OAuth(OAuthTokens),
    /// A live record whose payload failed to decrypt or validate
    Unreadable { mode: AuthMode, reason: String },
}

/// Derives a provider's status. Pure; reads nothing.
pub fn evaluate(
    definition: &ProviderDefinition,
    snapshot: &CredentialSnapshot,
    now: DateTime<Utc>,
    refresh_buffer: Duration,
) -> ProviderAuthStatus {
    let mut status = ProviderAuthStatus {
        provider: definition.id.clone(),
        display_name: definition.display_name.clone(),
        requires_auth: definition.requires_auth,
        auth_modes: definition.auth_modes.clone(),
        env_vars: definition.env_vars.clone(),
        base_url: definition.base_url.clone(),
        user_configurable: definition.user_configurable,
        connection_state: ConnectionState::Ready,
        configured: false,
        active_mode: None,
        expires_at: None,
        detail: None,
    };

    match snapshot {
        CredentialSnapshot::None => {}
        CredentialSnapshot::ApiKey => {
            status.configured = true;
            status.active_mode = Some(AuthMode::ApiKey);
        }
        CredentialSnapshot::OAuth(tokens) => {
            status.configured = true;
            status.active_mode = Some(AuthMode::OAuth);
            status.expires_at = Some(tokens.expires_at);
        }
        CredentialSnapshot::Unreadable { mode, .. } => {
            status.configured = true;
            status.active_mode = Some(*mode);
        }
    }

    if !definition.requires_auth {
        return status;
    }

    if definition.auth_modes.is_empty() {
        status.connection_state = ConnectionState::Invalid;
        status.detail = Some("provider requires authentication but declares no auth modes".to_string());
        return status;
    }

    match snapshot {
        CredentialSnapshot::None => {
            status.connection_state = ConnectionState::RequiresAuth;
        }
        CredentialSnapshot::ApiKey => {}
        CredentialSnapshot::OAuth(tokens) => {
            if tokens.needs_refresh(now, refresh_buffer) && !tokens.has_refresh_token() {
                status.connection_state = ConnectionState::RequiresReauth;
                status.detail = Some(if tokens.is_expired(now) {
                    "access token expired and no refresh token is stored".to_string()
                } else {
                    "access token expires soon and no refresh token is stored".to_string()
                });
            }
        }
        CredentialSnapshot::Unreadable { reason, .. } => {
            status.connection_state = ConnectionState::Invalid;
            status.detail = Some(reason.clone());
        }
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(requires_auth: bool, modes: Vec<AuthMode>) -> ProviderDefinition {
        ProviderDefinition {
            id: "acme".to_string(),
            display_name: None,
            requires_auth,
            auth_modes: modes,
            env_vars: vec!["ACME_API_KEY".to_string()],
            base_url: None,
            user_configurable: true,
            oauth: None,
        }
    }

    fn tokens(expires_in_minutes: i64, refresh: bool) -> OAuthTokens {
        OAuthTokens {
            access_token: "at".to_string(),
            refresh_token: refresh.then(|| "rt".to_string()),
            expires_at: Utc::now() + Duration::minutes(expires_in_minutes),
            scope: None,
            token_type: "Bearer".to_string(),
        }
    }

    fn state_of(definition: &ProviderDefinition, snapshot: CredentialSnapshot) -> ConnectionState {
        evaluate(definition, &snapshot, Utc::now(), Duration::minutes(5)).connection_state
    }

    #[test]
    fn test_no_auth_required_is_ready() {
        let local = provider(false, vec![]);
        assert_eq!(state_of(&local, CredentialSnapshot::None), ConnectionState::Ready);
    }

    #[test]
    fn test_no_modes_is_invalid() {
        let broken = provider(true, vec![]);
        let status = evaluate(&broken, &CredentialSnapshot::None, Utc::now(), Duration::minutes(5));
        assert_eq!(status.connection_state, ConnectionState::Invalid);
        assert!(status.detail.is_some());
    }

    #[test]
    fn test_missing_credential_requires_auth() {
        let acme = provider(true, vec![AuthMode::ApiKey, AuthMode::OAuth]);
        assert_eq!(state_of(&acme, CredentialSnapshot::None), ConnectionState::RequiresAuth);
    }

    #[test]
    fn test_api_key_is_ready() {
        let acme = provider(true, vec![AuthMode::ApiKey]);
        let status = evaluate(&acme, &CredentialSnapshot::ApiKey, Utc::now(), Duration::minutes(5));
        assert_eq!(status.connection_state, ConnectionState::Ready);
        assert_eq!(status.active_mode, Some(AuthMode::ApiKey));
        assert!(status.configured);
    }

    #[test]
    fn test_expiring_token_without_refresh_requires_reauth() {
        let acme = provider(true, vec![AuthMode::OAuth]);
        assert_eq!(
            state_of(&acme, CredentialSnapshot::OAuth(tokens(4, false))),
            ConnectionState::RequiresReauth
        );
        assert_eq!(
            state_of(&acme, CredentialSnapshot::OAuth(tokens(4, true))),
            ConnectionState::Ready
        );
        assert_eq!(
            state_of(&acme, CredentialSnapshot::OAuth(tokens(-10, true))),
            ConnectionState::Ready
        );
        assert_eq!(
            state_of(&acme, CredentialSnapshot::OAuth(tokens(60, false))),
            ConnectionState::Ready
        );
    }

    #[test]
    fn test_unreadable_is_invalid() {
        let acme = provider(true, vec![AuthMode::OAuth]);
        let status = evaluate(
            &acme,
            &CredentialSnapshot::Unreadable {
                mode: AuthMode::OAuth,
                reason: "decryption failed".to_string(),
            },
            Utc::now(),
            Duration::minutes(5),
        );
        assert_eq!(status.connection_state, ConnectionState::Invalid);
        assert_eq!(status.detail.as_deref(), Some("decryption failed"));
    }

    #[test]
    fn test_status_serialization() {
        let acme = provider(true, vec![AuthMode::OAuth]);
        let status = evaluate(&acme, &CredentialSnapshot::None, Utc::now(), Duration::minutes(5));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["connectionState"], "requires_auth");
        assert_eq!(json["authModes"][0], "oauth");
        assert_eq!(json["envVars"][0], "ACME_API_KEY");
        assert!(json.get("expiresAt").is_none());
    }
}
