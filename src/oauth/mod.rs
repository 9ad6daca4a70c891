//! OAuth 2.0 authorization-code flow support.
//!
//! 1. Orchestrator starts a loopback [`OAuthCallbackServer`] and builds the
//!    authorization URL (with `state` and optional PKCE challenge)
//! 2. User authorizes on the provider's site
//! 3. Provider redirects to `http://127.0.0.1:<port>/callback?code=..&state=..`
//! 4. The listener hands `{code, state}` to the waiting flow and stops
//! 5. Code is exchanged for [`OAuthTokens`], which are stored encrypted
//!
//! In-flight flows live in [`PendingOAuthSessions`], one per provider.

mod callback;
mod pkce;
mod provider;
mod session;

pub use callback::{CallbackParams, CallbackQuery, CallbackServerOptions, OAuthCallbackServer};
pub(crate) use callback::validate_callback;
pub use pkce::{challenge_for as pkce_challenge_for, PkceChallenge};
pub use provider::OAuthProviderConfig;
pub use session::{PendingOAuthSession, PendingOAuthSessions};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::credentials::PayloadSchema;

/// Lifetime assumed when a token endpoint omits `expires_in`
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Longest `expires_in` accepted from a token endpoint (ten years)
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 10 * 365 * 24 * 3600;

/// Tokens issued by a provider's token endpoint.
///
/// Stored as the encrypted payload of an `oauth` credential record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokens {
    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC)
    pub expires_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthTokens {
    /// Builds tokens from a relative `expires_in`, as token endpoints report it.
    ///
    /// The lifetime is clamped to `0..=MAX_TOKEN_LIFETIME_SECS`; callers that
    /// must reject out-of-range values check them first.
    pub fn from_expires_in(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in: Option<i64>,
    ) -> Self {
        let lifetime = expires_in
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS)
            .clamp(0, MAX_TOKEN_LIFETIME_SECS);
        let now = Utc::now();
        let expires_at = Duration::try_seconds(lifetime)
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at,
            scope: None,
            token_type: default_token_type(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True once `now` is inside the refresh buffer before expiry.
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        self.expires_at
            .checked_sub_signed(buffer)
            .map_or(true, |refresh_at| now >= refresh_at)
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false)
    }
}

impl PayloadSchema for OAuthTokens {
    fn check(&self) -> Result<(), String> {
        if self.access_token.trim().is_empty() {
            return Err("accessToken is empty".to_string());
        }
        if self.token_type.trim().is_empty() {
            return Err("tokenType is empty".to_string());
        }
        if let Some(refresh) = &self.refresh_token {
            if refresh.trim().is_empty() {
                return Err("refreshToken is present but empty".to_string());
            }
        }
        Ok(())
    }
}
