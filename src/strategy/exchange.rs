//! OAuth token endpoint exchanges.
//!
//! Wire formats differ per provider, so exchanges sit behind
//! [`TokenExchanger`]. [`HttpTokenExchanger`] is the generic RFC 6749
//! form-post implementation used when a provider needs nothing special.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::oauth::{OAuthProviderConfig, OAuthTokens, MAX_TOKEN_LIFETIME_SECS};

/// Authorization code plus what the provider needs to verify it
#[derive(Clone, Debug)]
pub struct CodeExchangeRequest {
    pub code: String,
    pub redirect_uri: String,
    pub code_verifier: Option<String>,
}

/// Per-provider token endpoint wire format
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    /// Exchanges an authorization code for tokens.
    async fn exchange_code(
        &self,
        config: &OAuthProviderConfig,
        request: &CodeExchangeRequest,
    ) -> Result<OAuthTokens>;

    /// Exchanges a refresh token for a new access token.
    ///
    /// `refresh_token` in the result is `None` when the provider did not rotate it.
    async fn refresh(&self, config: &OAuthProviderConfig, refresh_token: &str) -> Result<OAuthTokens>;
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_tokens(self) -> Result<OAuthTokens> {
        if self.access_token.trim().is_empty() {
            return Err(ProtocolError::TokenEndpoint {
                message: "token response contained an empty access_token".to_string(),
                status: None,
                source: None,
            }
            .into());
        }

        if let Some(expires_in) = self.expires_in {
            if !(0..=MAX_TOKEN_LIFETIME_SECS).contains(&expires_in) {
                return Err(ProtocolError::TokenEndpoint {
                    message: format!("token response contained an invalid expires_in: {}", expires_in),
                    status: None,
                    source: None,
                }
                .into());
            }
        }

        let refresh_token = self.refresh_token.filter(|t| !t.trim().is_empty());
        let mut tokens = OAuthTokens::from_expires_in(self.access_token, refresh_token, self.expires_in);
        tokens.scope = self.scope;
        if let Some(token_type) = self.token_type.filter(|t| !t.trim().is_empty()) {
            tokens.token_type = token_type;
        }
        Ok(tokens)
    }
}

/// OAuth error body (RFC 6749 section 5.2)
#[derive(Deserialize, Debug)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Generic form-post token exchanger
#[derive(Clone, Debug, Default)]
pub struct HttpTokenExchanger {
    client: reqwest::Client,
}

impl HttpTokenExchanger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn post_form(
        &self,
        config: &OAuthProviderConfig,
        grant: &str,
        form: Vec<(&str, String)>,
    ) -> Result<OAuthTokens> {
        debug!(token_url = %config.token_url, grant = %grant, "Calling OAuth token endpoint");

        let response = self
            .client
            .post(&config.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| ProtocolError::TokenEndpoint {
                message: format!("failed to send {} request to {}", grant, config.token_url),
                status: None,
                source: Some(e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            let detail = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {}", err.error, description),
                    None => err.error,
                },
                Err(_) => body,
            };
            return Err(ProtocolError::TokenEndpoint {
                message: format!("{} failed with status {}: {}", grant, status, detail),
                status: Some(status.as_u16()),
                source: None,
            }
            .into());
        }

        let token_response: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| ProtocolError::TokenEndpoint {
                    message: format!("failed to parse {} response", grant),
                    status: Some(status.as_u16()),
                    source: Some(e),
                })?;

        debug!(
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token endpoint call successful"
        );

        token_response.into_tokens()
    }
}

fn client_credentials(config: &OAuthProviderConfig, form: &mut Vec<(&str, String)>) {
    form.push(("client_id", config.client_id.clone()));
    if let Some(secret) = &config.client_secret {
        form.push(("client_secret", secret.clone()));
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange_code(
        &self,
        config: &OAuthProviderConfig,
        request: &CodeExchangeRequest,
    ) -> Result<OAuthTokens> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", request.code.clone()),
            ("redirect_uri", request.redirect_uri.clone()),
        ];
        client_credentials(config, &mut form);
        if let Some(verifier) = &request.code_verifier {
            form.push(("code_verifier", verifier.clone()));
        }

        self.post_form(config, "authorization_code", form).await
    }

    async fn refresh(&self, config: &OAuthProviderConfig, refresh_token: &str) -> Result<OAuthTokens> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        client_credentials(config, &mut form);

        self.post_form(config, "refresh_token", form).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, Utc};
    use mockito::Matcher;

    use super::*;
    use crate::error::AuthError;

    fn config_for(server: &mockito::Server) -> OAuthProviderConfig {
        OAuthProviderConfig {
            auth_url: format!("{}/authorize", server.url()),
            token_url: format!("{}/token", server.url()),
            scopes: vec!["chat".to_string()],
            client_id: "reins-cli".to_string(),
            client_secret: None,
            use_pkce: true,
            local_callback: true,
            callback_port: None,
            redirect_uri: None,
            extra_auth_params: BTreeMap::new(),
        }
    }

    #[test]
    fn test_token_response_deserialization() {
        let json = r#"{
            "access_token": "gho_1234567890",
            "refresh_token": "ghr_0987654321",
            "expires_in": 3600,
            "token_type": "bearer",
            "scope": "chat"
        }"#;

        let response: TokenResponse = serde_json::from_str(json).unwrap();
        let tokens = response.into_tokens().unwrap();
        assert_eq!(tokens.access_token, "gho_1234567890");
        assert_eq!(tokens.refresh_token.as_deref(), Some("ghr_0987654321"));
        assert_eq!(tokens.token_type, "bearer");
        assert_eq!(tokens.scope.as_deref(), Some("chat"));
    }

    #[test]
    fn test_token_response_minimal() {
        let response: TokenResponse = serde_json::from_str(r#"{"access_token": "token_12345"}"#).unwrap();
        let tokens = response.into_tokens().unwrap();
        assert!(tokens.refresh_token.is_none());
        assert_eq!(tokens.token_type, "Bearer");
        assert!(tokens.expires_at > Utc::now() + Duration::minutes(59));
    }

    #[tokio::test]
    async fn test_exchange_code_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "xyz".into()),
                Matcher::UrlEncoded("code_verifier".into(), "verifier-123".into()),
                Matcher::UrlEncoded("client_id".into(), "reins-cli".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at-1","refresh_token":"rt-1","expires_in":7200}"#)
            .create_async()
            .await;

        let tokens = HttpTokenExchanger::new()
            .exchange_code(
                &config_for(&server),
                &CodeExchangeRequest {
                    code: "xyz".to_string(),
                    redirect_uri: "http://127.0.0.1:8765/callback".to_string(),
                    code_verifier: Some("verifier-123".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "at-1");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt-1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_without_rotation() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("refresh_token".into(), "my_refresh".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new_token","expires_in":3600}"#)
            .create_async()
            .await;

        let tokens = HttpTokenExchanger::new()
            .refresh(&config_for(&server), "my_refresh")
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "new_token");
        assert!(tokens.refresh_token.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_http_failure() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"refresh token revoked"}"#)
            .create_async()
            .await;

        let err = HttpTokenExchanger::new()
            .refresh(&config_for(&server), "expired_refresh")
            .await
            .unwrap_err();

        match &err {
            AuthError::Protocol(ProtocolError::TokenEndpoint { status, message, .. }) => {
                assert_eq!(*status, Some(400));
                assert!(message.contains("invalid_grant"));
                assert!(message.contains("refresh token revoked"));
            }
            unexpected => panic!("expected TokenEndpoint error, got {unexpected:?}"),
        }
        assert!(err.requires_reauth());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_out_of_range_expires_in_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at","expires_in":9223372036854775807}"#)
            .create_async()
            .await;

        let err = HttpTokenExchanger::new()
            .refresh(&config_for(&server), "rt")
            .await
            .unwrap_err();
        match err {
            AuthError::Protocol(ProtocolError::TokenEndpoint { message, .. }) => {
                assert!(message.contains("expires_in"));
            }
            unexpected => panic!("expected TokenEndpoint error, got {unexpected:?}"),
        }
    }

    #[test]
    fn test_negative_expires_in_rejected() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"at","expires_in":-30}"#).unwrap();
        assert!(matches!(
            response.into_tokens(),
            Err(AuthError::Protocol(ProtocolError::TokenEndpoint { .. }))
        ));
    }

    #[tokio::test]
    async fn test_malformed_success_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token":"missing-field"}"#)
            .create_async()
            .await;

        let err = HttpTokenExchanger::new()
            .refresh(&config_for(&server), "rt")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::Protocol(ProtocolError::TokenEndpoint { source: Some(_), .. })
        ));
    }
}
