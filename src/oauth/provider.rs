//! OAuth provider configuration.
//!
//! Declared per provider in the registry. Controls how the authorization URL
//! is built and whether the flow uses the local callback listener.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// OAuth provider configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    /// Required OAuth scopes
    #[serde(default)]
    pub scopes: Vec<String>,

    pub client_id: String,

    /// Confidential clients only; public CLI clients rely on PKCE
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Send an S256 PKCE challenge with the authorization request
    #[serde(default = "default_true")]
    pub use_pkce: bool,

    /// Receive the redirect on the loopback callback listener.
    ///
    /// Providers whose redirect lands elsewhere (a hosted page that shows the
    /// code for copy/paste) set this to `false` and declare `redirect_uri`.
    #[serde(default = "default_true")]
    pub local_callback: bool,

    /// Fixed loopback port for providers that only accept a registered redirect
    #[serde(default)]
    pub callback_port: Option<u16>,

    /// Redirect URI used when the local callback listener is not in play
    #[serde(default)]
    pub redirect_uri: Option<String>,

    /// Provider-specific query parameters appended to the authorization URL
    #[serde(default)]
    pub extra_auth_params: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl OAuthProviderConfig {
    /// Build authorization URL with state, redirect_uri and optional PKCE challenge
    pub fn build_auth_url(
        &self,
        state: &str,
        redirect_uri: &str,
        code_challenge: Option<&str>,
    ) -> String {
        let scopes = self.scopes.join(" ");
        let separator = if self.auth_url.contains('?') { '&' } else { '?' };

        let mut url = format!(
            "{}{}response_type=code&client_id={}&redirect_uri={}&state={}",
            self.auth_url,
            separator,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(state)
        );

        if !scopes.is_empty() {
            url.push_str("&scope=");
            url.push_str(&urlencoding::encode(&scopes));
        }

        if let Some(challenge) = code_challenge {
            url.push_str("&code_challenge=");
            url.push_str(&urlencoding::encode(challenge));
            url.push_str("&code_challenge_method=S256");
        }

        for (key, value) in &self.extra_auth_params {
            url.push('&');
            url.push_str(&urlencoding::encode(key));
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }

        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> OAuthProviderConfig {
        OAuthProviderConfig {
            auth_url: "https://example.com/oauth/authorize".to_string(),
            token_url: "https://example.com/oauth/token".to_string(),
            scopes: vec!["read".to_string(), "write".to_string()],
            client_id: "test_client_id".to_string(),
            client_secret: None,
            use_pkce: true,
            local_callback: true,
            callback_port: None,
            redirect_uri: None,
            extra_auth_params: BTreeMap::new(),
        }
    }

    #[test]
    fn test_build_auth_url() {
        let url = test_config().build_auth_url(
            "random_state",
            "http://127.0.0.1:3000/callback",
            None,
        );

        assert!(url.starts_with("https://example.com/oauth/authorize?"));
        assert!(url.contains("client_id=test_client_id"));
        assert!(url.contains("redirect_uri=http%3A%2F%2F127.0.0.1%3A3000%2Fcallback"));
        // URL encoding converts spaces to %20
        assert!(url.contains("scope=read%20write"));
        assert!(url.contains("state=random_state"));
        assert!(url.contains("response_type=code"));
        assert!(!url.contains("code_challenge"));
    }

    #[test]
    fn test_build_auth_url_with_pkce_and_extras() {
        let mut config = test_config();
        config.auth_url = "https://example.com/authorize?prompt=consent".to_string();
        config
            .extra_auth_params
            .insert("originator".to_string(), "reins".to_string());

        let url = config.build_auth_url("s", "http://127.0.0.1:1/callback", Some("abc-_123"));

        assert!(url.starts_with("https://example.com/authorize?prompt=consent&response_type=code"));
        assert!(url.contains("code_challenge=abc-_123"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.ends_with("&originator=reins"));
    }

    #[test]
    fn test_config_deserialization_defaults() {
        let toml = r#"
            auth_url = "https://acme.test/authorize"
            token_url = "https://acme.test/token"
            client_id = "cli"
        "#;
        let config: OAuthProviderConfig = toml::from_str(toml).unwrap();
        assert!(config.use_pkce);
        assert!(config.local_callback);
        assert!(config.scopes.is_empty());
        assert!(config.client_secret.is_none());
    }
}
