//! Error type shared by every public operation in the crate.
//!
//! A single [`AuthError`] covers validation, cryptographic, persistence and
//! protocol failures. Underlying causes are chained through `#[source]` so the
//! full context survives up to the command surface.

use std::path::PathBuf;

use crate::registry::AuthMode;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Coarse classification used by the command surface to pick guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    Validation,
    Crypto,
    Persistence,
    Protocol,
}

/// Credential and authentication errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Input rejected before anything was touched (empty provider, bad key format, ...)
    #[error("validation failed: {0}")]
    Validation(String),

    /// The provider is not present in the registry
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    /// The provider does not declare the requested auth mode
    #[error("provider '{provider}' does not support {mode} authentication")]
    UnsupportedAuthMode { provider: String, mode: AuthMode },

    /// No usable credential is stored for the provider
    #[error("provider '{0}' has no stored credentials")]
    NotConfigured(String),

    /// Key derivation or encryption failure
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Wrong secret, tampered data or malformed payload
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Decrypted payload does not match the expected shape
    #[error("invalid credential payload: {0}")]
    InvalidPayload(String),

    /// Filesystem failure, always carrying the path involved
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Store file exists but cannot be trusted. Never reset automatically.
    #[error("credential store {} is corrupt: {reason}", .path.display())]
    CorruptStore {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<Box<AuthError>>,
    },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// OAuth flow failure (state mismatch, missing code, timeout, ...)
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// OAuth and callback protocol failures
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("OAuth state mismatch (possible CSRF): expected '{expected}', received '{received}'")]
    StateMismatch { expected: String, received: String },

    #[error("OAuth callback did not include an authorization code")]
    MissingCode,

    #[error("OAuth callback did not include a state parameter")]
    MissingState,

    #[error("authorization denied by provider: {error} ({description})")]
    ProviderDenied { error: String, description: String },

    #[error("failed to start OAuth callback listener on {address}: {source}")]
    ListenerStart {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {seconds}s waiting for the OAuth callback")]
    CallbackTimeout { seconds: u64 },

    #[error("OAuth callback listener was stopped before a callback arrived")]
    Cancelled,

    #[error("OAuth callback is already being awaited")]
    AlreadyAwaited,

    #[error("no pending OAuth flow for provider '{0}'")]
    NoPendingSession(String),

    #[error("provider '{0}' has no OAuth configuration")]
    MissingOAuthConfig(String),

    #[error("OAuth token for '{0}' expired and no refresh token is available")]
    MissingRefreshToken(String),

    #[error("token endpoint request failed: {message}")]
    TokenEndpoint {
        message: String,
        status: Option<u16>,
        #[source]
        source: Option<reqwest::Error>,
    },
}

impl AuthError {
    pub fn validation(message: impl Into<String>) -> Self {
        AuthError::Validation(message.into())
    }

    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AuthError::Io {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> AuthErrorKind {
        match self {
            AuthError::Validation(_)
            | AuthError::UnknownProvider(_)
            | AuthError::UnsupportedAuthMode { .. }
            | AuthError::NotConfigured(_) => AuthErrorKind::Validation,
            AuthError::Encryption(_) | AuthError::Decryption(_) | AuthError::InvalidPayload(_) => {
                AuthErrorKind::Crypto
            }
            AuthError::Io { .. } | AuthError::CorruptStore { .. } | AuthError::Serialization(_) => {
                AuthErrorKind::Persistence
            }
            AuthError::Protocol(_) => AuthErrorKind::Protocol,
        }
    }

    /// True when the only way forward is a fresh interactive authorization.
    pub fn requires_reauth(&self) -> bool {
        match self {
            AuthError::Protocol(ProtocolError::MissingRefreshToken(_)) => true,
            AuthError::Protocol(ProtocolError::TokenEndpoint { status, .. }) => {
                matches!(status, Some(400) | Some(401))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            AuthError::validation("empty provider").kind(),
            AuthErrorKind::Validation
        );
        assert_eq!(
            AuthError::Decryption("bad tag".into()).kind(),
            AuthErrorKind::Crypto
        );
        assert_eq!(
            AuthError::io(
                "failed to read",
                "/tmp/x",
                std::io::Error::new(std::io::ErrorKind::Other, "boom")
            )
            .kind(),
            AuthErrorKind::Persistence
        );
        assert_eq!(
            AuthError::from(ProtocolError::MissingCode).kind(),
            AuthErrorKind::Protocol
        );
    }

    #[test]
    fn test_io_error_carries_path() {
        let err = AuthError::io(
            "failed to write",
            "/var/lib/reins/credentials.enc",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let message = err.to_string();
        assert!(message.contains("/var/lib/reins/credentials.enc"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_requires_reauth() {
        assert!(AuthError::from(ProtocolError::MissingRefreshToken("acme".into())).requires_reauth());
        assert!(!AuthError::from(ProtocolError::Cancelled).requires_reauth());
        assert!(AuthError::from(ProtocolError::TokenEndpoint {
            message: "invalid_grant".into(),
            status: Some(400),
            source: None,
        })
        .requires_reauth());
    }
}
