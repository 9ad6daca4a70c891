//! Auth lifecycle events and tracing setup.
//!
//! Components report through an [`AuthEventSink`] handed to their
//! constructors. The default [`TracingEventSink`] turns each event into a
//! structured `tracing` record. Events never carry secrets.

use tracing::{info, warn};

use crate::credentials::CredentialType;

/// Something worth reporting about credentials or OAuth flows
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthEvent {
    CredentialStored {
        id: String,
        provider: String,
        credential_type: CredentialType,
    },
    CredentialRevoked {
        id: String,
        provider: String,
    },
    OAuthInitiated {
        provider: String,
        local_callback: bool,
    },
    OAuthSessionReplaced {
        provider: String,
    },
    OAuthCompleted {
        provider: String,
    },
    OAuthFailed {
        provider: String,
        reason: String,
    },
    TokenRefreshed {
        provider: String,
        rotated: bool,
    },
    CommandDowngraded {
        provider: String,
        action: String,
        reason: String,
    },
}

/// Receiver for [`AuthEvent`]s
pub trait AuthEventSink: Send + Sync {
    fn record(&self, event: AuthEvent);
}

/// Forwards events to `tracing`
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl AuthEventSink for TracingEventSink {
    fn record(&self, event: AuthEvent) {
        match event {
            AuthEvent::CredentialStored {
                id,
                provider,
                credential_type,
            } => {
                info!(credential_id = %id, provider = %provider, credential_type = %credential_type, "Credential stored");
            }
            AuthEvent::CredentialRevoked { id, provider } => {
                info!(credential_id = %id, provider = %provider, "Credential revoked");
            }
            AuthEvent::OAuthInitiated {
                provider,
                local_callback,
            } => {
                info!(provider = %provider, local_callback, "OAuth flow initiated");
            }
            AuthEvent::OAuthSessionReplaced { provider } => {
                info!(provider = %provider, "Pending OAuth flow replaced by a new one");
            }
            AuthEvent::OAuthCompleted { provider } => {
                info!(provider = %provider, "OAuth flow completed");
            }
            AuthEvent::OAuthFailed { provider, reason } => {
                warn!(provider = %provider, error = %reason, "OAuth flow failed");
            }
            AuthEvent::TokenRefreshed { provider, rotated } => {
                info!(provider = %provider, rotated, "OAuth access token refreshed");
            }
            AuthEvent::CommandDowngraded {
                provider,
                action,
                reason,
            } => {
                warn!(provider = %provider, action = %action, error = %reason, "Auth command failed, returning guidance");
            }
        }
    }
}

/// Installs a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (usually `reins_auth=info`).
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    let directive = if default_directive.trim().is_empty() {
        "reins_auth=info"
    } else {
        default_directive
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| directive.into()),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::{AuthEvent, AuthEventSink};

    /// Sink that keeps every event for assertions
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<AuthEvent>>,
    }

    impl AuthEventSink for RecordingSink {
        fn record(&self, event: AuthEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl RecordingSink {
        pub fn snapshot(&self) -> Vec<AuthEvent> {
            self.events.lock().unwrap().clone()
        }
    }
}
