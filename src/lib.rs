// Configuration (TOML + environment overrides)
pub mod config;

// Encrypted credential repository
pub mod credentials;

// AES-256-GCM payload encryption
pub mod crypto;

// Error types
pub mod error;

// OAuth authorization-code flow: callback listener, PKCE, pending sessions
pub mod oauth;

// Provider capabilities
pub mod registry;

// Provider auth orchestrator and command surface
pub mod service;

// Per-provider API-key and OAuth strategies
pub mod strategy;

// Auth events and tracing setup
pub mod telemetry;

pub use config::{load_config, AuthConfig};
pub use credentials::{CredentialRecord, CredentialStore, CredentialType};
pub use error::{AuthError, AuthErrorKind, ProtocolError, Result};
pub use oauth::OAuthTokens;
pub use registry::{AuthMode, ProviderDefinition, ProviderRegistry, StaticProviderRegistry};
pub use service::{
    ConnectionState, ProviderAuthCommandPayload, ProviderAuthCommandResult, ProviderAuthService,
    ProviderAuthStatus,
};
