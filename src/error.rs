//! Error types for the domofon bridge.

use std::path::PathBuf;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dedup store error: {0}")]
    Store(#[from] StoreError),

    #[error("Modem error: {0}")]
    Modem(#[from] ModemError),

    #[error("Domofon error: {0}")]
    Domofon(#[from] DomofonError),

    #[error("Gatekeeper error: {0}")]
    Gatekeeper(#[from] GatekeeperError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors from the persisted set of seen SMS identifiers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt dedup file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode dedup snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Huawei HiLink modem errors.
#[derive(Debug, thiserror::Error)]
pub enum ModemError {
    #[error("Not logged in to the modem, call login() first")]
    NotLoggedIn,

    #[error("Modem request to {endpoint} failed: {reason}")]
    Request { endpoint: String, reason: String },

    #[error("Modem returned error code {code}")]
    Api { code: String },

    #[error("Unexpected modem response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("Modem login failed after {attempts} attempts: {last}")]
    LoginExhausted { attempts: u32, last: Box<ModemError> },
}

/// Rosdomofon API errors.
#[derive(Debug, thiserror::Error)]
pub enum DomofonError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token refresh failed with status {status}")]
    TokenRefresh { status: reqwest::StatusCode },

    #[error("Temporary key request failed with status {status}")]
    CreateKey { status: reqwest::StatusCode },

    #[error("Invalid activation link: {0}")]
    InvalidLink(String),

    #[error("Key activation failed with status {status}")]
    Activation { status: reqwest::StatusCode },
}

/// Errors raised while handling a delivered SMS.
#[derive(Debug, thiserror::Error)]
pub enum GatekeeperError {
    #[error("Open request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Open endpoint answered {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Open endpoint did not confirm success")]
    NotConfirmed,
}

/// Result type alias for the bridge.
pub type Result<T> = std::result::Result<T, Error>;
