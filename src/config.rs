//! Configuration types.
//!
//! Every component reads its own settings from environment variables through
//! a `from_env()` constructor. Parsing goes through `from_lookup()` so tests
//! can feed a plain map instead of mutating the process environment.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default location of the dedup file.
pub const DEFAULT_LAST_SMS_FILE: &str = "./data/last_sms.json";

/// Default port of the open API.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default Rosdomofon API root.
pub const DEFAULT_DOMOFON_BASE_URL: &str = "https://rdba.rosdomofon.com";

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Fetch a variable, treating blank values as absent.
fn optional<L>(lookup: &L, key: &str) -> Option<String>
where
    L: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required<L>(lookup: &L, key: &str) -> Result<String, ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    optional(lookup, key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parsed<L, T>(lookup: &L, key: &str, default: T) -> Result<T, ConfigError>
where
    L: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match optional(lookup, key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn positive_secs<L>(lookup: &L, key: &str, default: u64) -> Result<Duration, ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    let secs: u64 = parsed(lookup, key, default)?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

// ── Poller ──────────────────────────────────────────────────────────

/// SMS poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// JSON file holding the identifiers of already processed messages.
    pub last_sms_file: PathBuf,
    /// Messages older than this are recorded but never delivered.
    pub sms_alive_time: Duration,
    /// Period between two inbox fetches.
    pub poll_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            last_sms_file: PathBuf::from(DEFAULT_LAST_SMS_FILE),
            sms_alive_time: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl PollerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        // Zero is a legal threshold: only messages stamped "now" get through.
        let alive_secs: u64 = parsed(&lookup, "SMS_ALIVE_TIME", defaults.sms_alive_time.as_secs())?;

        Ok(Self {
            last_sms_file: optional(&lookup, "LAST_SMS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.last_sms_file),
            sms_alive_time: Duration::from_secs(alive_secs),
            poll_interval: positive_secs(
                &lookup,
                "SMS_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )?,
        })
    }
}

// ── Modem ───────────────────────────────────────────────────────────

/// Huawei HiLink modem connection settings.
#[derive(Debug, Clone)]
pub struct ModemConfig {
    /// Base URL of the modem web API, e.g. `http://192.168.8.1`.
    pub url: String,
    /// Empty when the modem does not require a login.
    pub user: String,
    pub password: SecretString,
    pub login_attempts: u32,
    pub login_retry_interval: Duration,
}

impl ModemConfig {
    /// Build config from environment variables.
    /// Fails if `MODEM_URL` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let url = normalize_base_url(&required(&lookup, "MODEM_URL")?);

        let login_attempts: u32 = parsed(&lookup, "MODEM_LOGIN_ATTEMPTS", 10)?;
        if login_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MODEM_LOGIN_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            url,
            user: optional(&lookup, "MODEM_USER").unwrap_or_default(),
            password: SecretString::from(optional(&lookup, "MODEM_PASSWORD").unwrap_or_default()),
            login_attempts,
            login_retry_interval: positive_secs(&lookup, "MODEM_LOGIN_RETRY_SECS", 5)?,
        })
    }
}

/// Accept bare hosts (`192.168.8.1`) as well as full URLs.
fn normalize_base_url(raw: &str) -> String {
    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    with_scheme.trim_end_matches('/').to_string()
}

// ── Gatekeeper ──────────────────────────────────────────────────────

/// Content filter and open trigger used by the SMS checker.
#[derive(Debug, Clone)]
pub struct GatekeeperConfig {
    /// Word every command SMS must contain.
    pub keyword: String,
    /// Second factor every command SMS must contain.
    pub protection_code: SecretString,
    /// Sent as `code` to the open endpoint.
    pub secret_key: SecretString,
    pub open_url: String,
}

impl GatekeeperConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let port: u16 = parsed(&lookup, "HTTP_PORT", DEFAULT_HTTP_PORT)?;

        Ok(Self {
            keyword: optional(&lookup, "GATE_KEYWORD").unwrap_or_else(|| "domofon".to_string()),
            protection_code: SecretString::from(required(&lookup, "PROTECTION_CODE")?),
            secret_key: SecretString::from(required(&lookup, "SECRET_KEY")?),
            open_url: optional(&lookup, "OPEN_URL")
                .unwrap_or_else(|| format!("http://domofonapi:{port}/api/open")),
        })
    }
}

// ── Open API ────────────────────────────────────────────────────────

/// HTTP service that validates the shared code and opens the door.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub http_port: u16,
    pub secret_key: SecretString,
    /// Rosdomofon key the temporary keys are derived from.
    pub key_id: i64,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let key_id = required(&lookup, "KEY_ID")?;
        let key_id = key_id.parse::<i64>().map_err(|e| ConfigError::InvalidValue {
            key: "KEY_ID".to_string(),
            message: format!("{key_id:?}: {e}"),
        })?;

        Ok(Self {
            http_port: parsed(&lookup, "HTTP_PORT", DEFAULT_HTTP_PORT)?,
            secret_key: SecretString::from(required(&lookup, "SECRET_KEY")?),
            key_id,
        })
    }
}

/// Rosdomofon account credentials.
#[derive(Debug, Clone)]
pub struct DomofonConfig {
    pub base_url: String,
    pub refresh_token: SecretString,
}

impl DomofonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            base_url: optional(&lookup, "DOMOFON_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_DOMOFON_BASE_URL.to_string()),
            refresh_token: SecretString::from(required(&lookup, "REFRESH_TOKEN")?),
        })
    }
}
