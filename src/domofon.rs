//! Rosdomofon client. Mints and activates single-use temporary keys.
//!
//! Auth is an OAuth refresh-token grant. The access token is fetched lazily
//! on first use and refreshed once when the API answers 401.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::config::DomofonConfig;
use crate::error::DomofonError;

const TOKEN_PATH: &str = "/authserver-service/oauth/token";
const TEMPORARY_KEYS_PATH: &str = "/rdas-service/api/v1/temporary_keys";

/// OAuth client id used by the resident mobile app.
const CLIENT_ID: &str = "abonent";

/// Each key opens the door once.
const ACTIVATIONS_COUNT: u32 = 1;
/// Key lifetime in hours.
const WORKING_PERIOD: u32 = 12;

/// Per-request timeout for Rosdomofon calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Most upstream calls one open can make: refresh, create, refresh, create, activate.
pub const MAX_CALLS_PER_OPEN: u32 = 5;

/// Issues and activates temporary intercom keys.
#[async_trait]
pub trait KeyIssuer: Send + Sync {
    /// Create a temporary key derived from `key_id`; returns its activation link.
    async fn create_temporary_key(&self, key_id: i64) -> Result<String, DomofonError>;

    /// Activate a key from the link returned by `create_temporary_key`.
    async fn activate_key(&self, activation_link: &str) -> Result<(), DomofonError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TemporaryKeyRequest {
    activations_count: u32,
    key_id: i64,
    working_period: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemporaryKeyResponse {
    activation_link: String,
}

struct Tokens {
    /// `Bearer …`, ready for the Authorization header.
    access: Option<SecretString>,
    refresh: SecretString,
}

/// HTTP client for the Rosdomofon API.
pub struct RosDomofon {
    base_url: String,
    client: reqwest::Client,
    tokens: Mutex<Tokens>,
}

impl RosDomofon {
    pub fn new(config: DomofonConfig) -> Result<Self, DomofonError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            tokens: Mutex::new(Tokens {
                access: None,
                refresh: config.refresh_token,
            }),
        })
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// The server rotates the refresh token; the new one replaces the old.
    async fn refresh_access_token(&self, tokens: &mut Tokens) -> Result<(), DomofonError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", CLIENT_ID),
            ("refresh_token", tokens.refresh.expose_secret()),
        ];

        let response = self
            .client
            .post(format!("{}{TOKEN_PATH}", self.base_url))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DomofonError::TokenRefresh { status });
        }

        let token: TokenResponse = response.json().await?;
        tokens.access = Some(SecretString::from(format!("Bearer {}", token.access_token)));
        if let Some(refresh) = token.refresh_token.filter(|t| !t.is_empty()) {
            tokens.refresh = SecretString::from(refresh);
        }

        debug!("Refreshed Rosdomofon access token");
        Ok(())
    }

    async fn send_create(
        &self,
        tokens: &Tokens,
        body: &TemporaryKeyRequest,
    ) -> Result<reqwest::Response, DomofonError> {
        let access = tokens
            .access
            .as_ref()
            .map(|t| t.expose_secret().to_string())
            .unwrap_or_default();

        Ok(self
            .client
            .post(format!("{}{TEMPORARY_KEYS_PATH}", self.base_url))
            .header(AUTHORIZATION, access)
            .json(body)
            .send()
            .await?)
    }
}

#[async_trait]
impl KeyIssuer for RosDomofon {
    async fn create_temporary_key(&self, key_id: i64) -> Result<String, DomofonError> {
        let mut tokens = self.tokens.lock().await;
        if tokens.access.is_none() {
            self.refresh_access_token(&mut tokens).await?;
        }

        let body = TemporaryKeyRequest {
            activations_count: ACTIVATIONS_COUNT,
            key_id,
            working_period: WORKING_PERIOD,
        };

        let mut response = self.send_create(&tokens, &body).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            info!("Rosdomofon access token rejected, refreshing");
            self.refresh_access_token(&mut tokens).await?;
            response = self.send_create(&tokens, &body).await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(DomofonError::CreateKey { status });
        }

        let key: TemporaryKeyResponse = response.json().await?;
        info!(key_id, "Created temporary key");
        Ok(key.activation_link)
    }

    async fn activate_key(&self, activation_link: &str) -> Result<(), DomofonError> {
        let token = activation_token(activation_link)?;

        let response = self
            .client
            .post(format!(
                "{}{TEMPORARY_KEYS_PATH}/{token}/activate",
                self.base_url
            ))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            return Err(DomofonError::Activation { status });
        }

        info!("Activated temporary key");
        Ok(())
    }
}

/// Extract `token` from `https://my.rosdomofon.com/temporary-keys/activate?token=…`.
fn activation_token(link: &str) -> Result<String, DomofonError> {
    let url = Url::parse(link).map_err(|e| DomofonError::InvalidLink(format!("{link}: {e}")))?;
    url.query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| DomofonError::InvalidLink(format!("no token in {link}")))
}
