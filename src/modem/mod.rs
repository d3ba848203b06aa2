//! Huawei HiLink modem client.
//!
//! `login()` establishes the session cookie. Every later call first fetches
//! a fresh CSRF token from `SesTokInfo` under that cookie, then sends both as
//! `Cookie` and `__RequestVerificationToken` headers. Only the calls needed
//! to read the SMS inbox are implemented.

mod xml;

pub use xml::DeviceStatus;

use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ModemConfig;
use crate::error::ModemError;
use crate::sms::{InboxMessage, MessageSource};

const SES_TOK_INFO: &str = "/api/webserver/SesTokInfo";
const LOGIN: &str = "/api/user/login";
const DEVICE_STATUS: &str = "/api/monitoring/status";
const SMS_LIST: &str = "/api/sms/sms-list";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";
const VERIFICATION_TOKEN: &str = "__RequestVerificationToken";

/// Per-request timeout for modem calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct Session {
    cookie: String,
    token: String,
}

/// Stateful client for one HiLink modem.
pub struct HuaweiModem {
    base_url: String,
    user: String,
    /// `base64(hex(sha256(password)))`, the form the login hash builds on.
    password_hash: String,
    client: reqwest::Client,
    /// `None` until `login()` succeeds.
    session: Mutex<Option<Session>>,
}

impl HuaweiModem {
    pub fn new(config: &ModemConfig) -> Result<Self, ModemError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ModemError::Request {
                endpoint: config.url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password_hash: hash_and_encode(config.password.expose_secret()),
            client,
            session: Mutex::new(None),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.base_url)
    }

    /// Authenticate and read the device status.
    ///
    /// Modems without a configured user only need a session from
    /// `SesTokInfo`; otherwise a `password_type 4` login is sent.
    pub async fn login(&self) -> Result<(), ModemError> {
        let mut session = self.fetch_session().await?;

        if !self.user.is_empty() {
            let password = hash_and_encode(&format!(
                "{}{}{}",
                self.user, self.password_hash, session.token
            ));
            let response = self
                .client
                .post(self.url(LOGIN))
                .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
                .header(COOKIE, &session.cookie)
                .header(VERIFICATION_TOKEN, &session.token)
                .body(xml::login_request(&self.user, &password))
                .send()
                .await
                .map_err(|e| request_failed(LOGIN, e))?;

            if !response.status().is_success() {
                return Err(ModemError::Request {
                    endpoint: LOGIN.to_string(),
                    reason: format!("status {}", response.status()),
                });
            }

            // The modem rotates the session cookie on login.
            if let Some(cookie) = response
                .headers()
                .get(SET_COOKIE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(';').next())
            {
                session.cookie = cookie.trim().to_string();
            }

            let body = response.text().await.map_err(|e| request_failed(LOGIN, e))?;
            xml::check_error(&body)?;
            debug!(user = %self.user, "Modem login accepted");
        }

        *self.session.lock().await = Some(session);

        let status = self.device_status().await?;
        info!(
            modem = %self.base_url,
            connection = %status.connection_status,
            signal = %status.signal_icon,
            network = %status.current_network_type,
            sim = %status.sim_status,
            "Logged in to modem"
        );
        Ok(())
    }

    /// Call `login()` up to `attempts` times, sleeping `interval` between tries.
    pub async fn login_with_retry(&self, attempts: u32, interval: Duration) -> Result<(), ModemError> {
        let mut attempt = 1;
        loop {
            match self.login().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => {
                    return Err(ModemError::LoginExhausted {
                        attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(
                        "Modem login attempt {attempt}/{attempts} failed, retrying in {}s: {e}",
                        interval.as_secs()
                    );
                    tokio::time::sleep(interval).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn device_status(&self) -> Result<DeviceStatus, ModemError> {
        let session = self.refresh_session().await?;
        let body = self
            .get_text(DEVICE_STATUS, Some(&session))
            .await?;
        xml::parse_device_status(DEVICE_STATUS, &body)
    }

    /// Read the first page of the inbox.
    pub async fn read_inbox(&self) -> Result<Vec<InboxMessage>, ModemError> {
        let session = self.refresh_session().await?;

        let response = self
            .client
            .post(self.url(SMS_LIST))
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .header(COOKIE, &session.cookie)
            .header(VERIFICATION_TOKEN, &session.token)
            .body(xml::SMS_LIST_REQUEST)
            .send()
            .await
            .map_err(|e| request_failed(SMS_LIST, e))?;
        let body = response
            .text()
            .await
            .map_err(|e| request_failed(SMS_LIST, e))?;

        let inbox = xml::parse_sms_list(SMS_LIST, &body)?;
        debug!(count = inbox.len(), "Read SMS inbox");
        Ok(inbox)
    }

    /// Fresh CSRF token for an already logged-in client.
    ///
    /// `SesTokInfo` is requested with the session cookie from `login()`, and
    /// that cookie is kept: only the token rotates.
    async fn refresh_session(&self) -> Result<Session, ModemError> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(ModemError::NotLoggedIn);
        };

        let body = self.get_text(SES_TOK_INFO, Some(&*session)).await?;
        let info = xml::parse_ses_tok_info(SES_TOK_INFO, &body)?;
        session.token = info.tok_info;
        Ok(session.clone())
    }

    async fn fetch_session(&self) -> Result<Session, ModemError> {
        let body = self.get_text(SES_TOK_INFO, None).await?;
        let info = xml::parse_ses_tok_info(SES_TOK_INFO, &body)?;
        Ok(Session {
            cookie: info.ses_info,
            token: info.tok_info,
        })
    }

    async fn get_text(&self, endpoint: &str, session: Option<&Session>) -> Result<String, ModemError> {
        let mut request = self.client.get(self.url(endpoint));
        if let Some(session) = session {
            request = request
                .header(COOKIE, &session.cookie)
                .header(VERIFICATION_TOKEN, &session.token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| request_failed(endpoint, e))?;
        response.text().await.map_err(|e| request_failed(endpoint, e))
    }
}

#[async_trait]
impl MessageSource for HuaweiModem {
    async fn fetch_inbox(&self) -> Result<Vec<InboxMessage>, ModemError> {
        self.read_inbox().await
    }
}

fn request_failed(endpoint: &str, e: reqwest::Error) -> ModemError {
    ModemError::Request {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    }
}

/// `base64(hex(sha256(input)))`, the HiLink password encoding.
fn hash_and_encode(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    BASE64_STANDARD.encode(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_matches_hilink_encoding() {
        assert_eq!(
            hash_and_encode("admin"),
            "OGM2OTc2ZTViNTQxMDQxNWJkZTkwOGJkNGRlZTE1ZGZiMTY3YTljODczZmM0YmI4YTgxZjZmMmFiNDQ4YTkxOA=="
        );
    }

    #[test]
    fn login_hash_chains_user_password_and_token() {
        let password = hash_and_encode("admin");
        assert_eq!(
            hash_and_encode(&format!("admin{password}tok123")),
            "M2ViNTNkMWVhMmE1NmU3MzEzY2I0ZjU3Zjg2MDQzODQzYWFkNmFmNjZhOGJmYjJhYWJkNGViNWE4YjFkNzM0MQ=="
        );
    }

    #[tokio::test]
    async fn inbox_requires_login() {
        let config = ModemConfig {
            url: "http://127.0.0.1:9".into(),
            user: String::new(),
            password: secrecy::SecretString::from(""),
            login_attempts: 1,
            login_retry_interval: Duration::from_secs(1),
        };
        let modem = HuaweiModem::new(&config).unwrap();
        let err = modem.fetch_inbox().await.unwrap_err();
        assert!(matches!(err, ModemError::NotLoggedIn));
    }
}
