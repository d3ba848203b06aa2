//! Turns a command SMS into an open request.
//!
//! A message opens the door only when its text contains both the keyword and
//! the protection code. The open call goes to the local API, which holds the
//! intercom credentials.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::info;

use crate::config::GatekeeperConfig;
use crate::error::{Error, GatekeeperError};
use crate::sms::{Sms, SmsHandler};

/// Longer than the open API's worst case, so a slow but successful open is
/// not reported as a failure.
const OPEN_TIMEOUT: Duration = Duration::from_secs(90);

/// Why a message was or was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    MissingKeyword,
    MissingCode,
}

#[derive(Debug, Deserialize)]
struct OpenResponse {
    #[serde(default)]
    success: bool,
}

/// Content filter plus HTTP trigger.
pub struct Gatekeeper {
    config: GatekeeperConfig,
    client: reqwest::Client,
}

impl Gatekeeper {
    pub fn new(config: GatekeeperConfig) -> Result<Self, GatekeeperError> {
        let client = reqwest::Client::builder().timeout(OPEN_TIMEOUT).build()?;
        Ok(Self { config, client })
    }

    /// Match the message text. Case-sensitive.
    pub fn check(&self, content: &str) -> Verdict {
        if !content.contains(&self.config.keyword) {
            return Verdict::MissingKeyword;
        }
        if !content.contains(self.config.protection_code.expose_secret()) {
            return Verdict::MissingCode;
        }
        Verdict::Accepted
    }

    /// Call the open endpoint with the shared secret.
    pub async fn open(&self) -> Result<(), GatekeeperError> {
        let response = self
            .client
            .get(&self.config.open_url)
            .query(&[("code", self.config.secret_key.expose_secret())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatekeeperError::Rejected { status, body });
        }

        let reply: OpenResponse = response.json().await?;
        if !reply.success {
            return Err(GatekeeperError::NotConfirmed);
        }
        Ok(())
    }
}

#[async_trait]
impl SmsHandler for Gatekeeper {
    async fn on_sms(&self, sms: Sms) -> Result<(), Error> {
        match self.check(&sms.content) {
            Verdict::Accepted => {}
            verdict => {
                info!(id = sms.id, phone = %sms.phone, ?verdict, "SMS is not an open command");
                return Ok(());
            }
        }

        info!(id = sms.id, phone = %sms.phone, "Open command received");
        self.open().await?;
        info!(id = sms.id, "Door opened");
        Ok(())
    }
}
