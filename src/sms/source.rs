//! Seams between the poller and its collaborators.

use async_trait::async_trait;

use crate::error::{Error, ModemError};
use crate::sms::types::{InboxMessage, Sms};

/// Lists the current inbox of a stateful device.
///
/// Implementations own their session lifecycle; the poller only ever
/// calls `fetch_inbox` and expects a prior login to have happened.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// The full current inbox, not a diff against the previous call.
    async fn fetch_inbox(&self) -> Result<Vec<InboxMessage>, ModemError>;
}

/// Receives every new, fresh message exactly once.
///
/// Errors are logged by the poller and never retried.
#[async_trait]
pub trait SmsHandler: Send + Sync {
    async fn on_sms(&self, sms: Sms) -> Result<(), Error>;
}
