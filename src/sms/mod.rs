//! SMS polling and deduplication.

pub mod dedup;
pub mod poller;
pub mod source;
pub mod types;

pub use dedup::DedupStore;
pub use poller::{Clock, PollStats, SmsPoller, SystemClock, TickOutcome};
pub use source::{MessageSource, SmsHandler};
pub use types::{DEVICE_DATE_FORMAT, InboxMessage, Sms};
