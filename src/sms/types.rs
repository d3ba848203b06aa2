//! SMS records as listed by the modem and as handed to handlers.

use chrono::NaiveDateTime;

/// Timestamp layout of the modem's `<Date>` field. No timezone.
pub const DEVICE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One entry of an inbox snapshot, exactly as the device lists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxMessage {
    /// Device-assigned identifier. Neither monotonic nor gap-free.
    pub index: i64,
    pub phone: String,
    pub content: String,
    /// Device-local time, `YYYY-MM-DD HH:MM:SS`.
    pub date: String,
}

impl InboxMessage {
    /// Parse the device timestamp.
    pub fn parse_date(&self) -> Result<NaiveDateTime, chrono::ParseError> {
        NaiveDateTime::parse_from_str(self.date.trim(), DEVICE_DATE_FORMAT)
    }
}

/// A new, fresh message delivered to the registered handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sms {
    pub id: i64,
    pub date: NaiveDateTime,
    pub phone: String,
    pub content: String,
}
