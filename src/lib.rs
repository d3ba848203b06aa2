//! Domofon bridge: opens a Rosdomofon intercom from an SMS.
//!
//! `sms-checker` polls a Huawei HiLink modem inbox and forwards command
//! messages to `domofon-api`, which holds the intercom credentials.

pub mod api;
pub mod config;
pub mod domofon;
pub mod error;
pub mod gatekeeper;
pub mod logging;
pub mod modem;
pub mod sms;
