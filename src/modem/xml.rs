//! XML bodies exchanged with the HiLink web API.

use serde::Deserialize;

use crate::error::ModemError;
use crate::sms::types::InboxMessage;

/// `GET /api/webserver/SesTokInfo`
#[derive(Debug, Deserialize)]
pub(crate) struct SesTokInfo {
    #[serde(rename = "SesInfo")]
    pub ses_info: String,
    #[serde(rename = "TokInfo")]
    pub tok_info: String,
}

/// `<error><code>…</code><message>…</message></error>`
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
}

#[derive(Debug, Deserialize)]
struct SmsListBody {
    #[serde(rename = "Messages", default)]
    messages: MessagesBody,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesBody {
    #[serde(rename = "Message", default)]
    message: Vec<MessageBody>,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    #[serde(rename = "Index")]
    index: i64,
    #[serde(rename = "Phone", default)]
    phone: String,
    #[serde(rename = "Content", default)]
    content: String,
    #[serde(rename = "Date", default)]
    date: String,
}

/// Subset of `GET /api/monitoring/status` worth logging at startup.
///
/// Fields are kept as text: the firmware leaves many of them empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeviceStatus {
    #[serde(rename = "ConnectionStatus", default)]
    pub connection_status: String,
    #[serde(rename = "SignalIcon", default)]
    pub signal_icon: String,
    #[serde(rename = "CurrentNetworkType", default)]
    pub current_network_type: String,
    #[serde(rename = "ServiceStatus", default)]
    pub service_status: String,
    #[serde(rename = "SimStatus", default)]
    pub sim_status: String,
    #[serde(rename = "WanIPAddress", default)]
    pub wan_ip_address: String,
}

/// Request body for the first inbox page, newest first.
pub(crate) const SMS_LIST_REQUEST: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    "<request>",
    "<PageIndex>1</PageIndex>",
    "<ReadCount>20</ReadCount>",
    "<BoxType>1</BoxType>",
    "<SortType>0</SortType>",
    "<Ascending>0</Ascending>",
    "<UnreadPreferred>0</UnreadPreferred>",
    "</request>"
);

pub(crate) fn login_request(user: &str, password: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            "<request>",
            "<Username>{}</Username>",
            "<Password>{}</Password>",
            "<password_type>4</password_type>",
            "</request>"
        ),
        quick_xml::escape::escape(user),
        quick_xml::escape::escape(password),
    )
}

/// Turn an `<error>` body into `ModemError::Api`.
pub(crate) fn check_error(body: &str) -> Result<(), ModemError> {
    match quick_xml::de::from_str::<ErrorBody>(body) {
        Ok(err) => Err(ModemError::Api { code: err.code }),
        Err(_) => Ok(()),
    }
}

pub(crate) fn parse_ses_tok_info(endpoint: &str, body: &str) -> Result<SesTokInfo, ModemError> {
    check_error(body)?;
    quick_xml::de::from_str(body).map_err(|e| invalid(endpoint, e))
}

pub(crate) fn parse_sms_list(endpoint: &str, body: &str) -> Result<Vec<InboxMessage>, ModemError> {
    check_error(body)?;
    let list: SmsListBody = quick_xml::de::from_str(body).map_err(|e| invalid(endpoint, e))?;
    Ok(list
        .messages
        .message
        .into_iter()
        .map(|m| InboxMessage {
            index: m.index,
            phone: m.phone,
            content: m.content,
            date: m.date,
        })
        .collect())
}

pub(crate) fn parse_device_status(endpoint: &str, body: &str) -> Result<DeviceStatus, ModemError> {
    check_error(body)?;
    quick_xml::de::from_str(body).map_err(|e| invalid(endpoint, e))
}

fn invalid(endpoint: &str, e: quick_xml::de::DeError) -> ModemError {
    ModemError::InvalidResponse {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    }
}
