use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Nagios-compatible check states. Providers report these as plain
/// integers on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum CheckStatus {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl From<i64> for CheckStatus {
    fn from(value: i64) -> Self {
        match value {
            0 => CheckStatus::Ok,
            1 => CheckStatus::Warning,
            2 => CheckStatus::Critical,
            // Anything a provider sends outside the Nagios range is
            // reported as unknown rather than rejected.
            _ => CheckStatus::Unknown,
        }
    }
}

impl From<CheckStatus> for i64 {
    fn from(value: CheckStatus) -> Self {
        match value {
            CheckStatus::Ok => 0,
            CheckStatus::Warning => 1,
            CheckStatus::Critical => 2,
            CheckStatus::Unknown => 3,
        }
    }
}

/// A single check invocation sent to a provider process. Serialized as a
/// one-line JSON document terminated by a newline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    pub arguments: Vec<String>,
}

impl Request {
    pub fn new(command: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            command: command.into(),
            arguments,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut payload = serde_json::to_vec(self)?;
        payload.push(b'\n');
        Ok(payload)
    }
}

/// What a provider hands back for one check run. `received_at` is not part
/// of the wire format; the receiver stamps it when the payload is decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub name: String,
    pub status: CheckStatus,
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Vec<HashMap<String, i64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub received_at: i64,
}

impl Response {
    /// Decodes a provider payload, stamping the current time on it.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, serde_json::Error> {
        let mut resp: Response = serde_json::from_slice(payload)?;
        resp.received_at = chrono::Utc::now().timestamp();
        Ok(resp)
    }

    /// A well-formed UNKNOWN reply for queries that could not be served,
    /// so NRPE callers always get an answer when one is possible.
    pub fn unknown(name: impl Into<String>, message: &str) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Unknown,
            stdout: vec![format!("[ERROR] {message}")],
            metrics: None,
            error: Some(message.to_string()),
            received_at: chrono::Utc::now().timestamp(),
        }
    }
}
