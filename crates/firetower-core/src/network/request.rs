//! Client-facing JSON messages.
//!
//! One JSON object per line, `{"type": .., "topic": .., "data": ..}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::network::Message;

/// Request types a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

/// One client request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientRequest {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub data: Value,
}

impl ClientRequest {
    /// Parse one line.
    ///
    /// # Errors
    ///
    /// [`GatewayError::FrontProtocol`] for malformed JSON or an unknown type.
    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// `topic` split on commas, trimmed, empties dropped.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.topic
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Publish payload: strings are sent as their raw bytes, anything else
    /// as compact JSON.
    ///
    /// # Errors
    ///
    /// Fails only if `data` cannot be serialized.
    pub fn payload(&self) -> Result<Vec<u8>> {
        match &self.data {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            other => Ok(serde_json::to_vec(other)?),
        }
    }
}

/// One line written to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub topic: String,
    pub data: Value,
}

impl ClientEvent {
    /// Event for a message delivered from the bucket.
    ///
    /// A payload holding a JSON document (other than a bare string) is
    /// embedded as JSON, everything else as a string.
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        let data = match serde_json::from_slice::<Value>(&message.payload) {
            Ok(value) if !value.is_string() => value,
            _ => Value::String(String::from_utf8_lossy(&message.payload).into_owned()),
        };
        Self {
            kind: message.kind.clone(),
            topic: message.topic.clone(),
            data,
        }
    }

    #[must_use]
    pub fn error(topic: &str, reason: impl std::fmt::Display) -> Self {
        Self {
            kind: "error".to_string(),
            topic: topic.to_string(),
            data: Value::String(reason.to_string()),
        }
    }

    /// Serialize to a single line (no trailing newline).
    ///
    /// # Errors
    ///
    /// Fails only if serialization fails.
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self).map_err(GatewayError::from)
    }
}
