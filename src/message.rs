//! Wire message envelope.
//!
//! Frames on the wire are JSON objects with SCREAMING_SNAKE keys:
//!
//! ```text
//! { "MESSAGE_TYPE": "USER_ADD_ACK",
//!   "MESSAGE_ID": 42,
//!   "TIMESTAMP": "2026-08-27 10:15:00.123456-04:00",
//!   "REPLY_TO_ID": 41,
//!   "CONTENT": { ... },
//!   "EXCEPTION": { "ERROR_CODE": "XPRM", "ERROR_TEXT": "..." } }
//! ```
//!
//! `MESSAGE_ID` and `TIMESTAMP` are assigned by the session at send time;
//! an outgoing draft built with [`Message::request`] leaves them unset.
//! Reply content may carry `QUERY_ID`, `SCHEMA`, `INSERT`, `UPDATE`,
//! `DELETE` and `IS_LAST`; those keys are interpreted by the query channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One wire frame, incoming or outgoing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message type, also the routing key for observers.
    #[serde(rename = "MESSAGE_TYPE")]
    pub message_type: String,

    /// Monotonically increasing id, allocated once per outgoing message by
    /// the sending session. Absent on drafts and on some inbound frames.
    #[serde(rename = "MESSAGE_ID", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,

    /// Send timestamp in a lexicographically sortable format with offset.
    #[serde(rename = "TIMESTAMP", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Correlation id: the `MESSAGE_ID` of the message this one replies to.
    #[serde(rename = "REPLY_TO_ID", default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<u64>,

    /// Message payload. `Value::Null` when the frame carries none.
    #[serde(rename = "CONTENT", default, skip_serializing_if = "Value::is_null")]
    pub content: Value,

    /// Error detail, present on NACK frames.
    #[serde(rename = "EXCEPTION", default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<WireException>,
}

/// Ack/nack detail extracted from a reply frame for local event
/// observers. Both error fields are absent on a positive acknowledgement.
#[derive(Debug, Clone, Default)]
pub struct ReplyStatus {
    /// Short machine-readable code from the embedded exception.
    pub error_code: Option<String>,
    /// Human-readable text from the embedded exception.
    pub error_text: Option<String>,
    /// Correlation id of the request this reply answers.
    pub reply_to_id: Option<u64>,
}

impl ReplyStatus {
    /// Extract the status fields of a reply frame.
    #[must_use]
    pub fn of(message: &Message) -> Self {
        Self {
            error_code: message.error_code().map(String::from),
            error_text: message.error_text().map(String::from),
            reply_to_id: message.reply_to_id,
        }
    }
}

/// Embedded error detail on a negative acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireException {
    /// Short machine-readable code (e.g. `XPRM`, `XQID`).
    #[serde(rename = "ERROR_CODE", default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// Human-readable error text.
    #[serde(rename = "ERROR_TEXT", default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl Message {
    /// Build an outgoing draft. The session fills in id and timestamp when
    /// the draft is actually sent.
    #[must_use]
    pub fn request(message_type: impl Into<String>, content: Value) -> Self {
        Self {
            message_type: message_type.into(),
            message_id: None,
            timestamp: None,
            reply_to_id: None,
            content,
            exception: None,
        }
    }

    /// Embedded error code, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        self.exception.as_ref().and_then(|e| e.error_code.as_deref())
    }

    /// Embedded error text, if any.
    #[must_use]
    pub fn error_text(&self) -> Option<&str> {
        self.exception.as_ref().and_then(|e| e.error_text.as_deref())
    }
}
