//! Error types for the protocol layer.
//!
//! Transport drops are not errors here: the session recovers them with its
//! reconnect loop. Protocol-level rejections (NACK) are events, not errors.
//! What remains are caller-precondition and encoding failures surfaced from
//! `send` and `open`.

/// Errors surfaced by session and channel operations.
#[derive(Debug)]
pub enum SessionError {
    /// `send` was called while the session is not open. The caller must
    /// re-issue after the session reconnects; nothing is queued or retried.
    NotOpen,
    /// `open` was called on a session that already has a connection loop.
    AlreadyOpen,
    /// The address could not be resolved to a WebSocket endpoint.
    AddressInvalid(String),
    /// The transport rejected a frame (connection torn down mid-send).
    Transport(String),
    /// Outgoing message failed to serialize.
    Encode(serde_json::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotOpen => write!(f, "session is not open"),
            Self::AlreadyOpen => write!(f, "session is already open"),
            Self::AddressInvalid(addr) => write!(f, "invalid address: {addr}"),
            Self::Transport(msg) => write!(f, "transport failure: {msg}"),
            Self::Encode(e) => write!(f, "message encoding failed: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_not_open() {
        assert_eq!(SessionError::NotOpen.to_string(), "session is not open");
    }

    #[test]
    fn test_display_address_invalid() {
        let e = SessionError::AddressInvalid("bogus".to_string());
        assert_eq!(e.to_string(), "invalid address: bogus");
    }

    #[test]
    fn test_encode_has_source() {
        use std::error::Error as _;

        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let e = SessionError::Encode(bad);
        assert!(e.source().is_some());
    }
}
