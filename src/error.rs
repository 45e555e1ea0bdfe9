//! Error types and the transport close-status taxonomy.

use std::fmt;

/// Domain string used on protocol-generated error responses.
pub const ERROR_DOMAIN_BLIP: &str = "BLIP";

/// Why a connection (or its transport) went away.
///
/// Close statuses are reported verbatim through
/// [`ConnectionDelegate::on_close`](crate::ConnectionDelegate::on_close);
/// only a WebSocket-level close with code 1000 or 1001 counts as normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A WebSocket close frame; `code` is the WebSocket status code.
    WebSocket,
    /// An OS-level error; `code` is the errno when known.
    Posix,
    /// A network-layer failure below the WebSocket protocol.
    Network,
    /// An internal failure that was not supposed to happen.
    Exception,
    /// The transport went away without saying why.
    Unknown,
}

/// Status reported when the transport closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub reason: CloseReason,
    pub code: u16,
    pub message: String,
}

impl CloseStatus {
    pub fn new(reason: CloseReason, code: u16, message: impl Into<String>) -> Self {
        Self {
            reason,
            code,
            message: message.into(),
        }
    }

    /// True for a clean WebSocket close (codes 1000 and 1001).
    pub fn is_normal(&self) -> bool {
        self.reason == CloseReason::WebSocket && (self.code == 1000 || self.code == 1001)
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.reason, self.code)?;
        if !self.message.is_empty() {
            write!(f, " ({})", self.message)?;
        }
        Ok(())
    }
}

/// Errors surfaced through the public API.
#[derive(Debug)]
pub enum BlipError {
    /// The connection closed (or was closing) before the operation completed.
    ConnectionClosed,
    /// The message was sent with NoReply, so no response will ever arrive.
    NoReply,
    /// A request handler failed; the peer gets an automatic BLIP/501 reply.
    Handler(String),
}

impl fmt::Display for BlipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlipError::ConnectionClosed => write!(f, "connection closed"),
            BlipError::NoReply => write!(f, "message was sent with NoReply"),
            BlipError::Handler(msg) => write!(f, "request handler failed: {msg}"),
        }
    }
}

impl std::error::Error for BlipError {}

pub type Result<T> = std::result::Result<T, BlipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_close_codes() {
        assert!(CloseStatus::new(CloseReason::WebSocket, 1000, "").is_normal());
        assert!(CloseStatus::new(CloseReason::WebSocket, 1001, "going away").is_normal());
        assert!(!CloseStatus::new(CloseReason::WebSocket, 1006, "").is_normal());
        assert!(!CloseStatus::new(CloseReason::Posix, 1000, "").is_normal());
        assert!(!CloseStatus::new(CloseReason::Network, 0, "reset").is_normal());
    }

    #[test]
    fn close_status_display() {
        let s = CloseStatus::new(CloseReason::WebSocket, 1000, "bye");
        let text = s.to_string();
        assert!(text.contains("1000"));
        assert!(text.contains("bye"));
    }
}
