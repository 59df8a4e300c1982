//! Error types for hub operations.
//!
//! This module defines the error taxonomy shared by connections, clients,
//! rooms, the hub registry, and the message router.

use std::fmt;
use thiserror::Error;

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// Errors that can occur while operating on connections, rooms, or the hub.
#[derive(Debug, Error)]
pub enum HubError {
    /// An operation was attempted on a connection that has already closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A typed read expected a text frame but received another kind.
    #[error("expected a text message, received {received}")]
    ExpectedTextMessage {
        /// The kind of frame that actually arrived.
        received: &'static str,
    },

    /// A typed read expected a binary frame but received another kind.
    #[error("expected a binary message, received {received}")]
    ExpectedBinaryMessage {
        /// The kind of frame that actually arrived.
        received: &'static str,
    },

    /// A client was created against a hub that has already shut down.
    #[error("hub closed")]
    HubClosed,

    /// A room lookup missed.
    #[error("room not found: {name}")]
    RoomNotFound {
        /// The name that was looked up.
        name: String,
    },

    /// A client lookup missed.
    #[error("client not found: {id}")]
    ClientNotFound {
        /// The id that was looked up.
        id: String,
    },

    /// The peer closed the connection with a status code.
    #[error("connection closed by peer: {code} {reason}")]
    Closed {
        /// The close status code from the peer.
        code: u16,
        /// The close reason from the peer.
        reason: String,
    },

    /// An inbound frame exceeded the configured read limit.
    #[error("message too big: {size} bytes exceeds limit of {limit}")]
    MessageTooBig {
        /// The size of the offending frame.
        size: usize,
        /// The configured limit.
        limit: usize,
    },

    /// A blocking operation did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// Failed to send a frame on the transport.
    #[error("failed to send message: {0}")]
    SendFailed(String),

    /// The message payload could not be decoded.
    #[error("failed to decode message: {0}")]
    DecodeFailed(String),

    /// The message payload could not be encoded.
    #[error("failed to encode message: {0}")]
    EncodeFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level error from the WebSocket library.
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
}

impl HubError {
    /// Create a new room-not-found error.
    pub fn room_not_found(name: impl Into<String>) -> Self {
        Self::RoomNotFound { name: name.into() }
    }

    /// Create a new client-not-found error.
    pub fn client_not_found(id: impl Into<String>) -> Self {
        Self::ClientNotFound { id: id.into() }
    }

    /// Create a new peer-close error.
    pub fn closed(code: u16, reason: impl Into<String>) -> Self {
        Self::Closed {
            code,
            reason: reason.into(),
        }
    }

    /// Create a new send failed error.
    pub fn send_failed(reason: impl Into<String>) -> Self {
        Self::SendFailed(reason.into())
    }

    /// Create a new decode failed error.
    pub fn decode_failed(reason: impl Into<String>) -> Self {
        Self::DecodeFailed(reason.into())
    }

    /// Create a new encode failed error.
    pub fn encode_failed(reason: impl Into<String>) -> Self {
        Self::EncodeFailed(reason.into())
    }

    /// Get the close status code if the peer closed the connection.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Closed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Check whether this error represents a normal close.
    ///
    /// Normal (1000) and going-away (1001) closes are the expected way for a
    /// session to end; everything else is abnormal.
    pub fn is_normal_close(&self) -> bool {
        matches!(
            self,
            Self::Closed {
                code: 1000 | 1001,
                ..
            }
        )
    }

    /// Check whether this error ends the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::Closed { .. }
                | Self::MessageTooBig { .. }
                | Self::Io(_)
                | Self::Transport(_)
        )
    }
}

/// Close code for WebSocket connections.
///
/// Mirrors the standard close-code space; the numeric values are sent on the
/// wire and must stay bit-exact for client interoperability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Going away (1001).
    GoingAway = 1001,
    /// Protocol error (1002).
    Protocol = 1002,
    /// Unsupported data (1003).
    Unsupported = 1003,
    /// No status received (1005).
    NoStatus = 1005,
    /// Abnormal closure (1006).
    Abnormal = 1006,
    /// Invalid payload data (1007).
    InvalidPayload = 1007,
    /// Policy violation (1008).
    PolicyViolation = 1008,
    /// Message too big (1009).
    MessageTooBig = 1009,
    /// Extension required (1010).
    ExtensionRequired = 1010,
    /// Internal error (1011).
    InternalError = 1011,
    /// Service restart (1012).
    ServiceRestart = 1012,
    /// Try again later (1013).
    TryAgainLater = 1013,
    /// Bad gateway (1014).
    BadGateway = 1014,
    /// TLS handshake failure (1015).
    TlsHandshake = 1015,
}

impl CloseCode {
    /// Convert from a u16 code.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::Protocol),
            1003 => Some(Self::Unsupported),
            1005 => Some(Self::NoStatus),
            1006 => Some(Self::Abnormal),
            1007 => Some(Self::InvalidPayload),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::MessageTooBig),
            1010 => Some(Self::ExtensionRequired),
            1011 => Some(Self::InternalError),
            1012 => Some(Self::ServiceRestart),
            1013 => Some(Self::TryAgainLater),
            1014 => Some(Self::BadGateway),
            1015 => Some(Self::TlsHandshake),
            _ => None,
        }
    }

    /// Get the u16 value of this close code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Check whether this code represents a normal close.
    pub fn is_normal(self) -> bool {
        matches!(self, Self::Normal | Self::GoingAway)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "Normal",
            Self::GoingAway => "GoingAway",
            Self::Protocol => "Protocol",
            Self::Unsupported => "Unsupported",
            Self::NoStatus => "NoStatus",
            Self::Abnormal => "Abnormal",
            Self::InvalidPayload => "InvalidPayload",
            Self::PolicyViolation => "PolicyViolation",
            Self::MessageTooBig => "MessageTooBig",
            Self::ExtensionRequired => "ExtensionRequired",
            Self::InternalError => "InternalError",
            Self::ServiceRestart => "ServiceRestart",
            Self::TryAgainLater => "TryAgainLater",
            Self::BadGateway => "BadGateway",
            Self::TlsHandshake => "TlsHandshake",
        };
        write!(f, "{} ({})", name, self.as_u16())
    }
}
