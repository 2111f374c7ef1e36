//! Error types for gearq

use crate::protocol::{Packet, PacketType};
use thiserror::Error;

/// Result type alias for gearq operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in gearq operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame or unexpected packet; the connection must be closed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame length exceeds the configured maximum
    #[error("Message exceeds maximum size limit")]
    MessageTooLarge,

    /// Peer disconnected
    #[error("Connection closed")]
    ConnectionClosed,

    /// Bounded wait exceeded
    #[error("Operation timeout")]
    Timeout,

    /// A blocking wait for work was cancelled on purpose
    #[error("Interrupted while waiting for jobs")]
    Interrupted,

    /// The job already carries a handle
    #[error("Job has already been submitted")]
    AlreadySubmitted,

    /// A terminal report was already sent for this assignment
    #[error("Job {0} has already reached a terminal state")]
    JobFinished(String),

    /// No server connection is ready
    #[error("No server connection available")]
    NoServers,

    /// ERROR packet returned by the server
    #[error("Server error {code}: {message}")]
    Server {
        /// Error code sent by the server
        code: String,
        /// Human readable text sent by the server
        message: String,
    },

    /// Invalid arguments
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Certificate or key material could not be used
    #[error("TLS error: {0}")]
    Tls(String),
}

impl Error {
    /// Short machine-readable code used in ERROR packets
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Error::Protocol(_) => "protocol_error",
            Error::MessageTooLarge => "message_too_large",
            Error::InvalidArguments(_) => "invalid_arguments",
            Error::JobFinished(_) => "job_not_found",
            _ => "internal_error",
        }
    }

    /// Convert error to an ERROR response packet
    #[must_use]
    pub fn to_error_packet(&self) -> Packet {
        Packet::response(
            PacketType::Error,
            &[self.code().as_bytes(), self.to_string().as_bytes()],
        )
    }

    /// Whether the connection that produced this error must be dropped
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Protocol(_) | Error::MessageTooLarge | Error::ConnectionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_packet_carries_code_and_text() {
        let packet = Error::InvalidArguments("missing handle".to_string()).to_error_packet();
        assert_eq!(packet.ptype, PacketType::Error);
        let args = packet.arguments(2).unwrap();
        assert_eq!(args[0], &b"invalid_arguments"[..]);
        assert_eq!(args[1], &b"Invalid arguments: missing handle"[..]);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Protocol("bad magic".to_string()).is_fatal());
        assert!(Error::MessageTooLarge.is_fatal());
        assert!(!Error::InvalidArguments("x".to_string()).is_fatal());
        assert!(!Error::Interrupted.is_fatal());
    }
}
