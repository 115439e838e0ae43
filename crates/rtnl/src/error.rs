//! Error types for the rtnetlink codec and transport.

use netlink_packet_utils::DecodeError;
use thiserror::Error;

/// Errors surfaced by the rtnetlink socket and transport.
#[derive(Debug, Error)]
pub enum RtnlError {
    /// Socket-level failure (create, bind, send, receive).
    #[error("netlink socket error: {0}")]
    Io(#[from] std::io::Error),

    /// A single wire message could not be decoded. The offending
    /// message is discarded; the socket stays usable.
    #[error("malformed netlink message: {0}")]
    Malformed(#[from] DecodeError),

    /// A message could not be encoded. Aborts only the one request.
    #[error("could not encode netlink message: {0}")]
    Encode(String),
}

/// Result type alias for rtnetlink operations.
pub type Result<T> = std::result::Result<T, RtnlError>;
