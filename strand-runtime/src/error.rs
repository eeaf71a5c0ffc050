//! Runtime error types.

use std::time::Duration;

use strand_core::{PeerId, ServerId};
use strand_flow::Interrupted;

/// Errors establishing a connection or an access handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The caller's interruptor fired.
    #[error("interrupted")]
    Interrupted,

    /// The replica went away before the handshake completed.
    #[error("connection lost before handshake completed")]
    ConnectionLost,

    /// The replica did not answer the handshake in time.
    #[error("handshake timed out after {timeout:?}")]
    HandshakeTimeout {
        /// The configured timeout.
        timeout: Duration,
    },

    /// The peer is not connected.
    #[error("peer {peer} is not connected")]
    NotConnected {
        /// The missing peer.
        peer: PeerId,
    },

    /// A raw connection attempt failed.
    #[error("connection to {server} at {addr} refused")]
    Refused {
        /// Server we tried to reach.
        server: ServerId,
        /// Address we tried.
        addr: String,
    },
}

impl From<Interrupted> for ConnectError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

/// Result type for connection operations.
pub type ConnectResult<T> = Result<T, ConnectError>;
