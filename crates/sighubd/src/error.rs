use sighub_common::ClockError;
use thiserror::Error;

/// Errors that can occur during signaling server operation.
#[derive(Error, Debug)]
pub enum HubError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
    /// The system clock is unusable.
    #[error("clock error: {0}")]
    Clock(#[from] ClockError),
}
