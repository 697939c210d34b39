//! Tunnel transport layer.
//!
//! Everything between a raw TCP socket and a stream of protocol frames
//! lives here: the 2-byte length framing, the transport variants
//! (plain / encrypted / TLS / WebSocket / WebSocket over TLS), the
//! [`Tunnel`] write queue, and the [`TunnelSet`] used to pick a tunnel
//! for new traffic.

pub mod crypto;
pub mod framing;
pub mod manager;
pub mod sockopt;
pub mod tls;
pub mod transmission;
pub mod tunnel;

pub use manager::{ConnectionIdAllocator, TunnelSet};
pub use transmission::Transmission;
pub use tunnel::{Tunnel, TunnelReader};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Maximum frame payload the 2-byte length prefix can describe.
pub const MAX_FRAME_LEN: usize = burrow_proto::MAX_FRAME_LEN;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame size {0} outside 1..=65535")]
    FrameSize(usize),

    #[error("handshake timed out")]
    Timeout,
}

impl From<rustls::Error> for TransportError {
    fn from(err: rustls::Error) -> Self {
        TransportError::Tls(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(err.to_string())
    }
}

/// Byte stream a transmission can be layered over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Boxed byte stream (TCP or TLS, once the handshake is done).
pub type BoxedIo = Box<dyn Io>;
