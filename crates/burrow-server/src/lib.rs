//! Server role: accept tunnels from clients, bind the advertised public
//! ports, and relay public traffic over the tunnels.

pub mod connection;
pub mod entry;
pub mod switches;

pub use entry::ServerEntry;
pub use switches::Switches;

use thiserror::Error;

use burrow_proto::ProtoError;
use burrow_transport::TransportError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("public bind for port {expected} landed on port {got}")]
    BindMismatch { expected: u16, got: u16 },

    #[error("tunnel closed before the handshake request")]
    HandshakeClosed,

    #[error("server is closed")]
    Disposed,
}
