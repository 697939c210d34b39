//! Tunnel Protocol Definitions
//!
//! This crate defines the wire commands exchanged over a tunnel, the
//! embedded network-address records, and the handshake request a client
//! sends after the transport-level handshake.

pub mod address;
pub mod handshake;
pub mod packet;

pub use address::{decode_endpoint, encode_endpoint, validate_endpoint};
pub use handshake::{HandshakeRequest, MappingType};
pub use packet::{Command, Packet};

use thiserror::Error;

/// Size of the command + id header on every packet except `WriteTo`.
pub const PACKET_HEADER_LEN: usize = 5;

/// Maximum payload carried by a single framed packet.
pub const MAX_FRAME_LEN: usize = 65535;

/// Protocol decode/encode errors.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("truncated message: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unknown command byte: 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("unknown address family: 0x{0:02x}")]
    UnknownAddressFamily(u8),

    #[error("unknown mapping type: 0x{0:02x}")]
    UnknownMappingType(u8),

    #[error("invalid endpoint {0}")]
    InvalidEndpoint(std::net::SocketAddr),

    #[error("mapping name is not valid UTF-8")]
    InvalidName,
}
