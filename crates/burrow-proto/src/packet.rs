//! Tunnel command packets.
//!
//! Every framed payload on a tunnel is one packet:
//! ```text
//! | command (1B) | id (4B, big-endian) | remainder |
//! ```
//! `WriteTo` is the exception: it carries no id field at all, so decoding
//! branches on the command byte before touching the id bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;

use crate::{address, ProtoError, PACKET_HEADER_LEN};

/// Command byte of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0,
    ConnectOk = 1,
    Disconnect = 2,
    Write = 3,
    WriteTo = 4,
    Heartbeat = 5,
}

impl TryFrom<u8> for Command {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::Connect),
            1 => Ok(Command::ConnectOk),
            2 => Ok(Command::Disconnect),
            3 => Ok(Command::Write),
            4 => Ok(Command::WriteTo),
            5 => Ok(Command::Heartbeat),
            other => Err(ProtoError::UnknownCommand(other)),
        }
    }
}

/// An in-memory tunnel command.
///
/// `id` identifies the logical connection the packet belongs to; it is 0
/// for `WriteTo` and `Heartbeat`, which are not tied to a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub command: Command,
    pub id: u32,
    pub payload: Bytes,
}

impl Packet {
    /// `Connect`: ask the peer to open a logical connection toward
    /// `remote`, identified by `id` on this tunnel.
    pub fn connect(id: u32, remote: &SocketAddr) -> Self {
        let mut payload = BytesMut::with_capacity(19);
        address::encode_endpoint(remote, &mut payload);
        Self {
            command: Command::Connect,
            id,
            payload: payload.freeze(),
        }
    }

    pub fn connect_ok(id: u32) -> Self {
        Self {
            command: Command::ConnectOk,
            id,
            payload: Bytes::new(),
        }
    }

    pub fn disconnect(id: u32) -> Self {
        Self {
            command: Command::Disconnect,
            id,
            payload: Bytes::new(),
        }
    }

    pub fn write(id: u32, payload: Bytes) -> Self {
        Self {
            command: Command::Write,
            id,
            payload,
        }
    }

    /// `WriteTo`: a datagram for `peer`. The endpoint record is embedded
    /// at the front of the payload; there is no id field on the wire.
    pub fn write_to(peer: &SocketAddr, data: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(19 + data.len());
        address::encode_endpoint(peer, &mut payload);
        payload.put_slice(data);
        Self {
            command: Command::WriteTo,
            id: 0,
            payload: payload.freeze(),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            command: Command::Heartbeat,
            id: 0,
            payload: Bytes::new(),
        }
    }

    /// Serialize into a single frame payload.
    pub fn encode(&self) -> Bytes {
        let header = if self.command == Command::WriteTo {
            1
        } else {
            PACKET_HEADER_LEN
        };
        let mut buf = BytesMut::with_capacity(header + self.payload.len());
        buf.put_u8(self.command as u8);
        if self.command != Command::WriteTo {
            buf.put_u32(self.id);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Deserialize one frame payload.
    pub fn decode(mut frame: Bytes) -> Result<Self, ProtoError> {
        if frame.is_empty() {
            return Err(ProtoError::Truncated { needed: 1, got: 0 });
        }

        let command = Command::try_from(frame.get_u8())?;
        let id = if command == Command::WriteTo {
            0
        } else {
            if frame.len() < 4 {
                return Err(ProtoError::Truncated {
                    needed: PACKET_HEADER_LEN,
                    got: frame.len() + 1,
                });
            }
            frame.get_u32()
        };

        Ok(Self {
            command,
            id,
            payload: frame,
        })
    }

    /// Split a `Connect`/`WriteTo` payload into its embedded endpoint and
    /// the remaining opaque data.
    pub fn endpoint_and_data(&self) -> Result<(SocketAddr, Bytes), ProtoError> {
        let mut payload = self.payload.clone();
        let endpoint = address::decode_endpoint(&mut payload)?;
        Ok((endpoint, payload))
    }
}
