//! The handshake request a client sends on a fresh tunnel, announcing
//! which mapping the tunnel belongs to.
//!
//! Layout: `type (1B) | remote_port (2B BE) | name_len (2B BE) | name`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtoError;

/// Kind of traffic a mapping carries. This is a wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MappingType {
    Tcp = 0,
    Udp = 1,
}

impl TryFrom<u8> for MappingType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MappingType::Tcp),
            1 => Ok(MappingType::Udp),
            other => Err(ProtoError::UnknownMappingType(other)),
        }
    }
}

impl MappingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingType::Tcp => "tcp",
            MappingType::Udp => "udp",
        }
    }
}

/// First frame on every client tunnel after the transport handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub kind: MappingType,
    pub remote_port: u16,
    pub name: String,
}

impl HandshakeRequest {
    pub fn encode(&self) -> Bytes {
        // Names longer than the length field can express are truncated.
        let name = &self.name.as_bytes()[..self.name.len().min(u16::MAX as usize)];
        let mut buf = BytesMut::with_capacity(5 + name.len());
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.remote_port);
        buf.put_u16(name.len() as u16);
        buf.put_slice(name);
        buf.freeze()
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, ProtoError> {
        if frame.len() < 5 {
            return Err(ProtoError::Truncated {
                needed: 5,
                got: frame.len(),
            });
        }

        let kind = MappingType::try_from(frame.get_u8())?;
        let remote_port = frame.get_u16();
        let name_len = frame.get_u16() as usize;
        if frame.len() < name_len {
            return Err(ProtoError::Truncated {
                needed: 5 + name_len,
                got: 5 + frame.len(),
            });
        }

        let name = std::str::from_utf8(&frame[..name_len])
            .map_err(|_| ProtoError::InvalidName)?
            .to_owned();
        Ok(Self {
            kind,
            remote_port,
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let request = HandshakeRequest {
            kind: MappingType::Udp,
            remote_port: 53,
            name: "dns".to_owned(),
        };
        assert_eq!(
            HandshakeRequest::decode(request.encode()).unwrap(),
            request
        );
    }

    #[test]
    fn layout_is_fixed() {
        let request = HandshakeRequest {
            kind: MappingType::Tcp,
            remote_port: 80,
            name: "web".to_owned(),
        };
        assert_eq!(&request.encode()[..], &[0, 0, 80, 0, 3, b'w', b'e', b'b']);
    }

    #[test]
    fn empty_name_is_allowed() {
        let request = HandshakeRequest {
            kind: MappingType::Tcp,
            remote_port: 8080,
            name: String::new(),
        };
        assert_eq!(
            HandshakeRequest::decode(request.encode()).unwrap(),
            request
        );
    }

    #[test]
    fn bad_type_byte_is_rejected() {
        assert!(matches!(
            HandshakeRequest::decode(Bytes::from_static(&[2, 0, 80, 0, 0])),
            Err(ProtoError::UnknownMappingType(2))
        ));
    }

    #[test]
    fn truncated_name_is_rejected() {
        assert!(matches!(
            HandshakeRequest::decode(Bytes::from_static(&[0, 0, 80, 0, 9, b'x'])),
            Err(ProtoError::Truncated { .. })
        ));
    }
}
