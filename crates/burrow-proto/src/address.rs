//! Network-address records embedded in `Connect` and `WriteTo` packets.
//!
//! Record layout (all integers big-endian):
//! ```text
//! | af (1B) | port (2B) | address (4B if af=0, 16B if af=1) |
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};

use crate::ProtoError;

/// Address family tag for IPv4 records.
pub const AF_INET: u8 = 0;
/// Address family tag for IPv6 records.
pub const AF_INET6: u8 = 1;

const V4_RECORD_LEN: usize = 7;
const V6_RECORD_LEN: usize = 19;

/// Append an endpoint record to `buf`.
pub fn encode_endpoint(addr: &SocketAddr, buf: &mut BytesMut) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(AF_INET);
            buf.put_u16(addr.port());
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(AF_INET6);
            buf.put_u16(addr.port());
            buf.put_slice(&ip.octets());
        }
    }
}

/// Consume an endpoint record from the front of `buf`.
///
/// The decoded endpoint is validated: port 0, multicast, and unspecified
/// addresses are rejected.
pub fn decode_endpoint(buf: &mut Bytes) -> Result<SocketAddr, ProtoError> {
    if buf.len() < V4_RECORD_LEN {
        return Err(ProtoError::Truncated {
            needed: V4_RECORD_LEN,
            got: buf.len(),
        });
    }

    let af = buf.get_u8();
    let port = buf.get_u16();
    let ip = match af {
        AF_INET => {
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::from(octets)
        }
        AF_INET6 => {
            if buf.len() < V6_RECORD_LEN - 3 {
                return Err(ProtoError::Truncated {
                    needed: V6_RECORD_LEN,
                    got: buf.len() + 3,
                });
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::from(octets)
        }
        other => return Err(ProtoError::UnknownAddressFamily(other)),
    };

    let addr = SocketAddr::new(ip, port);
    validate_endpoint(&addr)?;
    Ok(addr)
}

/// Reject endpoints that can never be a legitimate traffic source or
/// destination: port 0, multicast, and unspecified addresses.
pub fn validate_endpoint(addr: &SocketAddr) -> Result<(), ProtoError> {
    if addr.port() == 0 || addr.ip().is_multicast() || addr.ip().is_unspecified() {
        return Err(ProtoError::InvalidEndpoint(*addr));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(addr: SocketAddr) -> SocketAddr {
        let mut buf = BytesMut::new();
        encode_endpoint(&addr, &mut buf);
        let mut frozen = buf.freeze();
        let decoded = decode_endpoint(&mut frozen).unwrap();
        assert!(frozen.is_empty());
        decoded
    }

    #[test]
    fn v4_record_round_trips() {
        let addr: SocketAddr = "203.0.113.9:443".parse().unwrap();
        assert_eq!(round_trip(addr), addr);
    }

    #[test]
    fn v6_record_round_trips() {
        let addr: SocketAddr = "[2001:db8::17]:65535".parse().unwrap();
        assert_eq!(round_trip(addr), addr);
    }

    #[test]
    fn record_lengths_match_wire_contract() {
        let mut buf = BytesMut::new();
        encode_endpoint(&"192.0.2.1:53".parse().unwrap(), &mut buf);
        assert_eq!(buf.len(), 7);

        let mut buf = BytesMut::new();
        encode_endpoint(&"[2001:db8::1]:53".parse().unwrap(), &mut buf);
        assert_eq!(buf.len(), 19);
    }

    #[test]
    fn rejects_port_zero() {
        let mut buf = BytesMut::new();
        buf.put_u8(AF_INET);
        buf.put_u16(0);
        buf.put_slice(&[192, 0, 2, 1]);
        assert!(matches!(
            decode_endpoint(&mut buf.freeze()),
            Err(ProtoError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn rejects_multicast_and_unspecified() {
        for ip in ["224.0.0.1:80", "0.0.0.0:80", "[ff02::1]:80", "[::]:80"] {
            let addr: SocketAddr = ip.parse().unwrap();
            assert!(validate_endpoint(&addr).is_err(), "{ip} accepted");
        }
    }

    #[test]
    fn rejects_unknown_family() {
        let mut buf = BytesMut::new();
        buf.put_u8(7);
        buf.put_slice(&[0; 6]);
        assert!(matches!(
            decode_endpoint(&mut buf.freeze()),
            Err(ProtoError::UnknownAddressFamily(7))
        ));
    }
}
