//! One logical TCP flow, client side: dial the local service when the
//! server says `Connect`, then shuttle bytes between the local socket
//! and the tunnel.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use burrow_proto::Packet;
use burrow_transport::{sockopt, Tunnel};

use crate::entry::MappingEntry;

/// Lifecycle of a logical connection. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Unopen = 0,
    Opening = 1,
    OpenOk = 2,
    Closed = 3,
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        match value {
            0 => Status::Unopen,
            1 => Status::Opening,
            2 => Status::OpenOk,
            _ => Status::Closed,
        }
    }
}

/// Shared state of a logical connection.
pub struct Connection {
    id: u32,
    tunnel: Arc<Tunnel>,
    status: AtomicU8,
    cancel: CancellationToken,
}

/// What the entry's tables hold for each connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn: Arc<Connection>,
    pub to_socket: mpsc::UnboundedSender<Bytes>,
}

impl Connection {
    pub fn new(id: u32, tunnel: Arc<Tunnel>) -> Arc<Self> {
        Arc::new(Self {
            id,
            tunnel,
            status: AtomicU8::new(Status::Unopen as u8),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    pub fn status(&self) -> Status {
        self.status.load(Ordering::Acquire).into()
    }

    pub(crate) fn transition(&self, from: Status, to: Status) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Idempotent close. Emits at most one `Disconnect` over the
    /// connection's lifetime: only the caller that performs the
    /// `* -> Closed` transition, and only if the flow ever left
    /// `Unopen`.
    pub fn shutdown(&self) {
        let previous: Status = self.status.swap(Status::Closed as u8, Ordering::AcqRel).into();
        if previous == Status::Closed {
            return;
        }

        self.cancel.cancel();
        if previous != Status::Unopen {
            let _ = self.tunnel.send(Packet::disconnect(self.id).encode());
        }
    }

    pub(crate) fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Drive one client-side connection to completion.
///
/// `from_tunnel` delivers the payloads of `Write` frames addressed to
/// this id; they are written to the local socket strictly in arrival
/// order.
pub(crate) async fn run_client_connection(
    entry: Arc<MappingEntry>,
    conn: Arc<Connection>,
    mut from_tunnel: mpsc::UnboundedReceiver<Bytes>,
) {
    let mapping = entry.mapping();
    let config = entry.config();
    let target = SocketAddr::new(mapping.local_ip, mapping.local_port);

    if !conn.transition(Status::Unopen, Status::Opening) {
        entry.release_connection(conn.tunnel().id(), conn.id());
        return;
    }

    let stream = tokio::select! {
        _ = conn.cancelled() => None,
        dialed = timeout(config.connect_timeout, TcpStream::connect(target)) => match dialed {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(error)) => {
                debug!(id = conn.id(), %target, %error, "local connect failed");
                None
            }
            Err(_) => {
                debug!(id = conn.id(), %target, "local connect timed out");
                None
            }
        },
    };
    let stream = match stream {
        Some(stream) => stream,
        None => {
            entry.release_connection(conn.tunnel().id(), conn.id());
            return;
        }
    };

    sockopt::tune_stream(&stream, config.turbo_lan);

    if !conn.transition(Status::Opening, Status::OpenOk) {
        entry.release_connection(conn.tunnel().id(), conn.id());
        return;
    }

    if conn
        .tunnel()
        .send(Packet::connect_ok(conn.id()).encode())
        .is_err()
    {
        let tunnel = Arc::clone(conn.tunnel());
        entry.close_transmission(&tunnel);
        entry.release_connection(tunnel.id(), conn.id());
        return;
    }

    trace!(id = conn.id(), %target, "local connection open");
    pump_socket(&entry, &conn, stream, &mut from_tunnel, config.alignment).await;
    entry.release_connection(conn.tunnel().id(), conn.id());
}

/// Shared pump for an open connection: socket reads become `Write`
/// frames, queued `Write` payloads become socket writes.
pub(crate) async fn pump_socket(
    entry: &Arc<MappingEntry>,
    conn: &Arc<Connection>,
    stream: TcpStream,
    from_tunnel: &mut mpsc::UnboundedReceiver<Bytes>,
    read_buffer: usize,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; read_buffer];

    loop {
        tokio::select! {
            _ = conn.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = Packet::write(conn.id(), Bytes::copy_from_slice(&buf[..n])).encode();
                    if conn.tunnel().send(frame).is_err() {
                        let tunnel = Arc::clone(conn.tunnel());
                        entry.close_transmission(&tunnel);
                        break;
                    }
                }
            },
            payload = from_tunnel.recv() => match payload {
                Some(data) => {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_never_reverses() {
        let order = [Status::Unopen, Status::Opening, Status::OpenOk, Status::Closed];
        for (i, a) in order.iter().enumerate() {
            for b in &order[..i] {
                assert!((*a as u8) > (*b as u8));
            }
        }
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_notifies_once() {
        let (transmission, peer) = test_support::pair();
        let (tunnel, _reader) = burrow_transport::Tunnel::start(transmission);
        let (_peer_tunnel, mut peer_reader) = burrow_transport::Tunnel::start(peer);

        let conn = Connection::new(7, tunnel);
        assert!(conn.transition(Status::Unopen, Status::Opening));

        conn.shutdown();
        conn.shutdown();
        assert_eq!(conn.status(), Status::Closed);

        let frame = peer_reader.next().await.unwrap();
        let packet = Packet::decode(frame).unwrap();
        assert_eq!(packet.command, burrow_proto::Command::Disconnect);
        assert_eq!(packet.id, 7);
    }

    #[tokio::test]
    async fn unopened_connection_closes_silently() {
        let (transmission, peer) = test_support::pair();
        let (tunnel, _reader) = burrow_transport::Tunnel::start(transmission);
        let (peer_tunnel, mut peer_reader) = burrow_transport::Tunnel::start(peer);

        let conn = Connection::new(8, tunnel);
        conn.shutdown();

        // Nothing was sent; the peer only observes the close.
        peer_tunnel.close();
        assert!(peer_reader.next().await.is_none());
    }

    mod test_support {
        use burrow_transport::Transmission;

        pub fn pair() -> (Transmission, Transmission) {
            let (a, b) = tokio::io::duplex(64 * 1024);
            (Transmission::from_io(Box::new(a)), Transmission::from_io(Box::new(b)))
        }
    }
}
