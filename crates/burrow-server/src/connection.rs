//! One logical TCP flow, server side: a public user's socket, bridged
//! to the client once it acknowledges the `Connect`.

use bytes::Bytes;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use burrow_proto::Packet;
use burrow_transport::Tunnel;

use crate::entry::ServerEntry;

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

/// Shared state of a server-side logical connection.
pub struct ServerConnection {
    id: u32,
    tunnel: Arc<Tunnel>,
    status: AtomicU8,
    opened: Mutex<Option<oneshot::Sender<()>>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn: Arc<ServerConnection>,
    pub to_public: mpsc::UnboundedSender<Bytes>,
}

impl ServerConnection {
    pub fn new(id: u32, tunnel: Arc<Tunnel>, opened: oneshot::Sender<()>) -> Arc<Self> {
        Arc::new(Self {
            id,
            tunnel,
            status: AtomicU8::new(Status::Unopen as u8),
            opened: Mutex::new(Some(opened)),
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

    /// Deliver the client's `ConnectOk` to the waiting connection task.
    pub(crate) fn signal_open(&self) {
        if let Some(tx) = self.opened.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    /// Idempotent close; emits at most one `Disconnect`.
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

/// Drive one public connection: wait for the client's `ConnectOk` under
/// the connect deadline, then pump bytes both ways.
pub(crate) async fn run_server_connection(
    entry: Arc<ServerEntry>,
    conn: Arc<ServerConnection>,
    stream: TcpStream,
    mut from_tunnel: mpsc::UnboundedReceiver<Bytes>,
    opened: oneshot::Receiver<()>,
) {
    let config = entry.config();

    // The entry sets Opening before the Connect leaves and promotes to
    // OpenOk on the ConnectOk dispatch; this task only waits for that
    // acknowledgement under the connect deadline.
    let acknowledged = tokio::select! {
        _ = conn.cancelled() => false,
        answer = timeout(config.connect_timeout, opened) => matches!(answer, Ok(Ok(()))),
    };
    if !acknowledged || conn.status() != Status::OpenOk {
        debug!(id = conn.id(), "client never acknowledged the connect");
        entry.release_connection(conn.tunnel().id(), conn.id());
        return;
    }
    trace!(id = conn.id(), "public connection open");

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; config.alignment];

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

    entry.release_connection(conn.tunnel().id(), conn.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_transport::Transmission;

    fn tunnel_pair() -> (Arc<Tunnel>, burrow_transport::TunnelReader) {
        let (a, _b) = tokio::io::duplex(64 * 1024);
        Tunnel::start(Transmission::from_io(Box::new(a)))
    }

    #[tokio::test]
    async fn signal_open_fires_once() {
        let (tunnel, _reader) = tunnel_pair();
        let (tx, mut rx) = oneshot::channel();
        let conn = ServerConnection::new(1, tunnel, tx);

        conn.signal_open();
        conn.signal_open();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn shutdown_from_unopen_is_silent() {
        let (tunnel, _reader) = tunnel_pair();
        let (tx, _rx) = oneshot::channel();
        let conn = ServerConnection::new(2, tunnel, tx);
        conn.shutdown();
        conn.shutdown();
        assert_eq!(conn.status(), Status::Closed);
    }
}
