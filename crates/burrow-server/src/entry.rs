//! Server-side mapping entry: the public socket for one `(type, port)`
//! binding and the tunnels serving it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use burrow_config::AppConfig;
use burrow_proto::{validate_endpoint, Command, MappingType, Packet};
use burrow_transport::{sockopt, ConnectionIdAllocator, Transmission, Tunnel, TunnelReader, TunnelSet};

use crate::connection::{self, ConnectionHandle, ServerConnection};
use crate::switches::Switches;
use crate::ServerError;

/// Receive buffer for the public UDP socket: the largest datagram that
/// still fits a `WriteTo` frame.
const MAX_DATAGRAM: usize = burrow_proto::MAX_FRAME_LEN - 20;

/// One public `(type, port)` binding on the server.
pub struct ServerEntry {
    name: String,
    kind: MappingType,
    port: u16,
    config: Arc<AppConfig>,
    switches: Weak<Switches>,
    tunnels: Mutex<TunnelSet>,
    connections: Mutex<HashMap<(u64, u32), ConnectionHandle>>,
    ids: ConnectionIdAllocator,
    udp: Mutex<Option<Arc<UdpSocket>>>,
    socket_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ServerEntry {
    pub fn new(
        switches: &Arc<Switches>,
        name: String,
        kind: MappingType,
        port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            kind,
            port,
            config: Arc::clone(switches.config()),
            switches: Arc::downgrade(switches),
            tunnels: Mutex::new(TunnelSet::new()),
            connections: Mutex::new(HashMap::new()),
            ids: ConnectionIdAllocator::new(),
            udp: Mutex::new(None),
            socket_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    pub fn kind(&self) -> MappingType {
        self.kind
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Bind the public socket. A TCP bind that lands on a different port
    /// than requested is refused rather than silently remapped.
    pub async fn open(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.ip, self.port);
        match self.kind {
            MappingType::Tcp => {
                let listener = sockopt::bind_listener(addr, self.config.backlog)?;
                let local = listener.local_addr()?;
                if local.port() != self.port {
                    return Err(ServerError::BindMismatch {
                        expected: self.port,
                        got: local.port(),
                    });
                }
                let entry = Arc::clone(self);
                *self.socket_task.lock().unwrap() =
                    Some(tokio::spawn(entry.accept_loop(listener)));
            }
            MappingType::Udp => {
                let socket = UdpSocket::bind(addr).await?;
                let local = socket.local_addr()?;
                if local.port() != self.port {
                    return Err(ServerError::BindMismatch {
                        expected: self.port,
                        got: local.port(),
                    });
                }
                let socket = Arc::new(socket);
                *self.udp.lock().unwrap() = Some(Arc::clone(&socket));
                let entry = Arc::clone(self);
                *self.socket_task.lock().unwrap() = Some(tokio::spawn(entry.udp_loop(socket)));
            }
        }
        Ok(())
    }

    /// Attach a handshaken tunnel and start dispatching its frames.
    pub async fn add_tunnel(self: &Arc<Self>, transmission: Transmission) -> bool {
        if self.is_disposed() {
            return false;
        }

        let (tunnel, reader) = Tunnel::start(transmission);
        let count = {
            let mut tunnels = self.tunnels.lock().unwrap();
            tunnels.insert(Arc::clone(&tunnel));
            tunnels.len()
        };

        info!(
            name = %self.name,
            kind = self.kind.as_str(),
            port = self.port,
            peer = ?tunnel.peer_addr(),
            "{} mapping",
            if count > 1 { "accept" } else { "create" }
        );

        let entry = Arc::clone(self);
        tokio::spawn(entry.run_tunnel(tunnel, reader));
        true
    }

    async fn run_tunnel(self: Arc<Self>, tunnel: Arc<Tunnel>, mut reader: TunnelReader) {
        while let Some(frame) = reader.next().await {
            let packet = match Packet::decode(frame) {
                Ok(packet) => packet,
                Err(error) => {
                    warn!(name = %self.name, %error, "malformed packet");
                    break;
                }
            };
            if !self.on_packet(&tunnel, packet).await {
                break;
            }
        }
        self.close_transmission(&tunnel);
    }

    async fn on_packet(self: &Arc<Self>, tunnel: &Arc<Tunnel>, packet: Packet) -> bool {
        match packet.command {
            Command::ConnectOk => {
                let handle = self
                    .connections
                    .lock()
                    .unwrap()
                    .get(&(tunnel.id(), packet.id))
                    .cloned();
                if let Some(handle) = handle {
                    // Promote here, on the dispatch path, so a Write
                    // that follows in the same tunnel stream already
                    // observes OpenOk.
                    if handle
                        .conn
                        .transition(connection::Status::Opening, connection::Status::OpenOk)
                    {
                        handle.conn.signal_open();
                    }
                }
                true
            }
            Command::Disconnect => {
                self.release_connection(tunnel.id(), packet.id);
                true
            }
            Command::Write => self.on_write(tunnel, packet).await,
            Command::WriteTo => self.on_write_to(packet).await,
            Command::Heartbeat => {
                // Keep-alives are answered in kind.
                if tunnel.send(Packet::heartbeat().encode()).is_err() {
                    self.close_transmission(tunnel);
                }
                true
            }
            // Only the server originates Connect.
            Command::Connect => false,
        }
    }

    async fn on_write(self: &Arc<Self>, tunnel: &Arc<Tunnel>, packet: Packet) -> bool {
        let handle = self
            .connections
            .lock()
            .unwrap()
            .get(&(tunnel.id(), packet.id))
            .cloned();

        match handle {
            None => {
                let _ = tunnel.send(Packet::disconnect(packet.id).encode());
                true
            }
            Some(handle) => {
                if handle.conn.status() != connection::Status::OpenOk
                    || handle.to_public.send(packet.payload).is_err()
                {
                    self.release_connection(tunnel.id(), packet.id);
                }
                true
            }
        }
    }

    /// A datagram from the client for a public peer goes straight out of
    /// the public UDP socket. No per-peer state, no source filtering.
    async fn on_write_to(&self, packet: Packet) -> bool {
        let (peer, data) = match packet.endpoint_and_data() {
            Ok(parts) => parts,
            Err(error) => {
                warn!(name = %self.name, %error, "malformed datagram");
                return false;
            }
        };

        let socket = self.udp.lock().unwrap().clone();
        match socket {
            Some(socket) => {
                if let Err(error) = socket.send_to(&data, peer).await {
                    warn!(name = %self.name, %peer, %error, "datagram send failed");
                }
                true
            }
            None => false,
        }
    }

    /// Public TCP accept loop.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    sockopt::tune_stream(&stream, self.config.turbo_wan);
                    if !self.accept_public(stream, peer).await {
                        debug!(name = %self.name, %peer, "public connection refused");
                    }
                }
                Err(error) => {
                    warn!(name = %self.name, %error, "public accept failed");
                }
            }
            if self.is_disposed() {
                break;
            }
        }
    }

    /// Dispatch a freshly accepted public connection to the
    /// least-loaded tunnel.
    async fn accept_public(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> bool {
        if validate_endpoint(&peer).is_err() {
            return false;
        }

        let tunnel = match self.tunnels.lock().unwrap().least_loaded() {
            Some(tunnel) => tunnel,
            None => return false,
        };

        let (opened_tx, opened_rx) = oneshot::channel();
        let (to_public, from_tunnel) = mpsc::unbounded_channel();
        let conn = {
            let mut connections = self.connections.lock().unwrap();
            let id = match self
                .ids
                .allocate(|id| connections.keys().any(|(_, existing)| *existing == id))
            {
                Some(id) => id,
                None => return false,
            };
            let conn = ServerConnection::new(id, Arc::clone(&tunnel), opened_tx);
            // Opening from the moment the Connect goes out; the
            // dispatch path promotes to OpenOk on the ConnectOk.
            conn.transition(connection::Status::Unopen, connection::Status::Opening);
            connections.insert(
                (tunnel.id(), id),
                ConnectionHandle {
                    conn: Arc::clone(&conn),
                    to_public,
                },
            );
            conn
        };
        tunnel.track_open();

        tokio::spawn(connection::run_server_connection(
            Arc::clone(self),
            Arc::clone(&conn),
            stream,
            from_tunnel,
            opened_rx,
        ));

        if tunnel.send(Packet::connect(conn.id(), &peer).encode()).is_err() {
            self.close_transmission(&tunnel);
            return false;
        }
        true
    }

    /// Public UDP receive loop: every datagram becomes a `WriteTo` over
    /// the next tunnel in rotation.
    async fn udp_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, peer)) if n > 0 => {
                    if validate_endpoint(&peer).is_err() {
                        continue;
                    }
                    let tunnel = match self.tunnels.lock().unwrap().rotate() {
                        Some(tunnel) => tunnel,
                        None => continue,
                    };
                    let frame = Packet::write_to(&peer, &buf[..n]).encode();
                    if tunnel.send(frame).is_err() {
                        self.close_transmission(&tunnel);
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    if self.is_disposed() {
                        break;
                    }
                    debug!(name = %self.name, %error, "public receive failed");
                }
            }
        }
    }

    pub(crate) fn release_connection(&self, tunnel_id: u64, id: u32) {
        let handle = self.connections.lock().unwrap().remove(&(tunnel_id, id));
        if let Some(handle) = handle {
            handle.conn.tunnel().track_close();
            handle.conn.shutdown();
        }
    }

    /// Detach a failed tunnel and everything dispatched through it; the
    /// entry closes itself when the last tunnel is gone.
    pub(crate) fn close_transmission(self: &Arc<Self>, tunnel: &Arc<Tunnel>) {
        tunnel.close();
        if self.tunnels.lock().unwrap().remove(tunnel.id()).is_none() {
            return;
        }

        let victims: Vec<(u64, u32)> = self
            .connections
            .lock()
            .unwrap()
            .keys()
            .filter(|(tid, _)| *tid == tunnel.id())
            .copied()
            .collect();
        for (tid, id) in victims {
            self.release_connection(tid, id);
        }

        let remaining = self.tunnels.lock().unwrap().len();
        info!(
            name = %self.name,
            kind = self.kind.as_str(),
            port = self.port,
            "{} mapping",
            if remaining > 0 { "disconnect" } else { "close" }
        );
        if remaining == 0 {
            self.close();
        }
    }

    /// Cascade close and deregister from the switches table. Idempotent.
    pub fn close(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(switches) = self.switches.upgrade() {
            switches.deregister(self.kind, self.port);
        }
        if let Some(task) = self.socket_task.lock().unwrap().take() {
            task.abort();
        }
        self.udp.lock().unwrap().take();

        let connections: Vec<_> = self
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in connections {
            handle.conn.shutdown();
        }

        for tunnel in self.tunnels.lock().unwrap().drain() {
            tunnel.close();
        }
    }
}
