//! Client-side mapping entry: the tunnels for one mapping plus every
//! logical flow carried over them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, info, warn};

use burrow_config::{AppConfig, MappingConfig};
use burrow_proto::{Command, HandshakeRequest, Packet};
use burrow_transport::{sockopt, Transmission, Tunnel, TunnelReader, TunnelSet};

use crate::connection::{self, Connection, ConnectionHandle, Status};
use crate::datagram::DatagramPort;
use crate::ClientError;

/// Cadence of the keepalive heartbeat on every tunnel.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// One configured mapping on the client.
pub struct MappingEntry {
    config: Arc<AppConfig>,
    mapping: MappingConfig,
    tunnels: Mutex<TunnelSet>,
    connections: Mutex<HashMap<(u64, u32), ConnectionHandle>>,
    ports: Mutex<HashMap<String, Arc<DatagramPort>>>,
    restarts: Mutex<HashMap<u64, JoinHandle<()>>>,
    restart_seq: AtomicU64,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl MappingEntry {
    pub fn new(config: Arc<AppConfig>, mapping: MappingConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            mapping,
            tunnels: Mutex::new(TunnelSet::new()),
            connections: Mutex::new(HashMap::new()),
            ports: Mutex::new(HashMap::new()),
            restarts: Mutex::new(HashMap::new()),
            restart_seq: AtomicU64::new(0),
            keepalive: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    pub fn mapping(&self) -> &MappingConfig {
        &self.mapping
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Initiate `concurrent` tunnels and arm the keepalive timer.
    /// Establishment runs asynchronously; a failed attempt feeds the
    /// reconnect loop.
    pub fn open(self: &Arc<Self>) {
        for _ in 0..self.mapping.concurrent {
            let entry = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(error) = entry.connect_tunnel().await {
                    debug!(name = %entry.mapping.name, %error, "tunnel establishment failed");
                    entry.schedule_restart();
                }
            });
        }

        let entry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(KEEPALIVE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if entry.is_disposed() {
                    break;
                }
                let tunnels: Vec<_> = entry.tunnels.lock().unwrap().iter().cloned().collect();
                for tunnel in tunnels {
                    if tunnel.send(Packet::heartbeat().encode()).is_err() {
                        entry.close_transmission(&tunnel);
                    }
                }
            }
        });
        *self.keepalive.lock().unwrap() = Some(handle);
    }

    /// Dial the server, handshake the transport, announce the mapping,
    /// and start dispatching.
    async fn connect_tunnel(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }

        let server = SocketAddr::new(self.config.ip, self.config.port);
        let stream = TcpStream::connect(server).await?;
        sockopt::tune_stream(&stream, self.config.turbo_wan);

        let transmission = Transmission::connect(&self.config, stream).await?;
        let (tunnel, reader) = Tunnel::start(transmission);

        let request = HandshakeRequest {
            kind: self.mapping.kind,
            remote_port: self.mapping.remote_port,
            name: self.mapping.name.clone(),
        };
        tunnel.send(request.encode())?;

        if self.is_disposed() {
            tunnel.close();
            return Err(ClientError::Disposed);
        }
        self.tunnels.lock().unwrap().insert(Arc::clone(&tunnel));

        info!(
            name = %self.mapping.name,
            kind = self.mapping.kind.as_str(),
            port = self.mapping.remote_port,
            %server,
            "mapping connected"
        );

        let entry = Arc::clone(self);
        tokio::spawn(entry.run_tunnel(tunnel, reader));
        Ok(())
    }

    /// Re-establish one tunnel after `reconnect` seconds, re-arming
    /// until the attempt succeeds or the entry closes.
    fn schedule_restart(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }

        let key = self.restart_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                sleep(entry.mapping.reconnect).await;
                if entry.is_disposed() {
                    break;
                }
                match entry.connect_tunnel().await {
                    Ok(()) => break,
                    Err(error) => {
                        debug!(name = %entry.mapping.name, %error, "reconnect attempt failed")
                    }
                }
            }
            entry.restarts.lock().unwrap().remove(&key);
        });
        self.restarts.lock().unwrap().insert(key, handle);
    }

    async fn run_tunnel(self: Arc<Self>, tunnel: Arc<Tunnel>, mut reader: TunnelReader) {
        while let Some(frame) = reader.next().await {
            let packet = match Packet::decode(frame) {
                Ok(packet) => packet,
                Err(error) => {
                    warn!(name = %self.mapping.name, %error, "malformed packet");
                    break;
                }
            };
            if !self.on_packet(&tunnel, packet).await {
                break;
            }
        }
        self.close_transmission(&tunnel);
    }

    /// Dispatch one inbound command. Returning `false` closes the
    /// offending tunnel.
    async fn on_packet(self: &Arc<Self>, tunnel: &Arc<Tunnel>, packet: Packet) -> bool {
        match packet.command {
            Command::Connect => self.on_connect(tunnel, packet).await,
            Command::Disconnect => {
                self.release_connection(tunnel.id(), packet.id);
                true
            }
            Command::Write => self.on_write(tunnel, packet).await,
            Command::WriteTo => self.on_write_to(packet).await,
            Command::Heartbeat => true,
            // The server never legitimately sends ConnectOk to a client.
            Command::ConnectOk => false,
        }
    }

    async fn on_connect(self: &Arc<Self>, tunnel: &Arc<Tunnel>, packet: Packet) -> bool {
        let (peer, _) = match packet.endpoint_and_data() {
            Ok(parts) => parts,
            Err(error) => {
                warn!(name = %self.mapping.name, %error, "malformed connect");
                return false;
            }
        };
        debug!(name = %self.mapping.name, id = packet.id, %peer, "connect requested");

        let conn = Connection::new(packet.id, Arc::clone(tunnel));
        let (to_socket, from_tunnel) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            conn: Arc::clone(&conn),
            to_socket,
        };

        {
            let mut connections = self.connections.lock().unwrap();
            if connections.contains_key(&(tunnel.id(), packet.id)) {
                // Duplicate id on one tunnel: drop the request.
                return true;
            }
            connections.insert((tunnel.id(), packet.id), handle);
        }
        tunnel.track_open();

        tokio::spawn(connection::run_client_connection(
            Arc::clone(self),
            conn,
            from_tunnel,
        ));
        true
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
                // No such flow here: drop the payload, tell the peer.
                let _ = tunnel.send(Packet::disconnect(packet.id).encode());
                true
            }
            Some(handle) => {
                if handle.conn.status() != Status::OpenOk
                    || handle.to_socket.send(packet.payload).is_err()
                {
                    self.release_connection(tunnel.id(), packet.id);
                }
                true
            }
        }
    }

    async fn on_write_to(self: &Arc<Self>, packet: Packet) -> bool {
        let (peer, data) = match packet.endpoint_and_data() {
            Ok(parts) => parts,
            Err(error) => {
                warn!(name = %self.mapping.name, %error, "malformed datagram");
                return false;
            }
        };

        match self.alloc_datagram_port(peer).await {
            Some(port) => port.send_to_local(&data).await,
            None => debug!(name = %self.mapping.name, %peer, "no datagram port"),
        }
        true
    }

    /// Look up or create the datagram port for `peer`.
    async fn alloc_datagram_port(self: &Arc<Self>, peer: SocketAddr) -> Option<Arc<DatagramPort>> {
        let key = peer.to_string();
        if let Some(port) = self.ports.lock().unwrap().get(&key) {
            return Some(Arc::clone(port));
        }
        if self.is_disposed() {
            return None;
        }

        let port = match DatagramPort::open(self, peer).await {
            Ok(port) => port,
            Err(error) => {
                warn!(name = %self.mapping.name, %peer, %error, "datagram port open failed");
                return None;
            }
        };

        let mut ports = self.ports.lock().unwrap();
        match ports.get(&key) {
            // Lost the race to another tunnel's dispatch.
            Some(existing) => {
                let existing = Arc::clone(existing);
                drop(ports);
                port.close();
                Some(existing)
            }
            None => {
                ports.insert(key, Arc::clone(&port));
                Some(port)
            }
        }
    }

    /// Round-robin tunnel pick for the datagram return path.
    pub(crate) fn rotate_tunnel(&self) -> Option<Arc<Tunnel>> {
        self.tunnels.lock().unwrap().rotate()
    }

    pub(crate) fn remove_port(&self, key: &str) {
        self.ports.lock().unwrap().remove(key);
    }

    /// Drop a connection from the table and close it. Safe to call for
    /// ids that are already gone.
    pub(crate) fn release_connection(&self, tunnel_id: u64, id: u32) {
        let handle = self.connections.lock().unwrap().remove(&(tunnel_id, id));
        if let Some(handle) = handle {
            handle.conn.tunnel().track_close();
            handle.conn.shutdown();
        }
    }

    /// Remove a failed tunnel, release the flows dispatched through it,
    /// and schedule a replacement.
    pub(crate) fn close_transmission(self: &Arc<Self>, tunnel: &Arc<Tunnel>) {
        tunnel.close();
        if self.tunnels.lock().unwrap().remove(tunnel.id()).is_none() {
            return;
        }

        info!(
            name = %self.mapping.name,
            kind = self.mapping.kind.as_str(),
            port = self.mapping.remote_port,
            "mapping disconnected"
        );

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

        self.schedule_restart();
    }

    #[cfg(test)]
    pub(crate) fn datagram_port_count(&self) -> usize {
        self.ports.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn ports_insert_for_test(&self, key: String, port: Arc<DatagramPort>) {
        self.ports.lock().unwrap().insert(key, port);
    }

    /// Cascade close: keepalive, connections, datagram ports, tunnels,
    /// restart timers. Idempotent.
    pub fn close(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handle) = self.keepalive.lock().unwrap().take() {
            handle.abort();
        }
        for (_, handle) in self.restarts.lock().unwrap().drain() {
            handle.abort();
        }

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

        let ports: Vec<_> = self
            .ports
            .lock()
            .unwrap()
            .drain()
            .map(|(_, port)| port)
            .collect();
        for port in ports {
            port.close();
        }

        for tunnel in self.tunnels.lock().unwrap().drain() {
            tunnel.close();
        }
    }
}
