//! Per-peer UDP forwarding on the client side.
//!
//! Each remote UDP peer seen through the tunnel gets its own local
//! socket, so replies from the local service can be routed back to the
//! right peer. Ports are evicted on idleness; an apparent DNS query
//! (port 53, nothing but the first send) is evicted on a much shorter
//! fuse.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::{interval, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use burrow_proto::Packet;

use crate::entry::MappingEntry;
use crate::ClientError;

const DNS_PORT: u16 = 53;
const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(3);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Largest datagram that still fits a `WriteTo` frame alongside the
/// 1-byte command and a v6 endpoint record.
const MAX_DATAGRAM: usize = burrow_proto::MAX_FRAME_LEN - 20;

/// Freshness of a datagram port, re `onlydns`:
/// 0 = nothing sent yet, 1 = only port-53 traffic seen, 2 = anything
/// else. The value never regresses.
pub struct DatagramPort {
    key: String,
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    epoch: Instant,
    last_activity: AtomicU64,
    onlydns: AtomicU8,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl DatagramPort {
    /// Bind a local socket for `peer` and start the receive/eviction
    /// loop.
    pub async fn open(
        entry: &Arc<MappingEntry>,
        peer: SocketAddr,
    ) -> Result<Arc<Self>, ClientError> {
        let mapping = entry.mapping();
        let local_ip = mapping.local_ip;
        if local_ip.is_multicast() || local_ip.is_unspecified() {
            return Err(ClientError::InvalidLocalAddress(local_ip));
        }

        // Loopback targets get a loopback source; anything else binds
        // the wildcard of the same family on an ephemeral port.
        let bind_ip = if local_ip.is_loopback() {
            local_ip
        } else {
            match local_ip {
                IpAddr::V4(_) => IpAddr::from([0u8, 0, 0, 0]),
                IpAddr::V6(_) => IpAddr::from([0u16; 8]),
            }
        };
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;

        let port = Arc::new(Self {
            key: peer.to_string(),
            peer,
            socket: Arc::new(socket),
            target: SocketAddr::new(local_ip, mapping.local_port),
            epoch: Instant::now(),
            last_activity: AtomicU64::new(0),
            onlydns: AtomicU8::new(0),
            idle_timeout: entry.config().inactive_timeout,
            cancel: CancellationToken::new(),
        });

        trace!(%peer, local = %port.socket.local_addr()?, "datagram port open");
        tokio::spawn(run(Arc::clone(entry), Arc::clone(&port)));
        Ok(port)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Forward one payload from the tunnel to the local service.
    /// Send errors are transient: logged, the port stays.
    pub async fn send_to_local(&self, data: &[u8]) {
        match self.socket.send_to(data, self.target).await {
            Ok(_) => {
                if self.target.port() == DNS_PORT {
                    let _ = self
                        .onlydns
                        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
                } else {
                    self.onlydns.store(2, Ordering::Release);
                }
                self.touch();
            }
            Err(error) => warn!(peer = %self.peer, %error, "datagram forward failed"),
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn touch(&self) {
        self.last_activity
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
    }

    fn idle(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_activity.load(Ordering::Acquire)))
    }

    fn effective_timeout(&self) -> Duration {
        if self.onlydns.load(Ordering::Acquire) == 1 && self.target.port() == DNS_PORT {
            DNS_QUERY_TIMEOUT
        } else {
            self.idle_timeout
        }
    }
}

/// Receive loop plus the 1-second eviction sweep.
async fn run(entry: Arc<MappingEntry>, port: Arc<DatagramPort>) {
    let mut sweep = interval(SWEEP_INTERVAL);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = port.cancel.cancelled() => break,
            _ = sweep.tick() => {
                if port.idle() > port.effective_timeout() {
                    debug!(peer = %port.peer, "datagram port idle, evicting");
                    break;
                }
            }
            received = port.socket.recv_from(&mut buf) => match received {
                Ok((n, _from)) if n > 0 => {
                    let tunnel = match entry.rotate_tunnel() {
                        Some(tunnel) => tunnel,
                        None => break,
                    };
                    let frame = Packet::write_to(&port.peer, &buf[..n]).encode();
                    if tunnel.send(frame).is_err() {
                        entry.close_transmission(&tunnel);
                        break;
                    }
                    port.touch();
                }
                Ok(_) => {}
                Err(error) => {
                    debug!(peer = %port.peer, %error, "datagram receive failed");
                    break;
                }
            },
        }
    }

    port.cancel.cancel();
    entry.remove_port(&port.key);
    trace!(peer = %port.peer, "datagram port closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_config::{AppConfig, EncryptorConfig, MappingConfig, Mode, Protocol, TlsConfig,
        WebSocketConfig};
    use burrow_proto::MappingType;

    fn entry_with_local_port(local_port: u16) -> Arc<MappingEntry> {
        let config = AppConfig {
            mode: Mode::Client,
            ip: IpAddr::from([127, 0, 0, 1]),
            port: 7000,
            protocol: Protocol::Tcp,
            alignment: 4096,
            backlog: 128,
            fast_open: false,
            turbo_lan: false,
            turbo_wan: false,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            inactive_timeout: Duration::from_secs(72),
            encryptor: EncryptorConfig::default(),
            tls: TlsConfig::default(),
            websocket: WebSocketConfig::default(),
            mappings: Vec::new(),
        };
        let mapping = MappingConfig {
            name: "udp-test".to_owned(),
            kind: MappingType::Udp,
            local_ip: IpAddr::from([127, 0, 0, 1]),
            local_port,
            remote_port: 9000,
            concurrent: 1,
            reconnect: Duration::from_secs(1),
        };
        MappingEntry::new(Arc::new(config), mapping)
    }

    #[test]
    fn onlydns_never_regresses() {
        let state = AtomicU8::new(0);
        let _ = state.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
        assert_eq!(state.load(Ordering::Acquire), 1);
        // A later port-53 send cannot demote an already-promoted state.
        let _ = state.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
        state.store(2, Ordering::Release);
        let _ = state.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
        assert_eq!(state.load(Ordering::Acquire), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dns_query_ports_evict_on_the_short_fuse() {
        let entry = entry_with_local_port(DNS_PORT);
        let peer: SocketAddr = "198.51.100.7:4242".parse().unwrap();

        let port = DatagramPort::open(&entry, peer).await.unwrap();
        port.send_to_local(b"query").await;
        assert_eq!(port.effective_timeout(), DNS_QUERY_TIMEOUT);

        // No reply ever arrives; the sweep evicts within the DNS fuse.
        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(port.idle() > DNS_QUERY_TIMEOUT);
    }

    #[tokio::test]
    async fn non_dns_ports_keep_the_configured_timeout() {
        let entry = entry_with_local_port(9053);
        let peer: SocketAddr = "198.51.100.7:4242".parse().unwrap();

        let port = DatagramPort::open(&entry, peer).await.unwrap();
        port.send_to_local(b"payload").await;
        assert_eq!(port.effective_timeout(), Duration::from_secs(72));
        port.close();
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_ports_leave_the_entry_table() {
        let entry = entry_with_local_port(DNS_PORT);
        let peer: SocketAddr = "198.51.100.9:53000".parse().unwrap();

        let port = DatagramPort::open(&entry, peer).await.unwrap();
        entry
            .ports_insert_for_test(port.key().to_owned(), Arc::clone(&port));
        port.send_to_local(b"query").await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(entry.datagram_port_count(), 0);
    }
}
