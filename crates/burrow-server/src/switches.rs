//! The server's front door: accept tunnels, run their handshakes under a
//! deadline, and route each one to its mapping entry.

use futures::StreamExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use burrow_config::AppConfig;
use burrow_proto::{HandshakeRequest, MappingType};
use burrow_transport::{sockopt, Transmission};

use crate::entry::ServerEntry;
use crate::ServerError;

/// Registry of mapping entries keyed by `(type, remote port)`.
pub struct Switches {
    config: Arc<AppConfig>,
    entries: Mutex<HashMap<(MappingType, u16), Arc<ServerEntry>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Switches {
    pub fn new(config: Arc<AppConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: Mutex::new(HashMap::new()),
            accept_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Bind the tunnel listener and start accepting. Returns the bound
    /// address.
    pub async fn open(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        if self.is_disposed() {
            return Err(ServerError::Disposed);
        }

        let addr = SocketAddr::new(self.config.ip, self.config.port);
        let listener = sockopt::bind_listener(addr, self.config.backlog)?;
        let local = listener.local_addr()?;
        info!(%local, protocol = self.config.protocol.as_str(), "tunnel listener open");

        let switches = Arc::clone(self);
        *self.accept_task.lock().unwrap() = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        sockopt::tune_stream(&stream, switches.config.turbo_wan);
                        let switches = Arc::clone(&switches);
                        tokio::spawn(async move { switches.handshake(stream, peer).await });
                    }
                    Err(error) => {
                        warn!(%error, "tunnel accept failed");
                    }
                }
            }
        }));
        Ok(local)
    }

    /// Transport handshake plus the handshake-request read, bounded by
    /// `handshake.timeout`. A slow or silent peer is cut off.
    async fn handshake(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let outcome = timeout(self.config.handshake_timeout, async {
            let mut transmission = Transmission::accept(&self.config, stream).await?;
            let frame = transmission
                .next()
                .await
                .ok_or(ServerError::HandshakeClosed)??;
            let request = HandshakeRequest::decode(frame)?;
            Ok::<_, ServerError>((transmission, request))
        })
        .await;

        match outcome {
            Ok(Ok((transmission, request))) => {
                if !self.add_entry(transmission, request).await {
                    debug!(%peer, "tunnel rejected");
                }
            }
            Ok(Err(error)) => debug!(%peer, %error, "tunnel handshake failed"),
            Err(_) => debug!(%peer, "tunnel handshake timed out"),
        }
    }

    /// Attach a handshaken tunnel to its `(type, port)` entry, creating
    /// and opening the entry when it is the first arrival. An entry
    /// whose public bind fails is discarded.
    async fn add_entry(self: &Arc<Self>, transmission: Transmission, request: HandshakeRequest) -> bool {
        if self.is_disposed() || request.remote_port == 0 {
            return false;
        }

        let key = (request.kind, request.remote_port);
        let existing = self.entries.lock().unwrap().get(&key).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => {
                let entry = ServerEntry::new(
                    self,
                    request.name.clone(),
                    request.kind,
                    request.remote_port,
                );
                if let Err(error) = entry.open().await {
                    warn!(
                        name = %request.name,
                        kind = request.kind.as_str(),
                        port = request.remote_port,
                        %error,
                        "public bind failed"
                    );
                    return false;
                }

                let mut entries = self.entries.lock().unwrap();
                match entries.get(&key) {
                    // Another tunnel for the same binding raced us.
                    Some(winner) => {
                        let winner = Arc::clone(winner);
                        drop(entries);
                        entry.close();
                        winner
                    }
                    None => {
                        entries.insert(key, Arc::clone(&entry));
                        entry
                    }
                }
            }
        };

        entry.add_tunnel(transmission).await
    }

    /// Remove an entry from the table without closing it; entries call
    /// this as part of their own close.
    pub(crate) fn deregister(&self, kind: MappingType, port: u16) {
        self.entries.lock().unwrap().remove(&(kind, port));
    }

    /// Remove and close the `(type, port)` entry.
    pub fn close_entry(&self, kind: MappingType, port: u16) -> bool {
        let entry = self.entries.lock().unwrap().remove(&(kind, port));
        match entry {
            Some(entry) => {
                entry.close();
                true
            }
            None => false,
        }
    }

    /// Stop accepting and close every entry. Idempotent.
    pub fn close(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        let entries: Vec<_> = self
            .entries
            .lock()
            .unwrap()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            entry.close();
        }
    }
}
