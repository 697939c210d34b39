//! A tunnel: one transmission plus its write queue.
//!
//! All outbound frames go through an unbounded FIFO queue to a dedicated
//! writer task, so frames reach the transport strictly in enqueue order
//! with a single write in flight. No flow control beyond the TCP
//! backpressure the transport itself exerts. The read half is handed
//! back to the owning mapping entry, which runs the dispatch loop.

use bytes::Bytes;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::transmission::Transmission;
use crate::TransportError;

static NEXT_TUNNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a live tunnel. Cloned freely via `Arc`; identity is `id()`.
pub struct Tunnel {
    id: u64,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    queue: mpsc::UnboundedSender<Bytes>,
    active: AtomicUsize,
    closed: watch::Sender<bool>,
}

/// Read half of a tunnel, owned by the dispatching entry.
pub struct TunnelReader {
    frames: SplitStream<Transmission>,
    closed: watch::Receiver<bool>,
}

impl Tunnel {
    /// Take ownership of a handshaken transmission: spawn the writer
    /// task and hand the read half back.
    pub fn start(transmission: Transmission) -> (Arc<Tunnel>, TunnelReader) {
        let id = NEXT_TUNNEL_ID.fetch_add(1, Ordering::Relaxed);
        let local_addr = transmission.local_addr();
        let peer_addr = transmission.peer_addr();
        let (mut sink, frames) = transmission.split();

        let (queue, mut outbound) = mpsc::unbounded_channel::<Bytes>();
        let (closed, closed_rx) = watch::channel(false);

        let tunnel = Arc::new(Tunnel {
            id,
            local_addr,
            peer_addr,
            queue,
            active: AtomicUsize::new(0),
            closed,
        });

        let writer = Arc::clone(&tunnel);
        tokio::spawn(async move {
            let mut shutdown = writer.closed.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    frame = outbound.recv() => match frame {
                        Some(frame) => {
                            trace!(tunnel = writer.id, len = frame.len(), "writing frame");
                            if let Err(error) = sink.send(frame).await {
                                debug!(tunnel = writer.id, %error, "tunnel write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.close().await;
            writer.closed.send_replace(true);
        });

        (
            tunnel,
            TunnelReader {
                frames,
                closed: closed_rx,
            },
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queue one frame. Fails once the tunnel is closed or its writer is
    /// gone.
    pub fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }
        self.queue
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    /// Signal the writer to shut the transport down. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Number of logical connections currently dispatched to this tunnel.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn track_open(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_close(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

impl TunnelReader {
    /// Next inbound frame, or `None` once the tunnel is dead (read
    /// failure, peer close, or local `Tunnel::close`).
    pub async fn next(&mut self) -> Option<Bytes> {
        loop {
            tokio::select! {
                changed = self.closed.changed() => {
                    if changed.is_err() || *self.closed.borrow() {
                        return None;
                    }
                }
                frame = self.frames.next() => {
                    return match frame {
                        Some(Ok(frame)) => Some(frame),
                        Some(Err(error)) => {
                            debug!(%error, "tunnel read failed");
                            None
                        }
                        None => None,
                    };
                }
            }
        }
    }
}
