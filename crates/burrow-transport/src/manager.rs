//! Tunnel selection and connection-id allocation for a mapping entry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::tunnel::Tunnel;

/// Probe budget for [`ConnectionIdAllocator::allocate`]; an exhausted
/// id space fails the allocation instead of spinning.
const ID_PROBE_LIMIT: u32 = 65536;

/// The tunnels attached to one mapping entry, in rotation order.
#[derive(Default)]
pub struct TunnelSet {
    ring: VecDeque<Arc<Tunnel>>,
}

impl TunnelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tunnel: Arc<Tunnel>) {
        self.ring.push_back(tunnel);
    }

    pub fn remove(&mut self, id: u64) -> Option<Arc<Tunnel>> {
        let index = self.ring.iter().position(|t| t.id() == id)?;
        self.ring.remove(index)
    }

    /// Round-robin pick: head of the ring, rotated to the back. Used by
    /// the datagram forwarding path.
    pub fn rotate(&mut self) -> Option<Arc<Tunnel>> {
        let tunnel = self.ring.pop_front()?;
        self.ring.push_back(Arc::clone(&tunnel));
        Some(tunnel)
    }

    /// Least-loaded pick by active connection count, first tunnel
    /// winning ties. Used by the public TCP accept path.
    pub fn least_loaded(&self) -> Option<Arc<Tunnel>> {
        self.ring
            .iter()
            .min_by_key(|t| t.active_connections())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Tunnel>> {
        self.ring.iter()
    }

    pub fn drain(&mut self) -> Vec<Arc<Tunnel>> {
        self.ring.drain(..).collect()
    }
}

/// Allocator for logical connection ids: an atomic counter that skips
/// zero, re-checked against the entry's live tables with a bounded
/// number of probes.
#[derive(Default)]
pub struct ConnectionIdAllocator {
    next: AtomicU32,
}

impl ConnectionIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, mut in_use: impl FnMut(u32) -> bool) -> Option<u32> {
        let mut probes = 0;
        while probes < ID_PROBE_LIMIT {
            let id = self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id == 0 {
                continue;
            }
            if !in_use(id) {
                return Some(id);
            }
            probes += 1;
        }
        None
    }
}
