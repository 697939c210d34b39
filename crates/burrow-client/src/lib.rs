//! Client role: maintain tunnels to the relay server and bridge them to
//! the local services behind the mappings.

pub mod connection;
pub mod datagram;
pub mod entry;

pub use entry::MappingEntry;

use burrow_config::AppConfig;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use burrow_transport::TransportError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("mapping local address {0} is not usable")]
    InvalidLocalAddress(IpAddr),

    #[error("client is closed")]
    Disposed,
}

/// The client process: one [`MappingEntry`] per configured mapping.
pub struct Router {
    config: Arc<AppConfig>,
    entries: Mutex<Vec<Arc<MappingEntry>>>,
    disposed: AtomicBool,
}

impl Router {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            config,
            entries: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Start every configured mapping. Tunnel establishment is
    /// asynchronous; failures feed the per-mapping reconnect loop rather
    /// than this call.
    pub fn open(&self) -> Result<(), ClientError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ClientError::Disposed);
        }

        let mut entries = self.entries.lock().unwrap();
        for mapping in &self.config.mappings {
            let entry = MappingEntry::new(Arc::clone(&self.config), mapping.clone());
            entry.open();
            entries.push(entry);
        }
        Ok(())
    }

    pub fn close(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries: Vec<_> = self.entries.lock().unwrap().drain(..).collect();
        for entry in entries {
            entry.close();
        }
    }
}
