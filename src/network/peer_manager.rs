use crate::error::{BlockchainError, Result};
use log::{debug, warn};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// Tracks open inbound connections against `max_open_connections`
///
/// Peers are supplied by configuration and by `Peers` gossip; there is no DNS discovery.
#[derive(Clone)]
pub struct PeerManager {
    connected_peers: Arc<RwLock<HashSet<SocketAddr>>>,
    max_connections: usize,
}

impl PeerManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connected_peers: Arc::new(RwLock::new(HashSet::new())),
            max_connections,
        }
    }

    /// Parse configured seed addresses, skipping ones that do not parse.
    pub fn seed_addresses(peers: &[String]) -> Vec<SocketAddr> {
        peers
            .iter()
            .filter_map(|peer| match peer.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("Ignoring seed peer {peer}: {e}");
                    None
                }
            })
            .collect()
    }

    pub fn record_connection(&self, address: SocketAddr) -> Result<()> {
        let mut connected = self
            .connected_peers
            .write()
            .map_err(|e| BlockchainError::Network(format!("Failed to acquire peer lock: {e}")))?;

        connected.insert(address);
        debug!("Accepted connection from {address}");
        Ok(())
    }

    pub fn record_disconnection(&self, address: SocketAddr) -> Result<()> {
        let mut connected = self
            .connected_peers
            .write()
            .map_err(|e| BlockchainError::Network(format!("Failed to acquire peer lock: {e}")))?;

        connected.remove(&address);
        debug!("Closed connection from {address}");
        Ok(())
    }

    pub fn get_connected_count(&self) -> Result<usize> {
        let connected = self
            .connected_peers
            .read()
            .map_err(|e| BlockchainError::Network(format!("Failed to acquire peer lock: {e}")))?;
        Ok(connected.len())
    }

    pub fn should_accept_connection(&self) -> Result<bool> {
        let connected_count = self.get_connected_count()?;
        Ok(connected_count < self.max_connections)
    }
}
