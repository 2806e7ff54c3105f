//! Peer registry: open connections keyed by advertised `host:port`.
//!
//! Outbound and inbound connections live in disjoint collections per peer;
//! lookup prefers outbound. A channel never stores a connection under its
//! own address.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::connection::{Connection, Direction};
use crate::ChannelError;

#[derive(Default)]
struct Peer {
    outbound: Vec<Connection>,
    inbound: Vec<Connection>,
}

impl Peer {
    fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }
}

/// Registry of open connections, keyed by the peer's advertised `host:port`.
#[derive(Default)]
pub(crate) struct PeerRegistry {
    local_host_port: Mutex<Option<String>>,
    peers: Mutex<HashMap<String, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the channel's own address so self-insertions can be refused.
    pub fn set_local(&self, host_port: String) {
        *self.local_host_port.lock() = Some(host_port);
    }

    /// The preferred connection to a peer: outbound first, then inbound.
    /// Closing connections are skipped.
    pub fn get(&self, host_port: &str) -> Option<Connection> {
        let peers = self.peers.lock();
        let peer = peers.get(host_port)?;
        peer.outbound
            .iter()
            .chain(peer.inbound.iter())
            .find(|conn| !conn.is_closing())
            .cloned()
    }

    /// Store a connection under the peer's address. Refuses the channel's
    /// own address.
    pub fn insert(&self, host_port: &str, conn: Connection) -> Result<(), ChannelError> {
        if self.local_host_port.lock().as_deref() == Some(host_port) {
            return Err(ChannelError::SelfPeer {
                host_port: host_port.to_string(),
            });
        }
        let mut peers = self.peers.lock();
        let peer = peers.entry(host_port.to_string()).or_default();
        match conn.direction() {
            Direction::Outbound => peer.outbound.push(conn),
            Direction::Inbound => peer.inbound.push(conn),
        }
        Ok(())
    }

    /// Remove a connection by identity, dropping the peer entry when empty.
    pub fn remove(&self, host_port: &str, conn: &Connection) {
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.get_mut(host_port) {
            peer.outbound.retain(|c| !c.same_connection(conn));
            peer.inbound.retain(|c| !c.same_connection(conn));
            if peer.is_empty() {
                peers.remove(host_port);
            }
        }
    }

    pub fn connections_to(&self, host_port: &str) -> Vec<Connection> {
        let peers = self.peers.lock();
        peers
            .get(host_port)
            .map(|peer| {
                peer.outbound
                    .iter()
                    .chain(peer.inbound.iter())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn clear(&self) {
        self.peers.lock().clear();
    }
}

/// Split a `host:port` dial target, refusing malformed strings and literal
/// ephemerals (wildcard host or port 0).
pub(crate) fn parse_host_port(host_port: &str) -> Result<(String, u16), ChannelError> {
    let invalid = || ChannelError::InvalidPeer {
        host_port: host_port.to_string(),
    };
    let (host, port) = host_port.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if host.is_empty() || host == "0.0.0.0" || port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Channel, ChannelOptions};

    fn test_connection(channel: &Channel, direction: Direction, remote_addr: &str) -> Connection {
        // The far half stays open so the reader task blocks instead of
        // observing EOF and marking the connection closing.
        let (near, far) = tokio::io::duplex(4096);
        std::mem::forget(far);
        Connection::spawn(
            channel.shared.clone(),
            Box::new(near),
            direction,
            remote_addr.to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn get_prefers_outbound_connections() {
        let channel = Channel::new(ChannelOptions::default());
        let registry = PeerRegistry::new();

        let inbound = test_connection(&channel, Direction::Inbound, "10.0.0.9:41000");
        let outbound = test_connection(&channel, Direction::Outbound, "10.0.0.9:4040");

        registry.insert("10.0.0.9:4040", inbound).unwrap();
        registry.insert("10.0.0.9:4040", outbound.clone()).unwrap();

        let got = registry.get("10.0.0.9:4040").unwrap();
        assert!(got.same_connection(&outbound));
        assert_eq!(got.direction(), Direction::Outbound);
    }

    #[tokio::test]
    async fn insert_refuses_own_address() {
        let channel = Channel::new(ChannelOptions::default());
        let registry = PeerRegistry::new();
        registry.set_local("127.0.0.1:4040".to_string());

        let conn = test_connection(&channel, Direction::Inbound, "127.0.0.1:52000");
        assert!(matches!(
            registry.insert("127.0.0.1:4040", conn),
            Err(ChannelError::SelfPeer { .. })
        ));
        assert_eq!(registry.peer_count(), 0);
    }

    #[tokio::test]
    async fn remove_drops_empty_peer_entries() {
        let channel = Channel::new(ChannelOptions::default());
        let registry = PeerRegistry::new();

        let conn = test_connection(&channel, Direction::Outbound, "10.0.0.9:4040");
        registry.insert("10.0.0.9:4040", conn.clone()).unwrap();
        assert_eq!(registry.peer_count(), 1);

        registry.remove("10.0.0.9:4040", &conn);
        assert_eq!(registry.peer_count(), 0);
        assert!(registry.get("10.0.0.9:4040").is_none());
    }

    #[test]
    fn parse_accepts_routable_addresses() {
        assert_eq!(
            parse_host_port("127.0.0.1:4040").unwrap(),
            ("127.0.0.1".to_string(), 4040)
        );
        assert_eq!(
            parse_host_port("example.test:1").unwrap(),
            ("example.test".to_string(), 1)
        );
    }

    #[test]
    fn parse_refuses_ephemerals_and_garbage() {
        for bad in ["0.0.0.0:4040", "127.0.0.1:0", "nocolon", ":4040", "h:port"] {
            assert!(
                matches!(parse_host_port(bad), Err(ChannelError::InvalidPeer { .. })),
                "accepted {bad:?}"
            );
        }
    }
}
