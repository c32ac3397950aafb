use parking_lot::RwLock;
use pkg_types::replication::PeerEndpoint;

/// Source of the current peer set.
pub trait PeerDiscovery: Send + Sync {
    fn peers(&self) -> Vec<PeerEndpoint>;
}

/// Peer list fixed by configuration, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticPeers {
    peers: RwLock<Vec<PeerEndpoint>>,
}

impl StaticPeers {
    pub fn new(peers: Vec<PeerEndpoint>) -> Self {
        let mut peers = peers;
        peers.sort();
        peers.dedup();
        Self {
            peers: RwLock::new(peers),
        }
    }

    /// Parse `host:port` strings, skipping `self_endpoint` if listed.
    pub fn parse(peers: &[String], self_endpoint: Option<&PeerEndpoint>) -> anyhow::Result<Self> {
        let mut parsed = Vec::with_capacity(peers.len());
        for peer in peers {
            let endpoint = PeerEndpoint::parse(peer)?;
            if Some(&endpoint) != self_endpoint {
                parsed.push(endpoint);
            }
        }
        Ok(Self::new(parsed))
    }

    pub fn set(&self, peers: Vec<PeerEndpoint>) {
        *self.peers.write() = peers;
    }
}

impl PeerDiscovery for StaticPeers {
    fn peers(&self) -> Vec<PeerEndpoint> {
        self.peers.read().clone()
    }
}
