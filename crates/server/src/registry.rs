//! Owns every connected peer's `PeerTransport` and fans encoded media out
//! to all of them. One room maps to one `PeerRegistry`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::peer::PeerTransport;
use crate::rtp::RtpPacket;

pub struct PeerRegistry {
    peers: RwLock<HashMap<Uuid, Arc<PeerTransport>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, peer: Arc<PeerTransport>) {
        self.peers.write().await.insert(peer.id, peer);
    }

    pub async fn find(&self, id: Uuid) -> Option<Arc<PeerTransport>> {
        self.peers.read().await.get(&id).cloned()
    }

    /// Removes the peer from the map and returns it so the caller can close
    /// it outside the lock — closing while holding the registry lock would
    /// serialize every other peer's lookups behind one peer's teardown.
    pub async fn remove(&self, id: Uuid) -> Option<Arc<PeerTransport>> {
        self.peers.write().await.remove(&id)
    }

    pub async fn list(&self) -> Vec<Arc<PeerTransport>> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn connected_count(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.is_connected())
            .count()
    }

    pub async fn broadcast_video(&self, packet: &RtpPacket) {
        for peer in self.peers.read().await.values() {
            peer.send_video(packet.clone());
        }
    }

    pub async fn broadcast_audio(&self, packet: &RtpPacket) {
        for peer in self.peers.read().await.values() {
            peer.send_audio(packet.clone());
        }
    }

    pub async fn close_all(&self) {
        let peers: Vec<_> = self.peers.write().await.drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.close().await;
        }
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // PeerTransport has no public constructor outside `create_peer`, which
    // needs a live webrtc API; these cover map bookkeeping on an empty
    // registry, the rest is exercised by signaling's integration tests.

    #[tokio::test]
    async fn empty_registry_has_no_peers() {
        let registry = PeerRegistry::new();
        assert_eq!(registry.list().await.len(), 0);
        assert_eq!(registry.connected_count().await, 0);
        assert!(registry.find(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn remove_of_unknown_id_is_none() {
        let registry = PeerRegistry::new();
        assert!(registry.remove(Uuid::new_v4()).await.is_none());
    }
}
