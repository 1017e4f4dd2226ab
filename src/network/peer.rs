//! Live peer links and the neighbor registry.

use crate::error::NetError;
use crate::network::connect_controller::ConnectionGuard;
use crate::network::message::{Message, PeerAddr, PeerInfo};
use crate::network::peer_id::PeerId;
use crate::network::transport::FrameWriter;
use crate::network::wire;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One established link. The receive side is driven by the server's rx
/// task; this handle owns the write half and the admission slot.
pub struct Peer {
    pub info: Arc<PeerInfo>,
    addr: String,
    writer: tokio::sync::Mutex<Box<dyn FrameWriter>>,
    last_contact: parking_lot::Mutex<Instant>,
    closed: CancellationToken,
    guard: parking_lot::Mutex<Option<ConnectionGuard>>,
}

impl Peer {
    pub fn new(
        info: Arc<PeerInfo>,
        addr: String,
        writer: Box<dyn FrameWriter>,
        guard: Option<ConnectionGuard>,
    ) -> Self {
        Self {
            info,
            addr,
            writer: tokio::sync::Mutex::new(writer),
            last_contact: parking_lot::Mutex::new(Instant::now()),
            closed: CancellationToken::new(),
            guard: parking_lot::Mutex::new(guard),
        }
    }

    pub fn id(&self) -> PeerId {
        self.info.id
    }

    /// Remote address of the underlying connection.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn listen_addr(&self) -> String {
        self.info.remote_listen_address()
    }

    pub fn height(&self) -> u64 {
        self.info.height()
    }

    pub fn set_height(&self, height: u64) {
        self.info.set_height(height);
    }

    pub fn contact_time(&self) -> Instant {
        *self.last_contact.lock()
    }

    pub fn update_contact_time(&self, at: Instant) {
        *self.last_contact.lock() = at;
    }

    pub async fn send(&self, message: &Message) -> Result<(), NetError> {
        let frame = wire::encode(message)?;
        self.send_frame(&frame).await
    }

    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        self.writer.lock().await.write_frame(frame).await
    }

    /// Ask the link to shut down. The rx task notices, flushes out the
    /// disconnect and releases the admission slot.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub(crate) async fn shutdown_writer(&self) {
        self.writer.lock().await.close().await;
    }

    pub(crate) fn release_guard(&self) {
        let guard = self.guard.lock().take();
        drop(guard);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.info.id)
            .field("addr", &self.addr)
            .finish()
    }
}

/// Neighbor registry keyed by peer id.
#[derive(Default)]
pub struct NbrPeers {
    peers: DashMap<PeerId, Arc<Peer>>,
}

impl NbrPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `peer` in its id's slot, handing back the previous occupant for
    /// the caller to close.
    pub fn replace_peer(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        self.peers.insert(peer.id(), peer)
    }

    /// Drop the registry entry only if it still holds this exact link.
    pub fn remove_if_same(&self, peer: &Arc<Peer>) -> bool {
        self.peers
            .remove_if(&peer.id(), |_, current| Arc::ptr_eq(current, peer))
            .is_some()
    }

    pub fn get_peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.get(id).map(|p| p.value().clone())
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn get_neighbors(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    pub fn get_neighbor_addrs(&self) -> Vec<PeerAddr> {
        self.peers
            .iter()
            .map(|p| PeerAddr {
                id: *p.key(),
                addr: p.value().listen_addr(),
            })
            .collect()
    }

    pub fn nbr_count(&self) -> usize {
        self.peers.len()
    }

    pub fn neighbor_most_height(&self) -> u64 {
        self.peers
            .iter()
            .map(|p| p.value().height())
            .max()
            .unwrap_or(0)
    }

    pub fn has_listen_addr(&self, addr: &str) -> bool {
        self.peers.iter().any(|p| p.value().listen_addr() == addr)
    }

    /// Encode once, write to every neighbor.
    pub async fn broadcast(&self, message: &Message) {
        let frame = match wire::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };

        let peers = self.get_neighbors();
        if peers.is_empty() {
            debug!(
                "⚠️  Broadcast: no peers connected (message type: {})",
                message.message_type()
            );
            return;
        }

        for peer in peers {
            if let Err(e) = peer.send_frame(&frame).await {
                warn!("Failed to broadcast to {}: {}", peer.addr(), e);
            }
        }
    }
}
