//! Pluggable peer behavior.
//!
//! A `NetServer` hands every lifecycle event and every inbound application
//! message to one `Protocol`. The composites in `handlers` pick which
//! sub-services run and which messages reach them.

pub mod bootstrap;
pub mod discovery;
pub mod gov;
pub mod handlers;
pub mod heartbeat;
pub mod parker;
pub mod reconnect;
pub mod subnet;

use crate::error::{AdmissionError, NetError};
use crate::network::address_filter::AddressFilter;
use crate::network::message::{Message, PeerAddr, PeerInfo};
use crate::network::peer::Peer;
use crate::network::peer_id::PeerId;
use async_trait::async_trait;
use std::sync::Arc;

/// Lifecycle events delivered to `Protocol::handle_system_message`.
#[derive(Debug, Clone)]
pub enum SystemMessage {
    NetworkStart,
    PeerConnected(Arc<PeerInfo>),
    PeerDisconnected(Arc<PeerInfo>),
    NetworkStop,
    /// This node learned the address others can reach it on.
    HostAddrDetected(String),
}

/// The view of the network a protocol works against.
#[async_trait]
pub trait P2P: Send + Sync {
    fn id(&self) -> PeerId;
    fn host_info(&self) -> Arc<PeerInfo>;
    fn height(&self) -> u64;
    fn set_height(&self, height: u64);

    fn get_peer(&self, id: &PeerId) -> Option<Arc<Peer>>;
    fn get_neighbors(&self) -> Vec<Arc<Peer>>;
    fn get_neighbor_addrs(&self) -> Vec<PeerAddr>;
    fn connection_count(&self) -> usize;

    fn own_address(&self) -> String;
    fn is_own_address(&self, addr: &str) -> bool;

    async fn connect(&self, addr: &str) -> Result<(), AdmissionError>;
    async fn send_to(&self, id: &PeerId, message: &Message) -> Result<(), NetError>;
    async fn broadcast(&self, message: &Message);
}

/// Per-message context handed to `Protocol::handle_peer_message`.
#[derive(Clone)]
pub struct MessageContext {
    pub sender: Arc<Peer>,
    pub net: Arc<dyn P2P>,
    pub msg_size: usize,
}

impl MessageContext {
    pub fn sender(&self) -> &Arc<Peer> {
        &self.sender
    }

    pub fn network(&self) -> &Arc<dyn P2P> {
        &self.net
    }
}

#[async_trait]
pub trait Protocol: Send + Sync {
    async fn handle_system_message(&self, net: Arc<dyn P2P>, msg: SystemMessage);

    async fn handle_peer_message(&self, ctx: MessageContext, msg: Message);

    /// Extra admission filter consulted by the connect controller.
    fn reserved_addr_filter(&self, _static_filter_enabled: bool) -> Option<Arc<dyn AddressFilter>> {
        None
    }
}
