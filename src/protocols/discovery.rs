//! Neighbor exchange over a flat neighbor list.
//!
//! Nodes periodically ask a few random neighbors for the peers closest to
//! their own id and dial whatever comes back. Masked addresses are never
//! handed out and never dialed.

use crate::network::address_filter::{AddressFilter, CombinedFilter, StaticMaskFilter};
use crate::network::message::{Message, PeerAddr};
use crate::network::peer_id::PeerId;
use crate::protocols::{MessageContext, P2P};
use rand::seq::SliceRandom;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Most peers returned by one FindNodeResp.
pub const MAX_CLOSER_PEERS: usize = 8;
/// Neighbors asked per discovery round.
pub const FIND_NODE_FANOUT: usize = 3;

pub struct Discovery {
    mask: CombinedFilter,
    interval: Duration,
    stop: CancellationToken,
}

impl Discovery {
    pub fn new(
        mask_peers: Vec<String>,
        mask_filter: Option<Arc<dyn AddressFilter>>,
        interval: Duration,
    ) -> Arc<Self> {
        let mut mask = CombinedFilter::default();
        if !mask_peers.is_empty() {
            mask.push(Arc::new(StaticMaskFilter::new(mask_peers)));
        }
        if let Some(filter) = mask_filter {
            mask.push(filter);
        }
        Arc::new(Self {
            mask,
            interval,
            stop: CancellationToken::new(),
        })
    }

    pub fn start(self: &Arc<Self>, net: &Arc<dyn P2P>) {
        let discovery = self.clone();
        let net = Arc::downgrade(net);
        tokio::spawn(async move { discovery.run(net).await });
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    async fn run(self: Arc<Self>, net: Weak<dyn P2P>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(net) = net.upgrade() else { break };
                    self.find_self(&net).await;
                }
            }
        }
        debug!("[dht] discovery stopped");
    }

    /// Ask up to `FIND_NODE_FANOUT` random neighbors for peers close to us.
    async fn find_self(&self, net: &Arc<dyn P2P>) {
        let mut neighbors = net.get_neighbors();
        neighbors.shuffle(&mut rand::thread_rng());
        let request = Message::FindNodeReq { target: net.id() };
        for peer in neighbors.into_iter().take(FIND_NODE_FANOUT) {
            if let Err(e) = peer.send(&request).await {
                debug!("[dht] find node request to {} failed: {}", peer.addr(), e);
            }
        }
    }

    /// Neighbors sorted closest-first to `target`, without `exclude` and
    /// without masked addresses.
    pub fn closest_peers(&self, net: &Arc<dyn P2P>, target: &PeerId, exclude: &PeerId) -> Vec<PeerAddr> {
        let mut peers: Vec<PeerAddr> = net
            .get_neighbor_addrs()
            .into_iter()
            .filter(|p| p.id != *exclude && !self.mask.filtered(&p.addr))
            .collect();
        peers.sort_by_key(|p| std::cmp::Reverse(target.distance(&p.id)));
        peers.truncate(MAX_CLOSER_PEERS);
        peers
    }

    pub async fn find_node_handle(&self, ctx: &MessageContext, target: &PeerId) {
        let net = ctx.network();
        let sender = ctx.sender();
        let success = *target == net.id();
        let address = if success { net.own_address() } else { String::new() };
        let closer_peers = self.closest_peers(net, target, &sender.id());
        trace!(
            "[dht] find node {} for {}: {} closer peers",
            target,
            sender.addr(),
            closer_peers.len()
        );

        let reply = Message::FindNodeResp {
            target: *target,
            success,
            address,
            closer_peers,
        };
        if let Err(e) = sender.send(&reply).await {
            warn!("[dht] failed to send find node response to {}: {}", sender.addr(), e);
        }
    }

    pub fn find_node_response_handle(&self, ctx: &MessageContext, closer_peers: &[PeerAddr]) {
        for peer in closer_peers {
            self.maybe_dial(ctx.network(), &peer.addr);
        }
    }

    pub async fn addr_req_handle(&self, ctx: &MessageContext) {
        let sender = ctx.sender();
        let addrs: Vec<PeerAddr> = ctx
            .network()
            .get_neighbor_addrs()
            .into_iter()
            .filter(|p| p.id != sender.id() && !self.mask.filtered(&p.addr))
            .collect();
        if let Err(e) = sender.send(&Message::Addr(addrs)).await {
            warn!("[dht] failed to send addr to {}: {}", sender.addr(), e);
        }
    }

    pub fn addr_handle(&self, ctx: &MessageContext, addrs: &[PeerAddr]) {
        for peer in addrs {
            self.maybe_dial(ctx.network(), &peer.addr);
        }
    }

    /// Dial `addr` unless it is ours, already a neighbor or masked.
    /// Returns whether a dial was started.
    pub fn maybe_dial(&self, net: &Arc<dyn P2P>, addr: &str) -> bool {
        if net.is_own_address(addr) || self.mask.filtered(addr) {
            return false;
        }
        if net.get_neighbor_addrs().iter().any(|p| p.addr == addr) {
            return false;
        }
        let net = net.clone();
        let addr = addr.to_string();
        tokio::spawn(async move {
            if let Err(e) = net.connect(&addr).await {
                trace!("[dht] connect {} failed: {}", addr, e);
            }
        });
        true
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer_id::common_prefix_len;
    use crate::protocols::testing::{ctx, FakeNet};

    #[tokio::test]
    async fn test_find_node_response_excludes_requester_and_masked() {
        let net = FakeNet::new();
        let discovery = Discovery::new(vec!["10.0.9.".to_string()], None, Duration::from_secs(1));
        let target = PeerId::random();

        let (requester, outbox) = net.add_neighbor("10.0.0.2:20338");
        net.add_neighbor("10.0.9.1:20338");
        for cpl in [1, 30, 5, 60, 2, 9, 17, 40, 3, 80] {
            let id = PeerId::random_at_distance(&target, cpl);
            net.add_neighbor_with_id(id, &format!("10.0.1.{}:20338", cpl));
        }

        discovery
            .find_node_handle(&ctx(&net, &requester), &target)
            .await;
        let sent = outbox.take();
        let [Message::FindNodeResp {
            success,
            closer_peers,
            ..
        }] = sent.as_slice()
        else {
            panic!("expected one find node response, got {:?}", sent);
        };
        assert!(!success);
        assert_eq!(closer_peers.len(), MAX_CLOSER_PEERS);
        assert!(closer_peers.iter().all(|p| p.id != requester.id()));
        assert!(closer_peers.iter().all(|p| !p.addr.starts_with("10.0.9.")));
        let cpls: Vec<usize> = closer_peers
            .iter()
            .map(|p| common_prefix_len(&target, &p.id))
            .collect();
        assert_eq!(&cpls[..3], &[80, 60, 40]);
    }

    #[tokio::test]
    async fn test_find_self_reports_own_address() {
        let net = FakeNet::new();
        *net.own_addr.lock() = "10.0.0.1:20338".into();
        let discovery = Discovery::new(Vec::new(), None, Duration::from_secs(1));
        let (requester, outbox) = net.add_neighbor("10.0.0.2:20338");

        discovery
            .find_node_handle(&ctx(&net, &requester), &net.id())
            .await;
        let sent = outbox.take();
        assert!(matches!(
            sent.as_slice(),
            [Message::FindNodeResp { success: true, address, .. }] if address == "10.0.0.1:20338"
        ));
    }

    #[tokio::test]
    async fn test_dial_rules() {
        let net = FakeNet::new();
        *net.own_addr.lock() = "10.0.0.1:20338".into();
        let discovery = Discovery::new(vec!["10.0.9.".to_string()], None, Duration::from_secs(1));
        let dyn_net: Arc<dyn P2P> = net.clone();
        net.add_neighbor("10.0.0.2:20338");

        assert!(!discovery.maybe_dial(&dyn_net, "10.0.0.1:20338"));
        assert!(!discovery.maybe_dial(&dyn_net, "10.0.0.2:20338"));
        assert!(!discovery.maybe_dial(&dyn_net, "10.0.9.4:20338"));
        assert!(discovery.maybe_dial(&dyn_net, "10.0.0.3:20338"));

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*net.dialed.lock(), vec!["10.0.0.3:20338".to_string()]);
    }

    #[tokio::test]
    async fn test_addr_request_masks() {
        let net = FakeNet::new();
        let discovery = Discovery::new(vec!["10.0.9.".to_string()], None, Duration::from_secs(1));
        let (requester, outbox) = net.add_neighbor("10.0.0.2:20338");
        net.add_neighbor("10.0.0.3:20338");
        net.add_neighbor("10.0.9.3:20338");

        discovery.addr_req_handle(&ctx(&net, &requester)).await;
        let sent = outbox.take();
        assert!(matches!(
            sent.as_slice(),
            [Message::Addr(addrs)] if addrs.len() == 1 && addrs[0].addr == "10.0.0.3:20338"
        ));
    }
}
