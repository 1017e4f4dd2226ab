//! Keeps this node connected to its seed list.

use crate::network::hosts_resolver::HostsResolver;
use crate::protocols::P2P;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct BootstrapService {
    seeds: Arc<HostsResolver>,
    interval: Duration,
    stop: CancellationToken,
}

impl BootstrapService {
    pub fn new(seeds: Arc<HostsResolver>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            seeds,
            interval,
            stop: CancellationToken::new(),
        })
    }

    pub fn start(self: &Arc<Self>, net: &Arc<dyn P2P>) {
        let service = self.clone();
        let net = Arc::downgrade(net);
        tokio::spawn(async move { service.run(net).await });
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    async fn run(self: Arc<Self>, net: Weak<dyn P2P>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(net) = net.upgrade() else { break };
                    self.connect_seeds(&net);
                }
            }
        }
        debug!("[p2p] bootstrap stopped");
    }

    /// Dial every seed that is neither us nor a current neighbor. Dialing
    /// our own seed entry is how a seed learns its address.
    pub fn connect_seeds(&self, net: &Arc<dyn P2P>) -> Vec<String> {
        let neighbors = net.get_neighbor_addrs();
        let pending: Vec<String> = self
            .seeds
            .host_addrs()
            .into_iter()
            .filter(|seed| !net.is_own_address(seed))
            .filter(|seed| !neighbors.iter().any(|n| n.addr == *seed))
            .collect();

        for seed in &pending {
            let net = net.clone();
            let seed = seed.clone();
            tokio::spawn(async move {
                match net.connect(&seed).await {
                    Ok(()) => info!("[p2p] connected to seed {}", seed),
                    Err(e) => debug!("[p2p] connect seed {} failed: {}", seed, e),
                }
            });
        }
        pending
    }
}

impl Drop for BootstrapService {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
