//! Re-dials peers that dropped, a bounded number of times.

use crate::network::message::PeerInfo;
use crate::protocols::P2P;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub struct ReconnectService {
    /// listen address -> dials attempted so far
    retry: Mutex<HashMap<String, u32>>,
    max_retries: u32,
    interval: Duration,
    stop: CancellationToken,
}

impl ReconnectService {
    pub fn new(max_retries: u32, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            retry: Mutex::new(HashMap::new()),
            max_retries,
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

    pub fn on_add_peer(&self, info: &PeerInfo) {
        self.retry.lock().remove(&info.remote_listen_address());
    }

    pub fn on_del_peer(&self, info: &PeerInfo) {
        let addr = info.remote_listen_address();
        debug!("[p2p] schedule reconnect to {}", addr);
        self.retry.lock().entry(addr).or_insert(0);
    }

    pub fn pending(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.retry.lock().keys().cloned().collect();
        addrs.sort();
        addrs
    }

    async fn run(self: Arc<Self>, net: Weak<dyn P2P>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(net) = net.upgrade() else { break };
                    self.retry_round(&net);
                }
            }
        }
        debug!("[p2p] reconnect stopped");
    }

    /// One pass over the retry list; returns the addresses dialed.
    pub fn retry_round(&self, net: &Arc<dyn P2P>) -> Vec<String> {
        let neighbors = net.get_neighbor_addrs();
        let mut dial = Vec::new();
        {
            let mut retry = self.retry.lock();
            retry.retain(|addr, count| {
                if neighbors.iter().any(|n| n.addr == *addr) {
                    return false;
                }
                if *count >= self.max_retries {
                    info!("[p2p] give up reconnecting {} after {} tries", addr, count);
                    return false;
                }
                *count += 1;
                dial.push(addr.clone());
                true
            });
        }

        for addr in &dial {
            let net = net.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                match net.connect(&addr).await {
                    Ok(()) => info!("[p2p] reconnected to {}", addr),
                    Err(e) => debug!("[p2p] reconnect {} failed: {}", addr, e),
                }
            });
        }
        dial
    }
}

impl Drop for ReconnectService {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
