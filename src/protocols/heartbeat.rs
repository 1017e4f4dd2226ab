//! Periodic ping/pong liveness and keep-alive eviction.

use crate::config::HeartbeatConfig;
use crate::network::message::Message;
use crate::protocols::{MessageContext, P2P};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Height a heartbeat starts advertising when nothing else is configured.
pub const DEFAULT_HEARTBEAT_HEIGHT: u64 = 9442;

/// Window during which a node pretends to be unresponsive. Measured from
/// the heartbeat's own start; a zero `after_start` disables it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatInterrupt {
    #[serde(with = "secs")]
    pub after_start: Duration,
    /// How long outgoing pings are suppressed.
    #[serde(with = "secs")]
    pub ping_last: Duration,
    /// How long incoming pings go unanswered.
    #[serde(with = "secs")]
    pub pong_last: Duration,
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatParams {
    pub period: Duration,
    pub keepalive_factor: u32,
    pub initial_height: u64,
    pub interrupt: HeartbeatInterrupt,
}

impl HeartbeatParams {
    pub fn from_config(config: &HeartbeatConfig, interrupt: HeartbeatInterrupt) -> Self {
        Self {
            period: config.period(),
            keepalive_factor: config.keepalive_timeout_factor,
            initial_height: config.initial_height,
            interrupt,
        }
    }

    /// Silence after which a neighbor is dropped.
    pub fn keepalive_timeout(&self) -> Duration {
        self.period * self.keepalive_factor
    }
}

impl Default for HeartbeatParams {
    fn default() -> Self {
        Self::from_config(&HeartbeatConfig::default(), HeartbeatInterrupt::default())
    }
}

pub struct Heartbeat {
    net: Weak<dyn P2P>,
    params: HeartbeatParams,
    height: AtomicU64,
    started: Instant,
    stop: CancellationToken,
}

impl Heartbeat {
    pub fn new(net: &Arc<dyn P2P>, params: HeartbeatParams) -> Arc<Self> {
        Arc::new(Self {
            net: Arc::downgrade(net),
            height: AtomicU64::new(params.initial_height),
            params,
            started: Instant::now(),
            stop: CancellationToken::new(),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let hb = self.clone();
        tokio::spawn(async move { hb.run().await });
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Relaxed)
    }

    async fn run(self: Arc<Self>) {
        let period = self.params.period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("[p2p] heartbeat every {:?}", period);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(net) = self.net.upgrade() else { break };
                    self.ping(&net).await;
                    self.evict_stale(&net, std::time::Instant::now());
                }
            }
        }
        debug!("[p2p] heartbeat stopped");
    }

    async fn ping(&self, net: &Arc<dyn P2P>) {
        if self.need_interrupt(true) {
            debug!("[p2p] interrupt ping...");
            return;
        }
        net.broadcast(&Message::Ping {
            height: self.height(),
        })
        .await;
    }

    /// Close every neighbor silent for longer than the keep-alive timeout.
    pub fn evict_stale(&self, net: &Arc<dyn P2P>, now: std::time::Instant) -> usize {
        let timeout = self.params.keepalive_timeout();
        let mut evicted = 0;
        for peer in net.get_neighbors() {
            let silent = now.saturating_duration_since(peer.contact_time());
            if silent > timeout {
                warn!(
                    "[p2p] keep alive timeout, lost remote peer {} - {} after {:?}",
                    peer.id(),
                    peer.addr(),
                    silent
                );
                peer.close();
                evicted += 1;
            }
        }
        evicted
    }

    pub async fn ping_handle(&self, ctx: &MessageContext, height: u64) {
        if self.need_interrupt(false) {
            info!("[p2p] interrupt pong...");
            return;
        }
        let sender = ctx.sender();
        sender.set_height(height);

        let local = self.height();
        ctx.network().set_height(local);
        if let Err(e) = sender.send(&Message::Pong { height: local }).await {
            warn!("[p2p] failed to answer ping from {}: {}", sender.addr(), e);
        }
    }

    pub fn pong_handle(&self, ctx: &MessageContext, height: u64) {
        ctx.sender().set_height(height);
        self.height.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether the interrupt window is open. `ping_side` selects which
    /// duration applies.
    pub fn need_interrupt(&self, ping_side: bool) -> bool {
        let window = &self.params.interrupt;
        if window.after_start.is_zero() {
            return false;
        }
        let last = if ping_side {
            window.ping_last
        } else {
            window.pong_last
        };
        let elapsed = self.started.elapsed();
        elapsed > window.after_start && elapsed < window.after_start + last
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{ctx, FakeNet};

    fn params() -> HeartbeatParams {
        HeartbeatParams {
            period: Duration::from_secs(3),
            keepalive_factor: 15,
            initial_height: DEFAULT_HEARTBEAT_HEIGHT,
            interrupt: HeartbeatInterrupt::default(),
        }
    }

    #[tokio::test]
    async fn test_ping_answered_with_local_height() {
        let net = FakeNet::new();
        let dyn_net: Arc<dyn P2P> = net.clone();
        let hb = Heartbeat::new(&dyn_net, params());
        let (peer, outbox) = net.add_neighbor("10.0.0.2:20338");

        hb.ping_handle(&ctx(&net, &peer), 77).await;
        assert_eq!(peer.height(), 77);
        assert_eq!(net.height(), DEFAULT_HEARTBEAT_HEIGHT);
        let sent = outbox.take();
        assert!(matches!(sent.as_slice(), [Message::Pong { height }] if *height == DEFAULT_HEARTBEAT_HEIGHT));
    }

    #[tokio::test]
    async fn test_pong_bumps_height() {
        let net = FakeNet::new();
        let dyn_net: Arc<dyn P2P> = net.clone();
        let hb = Heartbeat::new(&dyn_net, params());
        let (peer, _) = net.add_neighbor("10.0.0.2:20338");

        hb.pong_handle(&ctx(&net, &peer), 12);
        hb.pong_handle(&ctx(&net, &peer), 13);
        assert_eq!(peer.height(), 13);
        assert_eq!(hb.height(), DEFAULT_HEARTBEAT_HEIGHT + 2);
    }

    #[tokio::test]
    async fn test_silent_neighbor_evicted() {
        let net = FakeNet::new();
        let dyn_net: Arc<dyn P2P> = net.clone();
        let hb = Heartbeat::new(&dyn_net, params());
        let (quiet, _) = net.add_neighbor("10.0.0.2:20338");
        let (fresh, _) = net.add_neighbor("10.0.0.3:20338");

        let now = std::time::Instant::now();
        let limit = params().keepalive_timeout();
        let old = now.checked_sub(limit + Duration::from_secs(1)).unwrap();
        quiet.update_contact_time(old);
        fresh.update_contact_time(now);

        assert_eq!(hb.evict_stale(&dyn_net, now), 1);
        assert!(quiet.is_closed());
        assert!(!fresh.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_broadcasts_ping() {
        let net = FakeNet::new();
        let dyn_net: Arc<dyn P2P> = net.clone();
        let hb = Heartbeat::new(&dyn_net, params());
        hb.start();

        tokio::time::sleep(Duration::from_secs(4)).await;
        let sent = net.broadcasts.take();
        assert!(matches!(sent.as_slice(), [Message::Ping { .. }]));

        hb.stop();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(net.broadcasts.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_window() {
        let net = FakeNet::new();
        let dyn_net: Arc<dyn P2P> = net.clone();
        let mut p = params();
        p.interrupt = HeartbeatInterrupt {
            after_start: Duration::from_secs(10),
            ping_last: Duration::from_secs(20),
            pong_last: Duration::from_secs(5),
        };
        let hb = Heartbeat::new(&dyn_net, p);
        let (peer, outbox) = net.add_neighbor("10.0.0.2:20338");

        assert!(!hb.need_interrupt(true));
        tokio::time::advance(Duration::from_secs(12)).await;
        assert!(hb.need_interrupt(true));
        assert!(hb.need_interrupt(false));
        hb.ping_handle(&ctx(&net, &peer), 1).await;
        assert!(outbox.take().is_empty());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(hb.need_interrupt(true));
        assert!(!hb.need_interrupt(false));
        hb.ping_handle(&ctx(&net, &peer), 1).await;
        assert_eq!(outbox.take().len(), 1);
    }
}
