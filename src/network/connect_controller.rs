//! Connection admission control.
//!
//! Every inbound and outbound attempt goes through the same pipeline:
//! pre-handshake checks on the raw address, the handshake itself, checks on
//! the identity the remote advertised, and finally bookkeeping. Nothing is
//! recorded for an attempt that fails any step.
//!
//! The pre-handshake check reserves a pending slot under the same lock that
//! counts the bound sets, so attempts still in their handshake count against
//! the bound and per-IP limits. The slot is released when the attempt fails
//! and becomes a bound entry when it succeeds.
//!
//! A successful attempt yields a `ConnectionGuard`. Dropping the guard
//! releases the slot; a stale guard (its peer id has since been re-admitted
//! under a newer connection) leaves the newer record alone.

use crate::error::{AdmissionError, Direction};
use crate::network::address_filter::{AddressFilter, NoFilter};
use crate::network::handshake::{handshake_client, handshake_server, HandshakeFaults};
use crate::network::message::{join_host_port, parse_ip_addr, PeerInfo};
use crate::network::peer_id::{PeerId, PeerKeyId};
use crate::network::transport::{Connection, Dialer};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct ConnCtrlOptions {
    pub max_conn_out_bound: usize,
    pub max_conn_in_bound: usize,
    pub max_conn_in_bound_per_ip: usize,
    pub handshake_timeout: Duration,
    pub faults: HandshakeFaults,
    pub dialer: Arc<dyn Dialer>,
}

impl ConnCtrlOptions {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            max_conn_out_bound: 10,
            max_conn_in_bound: 20,
            max_conn_in_bound_per_ip: 10,
            handshake_timeout: Duration::from_secs(10),
            faults: HandshakeFaults::default(),
            dialer,
        }
    }
}

struct ConnectedPeer {
    connect_id: u64,
    addr: String,
    info: Arc<PeerInfo>,
}

#[derive(Default)]
struct ControllerState {
    inbound: HashSet<String>,
    outbound: HashSet<String>,
    inbound_listen: HashSet<String>,
    /// address -> direction of an attempt between its pre-handshake check
    /// and its bookkeeping
    pending: HashMap<String, Direction>,
    peers: HashMap<PeerId, ConnectedPeer>,
    own_listen_addr: String,
}

impl ControllerState {
    fn bound(&self, direction: Direction) -> &HashSet<String> {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    fn bound_mut(&mut self, direction: Direction) -> &mut HashSet<String> {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }

    fn pending_in(&self, direction: Direction) -> impl Iterator<Item = &String> {
        self.pending
            .iter()
            .filter(move |(_, d)| **d == direction)
            .map(|(addr, _)| addr)
    }

    /// Saved plus pending connections in one direction.
    fn bound_total(&self, direction: Direction) -> usize {
        self.bound(direction).len() + self.pending_in(direction).count()
    }

    fn inbound_from_ip(&self, ip: &str) -> usize {
        self.inbound
            .iter()
            .chain(self.pending_in(Direction::Inbound))
            .filter(|a| parse_ip_addr(a) == Some(ip))
            .count()
    }
}

struct LocalIdentity {
    key: PeerKeyId,
    info: Arc<PeerInfo>,
}

/// A connection that passed admission, ready to become a peer link.
pub struct AdmittedPeer {
    pub info: Arc<PeerInfo>,
    pub conn: Connection,
    pub guard: ConnectionGuard,
}

pub struct ConnectController {
    options: ConnCtrlOptions,
    reserve_filter: Arc<dyn AddressFilter>,
    local: RwLock<LocalIdentity>,
    state: Mutex<ControllerState>,
    next_connect_id: AtomicU64,
}

impl ConnectController {
    pub fn new(
        key: PeerKeyId,
        info: PeerInfo,
        options: ConnCtrlOptions,
        reserve_filter: Option<Arc<dyn AddressFilter>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            reserve_filter: reserve_filter.unwrap_or_else(|| Arc::new(NoFilter)),
            local: RwLock::new(LocalIdentity {
                key,
                info: Arc::new(info),
            }),
            state: Mutex::new(ControllerState::default()),
            next_connect_id: AtomicU64::new(0),
        })
    }

    pub fn local_info(&self) -> Arc<PeerInfo> {
        self.local.read().info.clone()
    }

    pub fn self_id(&self) -> PeerId {
        self.local.read().key.id
    }

    pub fn key_id(&self) -> PeerKeyId {
        self.local.read().key.clone()
    }

    /// Swap in a fresh random identity. Established links keep their
    /// bookkeeping; only later handshakes advertise the new id.
    pub fn reset_identity(&self) -> PeerId {
        let key = PeerKeyId::random();
        let mut local = self.local.write();
        let old = &local.info;
        let info = PeerInfo::new(
            key.id,
            old.addr.clone(),
            old.port,
            old.http_info_port,
            old.height(),
            old.soft_version.clone(),
        );
        let id = key.id;
        *local = LocalIdentity {
            key,
            info: Arc::new(info),
        };
        id
    }

    pub fn own_address(&self) -> String {
        self.state.lock().own_listen_addr.clone()
    }

    pub fn set_own_address(&self, listen_addr: &str) {
        self.state.lock().own_listen_addr = listen_addr.to_string();
    }

    pub fn is_own_address(&self, addr: &str) -> bool {
        let state = self.state.lock();
        !state.own_listen_addr.is_empty() && state.own_listen_addr == addr
    }

    pub fn inbound_count(&self) -> usize {
        self.state.lock().inbound.len()
    }

    pub fn outbound_count(&self) -> usize {
        self.state.lock().outbound.len()
    }

    /// Attempts that passed the pre-handshake check and are not yet saved.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn has_bound_addr(&self, addr: &str) -> bool {
        let state = self.state.lock();
        state.inbound.contains(addr)
            || state.outbound.contains(addr)
            || state.inbound_listen.contains(addr)
    }

    /// Direction an address is currently counted under, if any.
    pub fn bound_direction(&self, addr: &str) -> Option<Direction> {
        let state = self.state.lock();
        if state.inbound.contains(addr) {
            Some(Direction::Inbound)
        } else if state.outbound.contains(addr) {
            Some(Direction::Outbound)
        } else {
            None
        }
    }

    /// Remote connection address recorded for a connected peer id.
    pub fn peer_addr(&self, id: &PeerId) -> Option<String> {
        self.state.lock().peers.get(id).map(|p| p.addr.clone())
    }

    pub fn peer_info(&self, id: &PeerId) -> Option<Arc<PeerInfo>> {
        self.state.lock().peers.get(id).map(|p| p.info.clone())
    }

    pub fn connect_id(&self, id: &PeerId) -> Option<u64> {
        self.state.lock().peers.get(id).map(|p| p.connect_id)
    }

    pub async fn accept_connect(
        self: &Arc<Self>,
        mut conn: Connection,
    ) -> Result<AdmittedPeer, AdmissionError> {
        let addr = conn.remote_addr.clone();
        let mut slot = self.before_handshake_check(&addr, Direction::Inbound)?;

        let local = self.local_info();
        let info = handshake_server(
            &local,
            &mut conn,
            &self.options.faults,
            self.options.handshake_timeout,
        )
        .await?;

        self.after_handshake_check(&info, &addr)?;

        let info = Arc::new(info);
        let guard = self.save_peer(&mut slot, &info);
        info!("🔗 inbound peer {} connected, {}", addr, info);
        Ok(AdmittedPeer { info, conn, guard })
    }

    /// Dial `addr` and admit the result as an outbound peer. The caller
    /// owns the returned connection and must close it.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<AdmittedPeer, AdmissionError> {
        let mut slot = self.before_handshake_check(addr, Direction::Outbound)?;

        let mut conn = self.options.dialer.dial(addr).await?;

        let local = self.local_info();
        let info = match handshake_client(
            &local,
            &mut conn,
            &self.options.faults,
            self.options.handshake_timeout,
        )
        .await
        {
            Ok(info) => info,
            Err(e) => {
                conn.close().await;
                return Err(e.into());
            }
        };

        let remote = conn.remote_addr.clone();
        if let Err(e) = self.after_handshake_check(&info, &remote) {
            conn.close().await;
            return Err(e);
        }

        let info = Arc::new(info);
        let guard = self.save_peer(&mut slot, &info);
        info!("🔗 outbound peer {} connected, {}", remote, info);
        Ok(AdmittedPeer { info, conn, guard })
    }

    fn before_handshake_check(
        &self,
        addr: &str,
        direction: Direction,
    ) -> Result<PendingSlot<'_>, AdmissionError> {
        if self.reserve_filter.filtered(addr) {
            return Err(AdmissionError::NotReserved {
                addr: addr.to_string(),
                local: self.own_address(),
            });
        }

        let mut state = self.state.lock();
        if state.inbound.contains(addr)
            || state.outbound.contains(addr)
            || state.inbound_listen.contains(addr)
        {
            return Err(AdmissionError::AlreadyConnected(addr.to_string()));
        }
        if state.pending.contains_key(addr) {
            return Err(AdmissionError::AlreadyConnecting(addr.to_string()));
        }

        if state.own_listen_addr == addr {
            return Err(AdmissionError::SelfAddress(addr.to_string()));
        }

        let limit = match direction {
            Direction::Inbound => self.options.max_conn_in_bound,
            Direction::Outbound => self.options.max_conn_out_bound,
        };
        if state.bound_total(direction) >= limit {
            return Err(AdmissionError::BoundFull { direction, limit });
        }

        if direction == Direction::Inbound {
            let ip = parse_ip_addr(addr)
                .ok_or_else(|| AdmissionError::InvalidAddress(addr.to_string()))?;
            let count = state.inbound_from_ip(ip);
            if count >= self.options.max_conn_in_bound_per_ip {
                return Err(AdmissionError::PerIpLimit {
                    ip: ip.to_string(),
                    count,
                    limit: self.options.max_conn_in_bound_per_ip,
                });
            }
        }

        state.pending.insert(addr.to_string(), direction);
        Ok(PendingSlot {
            ctrl: self,
            addr: addr.to_string(),
            direction,
            saved: false,
        })
    }

    fn after_handshake_check(&self, remote: &PeerInfo, remote_addr: &str) -> Result<(), AdmissionError> {
        let ip = parse_ip_addr(remote_addr).ok_or_else(|| {
            warn!("handshake peer has malformed address {}", remote_addr);
            AdmissionError::InvalidAddress(remote_addr.to_string())
        })?;

        if remote.id == self.self_id() {
            let listen_addr = join_host_port(ip, remote.port);
            debug!("handshake with self, own listen address {}", listen_addr);
            self.set_own_address(&listen_addr);
            return Err(AdmissionError::HandshakeWithSelf { listen_addr });
        }

        let state = self.state.lock();
        if let Some(old) = state.peers.get(&remote.id) {
            let old_ip = parse_ip_addr(&old.addr).unwrap_or(&old.addr);
            if old_ip != ip {
                error!(
                    "🚨 same peer id {} from different addr: {}, {}, rejecting latest",
                    remote.id, old_ip, ip
                );
                return Err(AdmissionError::IdentityConflict {
                    id: remote.id,
                    old_ip: old_ip.to_string(),
                    new_ip: ip.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Turn a pending slot into a bound entry and a peer record.
    fn save_peer(self: &Arc<Self>, slot: &mut PendingSlot<'_>, info: &Arc<PeerInfo>) -> ConnectionGuard {
        let listen_addr = info.remote_listen_address();
        let connect_id = self.next_connect_id.fetch_add(1, Ordering::SeqCst) + 1;
        let addr = slot.addr.clone();
        let direction = slot.direction;

        let mut state = self.state.lock();
        state.pending.remove(&addr);
        slot.saved = true;
        state.bound_mut(direction).insert(addr.clone());
        if direction == Direction::Inbound {
            state.inbound_listen.insert(listen_addr.clone());
        }
        state.peers.insert(
            info.id,
            ConnectedPeer {
                connect_id,
                addr: addr.clone(),
                info: info.clone(),
            },
        );

        ConnectionGuard {
            connect_id,
            peer_id: info.id,
            addr,
            listen_addr,
            direction,
            controller: self.clone(),
        }
    }

    fn remove_peer(&self, guard: &ConnectionGuard) {
        let mut state = self.state.lock();
        state.bound_mut(guard.direction).remove(&guard.addr);
        if guard.direction == Direction::Inbound {
            state.inbound_listen.remove(&guard.listen_addr);
        }

        match state.peers.get(&guard.peer_id) {
            None => warn!("connection {} not in controller", guard.peer_id),
            Some(p) if p.connect_id == guard.connect_id => {
                state.peers.remove(&guard.peer_id);
            }
            Some(_) => debug!("connection {} replaced, keep newer record", guard.peer_id),
        }
    }
}

/// Reservation held by an attempt in flight. Dropped unsaved, it frees the
/// slot for the next attempt.
struct PendingSlot<'a> {
    ctrl: &'a ConnectController,
    addr: String,
    direction: Direction,
    saved: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if !self.saved {
            self.ctrl.state.lock().pending.remove(&self.addr);
        }
    }
}

/// Bookkeeping slot of an admitted connection, released on drop.
pub struct ConnectionGuard {
    connect_id: u64,
    peer_id: PeerId,
    addr: String,
    listen_addr: String,
    direction: Direction,
    controller: Arc<ConnectController>,
}

impl ConnectionGuard {
    pub fn connect_id(&self) -> u64 {
        self.connect_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.controller.remove_peer(self);
    }
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("connect_id", &self.connect_id)
            .field("peer_id", &self.peer_id)
            .field("addr", &self.addr)
            .field("direction", &self.direction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandshakeError;
    use crate::network::transport::Listener;
    use crate::network::virtual_net::{VirtualListener, VirtualNetwork};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Node {
        ctrl: Arc<ConnectController>,
        addr: String,
        listener: Arc<VirtualListener>,
    }

    fn node(net: &VirtualNetwork, per_ip: usize, max_out: usize) -> Node {
        let key = PeerKeyId::random();
        let (addr, listener) = net.new_listener(key.id);
        let host = parse_ip_addr(&addr).unwrap().to_string();
        let mut options = ConnCtrlOptions::new(Arc::new(net.new_dialer_with_host(key.id, &host)));
        options.max_conn_in_bound_per_ip = per_ip;
        options.max_conn_out_bound = max_out;
        options.handshake_timeout = TIMEOUT;
        let info = PeerInfo::new(key.id, String::new(), 20338, 0, 0, "test".into());
        Node {
            ctrl: ConnectController::new(key, info, options, None),
            addr,
            listener: Arc::new(listener),
        }
    }

    /// Accept one connection on `node` while a bare client with `id`
    /// handshakes from `host`.
    async fn inbound_from(
        net: &VirtualNetwork,
        node: &Node,
        id: PeerId,
        host: &str,
    ) -> (Result<AdmittedPeer, AdmissionError>, Option<Connection>) {
        let mut client = net
            .new_dialer_with_host(id, host)
            .dial(&node.addr)
            .await
            .unwrap();
        let raw = node.listener.accept().await.unwrap();
        let ctrl = node.ctrl.clone();
        let server = tokio::spawn(async move { ctrl.accept_connect(raw).await });

        let info = PeerInfo::new(id, String::new(), 20338, 0, 0, "client".into());
        let client_result =
            handshake_client(&info, &mut client, &HandshakeFaults::default(), TIMEOUT).await;
        let admitted = server.await.unwrap();
        (admitted, client_result.ok().map(|_| client))
    }

    #[tokio::test]
    async fn test_outbound_admission_and_release() {
        let net = VirtualNetwork::new();
        let a = node(&net, 10, 10);
        let b = node(&net, 10, 10);

        let listener = b.listener.clone();
        let b_ctrl = b.ctrl.clone();
        let server = tokio::spawn(async move {
            let raw = listener.accept().await.unwrap();
            b_ctrl.accept_connect(raw).await
        });

        let admitted = a.ctrl.connect(&b.addr).await.unwrap();
        let inbound = server.await.unwrap().unwrap();

        assert_eq!(admitted.info.id, b.ctrl.self_id());
        assert_eq!(
            a.ctrl.peer_info(&b.ctrl.self_id()).map(|i| i.port),
            Some(20338)
        );
        assert_eq!(a.ctrl.bound_direction(&b.addr), Some(Direction::Outbound));
        assert_eq!(a.ctrl.outbound_count(), 1);
        assert_eq!(a.ctrl.inbound_count(), 0);
        assert_eq!(b.ctrl.inbound_count(), 1);
        assert!(b.ctrl.has_bound_addr(&inbound.info.remote_listen_address()));

        // a second dial of the same address is a duplicate
        assert!(matches!(
            a.ctrl.connect(&b.addr).await,
            Err(AdmissionError::AlreadyConnected(_))
        ));

        drop(admitted);
        assert_eq!(a.ctrl.outbound_count(), 0);
        assert!(a.ctrl.peer_addr(&b.ctrl.self_id()).is_none());
    }

    #[tokio::test]
    async fn test_per_ip_inbound_limit() {
        let net = VirtualNetwork::new();
        let server = node(&net, 2, 10);
        let mut kept = Vec::new();
        for _ in 0..2 {
            let (admitted, _client) =
                inbound_from(&net, &server, PeerId::random(), "10.200.0.1").await;
            kept.push(admitted.unwrap());
        }

        let (third, _client) = inbound_from(&net, &server, PeerId::random(), "10.200.0.1").await;
        assert!(matches!(
            third,
            Err(AdmissionError::PerIpLimit { count: 2, limit: 2, .. })
        ));

        // another source IP is unaffected
        let (other, _client) = inbound_from(&net, &server, PeerId::random(), "10.200.0.2").await;
        assert!(other.is_ok());
        assert_eq!(server.ctrl.inbound_count(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_handshakes_share_per_ip_limit() {
        let net = VirtualNetwork::new();
        let server = node(&net, 1, 10);

        // both attempts are accepted before either client handshakes
        let mut accepts = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..2 {
            let id = PeerId::random();
            let client = net
                .new_dialer_with_host(id, "10.200.0.1")
                .dial(&server.addr)
                .await
                .unwrap();
            let raw = server.listener.accept().await.unwrap();
            let ctrl = server.ctrl.clone();
            accepts.push(tokio::spawn(async move { ctrl.accept_connect(raw).await }));
            clients.push((id, client));
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(server.ctrl.pending_count(), 1);

        for (id, mut client) in clients {
            tokio::spawn(async move {
                let info = PeerInfo::new(id, String::new(), 20338, 0, 0, "client".into());
                let _ = handshake_client(&info, &mut client, &HandshakeFaults::default(), TIMEOUT).await;
                client
            });
        }

        let mut admitted = Vec::new();
        let mut rejected = 0;
        for accept in accepts {
            match accept.await.unwrap() {
                Ok(peer) => admitted.push(peer),
                Err(AdmissionError::PerIpLimit { limit: 1, .. }) => rejected += 1,
                Err(e) => panic!("unexpected admission error: {}", e),
            }
        }
        assert_eq!(admitted.len(), 1);
        assert_eq!(rejected, 1);
        assert_eq!(server.ctrl.inbound_count(), 1);
        assert_eq!(server.ctrl.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_dials_share_outbound_limit() {
        let net = VirtualNetwork::new();
        let a = node(&net, 10, 1);
        let b = node(&net, 10, 10);
        let c = node(&net, 10, 10);

        for target in [&b, &c] {
            let listener = target.listener.clone();
            let ctrl = target.ctrl.clone();
            tokio::spawn(async move {
                if let Ok(raw) = listener.accept().await {
                    let _ = ctrl.accept_connect(raw).await;
                }
            });
        }

        let (to_b, to_c) = tokio::join!(a.ctrl.connect(&b.addr), a.ctrl.connect(&c.addr));
        assert!(to_b.is_ok());
        assert!(matches!(
            to_c,
            Err(AdmissionError::BoundFull { direction: Direction::Outbound, limit: 1 })
        ));
        assert_eq!(a.ctrl.outbound_count(), 1);
        assert_eq!(a.ctrl.pending_count(), 0);

        // releasing the first link frees the slot
        drop(to_b);
        assert!(a.ctrl.connect(&c.addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_self_address_rejected_before_bound_full() {
        let net = VirtualNetwork::new();
        let a = node(&net, 10, 0);
        a.ctrl.set_own_address("10.1.2.3:20338");
        assert!(a.ctrl.is_own_address("10.1.2.3:20338"));

        let err = a.ctrl.connect("10.1.2.3:20338").await.err().unwrap();
        assert!(matches!(err, AdmissionError::SelfAddress(_)));

        let err = a.ctrl.connect("10.1.2.4:20338").await.err().unwrap();
        assert!(matches!(err, AdmissionError::BoundFull { limit: 0, .. }));
    }

    #[tokio::test]
    async fn test_identity_conflict_keeps_first() {
        let net = VirtualNetwork::new();
        let server = node(&net, 10, 10);
        let id = PeerId::random();

        let (first, _c1) = inbound_from(&net, &server, id, "10.100.0.1").await;
        let first = first.unwrap();
        let first_cid = server.ctrl.connect_id(&id).unwrap();

        let (second, _c2) = inbound_from(&net, &server, id, "10.100.0.2").await;
        let err = second.err().unwrap();
        assert!(err.is_identity_conflict());

        assert_eq!(server.ctrl.connect_id(&id), Some(first_cid));
        assert_eq!(server.ctrl.peer_addr(&id), Some(first.guard.addr().to_string()));
        assert_eq!(server.ctrl.inbound_count(), 1);
    }

    #[tokio::test]
    async fn test_replaced_connection_release_is_ignored() {
        let net = VirtualNetwork::new();
        let server = node(&net, 10, 10);
        let id = PeerId::random();

        // same identity arriving twice from one IP on different listen ports
        let (first, _c1) = inbound_from(&net, &server, id, "10.100.0.1").await;
        let first = first.unwrap();
        let first_cid = first.guard.connect_id();

        let mut client = net
            .new_dialer_with_host(id, "10.100.0.1")
            .dial(&server.addr)
            .await
            .unwrap();
        let raw = server.listener.accept().await.unwrap();
        let ctrl = server.ctrl.clone();
        let accept = tokio::spawn(async move { ctrl.accept_connect(raw).await });
        let info = PeerInfo::new(id, String::new(), 30338, 0, 0, "client".into());
        handshake_client(&info, &mut client, &HandshakeFaults::default(), TIMEOUT)
            .await
            .unwrap();
        let second = accept.await.unwrap().unwrap();
        assert_ne!(second.guard.connect_id(), first_cid);

        drop(first);
        assert_eq!(server.ctrl.connect_id(&id), Some(second.guard.connect_id()));
        drop(second);
        assert!(server.ctrl.connect_id(&id).is_none());
        assert_eq!(server.ctrl.inbound_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_with_self_records_own_address() {
        let net = VirtualNetwork::new();
        let a = node(&net, 10, 10);

        let listener = a.listener.clone();
        let ctrl = a.ctrl.clone();
        let server = tokio::spawn(async move {
            let raw = listener.accept().await.unwrap();
            ctrl.accept_connect(raw).await
        });

        let err = a.ctrl.connect(&a.addr).await.err().unwrap();
        assert!(err.is_handshake_with_self());
        assert_eq!(a.ctrl.own_address(), a.addr);
        assert_eq!(a.ctrl.outbound_count(), 0);
        let _ = server.await;

        // now caught before dialing
        assert!(matches!(
            a.ctrl.connect(&a.addr).await,
            Err(AdmissionError::SelfAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_reserved_filter_blocks() {
        use crate::network::address_filter::StaticReserveFilter;

        let net = VirtualNetwork::new();
        let key = PeerKeyId::random();
        let options = ConnCtrlOptions::new(Arc::new(net.new_dialer(key.id)));
        let info = PeerInfo::new(key.id, String::new(), 20338, 0, 0, "test".into());
        let filter: Arc<dyn AddressFilter> =
            Arc::new(StaticReserveFilter::new(vec!["10.5.5.5".into()]));
        let ctrl = ConnectController::new(key, info, options, Some(filter));

        assert!(matches!(
            ctrl.connect("10.6.6.6:20338").await,
            Err(AdmissionError::NotReserved { .. })
        ));
        // allowed through the filter, then fails at dial time
        assert!(matches!(
            ctrl.connect("10.5.5.5:20338").await,
            Err(AdmissionError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_handshake_leaves_no_record() {
        let net = VirtualNetwork::new();
        let server = node(&net, 10, 10);
        let client = net
            .new_dialer_with_host(PeerId::random(), "10.100.0.1")
            .dial(&server.addr)
            .await
            .unwrap();
        let raw = server.listener.accept().await.unwrap();
        client.close().await;

        let result = server.ctrl.accept_connect(raw).await;
        assert!(matches!(
            result,
            Err(AdmissionError::Handshake(HandshakeError::Closed))
        ));
        assert_eq!(server.ctrl.inbound_count(), 0);
    }
}
