//! Peer session: transport, neighbor registry and message dispatch.
//!
//! Task layout per server:
//! - one accept loop, plus one task per inbound connection while it is
//!   admitted (a slow handshake never blocks accepting others)
//! - one rx task per live link, feeding the shared bounded channel
//! - one dispatch loop draining that channel, spawning a handler task per
//!   message
//!
//! The bounded channel is the only backpressure: when it is full, rx tasks
//! stop reading from their links.

use crate::config::Config;
use crate::error::{AdmissionError, AppError, NetError};
use crate::network::address_filter::{AddressFilter, CombinedFilter, StaticReserveFilter};
use crate::network::connect_controller::{AdmittedPeer, ConnCtrlOptions, ConnectController};
use crate::network::handshake::HandshakeFaults;
use crate::network::hosts_resolver::HostsResolver;
use crate::network::message::{split_host_port, Message, PeerAddr, PeerInfo, SOFT_VERSION};
use crate::network::peer::{NbrPeers, Peer};
use crate::network::peer_id::{PeerId, PeerKeyId};
use crate::network::transport::{
    Connection, Dialer, FrameReader, Listener, TcpDialer, TcpTransportListener,
};
use crate::network::wire;
use crate::protocols::{MessageContext, Protocol, SystemMessage, P2P};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the shared inbound message channel.
pub const CHAN_CAPACITY: usize = 10_000;

/// Connection limits and identity settings for one server.
#[derive(Debug, Clone)]
pub struct NetServerOptions {
    pub node_port: u16,
    pub http_info_port: u16,
    pub max_conn_in_bound: usize,
    pub max_conn_out_bound: usize,
    pub max_conn_in_bound_per_ip: usize,
    pub reserved_peers: Vec<String>,
    pub reserved_only: bool,
    pub handshake_timeout: Duration,
    pub initial_height: u64,
    pub faults: HandshakeFaults,
}

impl Default for NetServerOptions {
    fn default() -> Self {
        Self {
            node_port: 20338,
            http_info_port: 20335,
            max_conn_in_bound: 1024,
            max_conn_out_bound: 1024,
            max_conn_in_bound_per_ip: 16,
            reserved_peers: Vec::new(),
            reserved_only: false,
            handshake_timeout: Duration::from_secs(10),
            initial_height: 0,
            faults: HandshakeFaults::default(),
        }
    }
}

impl NetServerOptions {
    pub fn from_config(config: &Config, faults: HandshakeFaults) -> Self {
        let net = &config.network;
        Self {
            node_port: net.node_port,
            http_info_port: net.http_info_port,
            max_conn_in_bound: net.max_conn_in_bound,
            max_conn_out_bound: net.max_conn_out_bound,
            max_conn_in_bound_per_ip: net.max_conn_in_bound_per_ip,
            reserved_peers: net.reserved_peers.clone(),
            reserved_only: net.reserved_only,
            handshake_timeout: Duration::from_secs(net.handshake_timeout_secs),
            initial_height: config.heartbeat.initial_height,
            faults,
        }
    }
}

struct MsgPayload {
    id: PeerId,
    message: Message,
    size: usize,
}

pub struct NetServer {
    me: Weak<NetServer>,
    protocol: Arc<dyn Protocol>,
    ctrl: Arc<ConnectController>,
    listener: Arc<dyn Listener>,
    /// names in the reserved list, looked up while the server runs
    reserved_names: Option<Arc<HostsResolver>>,
    nbrs: NbrPeers,
    msg_tx: mpsc::Sender<MsgPayload>,
    msg_rx: Mutex<Option<mpsc::Receiver<MsgPayload>>>,
    stop: CancellationToken,
    stopped: AtomicBool,
}

impl NetServer {
    pub fn new(
        key: PeerKeyId,
        protocol: Arc<dyn Protocol>,
        listener: Arc<dyn Listener>,
        dialer: Arc<dyn Dialer>,
        options: &NetServerOptions,
    ) -> Result<Arc<Self>, AppError> {
        let listen_addr = listener.local_addr();
        let port = split_host_port(&listen_addr)
            .map(|(_, port)| port)
            .unwrap_or(options.node_port);
        if port == 0 {
            return Err(AppError::InvalidPort(port));
        }

        let info = PeerInfo::new(
            key.id,
            listen_addr,
            port,
            options.http_info_port,
            options.initial_height,
            SOFT_VERSION.to_string(),
        );

        let mut ctrl_options = ConnCtrlOptions::new(dialer);
        ctrl_options.max_conn_in_bound = options.max_conn_in_bound;
        ctrl_options.max_conn_out_bound = options.max_conn_out_bound;
        ctrl_options.max_conn_in_bound_per_ip = options.max_conn_in_bound_per_ip;
        ctrl_options.handshake_timeout = options.handshake_timeout;
        ctrl_options.faults = options.faults.clone();

        let static_enabled = options.reserved_only && !options.reserved_peers.is_empty();
        let mut filter = CombinedFilter::default();
        let mut reserved_names = None;
        if static_enabled {
            let reserve = StaticReserveFilter::new(options.reserved_peers.clone());
            reserved_names = Some(reserve.resolver());
            filter.push(Arc::new(reserve));
        }
        if let Some(f) = protocol.reserved_addr_filter(static_enabled) {
            filter.push(f);
        }
        let filter: Option<Arc<dyn AddressFilter>> = if filter.is_empty() {
            None
        } else {
            Some(Arc::new(filter))
        };

        info!("[p2p] init peer ID to {}", key.id);
        let ctrl = ConnectController::new(key, info, ctrl_options, filter);
        let (msg_tx, msg_rx) = mpsc::channel(CHAN_CAPACITY);

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            protocol,
            ctrl,
            listener,
            reserved_names,
            nbrs: NbrPeers::new(),
            msg_tx,
            msg_rx: Mutex::new(Some(msg_rx)),
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Server on a real TCP socket at `listen_host:node_port`.
    pub async fn bind_tcp(
        key: PeerKeyId,
        protocol: Arc<dyn Protocol>,
        config: &Config,
        faults: HandshakeFaults,
    ) -> Result<Arc<Self>, AppError> {
        let net = &config.network;
        if net.node_port == 0 {
            error!("[p2p] sync port invalid");
            return Err(AppError::InvalidPort(net.node_port));
        }
        let addr = format!("{}:{}", net.listen_host, net.node_port);
        let listener = TcpTransportListener::bind(&addr)
            .await
            .map_err(|source| AppError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let dialer = TcpDialer::new(Duration::from_secs(net.dial_timeout_secs));
        Self::new(
            key,
            protocol,
            Arc::new(listener),
            Arc::new(dialer),
            &NetServerOptions::from_config(config, faults),
        )
    }

    fn net(&self) -> Option<Arc<dyn P2P>> {
        self.me.upgrade().map(|me| me as Arc<dyn P2P>)
    }

    /// Fire `NetworkStart`, then run the accept and dispatch loops.
    pub async fn start(self: &Arc<Self>) {
        let net: Arc<dyn P2P> = self.clone();
        self.protocol
            .handle_system_message(net.clone(), SystemMessage::NetworkStart)
            .await;

        let listen_addr = self.listener.local_addr();
        if is_concrete_addr(&listen_addr) {
            self.ctrl.set_own_address(&listen_addr);
            self.protocol
                .handle_system_message(net, SystemMessage::HostAddrDetected(listen_addr.clone()))
                .await;
        }

        let Some(msg_rx) = self.msg_rx.lock().take() else {
            warn!("[p2p] server on {} already started", listen_addr);
            return;
        };

        if let Some(names) = &self.reserved_names {
            names.start();
        }
        let server = self.clone();
        tokio::spawn(async move { server.accept_loop().await });
        let server = self.clone();
        tokio::spawn(async move { server.dispatch_loop(msg_rx).await });

        info!("[p2p] start listen on {}", listen_addr);
    }

    /// Close every link and the listener, then fire `NetworkStop`. Safe to
    /// call more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for peer in self.nbrs.get_neighbors() {
            peer.close();
        }
        self.listener.close();
        self.stop.cancel();
        if let Some(names) = &self.reserved_names {
            names.stop();
        }

        if let Some(net) = self.net() {
            self.protocol
                .handle_system_message(net, SystemMessage::NetworkStop)
                .await;
        }
        info!("🛑 [p2p] server {} stopped", self.ctrl.self_id());
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            let accepted = tokio::select! {
                _ = self.stop.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok(conn) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        let addr = conn.remote_addr.clone();
                        if let Err(e) = server.handle_client_connection(conn).await {
                            warn!("[p2p] client {} connect error: {}", addr, e);
                        }
                    });
                }
                Err(NetError::Closed) => break,
                Err(e) => {
                    error!("[p2p] error accepting {}", e);
                    break;
                }
            }
        }
        debug!("[p2p] accept loop exited");
    }

    async fn handle_client_connection(self: &Arc<Self>, conn: Connection) -> Result<(), AdmissionError> {
        match self.ctrl.accept_connect(conn).await {
            Ok(admitted) => {
                self.attach_peer(admitted).await;
                Ok(())
            }
            Err(e) => {
                if e.is_handshake_with_self() {
                    self.notify_host_addr().await;
                }
                Err(e)
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut msg_rx: mpsc::Receiver<MsgPayload>) {
        debug!("[p2p] message router started");
        loop {
            let payload = tokio::select! {
                _ = self.stop.cancelled() => break,
                payload = msg_rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };

            let Some(sender) = self.nbrs.get_peer(&payload.id) else {
                trace!(
                    "[p2p] drop {} from unknown peer {}",
                    payload.message.message_type(),
                    payload.id
                );
                continue;
            };
            let ctx = MessageContext {
                sender,
                net: self.clone(),
                msg_size: payload.size,
            };
            let protocol = self.protocol.clone();
            tokio::spawn(async move {
                protocol.handle_peer_message(ctx, payload.message).await;
            });
        }
        debug!("[p2p] message router exited");
    }

    /// Register an admitted connection, start reading from it and announce
    /// it to the protocol.
    async fn attach_peer(self: &Arc<Self>, admitted: AdmittedPeer) -> Arc<Peer> {
        let AdmittedPeer { info, conn, guard } = admitted;
        let Connection {
            remote_addr,
            reader,
            writer,
            ..
        } = conn;

        let peer = Arc::new(Peer::new(info.clone(), remote_addr, writer, Some(guard)));
        self.replace_peer(peer.clone());
        self.spawn_rx(peer.clone(), reader);

        self.protocol
            .handle_system_message(self.clone(), SystemMessage::PeerConnected(info))
            .await;
        peer
    }

    pub fn replace_peer(&self, peer: Arc<Peer>) {
        if let Some(old) = self.nbrs.replace_peer(peer) {
            debug!("[p2p] replace link {} of peer {}", old.addr(), old.id());
            old.close();
        }
    }

    fn spawn_rx(self: &Arc<Self>, peer: Arc<Peer>, mut reader: Box<dyn FrameReader>) {
        let server = self.clone();
        let closed = peer.closed_token();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = reader.read_frame() => frame,
                };
                let frame = match frame {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        debug!("[p2p] peer {} closed the link", peer.addr());
                        break;
                    }
                    Err(e) => {
                        debug!("[p2p] read from {} failed: {}", peer.addr(), e);
                        break;
                    }
                };
                let message = match wire::decode(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("[p2p] undecodable frame from {}: {}", peer.addr(), e);
                        break;
                    }
                };
                peer.update_contact_time(Instant::now());
                let payload = MsgPayload {
                    id: peer.id(),
                    message,
                    size: frame.len(),
                };
                tokio::select! {
                    _ = closed.cancelled() => break,
                    sent = server.msg_tx.send(payload) => if sent.is_err() { break },
                }
            }
            server.on_link_closed(&peer).await;
        });
    }

    async fn on_link_closed(&self, peer: &Arc<Peer>) {
        peer.close();
        peer.shutdown_writer().await;
        let removed = self.nbrs.remove_if_same(peer);
        peer.release_guard();
        if removed {
            info!("[p2p] peer {} ({}) disconnected", peer.id(), peer.addr());
            if let Some(net) = self.net() {
                self.protocol
                    .handle_system_message(net, SystemMessage::PeerDisconnected(peer.info.clone()))
                    .await;
            }
        }
    }

    async fn notify_host_addr(&self) {
        let own = self.ctrl.own_address();
        if let Some(net) = self.net() {
            self.protocol
                .handle_system_message(net, SystemMessage::HostAddrDetected(own))
                .await;
        }
    }

    /// Outbound connect that hands back the new link.
    pub async fn connect_and_return_peer(self: &Arc<Self>, addr: &str) -> Result<Arc<Peer>, AdmissionError> {
        match self.ctrl.connect(addr).await {
            Ok(admitted) => Ok(self.attach_peer(admitted).await),
            Err(e) => {
                if e.is_handshake_with_self() {
                    self.notify_host_addr().await;
                }
                Err(e)
            }
        }
    }

    /// Replace this server's identity with a fresh random one.
    pub fn reset_identity(&self) -> PeerId {
        let id = self.ctrl.reset_identity();
        info!("[p2p] reset peer ID to {}", id);
        id
    }

    pub fn connect_controller(&self) -> &Arc<ConnectController> {
        &self.ctrl
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn listen_addr(&self) -> String {
        self.listener.local_addr()
    }

    pub fn get_max_peer_block_height(&self) -> u64 {
        self.nbrs.neighbor_most_height()
    }

    pub fn out_conn_record_len(&self) -> usize {
        self.ctrl.outbound_count()
    }
}

/// A listen address others could dial: an IP that is not the wildcard.
fn is_concrete_addr(addr: &str) -> bool {
    split_host_port(addr)
        .and_then(|(host, _)| host.parse::<IpAddr>().ok())
        .is_some_and(|ip| !ip.is_unspecified())
}

#[async_trait]
impl P2P for NetServer {
    fn id(&self) -> PeerId {
        self.ctrl.self_id()
    }

    fn host_info(&self) -> Arc<PeerInfo> {
        self.ctrl.local_info()
    }

    fn height(&self) -> u64 {
        self.ctrl.local_info().height()
    }

    fn set_height(&self, height: u64) {
        self.ctrl.local_info().set_height(height);
    }

    fn get_peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.nbrs.get_peer(id)
    }

    fn get_neighbors(&self) -> Vec<Arc<Peer>> {
        self.nbrs.get_neighbors()
    }

    fn get_neighbor_addrs(&self) -> Vec<PeerAddr> {
        self.nbrs.get_neighbor_addrs()
    }

    fn connection_count(&self) -> usize {
        self.nbrs.nbr_count()
    }

    fn own_address(&self) -> String {
        self.ctrl.own_address()
    }

    fn is_own_address(&self, addr: &str) -> bool {
        self.ctrl.is_own_address(addr)
    }

    async fn connect(&self, addr: &str) -> Result<(), AdmissionError> {
        let me = self
            .me
            .upgrade()
            .ok_or(AdmissionError::Transport(NetError::Closed))?;
        me.connect_and_return_peer(addr).await.map(|_| ())
    }

    async fn send_to(&self, id: &PeerId, message: &Message) -> Result<(), NetError> {
        match self.nbrs.get_peer(id) {
            Some(peer) => peer.send(message).await,
            None => {
                warn!("[p2p] send {} to unknown peer {}", message.message_type(), id);
                Err(NetError::PeerNotFound(*id))
            }
        }
    }

    async fn broadcast(&self, message: &Message) {
        self.nbrs.broadcast(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::virtual_net::VirtualNetwork;
    use tokio::sync::mpsc::UnboundedSender;

    /// Forwards every event and message to a channel.
    struct Probe {
        events: UnboundedSender<String>,
    }

    #[async_trait]
    impl Protocol for Probe {
        async fn handle_system_message(&self, _net: Arc<dyn P2P>, msg: SystemMessage) {
            let name = match msg {
                SystemMessage::NetworkStart => "start".to_string(),
                SystemMessage::PeerConnected(info) => format!("connected {}", info.id),
                SystemMessage::PeerDisconnected(info) => format!("disconnected {}", info.id),
                SystemMessage::NetworkStop => "stop".to_string(),
                SystemMessage::HostAddrDetected(addr) => format!("host {}", addr),
            };
            let _ = self.events.send(name);
        }

        async fn handle_peer_message(&self, ctx: MessageContext, msg: Message) {
            let _ = self
                .events
                .send(format!("msg {} from {}", msg.message_type(), ctx.sender.id()));
        }
    }

    fn server(net: &VirtualNetwork) -> (Arc<NetServer>, mpsc::UnboundedReceiver<String>) {
        let key = PeerKeyId::random();
        let (addr, listener) = net.new_listener(key.id);
        let host = crate::network::message::parse_ip_addr(&addr).unwrap().to_string();
        let dialer = net.new_dialer_with_host(key.id, &host);
        let (tx, rx) = mpsc::unbounded_channel();
        let server = NetServer::new(
            key,
            Arc::new(Probe { events: tx }),
            Arc::new(listener),
            Arc::new(dialer),
            &NetServerOptions::default(),
        )
        .unwrap();
        (server, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>, prefix: &str) -> String {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if event.starts_with(prefix) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_send_and_disconnect() {
        let net = VirtualNetwork::new();
        let (a, mut a_events) = server(&net);
        let (b, mut b_events) = server(&net);
        a.start().await;
        b.start().await;
        assert_eq!(next_event(&mut a_events, "host").await, format!("host {}", a.listen_addr()));

        a.connect(&b.listen_addr()).await.unwrap();
        assert_eq!(next_event(&mut a_events, "connected").await, format!("connected {}", b.id()));
        assert_eq!(next_event(&mut b_events, "connected").await, format!("connected {}", a.id()));
        assert_eq!(a.connection_count(), 1);

        a.send_to(&b.id(), &Message::Ping { height: 1 }).await.unwrap();
        assert_eq!(
            next_event(&mut b_events, "msg").await,
            format!("msg ping from {}", a.id())
        );

        // closing the link on one side tears it down on both
        a.get_peer(&b.id()).unwrap().close();
        assert_eq!(
            next_event(&mut a_events, "disconnected").await,
            format!("disconnected {}", b.id())
        );
        assert_eq!(
            next_event(&mut b_events, "disconnected").await,
            format!("disconnected {}", a.id())
        );
        assert_eq!(a.connect_controller().outbound_count(), 0);
        assert_eq!(b.connect_controller().inbound_count(), 0);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_stop_twice_is_harmless() {
        let net = VirtualNetwork::new();
        let (a, mut events) = server(&net);
        a.start().await;
        a.stop().await;
        a.stop().await;
        assert!(a.is_closed());

        assert_eq!(next_event(&mut events, "stop").await, "stop");
        // only one stop event
        assert!(
            tokio::time::timeout(Duration::from_millis(100), next_event(&mut events, "stop"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_self_dial_detects_host_addr() {
        let net = VirtualNetwork::new();
        let (a, _events) = server(&net);
        // not started, so the own address is still unknown
        a.connect_controller().set_own_address("");
        let listener_addr = a.listen_addr();
        let server = a.clone();
        let accept = tokio::spawn(async move {
            let conn = server.listener.accept().await.unwrap();
            server.handle_client_connection(conn).await
        });

        let err = a.connect(&listener_addr).await.err().unwrap();
        assert!(err.is_handshake_with_self());
        assert!(a.is_own_address(&listener_addr));
        assert!(accept.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_reset_identity() {
        let net = VirtualNetwork::new();
        let (a, _events) = server(&net);
        let before = a.id();
        let after = a.reset_identity();
        assert_ne!(before, after);
        assert_eq!(a.id(), after);
        assert_eq!(a.host_info().id, after);
    }

    #[test]
    fn test_concrete_addr() {
        assert!(is_concrete_addr("10.0.0.1:20338"));
        assert!(!is_concrete_addr("0.0.0.0:20338"));
        assert!(!is_concrete_addr("[::]:20338"));
        assert!(!is_concrete_addr("localhost:20338"));
    }
}
