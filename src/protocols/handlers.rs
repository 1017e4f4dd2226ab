//! Composite protocols: which sub-services run and which messages reach
//! them.

use crate::config::Config;
use crate::error::AppError;
use crate::network::address_filter::AddressFilter;
use crate::network::hosts_resolver::HostsResolver;
use crate::network::message::Message;
use crate::network::signed_message::Account;
use crate::protocols::bootstrap::BootstrapService;
use crate::protocols::discovery::Discovery;
use crate::protocols::gov::GovNodeResolver;
use crate::protocols::heartbeat::{Heartbeat, HeartbeatParams};
use crate::protocols::reconnect::{ReconnectService, DEFAULT_MAX_RETRIES};
use crate::protocols::subnet::{Subnet, SubnetMemberInfo, SubnetParams};
use crate::protocols::{MessageContext, Protocol, SystemMessage, P2P};
use crate::txpool::{TxPool, DEFAULT_CHANNEL_SIZE, MAX_POOL_SIZE};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Seed list and timing shared by the discovery, bootstrap and reconnect
/// services.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub seeds: Vec<String>,
    pub mask_peers: Vec<String>,
    pub discovery_interval: Duration,
    pub bootstrap_interval: Duration,
    pub reconnect_interval: Duration,
    pub reconnect_max_retries: u32,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            mask_peers: Vec::new(),
            discovery_interval: Duration::from_secs(10),
            bootstrap_interval: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(5),
            reconnect_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> Self {
        let net = &config.network;
        Self {
            seeds: net.seeds.clone(),
            mask_peers: net.mask_peers.clone(),
            discovery_interval: Duration::from_secs(net.discovery_interval_secs),
            bootstrap_interval: Duration::from_secs(net.bootstrap_interval_secs),
            reconnect_interval: Duration::from_secs(net.reconnect_interval_secs),
            reconnect_max_retries: net.reconnect_max_retries,
        }
    }

    fn seed_resolver(&self) -> Result<Arc<HostsResolver>, AppError> {
        let (seeds, invalid) = HostsResolver::new(&self.seeds);
        if !invalid.is_empty() {
            return Err(AppError::Config(format!("invalid seed list: {:?}", invalid)));
        }
        Ok(Arc::new(seeds))
    }
}

fn log_unhandled(ctx: &MessageContext, msg: &Message) {
    match msg {
        Message::NotFound { hash } => {
            debug!("[p2p] receive notFound message, hash is {}", hex::encode(hash));
        }
        Message::Version(_) | Message::VerAck => {
            info!(
                "receive message: {} from peer {}",
                msg.message_type(),
                ctx.sender().addr()
            );
        }
        _ => warn!("unknown message handler for the msg: {}", msg.message_type()),
    }
}

/// Heartbeat only: liveness without discovery or relay.
pub struct OnlyHeartbeatHandler {
    params: HeartbeatParams,
    heartbeat: Mutex<Option<Arc<Heartbeat>>>,
}

impl OnlyHeartbeatHandler {
    pub fn new(params: HeartbeatParams) -> Self {
        Self {
            params,
            heartbeat: Mutex::new(None),
        }
    }

    fn heartbeat(&self) -> Option<Arc<Heartbeat>> {
        self.heartbeat.lock().clone()
    }
}

#[async_trait]
impl Protocol for OnlyHeartbeatHandler {
    async fn handle_system_message(&self, net: Arc<dyn P2P>, msg: SystemMessage) {
        match msg {
            SystemMessage::NetworkStart => {
                let heartbeat = Heartbeat::new(&net, self.params.clone());
                heartbeat.start();
                *self.heartbeat.lock() = Some(heartbeat);
            }
            SystemMessage::PeerConnected(info) => {
                debug!("peer connected, address: {}, id {}", info.addr, info.id.to_u64());
            }
            SystemMessage::PeerDisconnected(info) => {
                debug!("peer disconnected, address: {}, id {}", info.addr, info.id.to_u64());
            }
            SystemMessage::NetworkStop => {
                if let Some(heartbeat) = self.heartbeat.lock().take() {
                    heartbeat.stop();
                }
            }
            SystemMessage::HostAddrDetected(_) => {}
        }
    }

    async fn handle_peer_message(&self, ctx: MessageContext, msg: Message) {
        trace!(
            "[p2p] receive message {} from {}",
            msg.message_type(),
            ctx.sender().addr()
        );
        let Some(heartbeat) = self.heartbeat() else {
            return;
        };
        match msg {
            Message::Ping { height } => heartbeat.ping_handle(&ctx, height).await,
            Message::Pong { height } => heartbeat.pong_handle(&ctx, height),
            other => log_unhandled(&ctx, &other),
        }
    }
}

struct FullServices {
    reconnect: Arc<ReconnectService>,
    discovery: Arc<Discovery>,
    heartbeat: Arc<Heartbeat>,
    bootstrap: Arc<BootstrapService>,
}

/// Everything a relaying node does except block sync: reconnect,
/// discovery, heartbeat, bootstrap and transaction relay.
pub struct WithoutBlockSyncHandler {
    options: ServiceOptions,
    seeds: Arc<HostsResolver>,
    heartbeat_params: HeartbeatParams,
    txpool: Arc<TxPool>,
    services: Mutex<Option<Arc<FullServices>>>,
}

impl WithoutBlockSyncHandler {
    pub fn new(options: ServiceOptions, heartbeat_params: HeartbeatParams) -> Result<Self, AppError> {
        let seeds = options.seed_resolver()?;
        Ok(Self {
            options,
            seeds,
            heartbeat_params,
            txpool: TxPool::new(DEFAULT_CHANNEL_SIZE, MAX_POOL_SIZE),
            services: Mutex::new(None),
        })
    }

    pub fn txpool(&self) -> &Arc<TxPool> {
        &self.txpool
    }

    pub fn reconnect_service(&self) -> Option<Arc<ReconnectService>> {
        self.services.lock().as_ref().map(|s| s.reconnect.clone())
    }

    fn services(&self) -> Option<Arc<FullServices>> {
        self.services.lock().clone()
    }

    fn start(&self, net: &Arc<dyn P2P>) {
        let services = FullServices {
            reconnect: ReconnectService::new(
                self.options.reconnect_max_retries,
                self.options.reconnect_interval,
            ),
            discovery: Discovery::new(
                self.options.mask_peers.clone(),
                None,
                self.options.discovery_interval,
            ),
            heartbeat: Heartbeat::new(net, self.heartbeat_params.clone()),
            bootstrap: BootstrapService::new(self.seeds.clone(), self.options.bootstrap_interval),
        };
        services.reconnect.start(net);
        services.discovery.start(net);
        services.heartbeat.start();
        services.bootstrap.start(net);
        self.seeds.start();
        self.txpool.start(net);
        *self.services.lock() = Some(Arc::new(services));
    }

    fn stop(&self) {
        if let Some(services) = self.services.lock().take() {
            services.reconnect.stop();
            services.discovery.stop();
            services.heartbeat.stop();
            services.bootstrap.stop();
        }
        self.seeds.stop();
        self.txpool.stop();
    }
}

#[async_trait]
impl Protocol for WithoutBlockSyncHandler {
    async fn handle_system_message(&self, net: Arc<dyn P2P>, msg: SystemMessage) {
        match msg {
            SystemMessage::NetworkStart => self.start(&net),
            SystemMessage::PeerConnected(info) => {
                if let Some(services) = self.services() {
                    services.reconnect.on_add_peer(&info);
                }
            }
            SystemMessage::PeerDisconnected(info) => {
                if let Some(services) = self.services() {
                    services.reconnect.on_del_peer(&info);
                }
            }
            SystemMessage::NetworkStop => self.stop(),
            SystemMessage::HostAddrDetected(_) => {}
        }
    }

    async fn handle_peer_message(&self, ctx: MessageContext, msg: Message) {
        let Some(services) = self.services() else {
            return;
        };
        match msg {
            Message::AddrReq => services.discovery.addr_req_handle(&ctx).await,
            Message::FindNodeResp { closer_peers, .. } => {
                services.discovery.find_node_response_handle(&ctx, &closer_peers)
            }
            Message::FindNodeReq { target } => {
                services.discovery.find_node_handle(&ctx, &target).await
            }
            Message::Addr(addrs) => services.discovery.addr_handle(&ctx, &addrs),
            Message::Ping { height } => services.heartbeat.ping_handle(&ctx, height).await,
            Message::Pong { height } => services.heartbeat.pong_handle(&ctx, height),
            Message::Trn(tx) => {
                trace!(
                    "[p2p-without block sync] receive tx from {}, pid {}",
                    ctx.sender().addr(),
                    ctx.sender().id()
                );
                if let Err(e) = self.txpool.submit(tx) {
                    debug!("[p2p] drop tx from {}: {}", ctx.sender().addr(), e);
                }
            }
            Message::HeadersReq { len, .. } => {
                debug!("[p2p] ignore headers request ({}) from {}", len, ctx.sender().addr());
            }
            Message::Consensus { payload } => {
                trace!("[p2p] consensus payload of {} bytes", payload.len());
            }
            Message::DataReq { data_type, hash } => {
                debug!("[p2p] ignore data request {} {}", data_type, hex::encode(hash));
            }
            Message::Inv { inv_type, hashes } => {
                trace!("[p2p] inv type {} with {} hashes", inv_type, hashes.len());
            }
            other => log_unhandled(&ctx, &other),
        }
    }
}

struct SubnetServices {
    discovery: Arc<Discovery>,
    bootstrap: Arc<BootstrapService>,
}

/// Discovery, bootstrap and governance membership gossip.
pub struct SubnetHandler {
    options: ServiceOptions,
    seeds: Arc<HostsResolver>,
    subnet: Arc<Subnet>,
    services: Mutex<Option<Arc<SubnetServices>>>,
}

impl SubnetHandler {
    pub fn new(
        acct: Option<Account>,
        options: ServiceOptions,
        gov: Arc<dyn GovNodeResolver>,
        params: SubnetParams,
    ) -> Result<Self, AppError> {
        let seeds = options.seed_resolver()?;
        let subnet = Subnet::new(acct, seeds.clone(), gov, params);
        Ok(Self {
            options,
            seeds,
            subnet,
            services: Mutex::new(None),
        })
    }

    pub fn subnet(&self) -> &Arc<Subnet> {
        &self.subnet
    }

    pub fn members_info(&self) -> Vec<SubnetMemberInfo> {
        self.subnet.members_info()
    }

    pub fn mask_addr_filter(&self) -> Arc<dyn AddressFilter> {
        self.subnet.mask_addr_filter()
    }

    fn services(&self) -> Option<Arc<SubnetServices>> {
        self.services.lock().clone()
    }

    fn start(&self, net: &Arc<dyn P2P>) {
        let services = SubnetServices {
            discovery: Discovery::new(
                self.options.mask_peers.clone(),
                Some(self.subnet.mask_addr_filter()),
                self.options.discovery_interval,
            ),
            bootstrap: BootstrapService::new(self.seeds.clone(), self.options.bootstrap_interval),
        };
        services.discovery.start(net);
        services.bootstrap.start(net);
        self.seeds.start();
        self.subnet.start(net);
        *self.services.lock() = Some(Arc::new(services));
    }

    fn stop(&self) {
        if let Some(services) = self.services.lock().take() {
            services.discovery.stop();
            services.bootstrap.stop();
        }
        self.seeds.stop();
        self.subnet.stop();
    }
}

#[async_trait]
impl Protocol for SubnetHandler {
    async fn handle_system_message(&self, net: Arc<dyn P2P>, msg: SystemMessage) {
        match msg {
            SystemMessage::NetworkStart => self.start(&net),
            SystemMessage::PeerConnected(info) => self.subnet.on_add_peer(&net, &info).await,
            SystemMessage::PeerDisconnected(info) => self.subnet.on_del_peer(&info),
            SystemMessage::NetworkStop => self.stop(),
            SystemMessage::HostAddrDetected(addr) => self.subnet.on_host_addr_detected(&addr),
        }
    }

    async fn handle_peer_message(&self, ctx: MessageContext, msg: Message) {
        trace!(
            "[p2p] receive message {} from {} {}",
            msg.message_type(),
            ctx.sender().addr(),
            ctx.sender().id()
        );
        match msg {
            Message::SubnetMembersRequest(request) => {
                self.subnet.on_members_request(&ctx, &request).await
            }
            Message::SubnetMembers(members) => self.subnet.on_members_response(&ctx, &members),
            other => {
                let Some(services) = self.services() else {
                    return;
                };
                match other {
                    Message::AddrReq => services.discovery.addr_req_handle(&ctx).await,
                    Message::FindNodeResp { closer_peers, .. } => {
                        services.discovery.find_node_response_handle(&ctx, &closer_peers)
                    }
                    Message::FindNodeReq { target } => {
                        services.discovery.find_node_handle(&ctx, &target).await
                    }
                    Message::Addr(addrs) => services.discovery.addr_handle(&ctx, &addrs),
                    other => log_unhandled(&ctx, &other),
                }
            }
        }
    }

    fn reserved_addr_filter(&self, static_filter_enabled: bool) -> Option<Arc<dyn AddressFilter>> {
        Some(self.subnet.reserved_addr_filter(static_filter_enabled))
    }
}

/// Forwards every FindNodeResp to a probe channel.
pub struct NeighborHandler {
    resp_tx: mpsc::Sender<Message>,
}

impl NeighborHandler {
    pub fn new(resp_tx: mpsc::Sender<Message>) -> Self {
        Self { resp_tx }
    }
}

#[async_trait]
impl Protocol for NeighborHandler {
    async fn handle_system_message(&self, _net: Arc<dyn P2P>, msg: SystemMessage) {
        match msg {
            SystemMessage::PeerConnected(info) => {
                debug!("peer connected, address: {}, id {}", info.addr, info.id.to_u64());
            }
            SystemMessage::PeerDisconnected(info) => {
                debug!("peer disconnected, address: {}, id {}", info.addr, info.id.to_u64());
            }
            _ => {}
        }
    }

    async fn handle_peer_message(&self, ctx: MessageContext, msg: Message) {
        trace!(
            "[p2p] receive message, remote address {}, id {}, type {}",
            ctx.sender().addr(),
            ctx.sender().id().to_u64(),
            msg.message_type()
        );
        match msg {
            resp @ Message::FindNodeResp { .. } => {
                if self.resp_tx.send(resp).await.is_err() {
                    debug!("[p2p] neighbor probe channel closed");
                }
            }
            other => log_unhandled(&ctx, &other),
        }
    }
}
