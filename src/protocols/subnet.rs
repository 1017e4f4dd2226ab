//! Governance-node membership gossip.
//!
//! Seed nodes and authorized governance nodes periodically ask connected
//! members for the member list and dial any member they are not connected
//! to yet. Contact with a member only counts while the oracle still
//! recognizes its key, so members that have not been heard from for
//! `max_inactive`, or were demoted that long ago, are forgotten. The member list also drives two address filters: governance
//! nodes only accept seeds and members, and discovery never hands member
//! addresses to ordinary peers.

use crate::config::SubnetConfig;
use crate::network::address_filter::AddressFilter;
use crate::network::hosts_resolver::HostsResolver;
use crate::network::message::{parse_ip_addr, MemberInfo, Message, PeerInfo};
use crate::network::peer_id::PeerId;
use crate::network::signed_message::{pubkey_from_id, pubkey_id, Account, MembersRequest};
use crate::protocols::gov::GovNodeResolver;
use crate::protocols::parker::Parker;
use crate::protocols::{MessageContext, P2P};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MAX_MEMBER_REQUESTS: usize = 3;
pub const MAX_INACTIVE_TIME: Duration = Duration::from_secs(10 * 60);
pub const REFRESH_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SubnetParams {
    pub refresh: Duration,
    pub max_inactive: Duration,
    pub max_member_requests: usize,
}

impl Default for SubnetParams {
    fn default() -> Self {
        Self {
            refresh: REFRESH_DURATION,
            max_inactive: MAX_INACTIVE_TIME,
            max_member_requests: MAX_MEMBER_REQUESTS,
        }
    }
}

impl From<&SubnetConfig> for SubnetParams {
    fn from(config: &SubnetConfig) -> Self {
        Self {
            refresh: Duration::from_secs(config.refresh_secs),
            max_inactive: Duration::from_secs(config.max_inactive_secs),
            max_member_requests: config.max_member_requests,
        }
    }
}

#[derive(Debug, Clone)]
struct MemberStatus {
    pubkey: String,
    alive: Instant,
}

/// One entry of a node's membership view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetMemberInfo {
    pub pubkey: String,
    pub listen_addr: String,
    pub connected: bool,
}

#[derive(Default)]
struct SubnetState {
    self_addr: String,
    /// listen address -> member
    members: HashMap<String, MemberStatus>,
    /// listen address -> live seed or member session
    connected: HashMap<String, Arc<PeerInfo>>,
}

pub struct Subnet {
    acct: Option<Account>,
    seeds: Arc<HostsResolver>,
    gov: Arc<dyn GovNodeResolver>,
    params: SubnetParams,
    parker: Parker,
    seed_node: AtomicBool,
    state: RwLock<SubnetState>,
    stop: CancellationToken,
}

impl Subnet {
    pub fn new(
        acct: Option<Account>,
        seeds: Arc<HostsResolver>,
        gov: Arc<dyn GovNodeResolver>,
        params: SubnetParams,
    ) -> Arc<Self> {
        Arc::new(Self {
            acct,
            seeds,
            gov,
            params,
            parker: Parker::new(),
            seed_node: AtomicBool::new(false),
            state: RwLock::new(SubnetState::default()),
            stop: CancellationToken::new(),
        })
    }

    pub fn start(self: &Arc<Self>, net: &Arc<dyn P2P>) {
        let subnet = self.clone();
        let net = Arc::downgrade(net);
        tokio::spawn(async move { subnet.maintain_loop(net).await });
    }

    pub fn stop(&self) {
        self.stop.cancel();
        self.parker.unpark();
    }

    pub async fn on_add_peer(&self, net: &Arc<dyn P2P>, info: &Arc<PeerInfo>) {
        let listen_addr = info.remote_listen_address();
        let is_seed = self.is_seed_addr(&listen_addr);
        let tracked = {
            let mut state = self.state.write();
            let is_member = self.touch(&mut state, &listen_addr);
            if is_seed || is_member {
                state.connected.insert(listen_addr.clone(), info.clone());
            }
            is_seed || is_member
        };
        if tracked {
            self.send_members_request(net, &info.id).await;
        }
    }

    pub fn on_del_peer(&self, info: &PeerInfo) {
        let listen_addr = info.remote_listen_address();
        let is_seed = self.is_seed_addr(&listen_addr);
        let mut state = self.state.write();
        let is_member = self.touch(&mut state, &listen_addr);
        if is_seed || is_member {
            state.connected.remove(&listen_addr);
        }
    }

    /// Record contact with `listen_addr` if it is a member. Returns whether
    /// it is one; a member the oracle no longer recognizes keeps its old
    /// timestamp.
    fn touch(&self, state: &mut SubnetState, listen_addr: &str) -> bool {
        match state.members.get_mut(listen_addr) {
            Some(member) => {
                if self.is_gov_pubkey(&member.pubkey) {
                    member.alive = Instant::now();
                }
                true
            }
            None => false,
        }
    }

    fn is_gov_pubkey(&self, pubkey: &str) -> bool {
        pubkey_from_id(pubkey).is_some_and(|key| self.gov.is_gov_node(&key))
    }

    pub fn on_host_addr_detected(&self, listen_addr: &str) {
        let seed = self.is_seed_addr(listen_addr);
        self.state.write().self_addr = listen_addr.to_string();
        self.seed_node.store(seed, Ordering::SeqCst);
        if seed {
            info!("[subnet] this node is seed {}", listen_addr);
        }
    }

    pub fn is_seed_node(&self) -> bool {
        self.seed_node.load(Ordering::SeqCst)
    }

    /// This node holds an account the oracle currently recognizes.
    pub fn is_gov(&self) -> bool {
        self.acct
            .as_ref()
            .is_some_and(|acct| self.gov.is_gov_node(&acct.public_key()))
    }

    pub fn ip_in_members(&self, ip: &str) -> bool {
        self.state
            .read()
            .members
            .keys()
            .any(|addr| parse_ip_addr(addr) == Some(ip))
    }

    pub fn is_seed_ip(&self, ip: &str) -> bool {
        self.seeds.contains_ip(ip)
    }

    pub fn is_seed_addr(&self, addr: &str) -> bool {
        self.seeds.contains(addr)
    }

    fn check_authority(&self, listen_addr: &str, request: &MembersRequest) -> bool {
        if request.is_from_seed() {
            return self.is_seed_addr(listen_addr);
        }
        match request.pubkey() {
            Some(key) => request.verify().is_ok() && self.gov.is_gov_node(key),
            None => false,
        }
    }

    pub async fn on_members_request(&self, ctx: &MessageContext, request: &MembersRequest) {
        let sender = ctx.sender();
        let peer_addr = sender.listen_addr();
        if !self.check_authority(&peer_addr, request) {
            info!(
                "[subnet] check authority for members request failed, peer: {}",
                peer_addr
            );
            return;
        }

        let members = {
            let mut state = self.state.write();
            let members: Vec<MemberInfo> = state
                .members
                .iter()
                .map(|(addr, status)| MemberInfo {
                    pubkey: status.pubkey.clone(),
                    addr: addr.clone(),
                })
                .collect();

            if let Some(key) = request.pubkey() {
                if self.touch(&mut state, &peer_addr) {
                    debug!("[subnet] member {} is alive", peer_addr);
                } else {
                    info!("[subnet] new member {} from request", peer_addr);
                    state.members.insert(
                        peer_addr.clone(),
                        MemberStatus {
                            pubkey: pubkey_id(key),
                            alive: Instant::now(),
                        },
                    );
                }
            }
            members
        };

        debug!(
            "[subnet] send {} members to peer {}",
            members.len(),
            sender.id()
        );
        if let Err(e) = ctx
            .network()
            .send_to(&sender.id(), &Message::SubnetMembers(members))
            .await
        {
            warn!("[subnet] failed to send members to {}: {}", peer_addr, e);
        }
    }

    pub fn on_members_response(&self, ctx: &MessageContext, members: &[MemberInfo]) {
        let listen = ctx.sender().listen_addr();
        let learned = {
            let mut state = self.state.write();
            if !state.connected.contains_key(&listen) {
                info!("[subnet] receive members response from unknown node: {}", listen);
                return;
            }
            debug!("[subnet] receive {} members from {}", members.len(), listen);
            self.touch(&mut state, &listen);

            let mut learned = 0;
            for member in members {
                if member.addr == state.self_addr || state.members.contains_key(&member.addr) {
                    continue;
                }
                if !self.is_gov_pubkey(&member.pubkey) {
                    debug!("[subnet] skip member {} unknown to the oracle", member.addr);
                    continue;
                }
                state.members.insert(
                    member.addr.clone(),
                    MemberStatus {
                        pubkey: member.pubkey.clone(),
                        alive: Instant::now(),
                    },
                );
                learned += 1;
            }
            learned
        };
        // a known list would only restart the same round
        if learned > 0 {
            self.parker.unpark();
        }
    }

    fn unconnected_members(&self) -> Vec<String> {
        let state = self.state.read();
        state
            .members
            .keys()
            .filter(|addr| !state.connected.contains_key(*addr))
            .cloned()
            .collect()
    }

    fn new_members_request(&self) -> Option<MembersRequest> {
        if self.is_seed_node() {
            return Some(MembersRequest::from_seed());
        }
        match &self.acct {
            Some(acct) if self.gov.is_gov_node(&acct.public_key()) => {
                Some(MembersRequest::from_account(acct))
            }
            _ => None,
        }
    }

    async fn send_members_request(&self, net: &Arc<dyn P2P>, peer: &PeerId) {
        let Some(request) = self.new_members_request() else {
            return;
        };
        if let Err(e) = net
            .send_to(peer, &Message::SubnetMembersRequest(request))
            .await
        {
            debug!("[subnet] members request to {} failed: {}", peer, e);
        }
    }

    async fn send_members_request_to_rand_nodes(&self, net: &Arc<dyn P2P>) {
        let Some(request) = self.new_members_request() else {
            return;
        };
        let peers: Vec<PeerId> = {
            let state = self.state.read();
            let mut ids: Vec<PeerId> = state.connected.values().map(|info| info.id).collect();
            ids.shuffle(&mut rand::thread_rng());
            ids.truncate(self.params.max_member_requests);
            ids
        };
        let message = Message::SubnetMembersRequest(request);
        for id in peers {
            if let Err(e) = net.send_to(&id, &message).await {
                debug!("[subnet] members request to {} failed: {}", id, e);
            }
        }
    }

    /// Forget members whose last contact is older than `max_inactive`.
    pub fn clean_stale_members(&self, now: Instant) -> usize {
        let max_inactive = self.params.max_inactive;
        let mut state = self.state.write();
        let stale: Vec<String> = state
            .members
            .iter()
            .filter(|(_, member)| now.saturating_duration_since(member.alive) > max_inactive)
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in &stale {
            info!("[subnet] remove stale member {}", addr);
            state.members.remove(addr);
            if !self.is_seed_addr(addr) {
                state.connected.remove(addr);
            }
        }
        stale.len()
    }

    /// Mark members that are neighbors as connected and alive.
    fn reconcile(&self, net: &Arc<dyn P2P>) {
        let neighbors = net.get_neighbors();
        let mut state = self.state.write();
        for peer in neighbors {
            let listen = peer.listen_addr();
            if self.touch(&mut state, &listen) {
                state.connected.entry(listen).or_insert_with(|| peer.info.clone());
            }
        }
    }

    async fn maintain_loop(self: Arc<Self>, net: Weak<dyn P2P>) {
        loop {
            {
                let Some(net) = net.upgrade() else { break };
                self.reconcile(&net);

                for addr in self.unconnected_members() {
                    info!("[subnet] try connect gov node: {}", addr);
                    let net = net.clone();
                    tokio::spawn(async move {
                        if let Err(e) = net.connect(&addr).await {
                            debug!("[subnet] connect gov node {} failed: {}", addr, e);
                        }
                    });
                }

                self.clean_stale_members(Instant::now());
                self.send_members_request_to_rand_nodes(&net).await;

                if self.is_seed_node() || self.is_gov() {
                    match serde_json::to_string(&self.members_info()) {
                        Ok(members) => info!("[subnet] current members: {}", members),
                        Err(e) => warn!("[subnet] failed to encode members: {}", e),
                    }
                }
            }

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.parker.park_timeout(self.params.refresh) => {}
            }
        }
        debug!("[subnet] maintain loop exited");
    }

    pub fn members_info(&self) -> Vec<SubnetMemberInfo> {
        let state = self.state.read();
        let mut members: Vec<SubnetMemberInfo> = state
            .members
            .iter()
            .map(|(addr, member)| SubnetMemberInfo {
                pubkey: member.pubkey.clone(),
                listen_addr: addr.clone(),
                connected: state.connected.contains_key(addr) || state.self_addr == *addr,
            })
            .collect();
        members.sort_by(|a, b| a.listen_addr.cmp(&b.listen_addr));
        members
    }

    pub fn reserved_addr_filter(self: &Arc<Self>, static_enabled: bool) -> Arc<dyn AddressFilter> {
        Arc::new(SubnetReservedFilter {
            subnet: self.clone(),
            static_enabled,
        })
    }

    pub fn mask_addr_filter(self: &Arc<Self>) -> Arc<dyn AddressFilter> {
        Arc::new(SubnetMaskFilter {
            subnet: self.clone(),
        })
    }
}

/// Admission filter of a governance node: only seeds and known members get
/// through. Seed nodes accept everyone.
pub struct SubnetReservedFilter {
    subnet: Arc<Subnet>,
    static_enabled: bool,
}

impl AddressFilter for SubnetReservedFilter {
    fn filtered(&self, addr: &str) -> bool {
        if self.subnet.is_seed_node() {
            return false;
        }
        if !self.static_enabled && !self.subnet.is_gov() {
            return false;
        }
        let Some(ip) = parse_ip_addr(addr) else {
            return true;
        };
        !(self.subnet.is_seed_ip(ip) || self.subnet.ip_in_members(ip))
    }
}

/// Hides member addresses from peer exchange.
pub struct SubnetMaskFilter {
    subnet: Arc<Subnet>,
}

impl AddressFilter for SubnetMaskFilter {
    fn filtered(&self, addr: &str) -> bool {
        parse_ip_addr(addr).is_some_and(|ip| self.subnet.ip_in_members(ip))
    }
}
