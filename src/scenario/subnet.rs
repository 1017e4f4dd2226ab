//! Seed, governance and ordinary nodes wired together on one virtual
//! network, plus the checks that the resulting topology is the one the
//! subnet filters are meant to produce:
//!
//! - seeds talk to everybody
//! - gov nodes talk to seeds and each other, and list every other gov node
//!   as a connected member
//! - ordinary nodes talk to seeds and each other and never learn a member

use crate::network::message::parse_ip_addr;
use crate::network::server::{NetServer, NetServerOptions};
use crate::network::signed_message::{pubkey_id, Account};
use crate::protocols::gov::{GovNodeMockResolver, MockLedger};
use crate::protocols::handlers::{ServiceOptions, SubnetHandler};
use crate::protocols::subnet::{SubnetMemberInfo, SubnetParams};
use crate::protocols::P2P;
use crate::scenario::{HarnessContext, ScenarioError, TestParams};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const MAX_CONN: usize = 100;

#[derive(Debug, Clone)]
pub struct MockSubnetConfig {
    pub seeds: Vec<String>,
    pub govs: Vec<String>,
    pub norms: Vec<String>,
    /// Pause between starting the seeds and everybody else.
    pub start_delay: Duration,
    pub services: ServiceOptions,
    pub subnet: SubnetParams,
}

impl MockSubnetConfig {
    /// Topology with timings short enough for a test to settle in seconds.
    pub fn new(seeds: Vec<String>, govs: Vec<String>, norms: Vec<String>) -> Self {
        let services = ServiceOptions {
            seeds: seeds.clone(),
            discovery_interval: Duration::from_millis(500),
            bootstrap_interval: Duration::from_millis(500),
            ..ServiceOptions::default()
        };
        let subnet = SubnetParams {
            refresh: Duration::from_secs(1),
            ..SubnetParams::default()
        };
        Self {
            seeds,
            govs,
            norms,
            start_delay: Duration::from_secs(1),
            services,
            subnet,
        }
    }

    fn all_nodes(&self) -> impl Iterator<Item = &String> {
        self.seeds.iter().chain(&self.govs).chain(&self.norms)
    }

    /// Every node needs its own IP; neighbors are told apart by host.
    fn check_duplicate_hosts(&self) -> Result<(), ScenarioError> {
        let mut hosts = HashSet::new();
        for addr in self.all_nodes() {
            let host = parse_ip_addr(addr).ok_or_else(|| ScenarioError::UnknownHost(addr.clone()))?;
            if !hosts.insert(host) {
                return Err(ScenarioError::DuplicateHost(addr.clone()));
            }
        }
        Ok(())
    }

    pub fn check_reserves(&self, reserves: &[Reserve]) -> Result<(), ScenarioError> {
        let nodes: Vec<String> = self.all_nodes().cloned().collect();
        for reserve in reserves {
            if !host_in_list(&reserve.host, &nodes) {
                return Err(ScenarioError::UnknownHost(reserve.host.clone()));
            }
            if let Some(rsv) = reserve.rsv.iter().find(|rsv| !addr_in_list(rsv, &nodes)) {
                return Err(ScenarioError::UnknownHost(rsv.clone()));
            }
        }
        Ok(())
    }
}

/// Reserved-only peer list for the node on `host` (an IP).
#[derive(Debug, Clone)]
pub struct Reserve {
    pub host: String,
    pub rsv: Vec<String>,
}

fn reserves_for(reserves: &[Reserve], addr: &str) -> Vec<String> {
    let Some(host) = parse_ip_addr(addr) else {
        return Vec::new();
    };
    reserves
        .iter()
        .find(|r| r.host == host)
        .map(|r| {
            r.rsv
                .iter()
                .map(|rsv| parse_ip_addr(rsv).unwrap_or(rsv).to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn host_in_list(host: &str, list: &[String]) -> bool {
    list.iter().any(|addr| parse_ip_addr(addr) == Some(host))
}

fn addr_in_list(addr: &str, list: &[String]) -> bool {
    parse_ip_addr(addr).is_some_and(|host| host_in_list(host, list))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Seed,
    Gov,
    Norm,
    Unknown,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Seed => "seed",
            NodeType::Gov => "gov",
            NodeType::Norm => "norm",
            NodeType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

struct WrapNode {
    listen_addr: String,
    node_type: NodeType,
    /// Gov node revoked by `del_gov_node`; still running.
    demoted: bool,
    acct: Option<Account>,
    server: Arc<NetServer>,
    handler: Arc<SubnetHandler>,
}

impl WrapNode {
    fn host(&self) -> &str {
        parse_ip_addr(&self.listen_addr).unwrap_or(&self.listen_addr)
    }
}

pub struct MockSubnet {
    config: MockSubnetConfig,
    ctx: Arc<HarnessContext>,
    ledger: Arc<MockLedger>,
    nodes: Vec<WrapNode>,
}

impl MockSubnet {
    pub fn new(config: MockSubnetConfig, reserves: Vec<Reserve>) -> Result<Self, ScenarioError> {
        Self::with_context(HarnessContext::new(TestParams::default()), config, reserves)
    }

    pub fn with_context(
        ctx: Arc<HarnessContext>,
        config: MockSubnetConfig,
        reserves: Vec<Reserve>,
    ) -> Result<Self, ScenarioError> {
        config.check_duplicate_hosts()?;
        config.check_reserves(&reserves)?;

        let mut subnet = Self {
            config,
            ctx,
            ledger: MockLedger::new(),
            nodes: Vec::new(),
        };

        let seeds = subnet.config.seeds.clone();
        for addr in &seeds {
            subnet.generate_node(addr, NodeType::Seed, None, reserves_for(&reserves, addr))?;
        }
        let govs = subnet.config.govs.clone();
        for addr in &govs {
            let acct = subnet.new_gov_account();
            subnet.generate_node(addr, NodeType::Gov, Some(acct), reserves_for(&reserves, addr))?;
        }
        let norms = subnet.config.norms.clone();
        for addr in &norms {
            subnet.generate_node(addr, NodeType::Norm, None, reserves_for(&reserves, addr))?;
        }
        Ok(subnet)
    }

    fn new_gov_account(&self) -> Account {
        let acct = Account::random();
        self.ledger.add_gov_node(&pubkey_id(&acct.public_key()));
        acct
    }

    fn generate_node(
        &mut self,
        listen_addr: &str,
        node_type: NodeType,
        acct: Option<Account>,
        rsv: Vec<String>,
    ) -> Result<Arc<NetServer>, ScenarioError> {
        let mut services = self.config.services.clone();
        services.seeds = self.config.seeds.clone();
        let handler = Arc::new(SubnetHandler::new(
            acct.clone(),
            services,
            Arc::new(GovNodeMockResolver::new(self.ledger.clone())),
            self.config.subnet.clone(),
        )?);

        let options = NetServerOptions {
            max_conn_in_bound: MAX_CONN,
            max_conn_out_bound: MAX_CONN,
            max_conn_in_bound_per_ip: MAX_CONN,
            reserved_only: !rsv.is_empty(),
            reserved_peers: rsv,
            ..NetServerOptions::default()
        };
        let server = self
            .ctx
            .new_virtual_server(listen_addr, handler.clone(), options)?;

        self.nodes.push(WrapNode {
            listen_addr: listen_addr.to_string(),
            node_type,
            demoted: false,
            acct,
            server: server.clone(),
            handler,
        });
        Ok(server)
    }

    pub fn context(&self) -> &Arc<HarnessContext> {
        &self.ctx
    }

    pub fn ledger(&self) -> &Arc<MockLedger> {
        &self.ledger
    }

    /// Seeds first, so the others find them listening.
    pub async fn start_all(&self) {
        for node in self.nodes.iter().filter(|n| n.node_type == NodeType::Seed) {
            node.server.start().await;
        }
        tokio::time::sleep(self.config.start_delay).await;
        for node in self.nodes.iter().filter(|n| n.node_type != NodeType::Seed) {
            node.server.start().await;
        }
    }

    /// Register a new gov account and build its node. The caller starts it.
    pub fn add_gov_node(&mut self, listen_addr: &str) -> Result<Arc<NetServer>, ScenarioError> {
        self.config.govs.push(listen_addr.to_string());
        if let Err(e) = self.config.check_duplicate_hosts() {
            self.config.govs.pop();
            return Err(e);
        }
        let acct = self.new_gov_account();
        self.generate_node(listen_addr, NodeType::Gov, Some(acct), Vec::new())
    }

    /// Revoke a gov node in the ledger. The node keeps running as an
    /// ordinary one; peers drop it from their member lists only once its
    /// entry goes stale.
    pub fn del_gov_node(&mut self, listen_addr: &str) -> Result<(), ScenarioError> {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.listen_addr == listen_addr)
            .ok_or_else(|| ScenarioError::NodeNotFound(listen_addr.to_string()))?;
        if node.node_type != NodeType::Gov {
            return Err(ScenarioError::NotGovNode(listen_addr.to_string()));
        }
        node.node_type = NodeType::Norm;
        node.demoted = true;
        if let Some(acct) = &node.acct {
            self.ledger.del_gov_node(&pubkey_id(&acct.public_key()));
        }

        self.config.govs.retain(|gov| gov != listen_addr);
        self.config.norms.push(listen_addr.to_string());
        info!("[subnet-check] gov node {} demoted", listen_addr);
        Ok(())
    }

    pub fn server(&self, listen_addr: &str) -> Option<&Arc<NetServer>> {
        self.node(listen_addr).map(|n| &n.server)
    }

    pub fn members_of(&self, listen_addr: &str) -> Result<Vec<SubnetMemberInfo>, ScenarioError> {
        self.node(listen_addr)
            .map(|n| n.handler.members_info())
            .ok_or_else(|| ScenarioError::NodeNotFound(listen_addr.to_string()))
    }

    fn node(&self, listen_addr: &str) -> Option<&WrapNode> {
        self.nodes.iter().find(|n| n.listen_addr == listen_addr)
    }

    fn is_demoted(&self, addr: &str) -> bool {
        let Some(host) = parse_ip_addr(addr) else {
            return false;
        };
        self.nodes.iter().any(|n| n.demoted && n.host() == host)
    }

    fn active(&self, list: &[String]) -> usize {
        list.iter().filter(|addr| !self.is_demoted(addr)).count()
    }

    fn remote_node_type(&self, addr: &str) -> NodeType {
        if addr_in_list(addr, &self.config.seeds) {
            NodeType::Seed
        } else if addr_in_list(addr, &self.config.govs) {
            NodeType::Gov
        } else if addr_in_list(addr, &self.config.norms) {
            NodeType::Norm
        } else {
            NodeType::Unknown
        }
    }

    /// Member lists, neighbor types and neighbor counts of every node.
    /// Demoted nodes, and every reference to them, are left out.
    pub fn check_all(&self) -> Result<(), ScenarioError> {
        for node in self.nodes.iter().filter(|n| !n.demoted) {
            info!(
                "[subnet-check] check {} node {}",
                node.node_type, node.listen_addr
            );
            self.check_member_info(node).map_err(ScenarioError::Check)?;
            self.check_neighbors(node).map_err(ScenarioError::Check)?;
        }
        Ok(())
    }

    fn check_member_info(&self, node: &WrapNode) -> Result<(), String> {
        let members: Vec<SubnetMemberInfo> = node
            .handler
            .members_info()
            .into_iter()
            .filter(|m| !self.is_demoted(&m.listen_addr))
            .collect();

        if node.node_type == NodeType::Norm {
            if !members.is_empty() {
                return Err(format!(
                    "norm node {} knows {} gov nodes",
                    node.listen_addr,
                    members.len()
                ));
            }
            return Ok(());
        }

        for member in &members {
            if !addr_in_list(&member.listen_addr, &self.config.govs) {
                return Err(format!(
                    "member {} of {} is not a gov node",
                    member.listen_addr, node.listen_addr
                ));
            }
            if !member.connected {
                return Err(format!(
                    "member {} of {} is not connected",
                    member.listen_addr, node.listen_addr
                ));
            }
        }

        // a gov node never lists itself
        let govs = self.config.govs.len();
        let expected = if node.node_type == NodeType::Gov { govs - 1 } else { govs };
        if members.len() != expected {
            return Err(format!(
                "{} node {} has {} members, expected {}",
                node.node_type,
                node.listen_addr,
                members.len(),
                expected
            ));
        }
        Ok(())
    }

    fn check_neighbors(&self, node: &WrapNode) -> Result<(), String> {
        let neighbors: Vec<String> = node
            .server
            .get_neighbors()
            .into_iter()
            .map(|peer| peer.addr().to_string())
            .filter(|addr| !self.is_demoted(addr))
            .collect();

        for addr in &neighbors {
            if parse_ip_addr(addr) == Some(node.host()) {
                return Err(format!("node {} connected itself", node.listen_addr));
            }
            let remote = self.remote_node_type(addr);
            let forbidden = matches!(
                (node.node_type, remote),
                (NodeType::Gov, NodeType::Norm) | (NodeType::Norm, NodeType::Gov)
            );
            if forbidden || remote == NodeType::Unknown {
                return Err(format!(
                    "{} node {} should not be connected with {} node {}",
                    node.node_type, node.listen_addr, remote, addr
                ));
            }
        }

        let s = self.config.seeds.len();
        let g = self.config.govs.len();
        let n = self.active(&self.config.norms);
        let expected = match node.node_type {
            NodeType::Seed => s + g + n - 1,
            NodeType::Gov => s + g - 1,
            NodeType::Norm | NodeType::Unknown => s + n - 1,
        };
        if neighbors.len() != expected {
            return Err(format!(
                "{} node {} has {} neighbors, expected {}",
                node.node_type,
                node.listen_addr,
                neighbors.len(),
                expected
            ));
        }
        Ok(())
    }

    /// A gov node that also serves as seed: it must have ordinary
    /// neighbors, and none of them may have learned a member.
    pub fn check_gov_seed(&self, gov: &str) -> Result<(), ScenarioError> {
        let node = self
            .node(gov)
            .ok_or_else(|| ScenarioError::NodeNotFound(gov.to_string()))?;

        let norms: Vec<String> = node
            .server
            .get_neighbors()
            .into_iter()
            .map(|peer| peer.addr().to_string())
            .filter(|addr| self.remote_node_type(addr) == NodeType::Norm && !self.is_demoted(addr))
            .collect();
        if norms.is_empty() {
            return Err(ScenarioError::Check(format!(
                "gov seed {} has no normal node as neighbor",
                gov
            )));
        }

        for norm in &norms {
            let host = parse_ip_addr(norm);
            for other in self.nodes.iter().filter(|n| Some(n.host()) == host) {
                let members = other.handler.members_info().len();
                if members > 0 {
                    return Err(ScenarioError::Check(format!(
                        "gov seed {}, normal neighbor {} has {} subnet members",
                        gov, norm, members
                    )));
                }
            }
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        self.ctx.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(hosts: &[&str]) -> Vec<String> {
        hosts.iter().map(|h| format!("{}:20338", h)).collect()
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let config = MockSubnetConfig::new(
            addrs(&["10.2.0.1"]),
            vec!["10.2.0.2:20338".into(), "10.2.0.2:20339".into()],
            Vec::new(),
        );
        assert!(matches!(
            MockSubnet::new(config, Vec::new()),
            Err(ScenarioError::DuplicateHost(_))
        ));
    }

    #[test]
    fn test_reserve_outside_topology_rejected() {
        let config = MockSubnetConfig::new(addrs(&["10.2.0.1"]), addrs(&["10.2.0.2"]), Vec::new());
        let reserves = vec![Reserve {
            host: "10.2.0.2".into(),
            rsv: addrs(&["10.9.9.9"]),
        }];
        assert!(matches!(
            config.check_reserves(&reserves),
            Err(ScenarioError::UnknownHost(h)) if h == "10.9.9.9:20338"
        ));
        assert_eq!(
            reserves_for(
                &[Reserve {
                    host: "10.2.0.2".into(),
                    rsv: addrs(&["10.2.0.1"]),
                }],
                "10.2.0.2:20338"
            ),
            vec!["10.2.0.1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_add_and_demote_gov_node() {
        let config = MockSubnetConfig::new(addrs(&["10.2.0.1"]), addrs(&["10.2.0.2"]), addrs(&["10.2.0.3"]));
        let mut subnet = MockSubnet::new(config, Vec::new()).unwrap();
        assert_eq!(subnet.ledger().gov_nodes().len(), 1);

        subnet.add_gov_node("10.2.0.4:20338").unwrap();
        assert_eq!(subnet.ledger().gov_nodes().len(), 2);
        assert!(matches!(
            subnet.add_gov_node("10.2.0.4:20338"),
            Err(ScenarioError::DuplicateHost(_))
        ));

        assert!(matches!(
            subnet.del_gov_node("10.2.0.3:20338"),
            Err(ScenarioError::NotGovNode(_))
        ));
        assert!(matches!(
            subnet.del_gov_node("10.2.0.9:20338"),
            Err(ScenarioError::NodeNotFound(_))
        ));
        subnet.del_gov_node("10.2.0.2:20338").unwrap();
        assert_eq!(subnet.ledger().gov_nodes().len(), 1);
        assert_eq!(subnet.remote_node_type("10.2.0.2:51000"), NodeType::Norm);
        assert!(subnet.is_demoted("10.2.0.2:51000"));
        subnet.stop_all().await;
    }
}
