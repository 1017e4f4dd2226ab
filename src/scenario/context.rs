//! Harness context: fault parameters plus ownership of every session a
//! scenario creates.

use crate::error::AppError;
use crate::network::handshake::HandshakeFaults;
use crate::network::message::parse_ip_addr;
use crate::network::peer_id::PeerKeyId;
use crate::network::server::{NetServer, NetServerOptions};
use crate::network::virtual_net::VirtualNetwork;
use crate::protocols::heartbeat::{HeartbeatInterrupt, HeartbeatParams, DEFAULT_HEARTBEAT_HEIGHT};
use crate::protocols::Protocol;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Fault injection applied to every session built through a context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestParams {
    pub handshake: HandshakeFaults,
    pub heartbeat_interrupt: HeartbeatInterrupt,
    pub heartbeat_height: u64,
}

impl Default for TestParams {
    fn default() -> Self {
        Self {
            handshake: HandshakeFaults::default(),
            heartbeat_interrupt: HeartbeatInterrupt::default(),
            heartbeat_height: DEFAULT_HEARTBEAT_HEIGHT,
        }
    }
}

impl TestParams {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn heartbeat_params(&self, mut base: HeartbeatParams) -> HeartbeatParams {
        base.interrupt = self.heartbeat_interrupt;
        base.initial_height = self.heartbeat_height;
        base
    }
}

pub struct HarnessContext {
    params: TestParams,
    net: VirtualNetwork,
    sessions: Mutex<Vec<Arc<NetServer>>>,
}

impl HarnessContext {
    pub fn new(params: TestParams) -> Arc<Self> {
        Arc::new(Self {
            params,
            net: VirtualNetwork::new(),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn params(&self) -> &TestParams {
        &self.params
    }

    pub fn network(&self) -> &VirtualNetwork {
        &self.net
    }

    /// Session listening on `listen_addr` of the virtual network. It dials
    /// out from the listen IP so remote peers see one host per node.
    pub fn new_virtual_server(
        &self,
        listen_addr: &str,
        protocol: Arc<dyn Protocol>,
        mut options: NetServerOptions,
    ) -> Result<Arc<NetServer>, AppError> {
        let host = parse_ip_addr(listen_addr)
            .ok_or_else(|| AppError::Config(format!("invalid listen address {}", listen_addr)))?
            .to_string();
        let key = PeerKeyId::random();
        let listener = self
            .net
            .new_listener_with_addr(key.id, listen_addr)
            .map_err(|source| AppError::Bind {
                addr: listen_addr.to_string(),
                source,
            })?;
        let dialer = self.net.new_dialer_with_host(key.id, &host);
        self.build(key, protocol, listener, dialer, &mut options)
    }

    /// Session on a freshly generated virtual address.
    pub fn new_random_server(
        &self,
        protocol: Arc<dyn Protocol>,
        mut options: NetServerOptions,
    ) -> Result<Arc<NetServer>, AppError> {
        let key = PeerKeyId::random();
        let (addr, listener) = self.net.new_listener(key.id);
        let host = parse_ip_addr(&addr).unwrap_or_default().to_string();
        let dialer = self.net.new_dialer_with_host(key.id, &host);
        self.build(key, protocol, listener, dialer, &mut options)
    }

    fn build(
        &self,
        key: PeerKeyId,
        protocol: Arc<dyn Protocol>,
        listener: crate::network::virtual_net::VirtualListener,
        dialer: crate::network::virtual_net::VirtualDialer,
        options: &mut NetServerOptions,
    ) -> Result<Arc<NetServer>, AppError> {
        options.faults = self.params.handshake.clone();
        options.initial_height = self.params.heartbeat_height;
        let server = NetServer::new(key, protocol, Arc::new(listener), Arc::new(dialer), options)?;
        self.register(server.clone());
        Ok(server)
    }

    pub fn register(&self, server: Arc<NetServer>) {
        self.sessions.lock().push(server);
    }

    pub fn sessions(&self) -> Vec<Arc<NetServer>> {
        self.sessions.lock().clone()
    }

    /// Stop and forget every session this context created.
    pub async fn stop_all(&self) {
        let sessions: Vec<Arc<NetServer>> = std::mem::take(&mut *self.sessions.lock());
        info!("[harness] stopping {} sessions", sessions.len());
        for server in sessions {
            server.stop().await;
        }
    }
}
