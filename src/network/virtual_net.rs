//! In-process network used to run many sessions in one process.
//!
//! Every listener is registered under a fake "ip:port" address. Dialing an
//! address creates a pair of frame channels, one per direction, and hands
//! the server half to the listener's accept queue. Sessions cannot tell the
//! difference from real sockets.

use crate::error::NetError;
use crate::network::peer_id::PeerId;
use crate::network::transport::{Connection, Dialer, FrameReader, FrameWriter, Listener};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const VIRTUAL_LISTEN_PORT: u16 = 20338;
const FRAME_QUEUE: usize = 1024;
const ACCEPT_QUEUE: usize = 128;
const EPHEMERAL_PORTS: RangeInclusive<u16> = 40000..=65535;

struct ListenerEntry {
    id: PeerId,
    serial: u64,
    incoming: mpsc::Sender<Connection>,
}

#[derive(Default)]
struct NetState {
    listeners: HashMap<String, ListenerEntry>,
    hosts: HashSet<String>,
    /// Unordered id pairs allowed to connect. Empty means fully connected.
    allowed: HashSet<(PeerId, PeerId)>,
    /// host -> source ports of its live dialed connections
    ephemeral: HashMap<String, HostPorts>,
}

#[derive(Default)]
struct HostPorts {
    /// offset into `EPHEMERAL_PORTS` where the next search starts
    next: u32,
    in_use: HashSet<u16>,
}

struct Shared {
    state: Mutex<NetState>,
    deliver_percent: AtomicU32,
    next_serial: AtomicU64,
}

/// Handle to an in-process network. Cheap to clone.
#[derive(Clone)]
pub struct VirtualNetwork {
    shared: Arc<Shared>,
}

impl Default for VirtualNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualNetwork {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(NetState::default()),
                deliver_percent: AtomicU32::new(100),
                next_serial: AtomicU64::new(0),
            }),
        }
    }

    /// Listener on a freshly generated address.
    pub fn new_listener(&self, id: PeerId) -> (String, VirtualListener) {
        loop {
            let addr = format!("{}:{}", self.random_host(), VIRTUAL_LISTEN_PORT);
            if let Ok(listener) = self.new_listener_with_addr(id, &addr) {
                return (addr, listener);
            }
        }
    }

    pub fn new_listener_with_addr(
        &self,
        id: PeerId,
        addr: &str,
    ) -> Result<VirtualListener, NetError> {
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        let serial = self.shared.next_serial.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.state.lock();
        if state.listeners.contains_key(addr) {
            return Err(NetError::AddrInUse(addr.to_string()));
        }
        state.listeners.insert(
            addr.to_string(),
            ListenerEntry {
                id,
                serial,
                incoming: tx,
            },
        );
        if let Some(host) = crate::network::message::parse_ip_addr(addr) {
            state.hosts.insert(host.to_string());
        }
        Ok(VirtualListener {
            addr: addr.to_string(),
            serial,
            incoming: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            shared: self.shared.clone(),
        })
    }

    /// Dialer with a random source host.
    pub fn new_dialer(&self, id: PeerId) -> VirtualDialer {
        let host = self.random_host();
        self.new_dialer_with_host(id, &host)
    }

    pub fn new_dialer_with_host(&self, id: PeerId, host: &str) -> VirtualDialer {
        self.shared.state.lock().hosts.insert(host.to_string());
        VirtualDialer {
            id,
            host: host.to_string(),
            shared: self.shared.clone(),
        }
    }

    /// Once any pair is allowed, only allowed pairs can connect.
    pub fn allow_connect(&self, id1: PeerId, id2: PeerId) {
        let mut state = self.shared.state.lock();
        state.allowed.insert((id1, id2));
        state.allowed.insert((id2, id1));
    }

    /// Percentage (0..=100) of frames that reach the other side.
    pub fn deliver_rate(&self, percent: u32) {
        self.shared
            .deliver_percent
            .store(percent.min(100), Ordering::Relaxed);
    }

    fn random_host(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let host = format!(
                "10.{}.{}.{}",
                rng.gen_range(0..=255u8),
                rng.gen_range(0..=255u8),
                rng.gen_range(1..=254u8)
            );
            if !self.shared.state.lock().hosts.contains(&host) {
                return host;
            }
        }
    }
}

impl Shared {
    fn can_connect(&self, from: &PeerId, to: &PeerId) -> bool {
        let state = self.state.lock();
        state.allowed.is_empty() || state.allowed.contains(&(*from, *to))
    }

    /// Next free source port of `host`, round robin over the ephemeral
    /// range. `None` once every port of the host is taken.
    fn lease_port(self: &Arc<Self>, host: &str) -> Option<Arc<PortLease>> {
        let low = *EPHEMERAL_PORTS.start();
        let span = u32::from(*EPHEMERAL_PORTS.end() - low) + 1;
        let mut state = self.state.lock();
        let ports = state.ephemeral.entry(host.to_string()).or_default();
        for step in 0..span {
            let offset = (ports.next + step) % span;
            let port = low + offset as u16;
            if ports.in_use.insert(port) {
                ports.next = (offset + 1) % span;
                return Some(Arc::new(PortLease {
                    shared: self.clone(),
                    host: host.to_string(),
                    port,
                }));
            }
        }
        None
    }
}

/// Source port held by both halves of a dialed connection.
struct PortLease {
    shared: Arc<Shared>,
    host: String,
    port: u16,
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(ports) = state.ephemeral.get_mut(&self.host) {
            ports.in_use.remove(&self.port);
        }
    }
}

pub struct VirtualListener {
    addr: String,
    serial: u64,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    closed: CancellationToken,
    shared: Arc<Shared>,
}

#[async_trait]
impl Listener for VirtualListener {
    async fn accept(&self) -> Result<Connection, NetError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(NetError::Closed),
            conn = incoming.recv() => conn.ok_or(NetError::Closed),
        }
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    fn close(&self) {
        self.unregister();
        self.closed.cancel();
    }
}

impl VirtualListener {
    fn unregister(&self) {
        let mut state = self.shared.state.lock();
        if state
            .listeners
            .get(&self.addr)
            .is_some_and(|entry| entry.serial == self.serial)
        {
            state.listeners.remove(&self.addr);
        }
    }
}

impl Drop for VirtualListener {
    fn drop(&mut self) {
        self.unregister();
    }
}

pub struct VirtualDialer {
    id: PeerId,
    host: String,
    shared: Arc<Shared>,
}

impl VirtualDialer {
    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl Dialer for VirtualDialer {
    async fn dial(&self, addr: &str) -> Result<Connection, NetError> {
        let (target, incoming) = {
            let state = self.shared.state.lock();
            let entry = state
                .listeners
                .get(addr)
                .ok_or_else(|| NetError::Unreachable(addr.to_string()))?;
            (entry.id, entry.incoming.clone())
        };
        if !self.shared.can_connect(&self.id, &target) {
            return Err(NetError::Unreachable(addr.to_string()));
        }

        let lease = self
            .shared
            .lease_port(&self.host)
            .ok_or_else(|| NetError::AddrInUse(self.host.clone()))?;
        let local = format!("{}:{}", self.host, lease.port);
        let (to_server, server_rx) = mpsc::channel(FRAME_QUEUE);
        let (to_client, client_rx) = mpsc::channel(FRAME_QUEUE);

        let server_side = Connection {
            local_addr: addr.to_string(),
            remote_addr: local.clone(),
            reader: Box::new(ChannelReader(server_rx)),
            writer: Box::new(ChannelWriter {
                tx: Some(to_client),
                shared: self.shared.clone(),
                _lease: lease.clone(),
            }),
        };
        incoming
            .send(server_side)
            .await
            .map_err(|_| NetError::Unreachable(addr.to_string()))?;

        Ok(Connection {
            local_addr: local,
            remote_addr: addr.to_string(),
            reader: Box::new(ChannelReader(client_rx)),
            writer: Box::new(ChannelWriter {
                tx: Some(to_server),
                shared: self.shared.clone(),
                _lease: lease,
            }),
        })
    }
}

struct ChannelReader(mpsc::Receiver<Vec<u8>>);

#[async_trait]
impl FrameReader for ChannelReader {
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, NetError> {
        Ok(self.0.recv().await)
    }
}

struct ChannelWriter {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    shared: Arc<Shared>,
    _lease: Arc<PortLease>,
}

#[async_trait]
impl FrameWriter for ChannelWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), NetError> {
        let tx = self.tx.as_ref().ok_or(NetError::Closed)?;
        let percent = self.shared.deliver_percent.load(Ordering::Relaxed);
        if percent < 100 && rand::thread_rng().gen_range(0..100) >= percent {
            // dropped in transit
            return Ok(());
        }
        tx.send(frame.to_vec()).await.map_err(|_| NetError::Closed)
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}
