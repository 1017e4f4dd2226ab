use crate::network::peer_id::PeerId;
use crate::network::signed_message::MembersRequest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub const PROTOCOL_VERSION: u32 = 1;
pub const SERVICE_NODE: u64 = 1;
pub const SOFT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub type Hash256 = [u8; 32];

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Message {
    // Handshake
    Version(VersionPayload),
    VerAck,
    // Heartbeat
    Ping {
        height: u64,
    },
    Pong {
        height: u64,
    },
    // Discovery
    FindNodeReq {
        target: PeerId,
    },
    FindNodeResp {
        target: PeerId,
        success: bool,
        address: String,
        closer_peers: Vec<PeerAddr>,
    },
    AddrReq,
    Addr(Vec<PeerAddr>),
    // Governance membership gossip
    SubnetMembersRequest(MembersRequest),
    SubnetMembers(Vec<MemberInfo>),
    // Relay / sync traffic the harness only routes or logs
    Trn(Transaction),
    HeadersReq {
        len: u8,
        hash_start: Hash256,
        hash_end: Hash256,
    },
    Consensus {
        payload: Vec<u8>,
    },
    NotFound {
        hash: Hash256,
    },
    DataReq {
        data_type: u8,
        hash: Hash256,
    },
    Inv {
        inv_type: u8,
        hashes: Vec<Hash256>,
    },
}

impl Message {
    /// Get the message type name as a string (for logging/debugging)
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::FindNodeReq { .. } => "findnodereq",
            Message::FindNodeResp { .. } => "findnoderesp",
            Message::AddrReq => "getaddr",
            Message::Addr(_) => "addr",
            Message::SubnetMembersRequest(_) => "subnetmembersrequest",
            Message::SubnetMembers(_) => "subnetmembers",
            Message::Trn(_) => "tx",
            Message::HeadersReq { .. } => "getheaders",
            Message::Consensus { .. } => "consensus",
            Message::NotFound { .. } => "notfound",
            Message::DataReq { .. } => "getdata",
            Message::Inv { .. } => "inv",
        }
    }
}

/// What a node advertises about itself in the version message.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VersionPayload {
    pub version: u32,
    pub services: u64,
    pub http_info_port: u16,
    pub sync_port: u16,
    pub height: u64,
    pub id: PeerId,
    pub soft_version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub id: PeerId,
    pub addr: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub pubkey: String,
    pub addr: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub nonce: u32,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            nonce: rand::random(),
            payload,
        }
    }

    pub fn hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(&self.payload);
        hasher.finalize().into()
    }
}

/// A remote peer's advertised identity, created when the handshake
/// completes. Only the height changes afterwards.
#[derive(Debug)]
pub struct PeerInfo {
    pub id: PeerId,
    pub version: u32,
    pub services: u64,
    /// Remote address of the connection this info arrived on ("ip:port").
    pub addr: String,
    /// Port the peer listens on.
    pub port: u16,
    pub http_info_port: u16,
    pub soft_version: String,
    height: AtomicU64,
}

impl PeerInfo {
    pub fn new(
        id: PeerId,
        addr: String,
        port: u16,
        http_info_port: u16,
        height: u64,
        soft_version: String,
    ) -> Self {
        Self {
            id,
            version: PROTOCOL_VERSION,
            services: SERVICE_NODE,
            addr,
            port,
            http_info_port,
            soft_version,
            height: AtomicU64::new(height),
        }
    }

    pub fn from_version(payload: &VersionPayload, remote_addr: &str) -> Self {
        Self {
            id: payload.id,
            version: payload.version,
            services: payload.services,
            addr: remote_addr.to_string(),
            port: payload.sync_port,
            http_info_port: payload.http_info_port,
            soft_version: payload.soft_version.clone(),
            height: AtomicU64::new(payload.height),
        }
    }

    pub fn to_version(&self) -> VersionPayload {
        VersionPayload {
            version: self.version,
            services: self.services,
            http_info_port: self.http_info_port,
            sync_port: self.port,
            height: self.height(),
            id: self.id,
            soft_version: self.soft_version.clone(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Relaxed)
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::Relaxed);
    }

    /// The address other nodes should dial to reach this peer: the IP it
    /// connected from plus the port it advertised.
    pub fn remote_listen_address(&self) -> String {
        match split_host_port(&self.addr) {
            Some((host, _)) => join_host_port(host, self.port),
            None => join_host_port(&self.addr, self.port),
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={}, version={}, services={}, addr={}, port={}, height={}, soft={}",
            self.id.to_hex(),
            self.version,
            self.services,
            self.addr,
            self.port,
            self.height(),
            self.soft_version
        )
    }
}

/// Split "host:port" / "[v6]:port" into its parts.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let colon = addr.rfind(':')?;
    let port = addr[colon + 1..].parse::<u16>().ok()?;
    let host = &addr[..colon];
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// IP part of a connection address, ignoring the port.
pub fn parse_ip_addr(addr: &str) -> Option<&str> {
    split_host_port(addr).map(|(host, _)| host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("10.0.0.1:20338"), Some(("10.0.0.1", 20338)));
        assert_eq!(split_host_port("[::1]:80"), Some(("::1", 80)));
        assert_eq!(split_host_port("10.0.0.1"), None);
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
    }

    #[test]
    fn test_remote_listen_address_uses_advertised_port() {
        let info = PeerInfo::new(PeerId::random(), "10.0.0.7:53122".into(), 20338, 0, 0, "x".into());
        assert_eq!(info.remote_listen_address(), "10.0.0.7:20338");
    }

    #[test]
    fn test_height_is_mutable_through_shared_ref() {
        let info = PeerInfo::new(PeerId::random(), "10.0.0.7:1".into(), 2, 0, 5, "x".into());
        info.set_height(42);
        assert_eq!(info.height(), 42);
        assert_eq!(info.to_version().height, 42);
    }
}
