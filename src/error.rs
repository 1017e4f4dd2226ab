use thiserror::Error;

use crate::network::peer_id::PeerId;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid node port: {0}")]
    InvalidPort(u16),

    #[error("Failed to create listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: NetError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Transport level failures. These close the affected connection and never
/// take the process down.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Address {0} unreachable")]
    Unreachable(String),

    #[error("Address {0} already in use")]
    AddrInUse(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Dial to {0} timed out")]
    DialTimeout(String),

    #[error("Peer {0} not found")]
    PeerNotFound(PeerId),
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Handshake timed out")]
    Timeout,

    #[error("Unexpected message during handshake: expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    #[error("Connection closed during handshake")]
    Closed,

    #[error("Handshake aborted at {0}")]
    Injected(&'static str),

    #[error("Transport error during handshake: {0}")]
    Transport(#[from] NetError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Reasons the connect controller refuses a connection attempt.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Remote addr {addr} not in reserved list (local {local})")]
    NotReserved { addr: String, local: String },

    #[error("Peer {0} already in connection records")]
    AlreadyConnected(String),

    #[error("Connecting with self address {0}")]
    SelfAddress(String),

    #[error("{direction} connections reach max limit {limit}")]
    BoundFull { direction: Direction, limit: usize },

    #[error("Connections({count}) with ip({ip}) has reach max limit({limit})")]
    PerIpLimit {
        ip: String,
        count: usize,
        limit: usize,
    },

    #[error("Node exist in connecting list: {0}")]
    AlreadyConnecting(String),

    #[error("The node handshake with itself, own listen address {listen_addr}")]
    HandshakeWithSelf { listen_addr: String },

    #[error("Same peer id {id} from different addr: {old_ip}, {new_ip}")]
    IdentityConflict {
        id: PeerId,
        old_ip: String,
        new_ip: String,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Transport error: {0}")]
    Transport(#[from] NetError),
}

impl AdmissionError {
    /// Expected during self-dial discovery; the caller records its own
    /// address instead of treating this as a failure.
    pub fn is_handshake_with_self(&self) -> bool {
        matches!(self, AdmissionError::HandshakeWithSelf { .. })
    }

    pub fn is_identity_conflict(&self) -> bool {
        matches!(self, AdmissionError::IdentityConflict { .. })
    }
}
