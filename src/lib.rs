// Peer session layer for probing a blockchain p2p network: admission
// control, the neighbor registry and dispatch loop, the pluggable
// protocols that run on top, and an in-process network for multi-node
// scenarios.

pub mod config;
pub mod error;
pub mod network;
pub mod protocols;
pub mod scenario;
pub mod shutdown;
pub mod txpool;
