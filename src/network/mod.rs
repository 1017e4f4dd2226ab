pub mod address_filter;
pub mod connect_controller;
pub mod handshake;
pub mod hosts_resolver;
pub mod message;
pub mod peer;
pub mod peer_id;
pub mod server;
pub mod signed_message;
pub mod transport;
pub mod virtual_net;
pub mod wire;
