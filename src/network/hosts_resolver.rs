//! Seed and reserved address lists that may contain DNS names.
//!
//! Entries are "host:port". Literal IPs are known from construction. Names
//! are looked up by a background task started with `start`, and every query
//! reads the last lookup only, so callers on the admission path never wait
//! on DNS.

use crate::network::message::{join_host_port, split_host_port};
use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

pub struct HostsResolver {
    literal: Vec<String>,
    names: Vec<(String, u16)>,
    resolved: RwLock<Vec<String>>,
    stop: CancellationToken,
}

impl HostsResolver {
    /// Returns the resolver and the entries that are not "host:port".
    pub fn new(list: &[String]) -> (Self, Vec<String>) {
        let mut literal = Vec::new();
        let mut names = Vec::new();
        let mut invalid = Vec::new();
        for entry in list {
            match split_host_port(entry) {
                Some((host, port)) if host.parse::<IpAddr>().is_ok() => {
                    literal.push(join_host_port(host, port));
                }
                Some((host, port)) => names.push((host.to_string(), port)),
                None => invalid.push(entry.clone()),
            }
        }
        literal.sort();
        literal.dedup();
        let resolver = Self {
            resolved: RwLock::new(literal.clone()),
            literal,
            names,
            stop: CancellationToken::new(),
        };
        (resolver, invalid)
    }

    pub fn is_empty(&self) -> bool {
        self.literal.is_empty() && self.names.is_empty()
    }

    pub fn has_names(&self) -> bool {
        !self.names.is_empty()
    }

    /// Resolved "ip:port" addresses of every entry, as of the last lookup.
    pub fn host_addrs(&self) -> Vec<String> {
        self.resolved.read().clone()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.resolved.read().iter().any(|a| a == addr)
    }

    pub fn contains_ip(&self, ip: &str) -> bool {
        self.resolved
            .read()
            .iter()
            .any(|a| split_host_port(a).is_some_and(|(host, _)| host == ip))
    }

    /// Look every name up again and replace the cached list.
    pub async fn refresh(&self) {
        let mut out = self.literal.clone();
        for (host, port) in &self.names {
            match tokio::net::lookup_host((host.as_str(), *port)).await {
                Ok(addrs) => {
                    out.extend(addrs.map(|sa| join_host_port(&sa.ip().to_string(), sa.port())));
                }
                Err(e) => debug!("failed to resolve {}: {}", host, e),
            }
        }
        out.sort();
        out.dedup();
        *self.resolved.write() = out;
    }

    /// Keep the names fresh until `stop`. Lists of literal IPs need no task.
    pub fn start(self: &Arc<Self>) {
        if !self.has_names() {
            return;
        }
        let me = Arc::downgrade(self);
        let stop = self.stop.clone();
        tokio::spawn(async move { refresh_loop(me, stop).await });
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

async fn refresh_loop(resolver: Weak<HostsResolver>, stop: CancellationToken) {
    loop {
        match resolver.upgrade() {
            Some(resolver) => resolver.refresh().await,
            None => break,
        }
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
        }
    }
    debug!("hosts refresh loop exited");
}

impl Drop for HostsResolver {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
