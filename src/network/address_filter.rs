//! Address filters consulted before connecting and before gossiping
//! addresses. `filtered` returning true means "block this address".

use crate::network::hosts_resolver::HostsResolver;
use crate::network::message::parse_ip_addr;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

pub trait AddressFilter: Send + Sync {
    fn filtered(&self, addr: &str) -> bool;
}

pub struct NoFilter;

impl AddressFilter for NoFilter {
    fn filtered(&self, _addr: &str) -> bool {
        false
    }
}

/// Blocks an address when any inner filter blocks it.
#[derive(Default)]
pub struct CombinedFilter {
    filters: Vec<Arc<dyn AddressFilter>>,
}

impl CombinedFilter {
    pub fn new(filters: Vec<Arc<dyn AddressFilter>>) -> Self {
        Self { filters }
    }

    pub fn push(&mut self, filter: Arc<dyn AddressFilter>) {
        self.filters.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl AddressFilter for CombinedFilter {
    fn filtered(&self, addr: &str) -> bool {
        self.filters.iter().any(|f| f.filtered(addr))
    }
}

/// Reserved-only mode: everything is blocked unless the remote IP is one of
/// the reserved hosts. Names match by the addresses the resolver last saw;
/// the owner keeps it fresh through `resolver()`.
pub struct StaticReserveFilter {
    ips: HashSet<String>,
    names: Arc<HostsResolver>,
}

impl StaticReserveFilter {
    pub fn new(reserved: Vec<String>) -> Self {
        let (names, ips): (Vec<String>, Vec<String>) = reserved
            .into_iter()
            .partition(|entry| entry.parse::<IpAddr>().is_err());
        let names: Vec<String> = names.iter().map(|name| format!("{}:0", name)).collect();
        let (names, _) = HostsResolver::new(&names);
        Self {
            ips: ips.into_iter().collect(),
            names: Arc::new(names),
        }
    }

    pub fn resolver(&self) -> Arc<HostsResolver> {
        self.names.clone()
    }

    fn in_reserve_list(&self, ip: &str) -> bool {
        self.ips.contains(ip) || self.names.contains_ip(ip)
    }
}

impl AddressFilter for StaticReserveFilter {
    fn filtered(&self, addr: &str) -> bool {
        match parse_ip_addr(addr) {
            Some(ip) => !self.in_reserve_list(ip),
            None => true,
        }
    }
}

/// Blocks IPs listed in the mask list. An entry ending in '.' masks the
/// whole prefix.
pub struct StaticMaskFilter {
    masks: Vec<String>,
}

impl StaticMaskFilter {
    pub fn new(masks: Vec<String>) -> Self {
        Self { masks }
    }
}

impl AddressFilter for StaticMaskFilter {
    fn filtered(&self, addr: &str) -> bool {
        let ip = parse_ip_addr(addr).unwrap_or(addr);
        self.masks
            .iter()
            .any(|mask| ip == mask || (mask.ends_with('.') && ip.starts_with(mask.as_str())))
    }
}
