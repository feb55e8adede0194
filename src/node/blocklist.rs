//! Locally ignored peers. Purely advisory: enforcement happens only in the
//! local dispatch path, nothing is sent to anyone.

use std::net::Ipv4Addr;

#[derive(Debug, Default)]
pub struct Blocklist {
    blocked: scc::HashSet<Ipv4Addr>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self { blocked: scc::HashSet::new() }
    }

    pub fn block(&self, ip: Ipv4Addr) {
        let _ = self.blocked.insert(ip);
    }

    pub fn unblock(&self, ip: Ipv4Addr) {
        let _ = self.blocked.remove(&ip);
    }

    pub fn is_blocked(&self, ip: Ipv4Addr) -> bool {
        self.blocked.contains(&ip)
    }

    /// Copy of the current set, sorted for deterministic presentation.
    pub fn snapshot(&self) -> Vec<Ipv4Addr> {
        let mut ips = Vec::new();
        self.blocked.scan(|ip| ips.push(*ip));
        ips.sort_unstable_by_key(|ip| ip.octets());
        ips
    }

    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}
