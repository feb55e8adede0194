use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 50000;
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 1);
/// Receive buffer for one datagram. Messages are short text, fragmentation
/// is not a design concern.
pub const RECV_BUFFER_SIZE: usize = 2048;
pub const DEDUP_CAPACITY: usize = 4096;
pub const DEDUP_TTL_MS: u64 = 30_000;
pub const ANNOUNCE_INTERVAL_MS: u64 = 2_000;
pub const EXPIRY_SWEEP_MS: u64 = 1_000;

/// The network interface the caller selected for us. Enumeration and
/// selection happen outside the core; we only consume the result.
#[derive(Debug, Clone, Copy)]
pub struct IfaceInfo {
    pub local_addr: Ipv4Addr,
    /// Directed broadcast address of the interface's subnet, when known.
    pub broadcast_addr: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub udp_port: u16,
    pub multicast_group: Ipv4Addr,
    pub announce_interval_ms: u64,
    pub dedup_ttl_ms: u64,
    pub dedup_capacity: usize,
    pub multicast_ttl: u32,
    pub nickname: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_PORT,
            multicast_group: DEFAULT_GROUP,
            announce_interval_ms: ANNOUNCE_INTERVAL_MS,
            dedup_ttl_ms: DEDUP_TTL_MS,
            dedup_capacity: DEDUP_CAPACITY,
            multicast_ttl: 1,
            nickname: String::new(),
        }
    }
}

impl Config {
    /// Build a config from environment variables, falling back to defaults.
    /// Unparsable values are ignored with a warning rather than failing
    /// startup.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(port) = parse_env("LANCHAT_PORT") {
            cfg.udp_port = port;
        }
        if let Some(group) = parse_env::<Ipv4Addr>("LANCHAT_GROUP") {
            if group.is_multicast() {
                cfg.multicast_group = group;
            } else {
                warn!("LANCHAT_GROUP {} is not a multicast address, keeping {}", group, cfg.multicast_group);
            }
        }
        if let Some(ms) = parse_env("LANCHAT_ANNOUNCE_MS") {
            cfg.announce_interval_ms = ms;
        }
        if let Some(ms) = parse_env("LANCHAT_DEDUP_TTL_MS") {
            cfg.dedup_ttl_ms = ms;
        }
        if let Some(cap) = parse_env("LANCHAT_DEDUP_CAP") {
            cfg.dedup_capacity = cap;
        }
        if let Some(ttl) = parse_env("LANCHAT_TTL") {
            cfg.multicast_ttl = ttl;
        }
        if let Ok(nick) = std::env::var("LANCHAT_NICK") {
            cfg.nickname = nick;
        }
        cfg
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparsable {}={}", name, raw);
            None
        }
    }
}
