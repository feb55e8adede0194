use lanchat_core::config::{
    Config, ANNOUNCE_INTERVAL_MS, DEDUP_CAPACITY, DEDUP_TTL_MS, DEFAULT_GROUP, DEFAULT_PORT,
};
use lanchat_core::node::{Message, Transport};
use lanchat_core::Context;
use std::net::Ipv4Addr;
use std::sync::Arc;

#[test]
fn defaults_match_documented_constants() {
    let config = Config::default();
    assert_eq!(config.udp_port, DEFAULT_PORT);
    assert_eq!(config.multicast_group, DEFAULT_GROUP);
    assert!(config.multicast_group.is_multicast());
    assert_eq!(config.announce_interval_ms, ANNOUNCE_INTERVAL_MS);
    assert_eq!(config.dedup_ttl_ms, DEDUP_TTL_MS);
    assert_eq!(config.dedup_capacity, DEDUP_CAPACITY);
    assert_eq!(config.multicast_ttl, 1);
    assert!(config.nickname.is_empty());
}

// all env interaction lives in one test: the process environment is shared
// between parallel tests
#[test]
fn from_env_overrides_and_rejects() {
    std::env::set_var("LANCHAT_PORT", "40123");
    std::env::set_var("LANCHAT_GROUP", "239.1.2.3");
    std::env::set_var("LANCHAT_ANNOUNCE_MS", "5000");
    std::env::set_var("LANCHAT_DEDUP_TTL_MS", "60000");
    std::env::set_var("LANCHAT_DEDUP_CAP", "1024");
    std::env::set_var("LANCHAT_TTL", "4");
    std::env::set_var("LANCHAT_NICK", "alice");

    let config = Config::from_env();
    assert_eq!(config.udp_port, 40123);
    assert_eq!(config.multicast_group, Ipv4Addr::new(239, 1, 2, 3));
    assert_eq!(config.announce_interval_ms, 5000);
    assert_eq!(config.dedup_ttl_ms, 60000);
    assert_eq!(config.dedup_capacity, 1024);
    assert_eq!(config.multicast_ttl, 4);
    assert_eq!(config.nickname, "alice");

    // unparsable and non-multicast values fall back instead of failing
    std::env::set_var("LANCHAT_PORT", "not-a-port");
    std::env::set_var("LANCHAT_GROUP", "10.0.0.1");
    let config = Config::from_env();
    assert_eq!(config.udp_port, DEFAULT_PORT);
    assert_eq!(config.multicast_group, DEFAULT_GROUP);

    for name in [
        "LANCHAT_PORT",
        "LANCHAT_GROUP",
        "LANCHAT_ANNOUNCE_MS",
        "LANCHAT_DEDUP_TTL_MS",
        "LANCHAT_DEDUP_CAP",
        "LANCHAT_TTL",
        "LANCHAT_NICK",
    ] {
        std::env::remove_var(name);
    }
}

struct NullMessages;
impl lanchat_core::node::dispatch::MessageListener for NullMessages {
    fn on_message(&self, _: Transport, _: Ipv4Addr, _: &Message, _: Option<Ipv4Addr>) {}
}

struct NullPeers;
impl lanchat_core::node::discovery::PeerListener for NullPeers {
    fn on_peer(&self, _: Ipv4Addr, _: bool, _: Transport, _: Option<Ipv4Addr>) {}
}

#[tokio::test]
async fn context_carries_the_configured_group() {
    let mut config = Config::default();
    config.multicast_group = Ipv4Addr::new(239, 7, 7, 7);
    let ctx = Context::with_config(config, Arc::new(NullMessages), Arc::new(NullPeers));
    // join_default_group targets exactly this address
    assert_eq!(ctx.default_group(), Ipv4Addr::new(239, 7, 7, 7));
    assert_eq!(ctx.config().multicast_group, Ipv4Addr::new(239, 7, 7, 7));
}

#[test]
fn config_serializes_round_trip() {
    let config = Config::default();
    let json = serde_json::to_string(&config).unwrap();
    let back: Config = serde_json::from_str(&json).unwrap();
    assert_eq!(back.udp_port, config.udp_port);
    assert_eq!(back.multicast_group, config.multicast_group);
}
