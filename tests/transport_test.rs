use lanchat_core::config::{Config, IfaceInfo};
use lanchat_core::node::{proto, BroadcastService, Message, MulticastService, PacketSink, Transport};
use lanchat_core::Context;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

struct NullSink;
impl PacketSink for NullSink {
    fn on_packet(&self, _: Transport, _: Ipv4Addr, _: Message, _: Option<Ipv4Addr>) {}
}

fn loopback_iface() -> IfaceInfo {
    IfaceInfo { local_addr: Ipv4Addr::LOCALHOST, broadcast_addr: None }
}

#[tokio::test]
async fn broadcast_lifecycle_is_guarded() {
    // port 0: the receive socket gets an ephemeral port, good enough for
    // lifecycle checks without fighting over a fixed port in parallel tests
    let svc = BroadcastService::new(0, loopback_iface(), Arc::new(NullSink));
    assert!(!svc.is_started().await);

    let res = svc.send(proto::TYPE_CHAT, &HashMap::new(), "early").await;
    assert!(matches!(res, Err(lanchat_core::node::broadcast::Error::NotStarted)));

    svc.start().await.unwrap();
    assert!(svc.is_started().await);
    let res = svc.start().await;
    assert!(matches!(res, Err(lanchat_core::node::broadcast::Error::AlreadyStarted)));

    svc.stop().await;
    assert!(!svc.is_started().await);
    svc.stop().await; // idempotent

    // a stopped service can come back
    svc.start().await.unwrap();
    svc.stop().await;
}

#[tokio::test]
async fn multicast_stays_left_after_failed_join() {
    let svc = MulticastService::new(0, loopback_iface(), Arc::new(NullSink));
    assert!(svc.join(Ipv4Addr::new(192, 168, 1, 1)).await.is_err());
    assert!(!svc.is_joined());
    assert_eq!(svc.current_group(), None);
    let res = svc.send(proto::TYPE_CHAT, &HashMap::new(), "hi").await;
    assert!(matches!(res, Err(lanchat_core::node::multicast::Error::NotJoined)));
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
async fn context_wires_up_without_sockets() {
    let mut config = Config::default();
    config.nickname = "tester".to_string();
    let ctx = Context::with_config(config, Arc::new(NullMessages), Arc::new(NullPeers));

    assert_eq!(ctx.nickname(), "tester");
    ctx.set_nickname("renamed");
    assert_eq!(ctx.nickname(), "renamed");

    assert!(ctx.peers().is_empty());
    assert!(!ctx.engine().is_muted());

    // mode switching is independent of any socket state
    ctx.set_mode(Transport::Multicast);
    ctx.set_mode(Transport::Broadcast);

    let metrics = ctx.get_json_metrics();
    assert!(metrics.get("packets").is_some());

    // stop before start is safe
    ctx.stop().await;
}
