pub mod blocklist;
pub mod broadcast;
pub mod dedup;
pub mod discovery;
pub mod dispatch;
pub mod multicast;
pub mod proto;

pub use blocklist::Blocklist;
pub use broadcast::BroadcastService;
pub use dedup::RecentMessageCache;
pub use discovery::PeerDiscoveryService;
pub use dispatch::ChatEngine;
pub use multicast::MulticastService;
pub use proto::Message;

use std::net::Ipv4Addr;

/// Which transport a packet arrived on. Presence is tracked separately per
/// transport, since being reachable on one says nothing about the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::IntoStaticStr)]
pub enum Transport {
    Broadcast,
    Multicast,
}

/// Internal sink the transports hand decoded packets to, invoked
/// synchronously from the receive task.
pub trait PacketSink: Send + Sync {
    fn on_packet(&self, transport: Transport, src: Ipv4Addr, msg: Message, group: Option<Ipv4Addr>);
}
