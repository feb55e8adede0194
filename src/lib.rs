use crate::config::{Config, IfaceInfo};
use crate::node::discovery::{ModeSelector, NicknameSupplier, PeerListener};
use crate::node::dispatch::MessageListener;
use crate::node::{BroadcastService, ChatEngine, MulticastService, PeerDiscoveryService, Transport};
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

pub mod config;
pub mod metrics;
pub mod node;
pub mod utils;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Broadcast(#[from] node::broadcast::Error),
    #[error(transparent)]
    Multicast(#[from] node::multicast::Error),
    #[error(transparent)]
    Engine(#[from] node::dispatch::Error),
}

/// Which transport outbound chat and presence use. Multicast mode requires
/// a joined group on top of the mode switch; the two are independent knobs.
struct ModePolicy {
    broadcast: AtomicBool,
    mcast: OnceCell<Arc<MulticastService>>,
}

impl ModeSelector for ModePolicy {
    fn use_broadcast(&self) -> bool {
        self.broadcast.load(Ordering::Acquire)
    }

    fn use_multicast(&self) -> bool {
        !self.use_broadcast()
    }

    fn current_group(&self) -> Option<Ipv4Addr> {
        self.mcast.get().and_then(|m| m.current_group())
    }
}

/// Forwards peer events to the consumer and drops a departed peer's
/// nickname once it is gone from both transports.
struct NicknameReaper {
    engine: Arc<ChatEngine>,
    discovery: OnceCell<Arc<PeerDiscoveryService>>,
    inner: Arc<dyn PeerListener>,
}

impl PeerListener for NicknameReaper {
    fn on_peer(&self, ip: Ipv4Addr, added: bool, transport: Transport, group: Option<Ipv4Addr>) {
        if !added {
            // removal fires after the map update, so is_live reflects the
            // other transport only
            if let Some(discovery) = self.discovery.get() {
                if !discovery.is_live(ip) {
                    self.engine.forget_nickname(ip);
                }
            }
        }
        self.inner.on_peer(ip, added, transport, group);
    }
}

/// Everything a running chat node is made of, wired together. The caller
/// provides the two callbacks (inbound messages, peer appearance changes)
/// and drives the lifecycle with [`start`](Self::start) and
/// [`stop`](Self::stop).
pub struct Context {
    config: Config,
    iface: IfaceInfo,
    nickname: Arc<RwLock<String>>,
    mode: Arc<ModePolicy>,
    engine: Arc<ChatEngine>,
    bcast: Arc<BroadcastService>,
    mcast: Arc<MulticastService>,
    discovery: Arc<PeerDiscoveryService>,
}

impl Context {
    pub fn new(listener: Arc<dyn MessageListener>, peer_listener: Arc<dyn PeerListener>) -> Self {
        Self::with_config(Config::from_env(), listener, peer_listener)
    }

    pub fn with_config(
        config: Config,
        listener: Arc<dyn MessageListener>,
        peer_listener: Arc<dyn PeerListener>,
    ) -> Self {
        let iface = utils::misc::detect_iface();
        let nickname = Arc::new(RwLock::new(config.nickname.clone()));
        let nick_supplier: NicknameSupplier = {
            let nickname = Arc::clone(&nickname);
            Arc::new(move || nickname.read().expect("nickname lock").clone())
        };
        let mode = Arc::new(ModePolicy { broadcast: AtomicBool::new(true), mcast: OnceCell::new() });

        let engine = Arc::new(ChatEngine::new(
            &config,
            iface.local_addr,
            Arc::clone(&mode) as Arc<dyn ModeSelector>,
            listener,
            Arc::clone(&nick_supplier),
        ));
        let sink = Arc::clone(&engine) as Arc<dyn node::PacketSink>;
        let bcast = Arc::new(BroadcastService::new(config.udp_port, iface, Arc::clone(&sink)));
        let mcast = Arc::new(MulticastService::new(config.udp_port, iface, sink));
        let _ = mode.mcast.set(Arc::clone(&mcast));
        let reaper = Arc::new(NicknameReaper {
            engine: Arc::clone(&engine),
            discovery: OnceCell::new(),
            inner: peer_listener,
        });
        let discovery = Arc::new(PeerDiscoveryService::new(
            Arc::clone(&bcast),
            Arc::clone(&mcast),
            nick_supplier,
            config.announce_interval_ms,
            Arc::clone(&reaper) as Arc<dyn PeerListener>,
            Arc::clone(&mode) as Arc<dyn ModeSelector>,
        ));
        let _ = reaper.discovery.set(Arc::clone(&discovery));
        engine.attach(Arc::clone(&bcast), Arc::clone(&mcast), Arc::clone(&discovery));

        Self { config, iface, nickname, mode, engine, bcast, mcast, discovery }
    }

    /// Bring the broadcast transport and discovery up. Multicast stays down
    /// until a group is joined.
    pub async fn start(&self) -> Result<(), Error> {
        self.bcast.start().await?;
        self.mcast.set_ttl(self.config.multicast_ttl).await;
        self.discovery.start();
        Ok(())
    }

    pub async fn stop(&self) {
        self.discovery.stop();
        let _ = self.engine.leave_group().await;
        self.bcast.stop().await;
    }

    // --- chat operations, routed by the current mode ---

    pub async fn send_chat(&self, text: &str) -> Result<(), Error> {
        let transport =
            if self.mode.use_broadcast() { Transport::Broadcast } else { Transport::Multicast };
        self.engine.send_chat(transport, text).await?;
        Ok(())
    }

    pub async fn join_group(&self, group: Ipv4Addr) -> Result<(), Error> {
        self.engine.join_group(group).await?;
        self.set_mode(Transport::Multicast);
        Ok(())
    }

    /// Join the configured group (`LANCHAT_GROUP` or the compiled default).
    pub async fn join_default_group(&self) -> Result<(), Error> {
        self.join_group(self.config.multicast_group).await
    }

    pub async fn leave_group(&self) -> Result<(), Error> {
        self.engine.leave_group().await?;
        self.set_mode(Transport::Broadcast);
        Ok(())
    }

    pub async fn ban(&self, target: Ipv4Addr) -> Result<(), Error> {
        self.engine.send_ban(target).await?;
        Ok(())
    }

    pub async fn unban(&self, target: Ipv4Addr) -> Result<(), Error> {
        self.engine.send_unban(target).await?;
        Ok(())
    }

    // --- knobs ---

    pub fn set_mode(&self, transport: Transport) {
        self.mode.broadcast.store(transport == Transport::Broadcast, Ordering::Release);
    }

    pub fn set_nickname(&self, nick: &str) {
        *self.nickname.write().expect("nickname lock") = nick.to_string();
    }

    pub fn nickname(&self) -> String {
        self.nickname.read().expect("nickname lock").clone()
    }

    pub fn set_host(&self, is_host: bool) {
        self.mcast.configure_host(is_host);
    }

    pub async fn set_ttl(&self, ttl: u32) {
        self.mcast.set_ttl(ttl).await;
    }

    // --- introspection ---

    pub fn local_addr(&self) -> Ipv4Addr {
        self.iface.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn default_group(&self) -> Ipv4Addr {
        self.config.multicast_group
    }

    pub fn engine(&self) -> &Arc<ChatEngine> {
        &self.engine
    }

    pub fn multicast(&self) -> &Arc<MulticastService> {
        &self.mcast
    }

    pub fn peers(&self) -> Vec<String> {
        self.discovery.snapshot_all_peers()
    }

    pub fn get_json_metrics(&self) -> Value {
        metrics::METRICS.get_json()
    }
}
