//! Inbound message dispatch and the group moderation overlay.
//!
//! Every decoded packet from either transport funnels through [`ChatEngine`]:
//! own-packet filtering, duplicate suppression, liveness recording, mode and
//! group scoping, host identification, blocklist and ban enforcement, and
//! application of host ban/unban commands. Whatever survives is handed to
//! the registered [`MessageListener`]; the listener interprets message types
//! itself.
//!
//! Moderation trust is bootstrapped from the `host` header: each member
//! trusts whichever address it first saw claiming `host=1` in the current
//! group session. There is no dispute or re-election mechanism; when two
//! peers both claim the role, members can end up trusting different hosts.
//! That is a known limitation of the protocol, preserved as-is.

use crate::config::Config;
use crate::metrics::METRICS;
use crate::node::discovery::{ModeSelector, NicknameSupplier, PeerDiscoveryService};
use crate::node::{
    proto, Blocklist, BroadcastService, Message, MulticastService, PacketSink, RecentMessageCache, Transport,
};
use crate::utils::misc::{get_unix_millis_now, Typename};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error, strum_macros::IntoStaticStr)]
pub enum Error {
    #[error("only the group host may moderate")]
    NotHost,
    #[error("cannot ban your own address")]
    BanSelf,
    #[error("cannot block your own address")]
    BlockSelf,
    #[error("you are muted by the group host")]
    MutedByHost,
    #[error("engine has no transports attached")]
    NotReady,
    #[error(transparent)]
    Broadcast(#[from] crate::node::broadcast::Error),
    #[error(transparent)]
    Multicast(#[from] crate::node::multicast::Error),
}

impl Typename for Error {
    fn typename(&self) -> &'static str {
        self.into()
    }
}

/// The sole channel by which the consuming layer learns about inbound
/// traffic, invoked synchronously from the receive task. The consumer is
/// responsible for any thread hand-off it needs.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, transport: Transport, src: Ipv4Addr, msg: &Message, group: Option<Ipv4Addr>);
}

struct Services {
    bcast: Arc<BroadcastService>,
    mcast: Arc<MulticastService>,
    discovery: Arc<PeerDiscoveryService>,
}

pub struct ChatEngine {
    local_addr: Ipv4Addr,
    mode: Arc<dyn ModeSelector>,
    listener: Arc<dyn MessageListener>,
    nickname: NicknameSupplier,

    blocklist: Blocklist,
    dedup: RecentMessageCache,
    nicknames: scc::HashMap<Ipv4Addr, String>,

    // moderation state, scoped to one group session
    bans: scc::HashSet<Ipv4Addr>,
    host_ip: Mutex<Option<Ipv4Addr>>,
    muted_by_host: AtomicBool,

    services: OnceCell<Services>,
}

impl ChatEngine {
    pub fn new(
        config: &Config,
        local_addr: Ipv4Addr,
        mode: Arc<dyn ModeSelector>,
        listener: Arc<dyn MessageListener>,
        nickname: NicknameSupplier,
    ) -> Self {
        Self {
            local_addr,
            mode,
            listener,
            nickname,
            blocklist: Blocklist::new(),
            dedup: RecentMessageCache::new(config.dedup_capacity, config.dedup_ttl_ms),
            nicknames: scc::HashMap::new(),
            bans: scc::HashSet::new(),
            host_ip: Mutex::new(None),
            muted_by_host: AtomicBool::new(false),
            services: OnceCell::new(),
        }
    }

    /// Wire the transports and the discovery service in after construction;
    /// they need the engine as their packet sink, so they cannot exist
    /// before it.
    pub fn attach(
        &self,
        bcast: Arc<BroadcastService>,
        mcast: Arc<MulticastService>,
        discovery: Arc<PeerDiscoveryService>,
    ) {
        let _ = self.services.set(Services { bcast, mcast, discovery });
    }

    fn services(&self) -> Result<&Services, Error> {
        self.services.get().ok_or(Error::NotReady)
    }

    // --- outbound ---

    /// Send a chat message. On multicast this requires a joined group and a
    /// sender not muted by the host; both are usage errors, not network
    /// conditions. Blank text is silently ignored.
    pub async fn send_chat(&self, transport: Transport, text: &str) -> Result<(), Error> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let services = self.services()?;

        let mut headers = HashMap::new();
        headers.insert(proto::H_ID.to_string(), proto::next_message_id());
        headers.insert(proto::H_TS.to_string(), get_unix_millis_now().to_string());
        let nick = (self.nickname)();
        if !nick.trim().is_empty() {
            headers.insert(proto::H_NICK.to_string(), nick);
        }

        match transport {
            Transport::Broadcast => services.bcast.send(proto::TYPE_CHAT, &headers, text).await?,
            Transport::Multicast => {
                if self.is_muted() {
                    return Err(Error::MutedByHost);
                }
                services.mcast.send(proto::TYPE_CHAT, &headers, text).await?;
            }
        }
        Ok(())
    }

    pub async fn send_ban(&self, target: Ipv4Addr) -> Result<(), Error> {
        self.send_moderation(true, target).await
    }

    pub async fn send_unban(&self, target: Ipv4Addr) -> Result<(), Error> {
        self.send_moderation(false, target).await
    }

    /// Only the declared local host may originate ban/unban commands, and
    /// never against itself. Both violations are rejected here, before any
    /// packet leaves.
    async fn send_moderation(&self, ban: bool, target: Ipv4Addr) -> Result<(), Error> {
        let services = self.services()?;
        if !services.mcast.is_host() {
            return Err(Error::NotHost);
        }
        if target == self.local_addr {
            return Err(Error::BanSelf);
        }

        let mut headers = HashMap::new();
        headers.insert(proto::H_ID.to_string(), proto::next_message_id());
        headers.insert(proto::H_TARGET.to_string(), target.to_string());
        let msg_type = if ban { proto::TYPE_MBLOCK } else { proto::TYPE_MUNBLOCK };
        services.mcast.send(msg_type, &headers, "").await?;

        // loopback delivery is off, so apply locally like every other member
        if ban {
            let _ = self.bans.insert(target);
        } else {
            let _ = self.bans.remove(&target);
        }
        Ok(())
    }

    // --- group session lifecycle ---

    /// Join (or switch to) `group` and reset all session-scoped moderation
    /// state: the ban set and host identity belong to exactly one group
    /// membership session.
    pub async fn join_group(&self, group: Ipv4Addr) -> Result<(), Error> {
        let services = self.services()?;
        services.mcast.switch_group(group).await?;
        self.reset_session();
        if services.mcast.is_host() {
            // the local host trusts itself from the start
            *self.host_ip.lock().expect("host lock") = Some(self.local_addr);
        }
        Ok(())
    }

    pub async fn leave_group(&self) -> Result<(), Error> {
        let services = self.services()?;
        services.mcast.leave().await;
        self.reset_session();
        Ok(())
    }

    fn reset_session(&self) {
        self.bans.clear();
        *self.host_ip.lock().expect("host lock") = None;
        self.muted_by_host.store(false, Ordering::Release);
    }

    // --- local blocklist ---

    pub fn block(&self, ip: Ipv4Addr) -> Result<(), Error> {
        if ip == self.local_addr {
            return Err(Error::BlockSelf);
        }
        self.blocklist.block(ip);
        Ok(())
    }

    pub fn unblock(&self, ip: Ipv4Addr) {
        self.blocklist.unblock(ip);
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    // --- session state accessors ---

    pub fn is_muted(&self) -> bool {
        self.muted_by_host.load(Ordering::Acquire)
    }

    pub fn group_host(&self) -> Option<Ipv4Addr> {
        *self.host_ip.lock().expect("host lock")
    }

    pub fn banned_snapshot(&self) -> Vec<Ipv4Addr> {
        let mut ips = Vec::new();
        self.bans.scan(|ip| ips.push(*ip));
        ips.sort_unstable_by_key(|ip| ip.octets());
        ips
    }

    pub fn is_banned(&self, ip: Ipv4Addr) -> bool {
        self.bans.contains(&ip)
    }

    pub fn nickname_of(&self, ip: Ipv4Addr) -> Option<String> {
        self.nicknames.read(&ip, |_, nick| nick.clone())
    }

    /// Drop the stored nickname for a departed peer so the registry does
    /// not grow without bound. Re-learned from the next message.
    pub fn forget_nickname(&self, ip: Ipv4Addr) {
        let _ = self.nicknames.remove(&ip);
    }

    // --- inbound pipeline ---

    fn apply_moderation(&self, src: Ipv4Addr, msg: &Message) -> bool {
        // accept only from the established host of this session; anything
        // else is expected steady-state filtering, not an error
        if self.group_host() != Some(src) {
            debug!("ignoring {} from {} without host trust", msg.msg_type, src);
            return false;
        }
        let Some(target) = msg.header(proto::H_TARGET).and_then(|t| t.parse::<Ipv4Addr>().ok()) else {
            return false;
        };
        let is_ban = msg.msg_type == proto::TYPE_MBLOCK;
        if is_ban {
            let _ = self.bans.insert(target);
        } else {
            let _ = self.bans.remove(&target);
        }
        if target == self.local_addr {
            // gates local sending only; receiving is unaffected
            self.muted_by_host.store(is_ban, Ordering::Release);
            info!("{} by the group host", if is_ban { "muted" } else { "unmuted" });
        }
        true
    }
}

impl PacketSink for ChatEngine {
    fn on_packet(&self, transport: Transport, src: Ipv4Addr, msg: Message, group: Option<Ipv4Addr>) {
        // own packets come back via the limited-broadcast fallback
        if src == self.local_addr {
            return;
        }
        if self.dedup.is_duplicate_and_record(msg.id().unwrap_or("")) {
            return;
        }

        // any valid traffic refreshes liveness, not only HELLO
        if let Some(services) = self.services.get() {
            services.discovery.record_activity(transport, src);
        }
        if let Some(nick) = msg.header(proto::H_NICK) {
            if !nick.trim().is_empty() {
                let nick = nick.to_string();
                if self.nicknames.insert(src, nick.clone()).is_err() {
                    let _ = self.nicknames.update(&src, |_, v| *v = nick);
                }
            }
        }

        // mode-appropriate packets only
        match transport {
            Transport::Broadcast if !self.mode.use_broadcast() => return,
            Transport::Multicast if self.mode.use_broadcast() => return,
            _ => {}
        }
        // group scoping: a multicast packet must carry the joined group
        if transport == Transport::Multicast {
            if let Some(joined) = group {
                if msg.header(proto::H_GROUP) != Some(joined.to_string().as_str()) {
                    return;
                }
            }
        }

        // first-claimant host identity, fixed for the session
        if msg.header(proto::H_HOST) == Some("1") {
            let mut host = self.host_ip.lock().expect("host lock");
            if host.is_none() {
                *host = Some(src);
                info!("group host identified: {}", src);
            }
        }

        if self.blocklist.is_blocked(src) && msg.msg_type == proto::TYPE_CHAT {
            return;
        }

        match msg.msg_type.as_str() {
            proto::TYPE_CHAT => {
                // host bans are enforced independently on every receiver
                if transport == Transport::Multicast && self.is_banned(src) {
                    return;
                }
            }
            proto::TYPE_MBLOCK | proto::TYPE_MUNBLOCK => {
                if transport != Transport::Multicast || !self.apply_moderation(src, &msg) {
                    return;
                }
            }
            _ => {} // HELLO and unknown types pass through; the listener decides
        }

        METRICS.add_handled_type(&msg.msg_type);
        self.listener.on_message(transport, src, &msg, group);
    }
}
