//! Presence advertisement and liveness tracking, independent per transport.
//!
//! A single background task drives two timers: periodic HELLO announcements
//! and a faster expiry sweep. Announcements are spawned off the timer task
//! so a slow send can never delay the sweep. Any valid inbound message
//! refreshes a peer's liveness, not only presence announcements.

use crate::config::EXPIRY_SWEEP_MS;
use crate::node::{proto, BroadcastService, MulticastService, Transport};
use crate::utils::misc::get_unix_millis_now;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

/// Floor of the liveness window, regardless of how short the announcement
/// period is configured.
pub const MIN_EXPIRY_MS: u64 = 10_000;

/// Policy queries that steer where announcements go. The discovery service
/// knows nothing about UI mode or join state; the caller answers for it.
pub trait ModeSelector: Send + Sync {
    fn use_broadcast(&self) -> bool;
    fn use_multicast(&self) -> bool;
    fn current_group(&self) -> Option<Ipv4Addr>;
}

pub trait PeerListener: Send + Sync {
    fn on_peer(&self, ip: Ipv4Addr, added: bool, transport: Transport, group: Option<Ipv4Addr>);
}

/// Read-on-demand nickname accessor; the nickname may change between
/// announcements.
pub type NicknameSupplier = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct SeenRecord {
    last_seen: u64,
    group: Option<Ipv4Addr>,
}

pub struct PeerDiscoveryService {
    bcast: Arc<BroadcastService>,
    mcast: Arc<MulticastService>,
    nickname: NicknameSupplier,
    announce_interval: Duration,
    listener: Arc<dyn PeerListener>,
    mode: Arc<dyn ModeSelector>,

    broadcast_peers: scc::HashMap<Ipv4Addr, SeenRecord>,
    multicast_peers: scc::HashMap<Ipv4Addr, SeenRecord>,

    timer_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerDiscoveryService {
    pub fn new(
        bcast: Arc<BroadcastService>,
        mcast: Arc<MulticastService>,
        nickname: NicknameSupplier,
        announce_interval_ms: u64,
        listener: Arc<dyn PeerListener>,
        mode: Arc<dyn ModeSelector>,
    ) -> Self {
        Self {
            bcast,
            mcast,
            nickname,
            announce_interval: Duration::from_millis(announce_interval_ms.max(1)),
            listener,
            mode,
            broadcast_peers: scc::HashMap::new(),
            multicast_peers: scc::HashMap::new(),
            timer_task: Mutex::new(None),
        }
    }

    /// Emit one announcement immediately, then announce on the configured
    /// period and sweep for expired peers every second.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.timer_task.lock().expect("timer lock");
        if task.is_some() {
            return;
        }
        let svc = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut announce = interval(svc.announce_interval);
            let mut sweep = interval(Duration::from_millis(EXPIRY_SWEEP_MS));
            loop {
                tokio::select! {
                    _ = announce.tick() => {
                        // spawned so an IO stall cannot delay the sweep tick
                        let svc = Arc::clone(&svc);
                        tokio::spawn(async move { svc.announce().await });
                    }
                    _ = sweep.tick() => {
                        svc.sweep_at(get_unix_millis_now());
                    }
                }
            }
        }));
    }

    /// Cancel all scheduled activity. Safe to call without `start()`.
    pub fn stop(&self) {
        if let Some(task) = self.timer_task.lock().expect("timer lock").take() {
            task.abort();
        }
    }

    async fn announce(&self) {
        let mut headers = HashMap::new();
        headers.insert(proto::H_ID.to_string(), proto::next_message_id());
        let nick = (self.nickname)();
        if !nick.trim().is_empty() {
            headers.insert(proto::H_NICK.to_string(), nick);
        }

        if self.mode.use_broadcast() {
            if let Err(e) = self.bcast.send(proto::TYPE_HELLO, &headers, "").await {
                warn!("failed to send broadcast presence: {}", e);
            }
        }
        if self.mode.use_multicast() && self.mcast.is_joined() {
            // the multicast service stamps the grp header itself
            if let Err(e) = self.mcast.send(proto::TYPE_HELLO, &headers, "").await {
                warn!("failed to send multicast presence: {}", e);
            }
        }
    }

    /// Refresh liveness of `ip` on `transport`. Called from the dispatch
    /// path for every valid inbound message. The first observation per
    /// transport notifies the peer listener.
    pub fn record_activity(&self, transport: Transport, ip: Ipv4Addr) {
        self.record_activity_at(transport, ip, get_unix_millis_now());
    }

    fn record_activity_at(&self, transport: Transport, ip: Ipv4Addr, now: u64) {
        let group = match transport {
            Transport::Multicast => self.mode.current_group(),
            Transport::Broadcast => None,
        };
        let record = SeenRecord { last_seen: now, group };
        let is_new = self.peers(transport).insert(ip, record).is_ok();
        if is_new {
            debug!("peer {} appeared on {:?}", ip, transport);
            self.listener.on_peer(ip, true, transport, group);
        } else {
            let _ = self.peers(transport).update(&ip, |_, r| *r = record);
        }
    }

    fn peers(&self, transport: Transport) -> &scc::HashMap<Ipv4Addr, SeenRecord> {
        match transport {
            Transport::Broadcast => &self.broadcast_peers,
            Transport::Multicast => &self.multicast_peers,
        }
    }

    fn expiry_window_ms(&self) -> u64 {
        MIN_EXPIRY_MS.max(self.announce_interval.as_millis() as u64 * 5)
    }

    fn sweep_at(&self, now: u64) {
        let window = self.expiry_window_ms();
        for transport in [Transport::Broadcast, Transport::Multicast] {
            let mut expired = Vec::new();
            self.peers(transport).scan(|ip, record| {
                if now.saturating_sub(record.last_seen) > window {
                    expired.push((*ip, record.group));
                }
            });
            for (ip, group) in expired {
                if self.peers(transport).remove(&ip).is_some() {
                    debug!("peer {} expired on {:?}", ip, transport);
                    self.listener.on_peer(ip, false, transport, group);
                }
            }
        }
    }

    /// True while `ip` is live on at least one transport.
    pub fn is_live(&self, ip: Ipv4Addr) -> bool {
        self.broadcast_peers.contains(&ip) || self.multicast_peers.contains(&ip)
    }

    /// Union of both transports' live peers, deduplicated and sorted by IP
    /// string for deterministic presentation.
    pub fn snapshot_all_peers(&self) -> Vec<String> {
        let mut all = std::collections::HashSet::new();
        self.broadcast_peers.scan(|ip, _| {
            all.insert(ip.to_string());
        });
        self.multicast_peers.scan(|ip, _| {
            all.insert(ip.to_string());
        });
        let mut sorted: Vec<String> = all.into_iter().collect();
        sorted.sort();
        sorted
    }
}
