//! Group-scoped fan-out with a join/leave lifecycle and a locally declared
//! "host" role.
//!
//! One joined group at a time. All mutators are serialized behind a single
//! mutex because join, leave and send all touch the one socket handle. The
//! `joined`/`host` flags and the TTL are mirrored in atomics so they can be
//! read from any thread without taking the session lock.

use crate::config::{IfaceInfo, RECV_BUFFER_SIZE};
use crate::metrics::METRICS;
use crate::node::{proto, PacketSink, Transport};
use crate::utils::misc::Typename;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const MIN_TTL: u32 = 1;
pub const MAX_TTL: u32 = 32;

#[derive(Debug, thiserror::Error, strum_macros::IntoStaticStr)]
pub enum Error {
    #[error("not joined to a multicast group")]
    NotJoined,
    #[error("already joined to group {0}")]
    AlreadyJoined(Ipv4Addr),
    #[error("{0} is not a multicast address")]
    NotMulticastAddr(Ipv4Addr),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Typename for Error {
    fn typename(&self) -> &'static str {
        self.into()
    }
}

struct Session {
    socket: Arc<UdpSocket>,
    group: Ipv4Addr,
    shutdown: watch::Sender<bool>,
    recv_task: JoinHandle<()>,
}

pub struct MulticastService {
    port: u16,
    iface: IfaceInfo,
    sink: Arc<dyn PacketSink>,
    session: Mutex<Option<Session>>,
    // cross-thread mirrors of session state, documented visibility:
    // written under the session lock, readable anywhere
    joined: AtomicBool,
    host: AtomicBool,
    ttl: AtomicU32,
    group: RwLock<Option<Ipv4Addr>>,
}

impl MulticastService {
    pub fn new(port: u16, iface: IfaceInfo, sink: Arc<dyn PacketSink>) -> Self {
        Self {
            port,
            iface,
            sink,
            session: Mutex::new(None),
            joined: AtomicBool::new(false),
            host: AtomicBool::new(false),
            ttl: AtomicU32::new(MIN_TTL),
            group: RwLock::new(None),
        }
    }

    /// Declare or revoke the local host role. Nobody is notified: the flag
    /// is only observed through the `host` header on subsequent sends.
    pub fn configure_host(&self, is_host: bool) {
        self.host.store(is_host, Ordering::Release);
    }

    pub fn is_host(&self) -> bool {
        self.host.load(Ordering::Acquire)
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }

    pub fn current_group(&self) -> Option<Ipv4Addr> {
        *self.group.read().expect("group lock")
    }

    /// Clamp and store the outgoing TTL, applying it live to an open socket
    /// when possible. Failure to apply is non-fatal: the socket keeps its
    /// previous TTL.
    pub async fn set_ttl(&self, ttl: u32) {
        let ttl = ttl.clamp(MIN_TTL, MAX_TTL);
        self.ttl.store(ttl, Ordering::Release);
        let session = self.session.lock().await;
        if let Some(session) = session.as_ref() {
            if let Err(e) = session.socket.set_multicast_ttl_v4(ttl) {
                warn!("could not apply ttl {} to open multicast socket: {}", ttl, e);
            }
        }
    }

    pub fn ttl(&self) -> u32 {
        self.ttl.load(Ordering::Acquire)
    }

    /// Join `group` on the configured interface. Fails when already joined
    /// (use [`switch_group`](Self::switch_group) to move between groups) and
    /// when the socket cannot be set up, in which case the service stays in
    /// the Left state.
    pub async fn join(&self, group: Ipv4Addr) -> Result<(), Error> {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            if current.group == group {
                return Ok(());
            }
            return Err(Error::AlreadyJoined(current.group));
        }
        self.join_locked(&mut session, group).await
    }

    /// Leave the current group then join `new_group`; a no-op when already
    /// joined to the requested group.
    pub async fn switch_group(&self, new_group: Ipv4Addr) -> Result<(), Error> {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            if current.group == new_group {
                return Ok(());
            }
            self.leave_locked(&mut session).await;
        }
        self.join_locked(&mut session, new_group).await
    }

    /// Leave the joined group. A no-op when not joined.
    pub async fn leave(&self) {
        let mut session = self.session.lock().await;
        if session.is_some() {
            self.leave_locked(&mut session).await;
        }
    }

    async fn join_locked(&self, session: &mut Option<Session>, group: Ipv4Addr) -> Result<(), Error> {
        if !group.is_multicast() {
            return Err(Error::NotMulticastAddr(group));
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        socket.set_multicast_loop_v4(false)?;
        socket.set_multicast_ttl_v4(self.ttl())?;
        socket.join_multicast_v4(group, self.iface.local_addr)?;
        info!("joined multicast group {}:{} via {}", group, self.port, self.iface.local_addr);

        let socket = Arc::new(socket);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let sink = Arc::clone(&self.sink);
        let recv_task = tokio::spawn(recv_loop(Arc::clone(&socket), group, sink, shutdown_rx));

        *session = Some(Session { socket, group, shutdown, recv_task });
        *self.group.write().expect("group lock") = Some(group);
        self.joined.store(true, Ordering::Release);
        Ok(())
    }

    async fn leave_locked(&self, session: &mut Option<Session>) {
        let Some(session) = session.take() else { return };
        self.joined.store(false, Ordering::Release);
        *self.group.write().expect("group lock") = None;

        if let Err(e) = session.socket.leave_multicast_v4(session.group, self.iface.local_addr) {
            error!("error leaving multicast group {}: {}", session.group, e);
        }
        let _ = session.shutdown.send(true);
        let _ = session.recv_task.await;
        info!("left multicast group {}", session.group);
    }

    /// Send into the joined group. Every send is stamped with the `grp`
    /// header; `host=1` is added iff the local host flag is set, which is
    /// how peers learn whom to trust for moderation commands.
    pub async fn send(&self, msg_type: &str, headers: &HashMap<String, String>, payload: &str) -> Result<(), Error> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(Error::NotJoined)?;

        let mut headers = headers.clone();
        headers.insert(proto::H_GROUP.to_string(), session.group.to_string());
        if self.is_host() {
            headers.insert(proto::H_HOST.to_string(), "1".to_string());
        }

        let data = proto::encode(msg_type, &headers, payload);
        session.socket.send_to(&data, SocketAddrV4::new(session.group, self.port)).await?;
        Ok(())
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    group: Ipv4Addr,
    sink: Arc<dyn PacketSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok((len, src)) => {
                    let IpAddr::V4(ip) = src.ip() else { continue };
                    METRICS.add_udp_packet(Transport::Multicast, len);
                    match proto::decode(&buf[..len]) {
                        Ok(msg) => sink.on_packet(Transport::Multicast, ip, msg, Some(group)),
                        Err(e) => {
                            METRICS.add_error(&e);
                            debug!("dropping undecodable multicast datagram from {}: {}", ip, e);
                        }
                    }
                }
                Err(e) => {
                    error!("multicast receive error: {}", e);
                }
            }
        }
    }
}
