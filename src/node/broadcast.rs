//! Best-effort fan-out to every listener on the local broadcast domain.
//!
//! One socket receives on the fixed port on all interfaces; a second socket,
//! bound to the selected interface's address, sends to the interface's
//! directed-broadcast address and to 255.255.255.255 as fallback for
//! interfaces whose broadcast address could not be determined.

use crate::config::{IfaceInfo, RECV_BUFFER_SIZE};
use crate::metrics::METRICS;
use crate::node::{proto, PacketSink, Transport};
use crate::utils::misc::Typename;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub const LIMITED_BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

#[derive(Debug, thiserror::Error, strum_macros::IntoStaticStr)]
pub enum Error {
    #[error("broadcast service is not started")]
    NotStarted,
    #[error("broadcast service is already started")]
    AlreadyStarted,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Typename for Error {
    fn typename(&self) -> &'static str {
        self.into()
    }
}

struct Running {
    send_socket: Arc<UdpSocket>,
    shutdown: watch::Sender<bool>,
    recv_task: JoinHandle<()>,
}

pub struct BroadcastService {
    port: u16,
    iface: IfaceInfo,
    sink: Arc<dyn PacketSink>,
    running: Mutex<Option<Running>>,
}

impl BroadcastService {
    pub fn new(port: u16, iface: IfaceInfo, sink: Arc<dyn PacketSink>) -> Self {
        Self { port, iface, sink, running: Mutex::new(None) }
    }

    /// Bind both sockets and spawn the receive loop. Bind failure is fatal:
    /// the service cannot operate without its sockets, and retry policy
    /// belongs to the caller.
    pub async fn start(&self) -> Result<(), Error> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let recv_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        let send_socket = UdpSocket::bind((self.iface.local_addr, 0)).await?;
        send_socket.set_broadcast(true)?;
        info!("broadcast service listening on port {}, sending via {}", self.port, self.iface.local_addr);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sink = Arc::clone(&self.sink);
        let recv_task = tokio::spawn(recv_loop(recv_socket, sink, shutdown_rx));

        *running = Some(Running { send_socket: Arc::new(send_socket), shutdown, recv_task });
        Ok(())
    }

    /// Encode once and transmit to the directed-broadcast address (when
    /// known) and to the limited-broadcast address, unless the two coincide.
    pub async fn send(&self, msg_type: &str, headers: &HashMap<String, String>, payload: &str) -> Result<(), Error> {
        let running = self.running.lock().await;
        let running = running.as_ref().ok_or(Error::NotStarted)?;
        let data = proto::encode(msg_type, headers, payload);

        if let Some(directed) = self.iface.broadcast_addr {
            running.send_socket.send_to(&data, SocketAddrV4::new(directed, self.port)).await?;
        }
        if self.iface.broadcast_addr != Some(LIMITED_BROADCAST_ADDR) {
            running.send_socket.send_to(&data, SocketAddrV4::new(LIMITED_BROADCAST_ADDR, self.port)).await?;
        }
        Ok(())
    }

    /// Idempotent: stopping a stopped service is a no-op.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(running) = running.take() {
            let _ = running.shutdown.send(true);
            let _ = running.recv_task.await;
            info!("broadcast service stopped");
        }
    }

    pub async fn is_started(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

async fn recv_loop(socket: UdpSocket, sink: Arc<dyn PacketSink>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok((len, src)) => {
                    let IpAddr::V4(ip) = src.ip() else { continue };
                    handle_datagram(&sink, ip, &buf[..len]);
                }
                Err(e) => {
                    // transient receive errors keep the loop alive; only a
                    // deliberate stop ends it
                    error!("broadcast receive error: {}", e);
                }
            }
        }
    }
}

fn handle_datagram(sink: &Arc<dyn PacketSink>, src: Ipv4Addr, data: &[u8]) {
    METRICS.add_udp_packet(Transport::Broadcast, data.len());
    match proto::decode(data) {
        Ok(msg) => sink.on_packet(Transport::Broadcast, src, msg, None),
        Err(e) => {
            METRICS.add_error(&e);
            debug!("dropping undecodable broadcast datagram from {}: {}", src, e);
        }
    }
}
