use crate::node::Transport;
use crate::utils::misc::{get_unix_secs_now, Typename};
use once_cell::sync::Lazy;
use scc::ebr::Guard;
use scc::HashIndex;
use serde_json::Value;
use std::collections::HashMap as StdHashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

pub struct Metrics {
    broadcast_bytes: AtomicU64,
    broadcast_packets: AtomicU64,
    multicast_bytes: AtomicU64,
    multicast_packets: AtomicU64,

    // Dispatched message counters by type tag (dynamic)
    handled_types: HashIndex<String, Arc<AtomicU64>>,

    // Error counters by type name (dynamic)
    errors: HashIndex<String, Arc<AtomicU64>>,

    start_time: u64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            broadcast_bytes: AtomicU64::new(0),
            broadcast_packets: AtomicU64::new(0),
            multicast_bytes: AtomicU64::new(0),
            multicast_packets: AtomicU64::new(0),
            handled_types: HashIndex::new(),
            errors: HashIndex::new(),
            start_time: get_unix_secs_now(),
        }
    }

    /// Count one received datagram with its size.
    pub fn add_udp_packet(&self, transport: Transport, len: usize) {
        let (bytes, packets) = match transport {
            Transport::Broadcast => (&self.broadcast_bytes, &self.broadcast_packets),
            Transport::Multicast => (&self.multicast_bytes, &self.multicast_packets),
        };
        bytes.fetch_add(len as u64, Ordering::Relaxed);
        packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_handled_type(&self, type_tag: &str) {
        // correct way of handling ownership in scc HashIndex
        let tag_owned = type_tag.to_string();
        if let Some(counter) = self.handled_types.get(&tag_owned) {
            counter.fetch_add(1, Ordering::Relaxed);
        } else {
            let _ = self.handled_types.insert(tag_owned, Arc::new(AtomicU64::new(1)));
        }
    }

    /// Count an error by its type name. Counting only, no logging: the call
    /// site decides what is worth a log line.
    pub fn add_error<E: Debug + Typename>(&self, error: &E) {
        let name_owned = error.typename().to_string();
        if let Some(counter) = self.errors.get(&name_owned) {
            counter.fetch_add(1, Ordering::Relaxed);
        } else {
            let _ = self.errors.insert(name_owned, Arc::new(AtomicU64::new(1)));
        }
    }

    /// Get JSON-formatted metrics
    pub fn get_json(&self) -> Value {
        let guard = Guard::new();

        let mut handled = StdHashMap::new();
        let mut iter = self.handled_types.iter(&guard);
        while let Some((tag, counter)) = iter.next() {
            handled.insert(tag.clone(), counter.load(Ordering::Relaxed));
        }

        let mut errors = StdHashMap::new();
        let mut iter = self.errors.iter(&guard);
        while let Some((name, counter)) = iter.next() {
            errors.insert(name.clone(), counter.load(Ordering::Relaxed));
        }

        serde_json::json!({
            "handled_types": handled,
            "errors": errors,
            "packets": {
                "broadcast": {
                    "packets": self.broadcast_packets.load(Ordering::Relaxed),
                    "bytes": self.broadcast_bytes.load(Ordering::Relaxed),
                },
                "multicast": {
                    "packets": self.multicast_packets.load(Ordering::Relaxed),
                    "bytes": self.multicast_bytes.load(Ordering::Relaxed),
                },
            },
            "uptime": get_unix_secs_now() - self.start_time,
        })
    }
}
