//! Statistics and metrics for the broker

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::protocol::ProtocolVersions;

/// Live counters shared by the server, connections and resend tasks
#[derive(Debug)]
pub struct BrokerStats {
    started_at: Instant,
    out_bytes: AtomicU64,
    out_messages: AtomicU64,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    /// Negotiated version pairs of connected clients
    versions: Mutex<HashMap<ProtocolVersions, u64>>,
    /// Start times of ongoing resends, keyed by resend id
    resends: Mutex<HashMap<u64, Instant>>,
}

/// Point-in-time copy of [`BrokerStats`]
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    /// Total connections ever
    pub total_connections: u64,
    /// Current active connections
    pub active_connections: u64,
    /// Total bytes sent to clients
    pub out_bytes: u64,
    /// Total frames sent to clients
    pub out_messages: u64,
    /// Resends currently streaming
    pub ongoing_resends: usize,
    /// Mean age of ongoing resends
    pub mean_resend_age: Duration,
    /// Clients per control/message version pair
    pub versions: Vec<(ProtocolVersions, u64)>,
    /// Uptime
    pub uptime: Duration,
}

impl BrokerStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            out_bytes: AtomicU64::new(0),
            out_messages: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            versions: Mutex::new(HashMap::new()),
            resends: Mutex::new(HashMap::new()),
        }
    }

    /// Record one outbound frame
    pub fn record_outbound(&self, bytes: usize) {
        self.out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.out_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self, versions: ProtocolVersions) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut map) = self.versions.lock() {
            *map.entry(versions).or_insert(0) += 1;
        }
    }

    pub fn connection_closed(&self, versions: ProtocolVersions) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if let Ok(mut map) = self.versions.lock() {
            if let Some(count) = map.get_mut(&versions) {
                *count -= 1;
                if *count == 0 {
                    map.remove(&versions);
                }
            }
        }
    }

    pub fn resend_started(&self, id: u64) {
        if let Ok(mut map) = self.resends.lock() {
            map.insert(id, Instant::now());
        }
    }

    pub fn resend_finished(&self, id: u64) {
        if let Ok(mut map) = self.resends.lock() {
            map.remove(&id);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let (ongoing_resends, mean_resend_age) = match self.resends.lock() {
            Ok(map) if !map.is_empty() => {
                let total: Duration = map.values().map(Instant::elapsed).sum();
                (map.len(), total / map.len() as u32)
            }
            _ => (0, Duration::ZERO),
        };

        let mut versions: Vec<_> = self
            .versions
            .lock()
            .map(|map| map.iter().map(|(v, n)| (*v, *n)).collect())
            .unwrap_or_default();
        versions.sort_by_key(|(v, _)| (v.control_layer, v.message_layer));

        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            out_messages: self.out_messages.load(Ordering::Relaxed),
            ongoing_resends,
            mean_resend_age,
            versions,
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Default for BrokerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSnapshot {
    /// Average outbound throughput since start, in bytes per second
    pub fn out_bytes_per_sec(&self) -> u64 {
        let secs = self.uptime.as_secs();
        if secs > 0 {
            self.out_bytes / secs
        } else {
            0
        }
    }
}
