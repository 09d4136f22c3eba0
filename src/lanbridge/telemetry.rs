use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

use crate::lanbridge::tunnel::relay::RelayStats;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// One bound tunnel as seen by the bind server.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub id: String,
    pub client_name: String,
    pub peer: String,
    pub public_addr: String,
    pub relay_addr: String,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, TunnelInfo>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
        }
    }

    pub fn add(&self, t: TunnelInfo) {
        self.tunnels.insert(t.id.clone(), t);
        metrics::gauge!("lanbridge_tunnels_active").set(self.tunnels.len() as f64);
    }

    pub fn remove(&self, id: &str) {
        self.tunnels.remove(id);
        metrics::gauge!("lanbridge_tunnels_active").set(self.tunnels.len() as f64);
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn snapshot(&self) -> Vec<TunnelInfo> {
        let mut out: Vec<TunnelInfo> = self.tunnels.iter().map(|t| t.value().clone()).collect();
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_tunnel_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("t{n}")
}

/// Counts one paired relay for as long as it lives.
pub struct ActiveRelayGuard;

impl ActiveRelayGuard {
    pub fn new() -> Self {
        metrics::counter!("lanbridge_relays_total").increment(1);
        metrics::gauge!("lanbridge_relays_active").increment(1.0);
        Self
    }
}

impl Drop for ActiveRelayGuard {
    fn drop(&mut self) {
        metrics::gauge!("lanbridge_relays_active").decrement(1.0);
    }
}

/// `role` is the side that observed the relay ("server", "agent", "client").
pub fn record_relay_bytes(role: &'static str, stats: &RelayStats) {
    metrics::counter!("lanbridge_relay_bytes_total", "role" => role, "direction" => "a_to_b")
        .increment(stats.a_to_b);
    metrics::counter!("lanbridge_relay_bytes_total", "role" => role, "direction" => "b_to_a")
        .increment(stats.b_to_a);
}

pub type SharedTunnels = Arc<TunnelRegistry>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, started: u64) -> TunnelInfo {
        TunnelInfo {
            id: id.into(),
            client_name: "agent".into(),
            peer: "10.0.0.2:50000".into(),
            public_addr: "0.0.0.0:8081".into(),
            relay_addr: "0.0.0.0:41000".into(),
            started_at_unix_ms: started,
        }
    }

    #[test]
    fn registry_snapshot_is_ordered_by_start() {
        let r = TunnelRegistry::new();
        r.add(info("t2", 20));
        r.add(info("t1", 10));
        let ids: Vec<_> = r.snapshot().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, ["t1", "t2"]);

        r.remove("t1");
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn tunnel_ids_are_unique() {
        assert_ne!(new_tunnel_id(), new_tunnel_id());
    }
}
