use std::{
    net::SocketAddr,
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

pub const CONNECTIONS_TOTAL: &str = "slipstream_connections_total";
pub const ACTIVE_BRIDGES: &str = "slipstream_active_bridges";
pub const BYTES_UPSTREAM_TOTAL: &str = "slipstream_bytes_upstream_total";
pub const BYTES_DOWNSTREAM_TOTAL: &str = "slipstream_bytes_downstream_total";
pub const STREAM_OPEN_FAILURES_TOTAL: &str = "slipstream_stream_open_failures_total";
pub const SESSIONS_ESTABLISHED_TOTAL: &str = "slipstream_sessions_established_total";
pub const SESSION_FAILURES_TOTAL: &str = "slipstream_session_failures_total";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// One live local connection and the stream carrying it.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeInfo {
    pub id: String,
    pub peer: String,
    /// Generation of the session the stream was opened on.
    pub session: u64,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Default)]
pub struct BridgeRegistry {
    bridges: DashMap<String, BridgeInfo>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, b: BridgeInfo) {
        self.bridges.insert(b.id.clone(), b);
    }

    pub fn remove(&self, id: &str) {
        self.bridges.remove(id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn snapshot(&self) -> Vec<BridgeInfo> {
        let mut out: Vec<BridgeInfo> = self.bridges.iter().map(|b| b.value().clone()).collect();
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

/// Removes a bridge from the registry when the bridge task ends, however it ends.
pub struct Registered {
    registry: SharedBridges,
    id: String,
}

impl Registered {
    pub fn new(registry: SharedBridges, id: String, peer: SocketAddr, session: u64) -> Self {
        registry.add(BridgeInfo {
            id: id.clone(),
            peer: peer.to_string(),
            session,
            started_at_unix_ms: now_unix_ms(),
        });
        Self { registry, id }
    }
}

impl Drop for Registered {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

pub struct ActiveBridgeGuard;

impl ActiveBridgeGuard {
    pub fn new() -> Self {
        metrics::counter!(CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(ACTIVE_BRIDGES).increment(1.0);
        Self
    }
}

impl Drop for ActiveBridgeGuard {
    fn drop(&mut self) {
        metrics::gauge!(ACTIVE_BRIDGES).decrement(1.0);
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_bridge_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("b{n}")
}

pub type SharedBridges = Arc<BridgeRegistry>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
