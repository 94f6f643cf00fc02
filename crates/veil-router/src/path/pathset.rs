use std::collections::HashMap;

use serde::Serialize;
use veil_core::{now_ms, Millis, PathId, RouterId};

use super::{Circuit, PathStatus};

type CircuitBox<Ctx> = Box<dyn Circuit<Ctx>>;

/// The circuits one client context has built, keyed by the pair inbound
/// traffic is addressed by: (first hop, rx path id).
///
/// Single owner, no internal locking.
pub struct PathSet<Ctx> {
    num_paths: usize,
    paths: HashMap<(RouterId, PathId), CircuitBox<Ctx>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSetStatus {
    pub num_paths: usize,
    pub paths: Vec<serde_json::Value>,
}

impl<Ctx> PathSet<Ctx> {
    /// An empty set that wants `num_paths` circuits.
    pub fn new(num_paths: usize) -> Self {
        Self {
            num_paths,
            paths: HashMap::new(),
        }
    }

    pub fn num_paths(&self) -> usize {
        self.num_paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn should_build_more(&self) -> bool {
        self.paths.len() < self.num_paths
    }

    /// Register `circuit`. A circuit already registered under the same key
    /// is kept and the new one handed back.
    pub fn add_path(&mut self, circuit: CircuitBox<Ctx>) -> Result<(), CircuitBox<Ctx>> {
        let key = (circuit.upstream(), circuit.rx_id());
        if self.paths.contains_key(&key) {
            return Err(circuit);
        }
        self.paths.insert(key, circuit);
        Ok(())
    }

    /// Unregister a circuit, returning it to the caller.
    pub fn remove_path(&mut self, upstream: &RouterId, rx_id: &PathId) -> Option<CircuitBox<Ctx>> {
        self.paths.remove(&(*upstream, *rx_id))
    }

    pub fn get_by_upstream(&self, upstream: &RouterId, rx_id: &PathId) -> Option<&dyn Circuit<Ctx>> {
        self.paths.get(&(*upstream, *rx_id)).map(|c| c.as_ref())
    }

    pub fn get_by_upstream_mut(&mut self, upstream: &RouterId, rx_id: &PathId) -> Option<&mut dyn Circuit<Ctx>> {
        self.paths
            .get_mut(&(*upstream, *rx_id))
            .map(|c| c.as_mut() as &mut dyn Circuit<Ctx>)
    }

    /// Tick every established circuit.
    pub fn tick(&mut self, now: Millis, ctx: &mut Ctx) {
        for circuit in self.paths.values_mut() {
            if circuit.status() == PathStatus::Established {
                circuit.tick(now, ctx);
            }
        }
    }

    /// Drop every circuit that reports itself expired at `now`. Returns how
    /// many were dropped.
    pub fn expire_paths(&mut self, now: Millis) -> usize {
        let before = self.paths.len();
        self.paths.retain(|_, circuit| !circuit.expired(now));
        let expired = before - self.paths.len();
        if expired > 0 {
            tracing::debug!(expired, remaining = self.paths.len(), "expired paths");
        }
        expired
    }

    pub fn num_in_status(&self, status: PathStatus) -> usize {
        self.paths.values().filter(|c| c.status() == status).count()
    }

    /// Log how long `circuit` took to build and return the latency.
    pub fn handle_path_built(&self, circuit: &dyn Circuit<Ctx>) -> Millis {
        let latency = now_ms().saturating_sub(circuit.build_started());
        tracing::info!(
            tx = %circuit.tx_id(),
            rx = %circuit.rx_id(),
            upstream = %circuit.upstream().short(),
            latency_ms = latency,
            "path built"
        );
        latency
    }

    pub fn handle_path_build_timeout(&self, circuit: &dyn Circuit<Ctx>) {
        tracing::warn!(
            tx = %circuit.tx_id(),
            rx = %circuit.rx_id(),
            upstream = %circuit.upstream().short(),
            "path build timed out"
        );
    }

    pub fn extract_status(&self) -> PathSetStatus {
        PathSetStatus {
            num_paths: self.num_paths,
            paths: self.paths.values().map(|c| c.extract_status()).collect(),
        }
    }
}
