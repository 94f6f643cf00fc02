//! Build pacing on top of a [`PathSet`].
//!
//! Building a path costs a round of key generation and a handshake through
//! every hop, so builds are spaced out: at least `build_interval_limit`
//! between two starts. Each timed-out build widens the interval linearly up
//! to [`MAX_BUILD_INTERVAL`]; a successful build resets it.

use serde::Serialize;
use veil_core::{Millis, PathId, RouterId};

use super::{Circuit, PathSet};

/// Spacing between builds while builds succeed.
pub const MIN_PATH_BUILD_INTERVAL: Millis = 1_000;

/// Upper bound on the spacing after repeated build timeouts.
pub const MAX_BUILD_INTERVAL: Millis = 30_000;

const BUILD_BACKOFF_STEP: Millis = 1_000;

pub struct PathBuilder<Ctx> {
    paths: PathSet<Ctx>,
    num_hops: usize,
    keygens: usize,
    running: bool,
    last_build: Millis,
    build_interval_limit: Millis,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathBuilderStatus {
    pub keygens: usize,
    pub num_hops: usize,
    pub num_paths: usize,
    pub paths: Vec<serde_json::Value>,
}

impl<Ctx> PathBuilder<Ctx> {
    pub fn new(num_paths: usize, num_hops: usize) -> Self {
        Self {
            paths: PathSet::new(num_paths),
            num_hops,
            keygens: 0,
            running: true,
            last_build: 0,
            build_interval_limit: MIN_PATH_BUILD_INTERVAL,
        }
    }

    pub fn paths(&self) -> &PathSet<Ctx> {
        &self.paths
    }

    pub fn paths_mut(&mut self) -> &mut PathSet<Ctx> {
        &mut self.paths
    }

    pub fn num_hops(&self) -> usize {
        self.num_hops
    }

    /// Builds started but not yet finished.
    pub fn keygens(&self) -> usize {
        self.keygens
    }

    pub fn build_interval_limit(&self) -> Millis {
        self.build_interval_limit
    }

    /// True while the last build started less than the current interval ago.
    /// A clock that went backwards also counts as a hit.
    pub fn build_cooldown_hit(&self, now: Millis) -> bool {
        now < self.last_build || now - self.last_build < self.build_interval_limit
    }

    /// Whether the caller should start another build at `now`.
    pub fn should_build_more(&self, now: Millis) -> bool {
        self.running && self.paths.should_build_more() && !self.build_cooldown_hit(now)
    }

    /// Record the start of a build. Refused once stopped.
    pub fn begin_build(&mut self, now: Millis) -> bool {
        if !self.running {
            return false;
        }
        self.last_build = now;
        self.keygens += 1;
        true
    }

    /// Record that a build started with [`begin_build`](Self::begin_build)
    /// has completed, successfully or not.
    pub fn finish_build(&mut self) {
        self.keygens = self.keygens.saturating_sub(1);
    }

    /// Reset the build interval and log the latency of the circuit at
    /// (`upstream`, `rx_id`). `None` if no such circuit is registered.
    pub fn handle_path_built(&mut self, upstream: &RouterId, rx_id: &PathId) -> Option<Millis> {
        self.build_interval_limit = MIN_PATH_BUILD_INTERVAL;
        let circuit = self.paths.get_by_upstream(upstream, rx_id)?;
        Some(self.paths.handle_path_built(circuit))
    }

    /// Back off the build interval and log the timeout of the circuit at
    /// (`upstream`, `rx_id`).
    pub fn handle_path_build_timeout(&mut self, upstream: &RouterId, rx_id: &PathId) {
        self.build_interval_limit = (self.build_interval_limit + BUILD_BACKOFF_STEP).min(MAX_BUILD_INTERVAL);
        tracing::debug!(interval_ms = self.build_interval_limit, "build interval backed off");
        if let Some(circuit) = self.paths.get_by_upstream(upstream, rx_id) {
            self.paths.handle_path_build_timeout(circuit);
        }
    }

    /// Register a newly built circuit. See [`PathSet::add_path`].
    pub fn add_path(&mut self, circuit: Box<dyn Circuit<Ctx>>) -> Result<(), Box<dyn Circuit<Ctx>>> {
        self.paths.add_path(circuit)
    }

    /// Expire stale circuits, then tick the established ones.
    pub fn tick(&mut self, now: Millis, ctx: &mut Ctx) {
        self.paths.expire_paths(now);
        self.paths.tick(now, ctx);
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_stopped(&self) -> bool {
        !self.running
    }

    /// Stopped and no build left in flight.
    pub fn should_remove(&self) -> bool {
        self.is_stopped() && self.keygens == 0
    }

    pub fn extract_status(&self) -> PathBuilderStatus {
        let paths = self.paths.extract_status();
        PathBuilderStatus {
            keygens: self.keygens,
            num_hops: self.num_hops,
            num_paths: paths.num_paths,
            paths: paths.paths,
        }
    }
}
