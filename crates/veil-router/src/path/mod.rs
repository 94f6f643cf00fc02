//! Client path sets: the onion circuits one context keeps built.

mod builder;
mod pathset;

pub use builder::{PathBuilder, PathBuilderStatus, MAX_BUILD_INTERVAL, MIN_PATH_BUILD_INTERVAL};
pub use pathset::{PathSet, PathSetStatus};

use serde::Serialize;
use veil_core::{Millis, PathId, RouterId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PathStatus {
    Building,
    Established,
    Timeout,
    Expired,
}

/// One built (or building) multi-hop path, as seen by the set owning it.
///
/// `Ctx` is whatever the owner passes down on tick: usually the router's
/// outbound message context.
pub trait Circuit<Ctx> {
    fn status(&self) -> PathStatus;

    /// First hop.
    fn upstream(&self) -> RouterId;

    /// Path id inbound traffic from the first hop is addressed by.
    fn rx_id(&self) -> PathId;

    fn tx_id(&self) -> PathId;

    fn build_started(&self) -> Millis;

    fn tick(&mut self, now: Millis, ctx: &mut Ctx);

    fn expired(&self, now: Millis) -> bool;

    fn extract_status(&self) -> serde_json::Value;
}
