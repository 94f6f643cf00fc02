//! veil-router: link-layer session management and client path sets.
//!
//! Two managers live here:
//!   - [`link::LinkLayer`] owns the pending and authenticated sessions of one
//!     transport binding and drives their lifecycle.
//!   - [`path::PathSet`] owns the paths one client context has built and
//!     decides when more are needed.
//!
//! Both schedule their recurring work through a [`scheduler::Scheduler`].

pub mod link;
pub mod path;
pub mod scheduler;

pub use link::{LinkDialect, LinkError, LinkLayer, LinkSession, LinkStatus, SessionSetup, Transport};
pub use path::{Circuit, PathBuilder, PathSet, PathStatus};
pub use scheduler::{EventLoopScheduler, Scheduler, TimerId, TokioScheduler};
