//! veil-core: shared identity types, router contacts, transport keys and
//! configuration. The router crate and the integration harness depend on this one.

pub mod config;
pub mod contact;
pub mod crypto;
pub mod time;
pub mod types;

pub use contact::{AddressInfo, RouterContact};
pub use time::{now_ms, Millis};
pub use types::{PathId, RouterId};
