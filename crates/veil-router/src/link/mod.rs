//! Link layer: sessions to other routers over one datagram transport binding.

mod server;
mod session;
mod transport;

pub use server::{LinkLayer, LinkStatus, SessionsStatus, MAX_SESSIONS_PER_KEY, PUMP_INTERVAL, TICK_INTERVAL};
pub use session::{LinkDialect, LinkSession, SessionSetup};
pub use transport::{resolve_bind_addr, Transport};

use std::net::SocketAddr;

use veil_core::config::AddressFamily;
use veil_core::crypto::KeyFileError;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no {family:?} address on interface '{ifname}'")]
    InterfaceNotFound { ifname: String, family: AddressFamily },
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: std::io::Error },
    #[error("link layer is not configured")]
    NotConfigured,
    #[error(transparent)]
    KeyFile(#[from] KeyFileError),
    #[error("link i/o: {0}")]
    Io(#[from] std::io::Error),
}
