//! The session and dialect capabilities a link layer drives.
//!
//! Handshakes, encryption and framing live behind these traits. The link
//! layer only owns the collections and calls into sessions; it never inspects
//! a session's concrete type.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use veil_core::crypto::Keypair;
use veil_core::{AddressInfo, Millis, RouterContact, RouterId};

use super::{LinkLayer, Transport};

/// One encrypted conversation with a remote router.
///
/// Methods take `&self`: sessions are shared between the pump and tick
/// contexts and keep their own interior state. A session must not block in
/// any of these calls; sends are queued into the session's own buffers.
pub trait LinkSession: Send + Sync {
    /// Begin the handshake of an outbound session.
    fn start(&self);

    /// Flush queued sends and process buffered receives.
    fn pump(&self);

    /// Periodic timer work: retransmits, keep-alives.
    fn tick(&self, now: Millis);

    /// Whether the session is dead and should be dropped.
    ///
    /// Called while the link layer holds its session collection lock: it
    /// must not call back into [`LinkLayer`].
    fn timed_out(&self, now: Millis) -> bool;

    /// Deliver one datagram received from [`remote_endpoint`](Self::remote_endpoint).
    fn recv(&self, buf: &[u8]) -> bool;

    /// Fixed for the session's lifetime. Like
    /// [`timed_out`](Self::timed_out) it may be called under the link
    /// layer's collection lock and must not call back into [`LinkLayer`].
    fn remote_endpoint(&self) -> SocketAddr;

    /// Verified identity of the remote router, once the handshake completed.
    fn remote_identity(&self) -> Option<RouterId>;

    /// Queue one message for delivery.
    fn send_message(&self, buf: &[u8]) -> bool;

    fn send_keep_alive(&self);

    /// Tell the remote end we are closing. The session stays usable until removed.
    fn send_close(&self);

    /// Bytes queued but not yet sent or acknowledged.
    fn send_queue_backlog(&self) -> usize;

    /// Diagnostic summary.
    fn extract_status(&self) -> serde_json::Value;
}

/// What a dialect needs to construct sessions for a link layer.
#[derive(Clone)]
pub struct SessionSetup {
    pub transport: Transport,
    /// The link layer's transport keypair at construction time.
    pub keypair: Arc<Keypair>,
    /// Sessions report a completed handshake through [`LinkLayer::map_addr`]
    /// on this handle. No link layer lock is held while a session method
    /// runs, so the call may be made from inside `recv`, `pump` or `tick`.
    pub link: Weak<LinkLayer>,
}

/// A concrete transport variant, selected when the link layer is built.
pub trait LinkDialect: Send + Sync {
    /// Dialect name, matched against [`AddressInfo::dialect`].
    fn name(&self) -> &str;

    /// Session for a datagram from an endpoint we have no session with.
    /// `None` drops the datagram.
    fn new_inbound_session(&self, setup: &SessionSetup, from: SocketAddr) -> Option<Arc<dyn LinkSession>>;

    /// Session dialing `addr`, one of `rc`'s advertised addresses.
    fn new_outbound_session(
        &self,
        setup: &SessionSetup,
        rc: &RouterContact,
        addr: &AddressInfo,
    ) -> Arc<dyn LinkSession>;
}
