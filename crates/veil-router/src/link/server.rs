//! Session bookkeeping for one transport binding.
//!
//! Sessions start out pending, keyed by remote endpoint. Once a session's
//! handshake verifies the remote router it is promoted with
//! [`LinkLayer::map_addr`] into the authenticated set, keyed by router id.
//! One router may hold several authenticated sessions (up to
//! [`MAX_SESSIONS_PER_KEY`]).
//!
//! Locking: `authed` and `pending` each sit behind their own mutex; when both
//! are needed `authed` is taken first. Apart from the `timed_out` and
//! `remote_endpoint` queries, no lock is held while calling into a session,
//! so sessions may call back into the link layer from their other methods.
//! The tick state has its own mutex and is never held together with
//! a collection lock.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use veil_core::config::{AddressFamily, IdentityConfig, NetworkConfig};
use veil_core::crypto::Keypair;
use veil_core::{now_ms, AddressInfo, Millis, RouterContact, RouterId};

use super::session::{LinkDialect, LinkSession, SessionSetup};
use super::transport::{resolve_bind_addr, Transport};
use super::LinkError;
use crate::scheduler::{Scheduler, TimerId};

/// Period of the session tick.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Period of the I/O loop's pump when no datagrams arrive.
pub const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// Authenticated sessions allowed per remote router.
pub const MAX_SESSIONS_PER_KEY: usize = 16;

const MAX_DATAGRAM: usize = 65_535;

type SessionPtr = Arc<dyn LinkSession>;

#[derive(Default)]
struct Ticker {
    scheduler: Option<Arc<dyn Scheduler>>,
    timer: Option<TimerId>,
    stopped: bool,
    /// Bumped on stop and whenever start schedules a fresh timer. A tick job
    /// from an older generation does nothing.
    generation: u64,
}

pub struct LinkLayer {
    dialect: Arc<dyn LinkDialect>,
    rank: u16,
    self_ref: Weak<LinkLayer>,
    keys: RwLock<Arc<Keypair>>,
    transport: RwLock<Option<Transport>>,
    authed: Mutex<HashMap<RouterId, Vec<SessionPtr>>>,
    pending: Mutex<HashMap<SocketAddr, SessionPtr>>,
    ticker: Mutex<Ticker>,
}

/// Diagnostic snapshot returned by [`LinkLayer::extract_status`].
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub name: String,
    pub rank: u16,
    /// Bound address, empty until configured.
    pub addr: String,
    pub sessions: SessionsStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionsStatus {
    pub pending: Vec<serde_json::Value>,
    pub established: Vec<serde_json::Value>,
}

impl LinkLayer {
    /// A link layer speaking `dialect`, advertising `rank`.
    ///
    /// Starts with a freshly generated transport keypair; call
    /// [`ensure_keys`](Self::ensure_keys) to use a persistent one.
    pub fn new(dialect: Arc<dyn LinkDialect>, rank: u16) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            dialect,
            rank,
            self_ref: self_ref.clone(),
            keys: RwLock::new(Arc::new(Keypair::generate())),
            transport: RwLock::new(None),
            authed: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            ticker: Mutex::new(Ticker::default()),
        })
    }

    /// Build and bind from the `[network]` config section.
    pub fn from_config(dialect: Arc<dyn LinkDialect>, network: &NetworkConfig) -> Result<Arc<Self>, LinkError> {
        let link = Self::new(dialect, network.rank);
        link.configure_from(network)?;
        Ok(link)
    }

    pub fn name(&self) -> &str {
        self.dialect.name()
    }

    pub fn rank(&self) -> u16 {
        self.rank
    }

    // ── Configuration ─────────────────────────────────────────────────────────

    /// Bind the transport on `ifname` ("*" for all interfaces of `family`).
    /// Returns the bound address.
    pub fn configure(
        &self,
        ifname: &str,
        family: AddressFamily,
        port: u16,
    ) -> Result<SocketAddr, LinkError> {
        let addr = resolve_bind_addr(ifname, family, port)?;
        let transport = Transport::bind(addr)?;
        let local = transport.local_addr();
        *self.transport.write() = Some(transport);
        tracing::info!(dialect = self.name(), interface = ifname, addr = %local, "link layer bound");
        Ok(local)
    }

    pub fn configure_from(&self, network: &NetworkConfig) -> Result<SocketAddr, LinkError> {
        self.configure(&network.interface, network.family, network.port)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.read().as_ref().map(Transport::local_addr)
    }

    pub fn transport(&self) -> Option<Transport> {
        self.transport.read().clone()
    }

    // ── Keys ──────────────────────────────────────────────────────────────────

    /// Load the transport key from `path`, generating and writing one first
    /// if the file does not exist.
    pub fn ensure_keys(&self, path: &Path) -> Result<(), LinkError> {
        if !path.exists() {
            let fresh = Keypair::generate();
            if let Err(e) = fresh.write_to(path) {
                tracing::error!(path = %path.display(), error = %e, "failed to write transport key");
                return Err(e.into());
            }
            tracing::info!(path = %path.display(), "generated transport key");
        }
        match Keypair::read_from(path) {
            Ok(keys) => {
                *self.keys.write() = Arc::new(keys);
                Ok(())
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to load transport key");
                Err(e.into())
            }
        }
    }

    /// Replace the transport key with a new random one.
    pub fn gen_ephemeral_keys(&self) {
        *self.keys.write() = Arc::new(Keypair::generate());
    }

    /// Apply the `[identity]` config section.
    pub fn setup_keys(&self, identity: &IdentityConfig) -> Result<(), LinkError> {
        if identity.ephemeral_keys {
            self.gen_ephemeral_keys();
            Ok(())
        } else {
            self.ensure_keys(&identity.transport_keyfile)
        }
    }

    pub fn transport_pubkey(&self) -> [u8; 32] {
        self.keys.read().public
    }

    pub fn keypair(&self) -> Arc<Keypair> {
        self.keys.read().clone()
    }

    /// The address descriptor we advertise for this binding.
    pub fn our_address_info(&self) -> Result<AddressInfo, LinkError> {
        let local = self.local_addr().ok_or(LinkError::NotConfigured)?;
        Ok(AddressInfo::new(
            self.name(),
            self.transport_pubkey(),
            self.rank,
            local.ip(),
            local.port(),
        ))
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Begin ticking every [`TICK_INTERVAL`] on `scheduler`.
    ///
    /// Calling `start` while already ticking keeps the outstanding timer.
    pub fn start(&self, scheduler: Arc<dyn Scheduler>) -> bool {
        let mut ticker = self.ticker.lock();
        ticker.scheduler = Some(scheduler);
        ticker.stopped = false;
        if ticker.timer.is_none() {
            ticker.generation += 1;
            self.schedule_tick(&mut ticker, TICK_INTERVAL);
        }
        true
    }

    /// Cancel the tick and send a close on every session.
    ///
    /// Sessions stay in their collections until they time out and a pump
    /// removes them.
    pub fn stop(&self) {
        {
            let mut ticker = self.ticker.lock();
            ticker.stopped = true;
            ticker.generation += 1;
            let timer = ticker.timer.take();
            if let (Some(scheduler), Some(id)) = (ticker.scheduler.as_ref(), timer) {
                scheduler.cancel(id);
            }
        }
        let authed = self.authed_snapshot();
        let pending: Vec<SessionPtr> = self.pending.lock().values().cloned().collect();
        tracing::info!(
            dialect = self.name(),
            authed = authed.len(),
            pending = pending.len(),
            "stopping link layer"
        );
        for session in authed.iter().chain(pending.iter()) {
            session.send_close();
        }
    }

    fn schedule_tick(&self, ticker: &mut Ticker, interval: Duration) {
        if ticker.stopped {
            return;
        }
        let Some(scheduler) = ticker.scheduler.clone() else {
            return;
        };
        let link = self.self_ref.clone();
        let generation = ticker.generation;
        let id = scheduler.call_later(
            interval,
            Box::new(move || {
                if let Some(link) = link.upgrade() {
                    link.on_tick(interval, generation);
                }
            }),
        );
        ticker.timer = Some(id);
    }

    fn on_tick(&self, interval: Duration, generation: u64) {
        {
            let mut ticker = self.ticker.lock();
            // a job that fired across a stop (and maybe a restart) must not
            // touch the current timer
            if ticker.stopped || ticker.generation != generation {
                return;
            }
            ticker.timer = None;
        }
        self.tick(now_ms());
        let mut ticker = self.ticker.lock();
        if ticker.timer.is_none() && ticker.generation == generation {
            self.schedule_tick(&mut ticker, interval);
        }
    }

    /// Run one tick on every authenticated session. Does not reschedule.
    pub fn tick(&self, now: Millis) {
        for session in self.authed_snapshot() {
            session.tick(now);
        }
    }

    /// Drop timed-out sessions from both collections, then pump the rest.
    pub fn pump(&self) {
        let now = now_ms();
        let mut live = Vec::new();
        {
            let mut authed = self.authed.lock();
            authed.retain(|id, sessions| {
                sessions.retain(|session| {
                    if session.timed_out(now) {
                        tracing::info!(peer = %id.short(), endpoint = %session.remote_endpoint(), "session timed out");
                        false
                    } else {
                        live.push(session.clone());
                        true
                    }
                });
                !sessions.is_empty()
            });
        }
        {
            let mut pending = self.pending.lock();
            pending.retain(|_, session| {
                if session.timed_out(now) {
                    false
                } else {
                    live.push(session.clone());
                    true
                }
            });
        }
        for session in live {
            session.pump();
        }
    }

    /// Receive loop: route datagrams to sessions and pump until `shutdown`
    /// fires, then stop.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<(), LinkError> {
        let socket = match self.transport() {
            Some(transport) => transport.async_socket()?,
            None => return Err(LinkError::NotConfigured),
        };
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut pump = tokio::time::interval(PUMP_INTERVAL);
        pump.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(dialect = self.name(), addr = ?self.local_addr(), "link layer running");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.stop();
                    return Ok(());
                }
                _ = pump.tick() => self.pump(),
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => {
                        self.recv_from(from, &buf[..len]);
                        self.pump();
                    }
                    Err(e) => tracing::warn!(error = %e, "link recv_from failed"),
                },
            }
        }
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    fn session_setup(&self) -> Option<SessionSetup> {
        Some(SessionSetup {
            transport: self.transport()?,
            keypair: self.keypair(),
            link: self.self_ref.clone(),
        })
    }

    fn authed_snapshot(&self) -> Vec<SessionPtr> {
        self.authed.lock().values().flatten().cloned().collect()
    }

    /// Register a new pending session under its remote endpoint.
    ///
    /// Fails, handing the session back, when a pending session for that
    /// endpoint already exists.
    pub fn put_session(&self, session: SessionPtr) -> Result<(), SessionPtr> {
        let endpoint = session.remote_endpoint();
        match self.pending.lock().entry(endpoint) {
            Entry::Occupied(_) => Err(session),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Promote the pending session at `session`'s endpoint to an
    /// authenticated session of `remote`.
    ///
    /// Fails if no pending session exists there, or if `remote` already holds
    /// [`MAX_SESSIONS_PER_KEY`] sessions; in that case `session` is sent a
    /// close and left pending.
    pub fn map_addr(&self, remote: RouterId, session: &dyn LinkSession) -> bool {
        let endpoint = session.remote_endpoint();
        let at_cap = {
            let mut authed = self.authed.lock();
            let mut pending = self.pending.lock();
            if !pending.contains_key(&endpoint) {
                return false;
            }
            let count = authed.get(&remote).map_or(0, Vec::len);
            if count >= MAX_SESSIONS_PER_KEY {
                true
            } else {
                let Some(promoted) = pending.remove(&endpoint) else {
                    return false;
                };
                authed.entry(remote).or_default().push(promoted);
                false
            }
        };
        if at_cap {
            tracing::warn!(peer = %remote.short(), %endpoint, "too many sessions to router, closing");
            session.send_close();
            return false;
        }
        tracing::debug!(peer = %remote.short(), %endpoint, "session established");
        true
    }

    /// Remove a pending session, e.g. after a failed handshake.
    pub fn remove_pending(&self, session: &dyn LinkSession) -> bool {
        let endpoint = session.remote_endpoint();
        self.pending.lock().remove(&endpoint).is_some()
    }

    /// The first of `rc`'s addresses advertised for our dialect.
    pub fn pick_address(&self, rc: &RouterContact) -> Option<AddressInfo> {
        rc.addrs.iter().find(|ai| ai.dialect == self.name()).cloned()
    }

    /// Open an outbound session to `rc`. The session is started only once it
    /// has been registered as pending.
    pub fn try_establish_to(&self, rc: &RouterContact) -> bool {
        let Some(addr) = self.pick_address(rc) else {
            tracing::debug!(peer = %rc.pubkey.short(), dialect = self.name(), "no compatible address");
            return false;
        };
        let Some(setup) = self.session_setup() else {
            tracing::warn!(dialect = self.name(), "cannot establish, link layer not configured");
            return false;
        };
        tracing::info!(peer = %rc.pubkey.short(), endpoint = %addr.socket_addr(), "establishing session");
        let session = self.dialect.new_outbound_session(&setup, rc, &addr);
        if self.put_session(session.clone()).is_err() {
            tracing::debug!(endpoint = %addr.socket_addr(), "session to endpoint already pending");
            return false;
        }
        session.start();
        true
    }

    /// Route one inbound datagram: to the pending session at `from`, else to
    /// the authenticated session at `from`, else to a new inbound session.
    pub fn recv_from(&self, from: SocketAddr, buf: &[u8]) -> bool {
        let pending = self.pending.lock().get(&from).cloned();
        if let Some(session) = pending {
            return session.recv(buf);
        }
        let authed = self
            .authed
            .lock()
            .values()
            .flatten()
            .find(|s| s.remote_endpoint() == from)
            .cloned();
        if let Some(session) = authed {
            return session.recv(buf);
        }
        let Some(setup) = self.session_setup() else {
            return false;
        };
        let Some(session) = self.dialect.new_inbound_session(&setup, from) else {
            return false;
        };
        if self.put_session(session.clone()).is_err() {
            return false;
        }
        tracing::debug!(%from, "new inbound session");
        session.recv(buf)
    }

    /// Queue `buf` on the authenticated session to `remote` with the smallest
    /// send backlog. Ties go to the earliest promoted session.
    pub fn send_to(&self, remote: &RouterId, buf: &[u8]) -> bool {
        let chosen = {
            let authed = self.authed.lock();
            authed
                .get(remote)
                .and_then(|sessions| sessions.iter().min_by_key(|s| s.send_queue_backlog()).cloned())
        };
        chosen.is_some_and(|session| session.send_message(buf))
    }

    pub fn has_session_to(&self, remote: &RouterId) -> bool {
        self.authed.lock().contains_key(remote)
    }

    pub fn num_sessions_to(&self, remote: &RouterId) -> usize {
        self.authed.lock().get(remote).map_or(0, Vec::len)
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Close and remove every authenticated session to `remote`.
    pub fn close_session_to(&self, remote: &RouterId) {
        let removed = self.authed.lock().remove(remote);
        if let Some(sessions) = removed {
            tracing::info!(peer = %remote.short(), count = sessions.len(), "closing sessions");
            for session in sessions {
                session.send_close();
            }
        }
    }

    pub fn keep_alive_session_to(&self, remote: &RouterId) {
        let sessions = self.authed.lock().get(remote).cloned().unwrap_or_default();
        for session in sessions {
            session.send_keep_alive();
        }
    }

    /// Call `visit` on every authenticated session.
    pub fn for_each_session(&self, mut visit: impl FnMut(&dyn LinkSession)) {
        for session in self.authed_snapshot() {
            visit(session.as_ref());
        }
    }

    /// Call `visit` on the first authenticated session to `remote` and return
    /// its result; false if there is none.
    pub fn visit_session_by_pubkey(&self, remote: &RouterId, visit: impl FnOnce(&dyn LinkSession) -> bool) -> bool {
        let first = self.authed.lock().get(remote).and_then(|s| s.first().cloned());
        first.is_some_and(|session| visit(session.as_ref()))
    }

    pub fn extract_status(&self) -> LinkStatus {
        let pending: Vec<SessionPtr> = self.pending.lock().values().cloned().collect();
        let established = self.authed_snapshot();
        LinkStatus {
            name: self.name().to_string(),
            rank: self.rank,
            addr: self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            sessions: SessionsStatus {
                pending: pending.iter().map(|s| s.extract_status()).collect(),
                established: established.iter().map(|s| s.extract_status()).collect(),
            },
        }
    }
}
