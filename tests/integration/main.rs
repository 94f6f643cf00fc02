//! Veil integration test harness.
//!
//! Link layers here bind real UDP sockets on the loopback interface and run
//! their receive loops on the test runtime. Sessions speak a plaintext test
//! dialect: one tag byte, then the body.
//!
//!   cargo test --test integration
//!
//! Set RUST_LOG=debug to see the link layer's logs.

mod config;
mod sessions;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once, Weak};
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use veil_core::config::AddressFamily;
use veil_core::{now_ms, AddressInfo, Millis, RouterContact, RouterId};
use veil_router::{LinkDialect, LinkError, LinkLayer, LinkSession, SessionSetup, Transport};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const DIALECT: &str = "plain";

/// Idle time after which a plain session times out.
pub const SESSION_TIMEOUT: Millis = 2_000;

const TAG_HELLO: u8 = 1;
const TAG_ACK: u8 = 2;
const TAG_DATA: u8 = 3;
const TAG_CLOSE: u8 = 4;
const TAG_KEEPALIVE: u8 = 5;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// What the plain sessions of one node observed.
#[derive(Default)]
pub struct Observed {
    pub delivered: Mutex<Vec<(RouterId, Vec<u8>)>>,
    pub ticks: AtomicUsize,
    pub keep_alives: AtomicUsize,
}

pub struct PlainDialect {
    pub observed: Arc<Observed>,
}

impl PlainDialect {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            observed: Arc::new(Observed::default()),
        })
    }
}

impl LinkDialect for PlainDialect {
    fn name(&self) -> &str {
        DIALECT
    }

    fn new_inbound_session(&self, setup: &SessionSetup, from: SocketAddr) -> Option<Arc<dyn LinkSession>> {
        Some(Arc::new(PlainSession::new(setup, from, self.observed.clone())))
    }

    fn new_outbound_session(
        &self,
        setup: &SessionSetup,
        _rc: &RouterContact,
        addr: &AddressInfo,
    ) -> Arc<dyn LinkSession> {
        Arc::new(PlainSession::new(setup, addr.socket_addr(), self.observed.clone()))
    }
}

/// Unencrypted session: HELLO/ACK exchange identities, then DATA flows.
pub struct PlainSession {
    link: Weak<LinkLayer>,
    transport: Transport,
    remote: SocketAddr,
    our_id: RouterId,
    peer: Mutex<Option<RouterId>>,
    last_rx: AtomicU64,
    closed: AtomicBool,
    observed: Arc<Observed>,
}

impl PlainSession {
    fn new(setup: &SessionSetup, remote: SocketAddr, observed: Arc<Observed>) -> Self {
        Self {
            link: setup.link.clone(),
            transport: setup.transport.clone(),
            remote,
            our_id: RouterId(setup.keypair.public),
            peer: Mutex::new(None),
            last_rx: AtomicU64::new(now_ms()),
            closed: AtomicBool::new(false),
            observed,
        }
    }

    fn send(&self, tag: u8, body: &[u8]) -> bool {
        let mut datagram = Vec::with_capacity(1 + body.len());
        datagram.push(tag);
        datagram.extend_from_slice(body);
        self.transport.send_to(&datagram, self.remote)
    }

    fn authenticated(&self, body: &[u8]) -> bool {
        let Ok(id) = <[u8; 32]>::try_from(body) else {
            return false;
        };
        let id = RouterId(id);
        *self.peer.lock() = Some(id);
        match self.link.upgrade() {
            Some(link) => link.map_addr(id, self),
            None => false,
        }
    }
}

impl LinkSession for PlainSession {
    fn start(&self) {
        self.send(TAG_HELLO, self.our_id.as_bytes());
    }

    fn pump(&self) {}

    fn tick(&self, _now: Millis) {
        self.observed.ticks.fetch_add(1, Ordering::SeqCst);
    }

    fn timed_out(&self, now: Millis) -> bool {
        self.closed.load(Ordering::SeqCst) || now.saturating_sub(self.last_rx.load(Ordering::SeqCst)) > SESSION_TIMEOUT
    }

    fn recv(&self, buf: &[u8]) -> bool {
        let Some((&tag, body)) = buf.split_first() else {
            return false;
        };
        self.last_rx.store(now_ms(), Ordering::SeqCst);
        match tag {
            TAG_HELLO => {
                self.send(TAG_ACK, self.our_id.as_bytes());
                self.authenticated(body)
            }
            TAG_ACK => self.authenticated(body),
            TAG_DATA => match *self.peer.lock() {
                Some(peer) => {
                    self.observed.delivered.lock().push((peer, body.to_vec()));
                    true
                }
                None => false,
            },
            TAG_CLOSE => {
                self.closed.store(true, Ordering::SeqCst);
                true
            }
            TAG_KEEPALIVE => {
                self.observed.keep_alives.fetch_add(1, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    fn remote_endpoint(&self) -> SocketAddr {
        self.remote
    }

    fn remote_identity(&self) -> Option<RouterId> {
        *self.peer.lock()
    }

    fn send_message(&self, buf: &[u8]) -> bool {
        self.send(TAG_DATA, buf)
    }

    fn send_keep_alive(&self) {
        self.send(TAG_KEEPALIVE, &[]);
    }

    fn send_close(&self) {
        self.send(TAG_CLOSE, &[]);
    }

    fn send_queue_backlog(&self) -> usize {
        0
    }

    fn extract_status(&self) -> serde_json::Value {
        serde_json::json!({
            "remoteAddr": self.remote.to_string(),
            "identity": self.peer.lock().as_ref().map(|id| id.to_string()),
        })
    }
}

/// A link layer bound on loopback with its receive loop running.
pub struct Node {
    pub link: Arc<LinkLayer>,
    pub dialect: Arc<PlainDialect>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<(), LinkError>>,
}

impl Node {
    pub fn spawn() -> Result<Self> {
        let dialect = PlainDialect::new();
        let link = LinkLayer::new(dialect.clone(), 1);
        link.configure("lo", AddressFamily::Inet, 0)?;
        let (shutdown, rx) = broadcast::channel(1);
        let task = tokio::spawn(link.clone().run(rx));
        Ok(Self {
            link,
            dialect,
            shutdown,
            task,
        })
    }

    pub fn id(&self) -> RouterId {
        RouterId(self.link.transport_pubkey())
    }

    pub fn contact(&self) -> Result<RouterContact> {
        Ok(RouterContact::new(self.id(), vec![self.link.our_address_info()?]))
    }

    /// Stop the receive loop and wait for it to exit.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task.await??;
        Ok(())
    }
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, what: &str, mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Per-test scratch directory under the system temp dir.
pub fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("veil-it-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}
