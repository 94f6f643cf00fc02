//! Router contacts and the address descriptors they advertise.
//!
//! A `RouterContact` is what a node publishes about itself: its identity,
//! a nickname, and one `AddressInfo` per link layer it listens on. A link
//! layer picks the advertised address whose dialect matches its own when
//! dialing out.

use std::net::{IpAddr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::time::Millis;
use crate::types::{hex_serde, RouterId};

/// Maximum nickname length in bytes.
pub const NICK_LEN: usize = 32;

/// How long a published contact stays valid (one day).
pub const LIFETIME: Millis = 24 * 60 * 60 * 1000;

/// Default window for [`RouterContact::expires_soon`] (one minute).
pub const EXPIRES_SOON_DELTA: Millis = 60 * 1000;

/// One advertised transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    /// Preference among a router's addresses. Lower is better.
    pub rank: u16,
    /// Transport dialect name. A link layer only dials addresses of its own dialect.
    pub dialect: String,
    /// Transport-level public key for this endpoint.
    #[serde(with = "hex_serde")]
    pub pubkey: [u8; 32],
    /// IPv4 addresses are carried IPv6-mapped.
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl AddressInfo {
    pub fn new(dialect: impl Into<String>, pubkey: [u8; 32], rank: u16, ip: IpAddr, port: u16) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            rank,
            dialect: dialect.into(),
            pubkey,
            ip,
            port,
        }
    }

    /// The advertised endpoint as a socket address, unmapping IPv4.
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        let ip = match self.ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(self.ip),
        };
        std::net::SocketAddr::new(ip, self.port)
    }
}

/// A router's published self-description.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RouterContact {
    /// Long-term identity key.
    pub pubkey: RouterId,
    /// Advertised link addresses. Empty for client-only routers.
    pub addrs: Vec<AddressInfo>,
    /// Up to [`NICK_LEN`] bytes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nickname: String,
    /// Network identifier. Contacts from other networks are ignored by peers.
    pub net_id: String,
    pub last_updated: Millis,
}

impl RouterContact {
    pub fn new(pubkey: RouterId, addrs: Vec<AddressInfo>) -> Self {
        Self {
            pubkey,
            addrs,
            ..Default::default()
        }
    }

    /// Routers that advertise at least one address accept inbound links.
    pub fn is_public_router(&self) -> bool {
        !self.addrs.is_empty()
    }

    pub fn has_nick(&self) -> bool {
        !self.nickname.is_empty()
    }

    pub fn nick(&self) -> &str {
        &self.nickname
    }

    /// Set the nickname, truncated to [`NICK_LEN`] bytes on a char boundary.
    pub fn set_nick(&mut self, nick: &str) {
        let mut end = nick.len().min(NICK_LEN);
        while !nick.is_char_boundary(end) {
            end -= 1;
        }
        self.nickname = nick[..end].to_string();
    }

    pub fn is_expired(&self, now: Millis) -> bool {
        now >= self.last_updated.saturating_add(LIFETIME)
    }

    /// Expired, or will expire within `dlt` of `now`.
    pub fn expires_soon(&self, now: Millis, dlt: Millis) -> bool {
        if self.is_expired(now) {
            return true;
        }
        let expires_at = self.last_updated.saturating_add(LIFETIME);
        expires_at - now <= dlt
    }

    pub fn other_is_newer(&self, other: &RouterContact) -> bool {
        self.last_updated < other.last_updated
    }

    /// Diagnostic summary.
    pub fn extract_status(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "lastUpdated": self.last_updated,
            "publicRouter": self.is_public_router(),
            "identity": self.pubkey.to_string(),
        });
        if self.has_nick() {
            obj["nickname"] = serde_json::Value::String(self.nickname.clone());
        }
        obj
    }
}
