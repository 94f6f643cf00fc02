//! The datagram socket a link layer and its sessions share.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use veil_core::config::AddressFamily;

use super::LinkError;

/// Bound UDP socket. Cloning shares the socket.
///
/// Sends never block: a full socket buffer drops the datagram and the
/// session's retransmit logic recovers.
#[derive(Clone, Debug)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl Transport {
    /// Bind a non-blocking UDP socket to `addr`. Port 0 picks a free port.
    pub fn bind(addr: SocketAddr) -> Result<Self, LinkError> {
        let socket = make_socket(addr).map_err(|source| LinkError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one datagram. Returns false if it was not handed to the kernel.
    pub fn send_to(&self, buf: &[u8], to: SocketAddr) -> bool {
        match self.socket.send_to(buf, to) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::trace!(%to, len = buf.len(), "socket buffer full, datagram dropped");
                false
            }
            Err(e) => {
                tracing::debug!(%to, error = %e, "send_to failed");
                false
            }
        }
    }

    /// A tokio handle on the same socket, for the receive loop.
    pub(crate) fn async_socket(&self) -> io::Result<tokio::net::UdpSocket> {
        tokio::net::UdpSocket::from_std(self.socket.try_clone()?)
    }
}

fn make_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Resolve the address to bind for `ifname`.
///
/// `"*"` binds the unspecified address of `family`. Any other name must be a
/// local interface carrying an address of that family; its first one is used.
pub fn resolve_bind_addr(ifname: &str, family: AddressFamily, port: u16) -> Result<SocketAddr, LinkError> {
    if ifname == "*" {
        let ip = match family {
            AddressFamily::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        return Ok(SocketAddr::new(ip, port));
    }
    interface_addr(ifname, family, port)?.ok_or_else(|| LinkError::InterfaceNotFound {
        ifname: ifname.to_string(),
        family,
    })
}

fn interface_addr(ifname: &str, family: AddressFamily, port: u16) -> io::Result<Option<SocketAddr>> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(io::Error::from)?;
    for ifa in addrs {
        if ifa.interface_name != ifname {
            continue;
        }
        let Some(storage) = ifa.address else { continue };
        match family {
            AddressFamily::Inet => {
                if let Some(sin) = storage.as_sockaddr_in() {
                    return Ok(Some(SocketAddr::new(IpAddr::V4(sin.ip()), port)));
                }
            }
            AddressFamily::Inet6 => {
                if let Some(sin6) = storage.as_sockaddr_in6() {
                    let v6 = SocketAddrV6::new(sin6.ip(), port, 0, sin6.scope_id());
                    return Ok(Some(SocketAddr::V6(v6)));
                }
            }
        }
    }
    Ok(None)
}
