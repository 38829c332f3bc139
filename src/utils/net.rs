//! Local address discovery and listener setup.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::{constants, IpcError, Result};

/// Pick the address a receiver registers under: the first non-loopback IPv4
/// address, else the first routable non-loopback IPv6 address.
pub fn select_registration_ip<I>(candidates: I) -> Option<IpAddr>
where
    I: IntoIterator<Item = IpAddr>,
{
    let mut v6 = None;
    for ip in candidates {
        if ip.is_loopback() || ip.is_unspecified() {
            continue;
        }
        match ip {
            IpAddr::V4(_) => return Some(ip),
            // link-local needs a scope id to be dialed from another host
            IpAddr::V6(v6_ip) if (v6_ip.segments()[0] & 0xffc0) == 0xfe80 => {}
            IpAddr::V6(_) => {
                v6.get_or_insert(ip);
            }
        }
    }
    v6
}

/// Resolve this host's registration address from its network interfaces.
///
/// Falls back to `127.0.0.1` when the host has no usable interface address.
pub fn discover_local_ip() -> Result<IpAddr> {
    let interfaces = local_ip_address::list_afinet_netifas().map_err(|e| {
        IpcError::Connection(format!("{}: {e}", constants::ERR_NO_LOCAL_ADDRESS))
    })?;

    match select_registration_ip(interfaces.into_iter().map(|(_, ip)| ip)) {
        Some(ip) => {
            debug!(ip = %ip, "Selected registration address");
            Ok(ip)
        }
        None => {
            warn!("{}, registering on loopback", constants::ERR_NO_LOCAL_ADDRESS);
            Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
        }
    }
}

/// True if nothing on this host currently holds `ip:port`.
pub fn can_bind(ip: IpAddr, port: u16) -> bool {
    std::net::TcpListener::bind(SocketAddr::new(ip, port)).is_ok()
}

/// Bind a non-blocking listener with an explicit backlog.
///
/// IPv6 listeners are IPv6-only so that an IPv4-any listener can share the port.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    TcpListener::from_std(socket.into())
}
