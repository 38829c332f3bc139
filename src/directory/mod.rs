//! # Directory Store
//!
//! Abstract `handle -> ip -> set(port)` storage shared by senders and receivers.
//!
//! Two backends implement [`DirectoryStore`]:
//! - [`LocalStore`](local::LocalStore): a per-user persistent snapshot guarded by a
//!   named cross-process lock, pruned against the host's bound ports on every access.
//! - [`RemoteStore`](remote::RemoteStore): forwards get/set to the directory service;
//!   liveness is maintained by the service's sweep.
//!
//! Stores are injected into [`Sender`](crate::transport::sender::Sender) and
//! [`Receiver`](crate::transport::receiver::Receiver) as `Arc<dyn DirectoryStore>`.

pub mod local;
pub mod remote;

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tracing::debug;

use crate::core::snapshot::Directory;
use crate::error::{IpcError, Result};
use crate::sweep::BoundPorts;
use crate::utils::net::{can_bind, discover_local_ip};

pub use local::LocalStore;
pub use remote::{RemoteStore, ServiceConnection};

/// Where and on which ports a receiver may register
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Address to register instead of the discovered one
    pub ip: Option<IpAddr>,
    /// Candidate ports in order of preference; empty means any free port
    pub allowed_ports: Vec<u16>,
}

impl RegisterOptions {
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_allowed_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.allowed_ports = ports.into_iter().collect();
        self
    }
}

/// Storage of the endpoint directory
#[async_trait]
pub trait DirectoryStore: Send + Sync + fmt::Debug {
    /// Read the whole directory.
    async fn get_all(&self) -> Result<Directory>;

    /// Replace the whole directory. Remote stores refuse an empty directory
    /// with `InvalidArgument`.
    async fn set_all(&self, directory: &Directory) -> Result<()>;

    /// Choose an endpoint for a new receiver of `handle` and record it.
    async fn register(&self, handle: &str, options: &RegisterOptions) -> Result<SocketAddr>;

    /// Current endpoints of `handle`.
    async fn lookup(&self, handle: &str) -> Result<Vec<SocketAddr>>;

    /// Pick an endpoint without recording it.
    fn select_endpoint(&self, options: &RegisterOptions) -> Result<SocketAddr>;

    /// True when the store is backed by the directory service.
    fn is_remote(&self) -> bool {
        false
    }
}

/// Registration address: the explicit override, else the discovered local address.
pub fn resolve_registration_ip(options: &RegisterOptions) -> Result<IpAddr> {
    match options.ip {
        Some(ip) => Ok(ip),
        None => discover_local_ip(),
    }
}

/// Choose a port on `ip` that is neither in `bound` nor refused by the OS.
///
/// With an allowed-port pool the first usable member wins; otherwise the lowest
/// usable port counting up from 1.
pub fn select_port(ip: IpAddr, allowed_ports: &[u16], bound: &BoundPorts) -> Result<u16> {
    let usable = |port: u16| port != 0 && !bound.contains(port) && can_bind(ip, port);

    let port = if allowed_ports.is_empty() {
        (1..=u16::MAX).find(|port| usable(*port))
    } else {
        allowed_ports.iter().copied().find(|port| usable(*port))
    };

    match port {
        Some(port) => {
            debug!(ip = %ip, port, "Selected receiver port");
            Ok(port)
        }
        None => Err(IpcError::PortExhaustion),
    }
}

/// Resolve address and port for a new registration.
pub fn select_endpoint(options: &RegisterOptions, bound: &BoundPorts) -> Result<SocketAddr> {
    let ip = resolve_registration_ip(options)?;
    let port = select_port(ip, &options.allowed_ports, bound)?;
    Ok(SocketAddr::new(ip, port))
}
