//! Host TCP port tables used by the local liveness sweep and port selection.

use std::collections::HashSet;
#[cfg(target_os = "linux")]
use std::fs;
use std::net::{IpAddr, Ipv4Addr};

use crate::error::Result;
use crate::utils::net::can_bind;

/// `/proc/net/tcp` state code for ESTABLISHED
const TCP_ESTABLISHED: &str = "01";
/// `/proc/net/tcp` state code for LISTEN
const TCP_LISTEN: &str = "0A";

/// Local TCP ports currently in use (listening or connected)
#[derive(Debug, Clone)]
pub enum BoundPorts {
    /// Ports read from the host socket table
    Known(HashSet<u16>),
    /// No table available; answer by trying to bind the wildcard address
    Probe,
}

impl BoundPorts {
    pub fn contains(&self, port: u16) -> bool {
        match self {
            BoundPorts::Known(ports) => ports.contains(&port),
            BoundPorts::Probe => !can_bind(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        }
    }
}

/// Source of the host's bound TCP ports
pub trait PortTable: Send + Sync {
    fn bound_ports(&self) -> Result<BoundPorts>;
}

/// Reads the operating system's socket tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortTable;

impl PortTable for SystemPortTable {
    #[cfg(target_os = "linux")]
    fn bound_ports(&self) -> Result<BoundPorts> {
        let mut ports = HashSet::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            match fs::read_to_string(table) {
                Ok(text) => ports.extend(parse_proc_net_tcp(&text)),
                // tcp6 is absent when IPv6 is disabled
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(BoundPorts::Known(ports))
    }

    #[cfg(not(target_os = "linux"))]
    fn bound_ports(&self) -> Result<BoundPorts> {
        Ok(BoundPorts::Probe)
    }
}

/// A fixed set of ports, for hosts whose tables are managed elsewhere.
#[derive(Debug, Clone, Default)]
pub struct FixedPortTable(pub HashSet<u16>);

impl PortTable for FixedPortTable {
    fn bound_ports(&self) -> Result<BoundPorts> {
        Ok(BoundPorts::Known(self.0.clone()))
    }
}

/// Extract local ports of LISTEN and ESTABLISHED sockets from `/proc/net/tcp{,6}` text.
pub fn parse_proc_net_tcp(text: &str) -> impl Iterator<Item = u16> + '_ {
    text.lines().skip(1).filter_map(|line| {
        let mut columns = line.split_whitespace();
        let local = columns.nth(1)?;
        let state = columns.nth(1)?;
        if state != TCP_LISTEN && state != TCP_ESTABLISHED {
            return None;
        }
        let (_, port) = local.rsplit_once(':')?;
        u16::from_str_radix(port, 16).ok()
    })
}
