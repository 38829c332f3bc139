//! # Directory Model and Snapshot Grammar
//!
//! The directory maps a handle to the IP addresses its receivers listen on and,
//! per address, the set of TCP ports:
//!
//! ```text
//! Directory := (Entry ';')*
//! Entry     := handle '*' (IpGroup ',')*
//! IpGroup   := ip '-' (port '+')*
//! ```
//!
//! Example: `A*10.0.0.1-9000+9001+,;` is handle `A` listening on two ports of
//! `10.0.0.1`. The characters `; , * + -` are reserved and may not appear in handles.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::{constants, IpcError, Result};

/// Characters that delimit the snapshot grammar
pub const RESERVED_CHARS: [char; 5] = [';', ',', '*', '+', '-'];

const ENTRY_SEP: char = ';';
const GROUP_SEP: char = ',';
const HANDLE_SEP: char = '*';
const IP_SEP: char = '-';
const PORT_SEP: char = '+';

/// Reject blank handles and handles containing grammar delimiters.
pub fn validate_handle(handle: &str) -> Result<()> {
    if handle.trim().is_empty() {
        return Err(IpcError::InvalidArgument(
            constants::ERR_BLANK_HANDLE.to_string(),
        ));
    }
    if handle.contains(&RESERVED_CHARS[..]) {
        return Err(IpcError::InvalidArgument(format!(
            "{}: {handle:?}",
            constants::ERR_RESERVED_HANDLE
        )));
    }
    Ok(())
}

/// `handle -> ip -> set(port)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    entries: BTreeMap<String, BTreeMap<IpAddr, BTreeSet<u16>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of registered endpoints across all handles.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .flat_map(|groups| groups.values())
            .map(BTreeSet::len)
            .sum()
    }

    /// Add an endpoint under `handle`. Returns false if it was already present.
    pub fn insert(&mut self, handle: &str, endpoint: SocketAddr) -> bool {
        self.entries
            .entry(handle.to_string())
            .or_default()
            .entry(endpoint.ip())
            .or_default()
            .insert(endpoint.port())
    }

    /// Remove an endpoint, pruning groups and entries left empty.
    pub fn remove(&mut self, handle: &str, endpoint: SocketAddr) -> bool {
        let Some(groups) = self.entries.get_mut(handle) else {
            return false;
        };
        let removed = match groups.get_mut(&endpoint.ip()) {
            Some(ports) => {
                let removed = ports.remove(&endpoint.port());
                if ports.is_empty() {
                    groups.remove(&endpoint.ip());
                }
                removed
            }
            None => false,
        };
        if groups.is_empty() {
            self.entries.remove(handle);
        }
        removed
    }

    pub fn contains(&self, handle: &str, endpoint: SocketAddr) -> bool {
        self.entries
            .get(handle)
            .and_then(|groups| groups.get(&endpoint.ip()))
            .is_some_and(|ports| ports.contains(&endpoint.port()))
    }

    /// Endpoints registered under `handle`.
    pub fn endpoints(&self, handle: &str) -> Vec<SocketAddr> {
        self.entries
            .get(handle)
            .map(|groups| {
                groups
                    .iter()
                    .flat_map(|(ip, ports)| ports.iter().map(|port| SocketAddr::new(*ip, *port)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn handles(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Every `(handle, endpoint)` pair.
    pub fn iter(&self) -> impl Iterator<Item = (&str, SocketAddr)> + '_ {
        self.entries.iter().flat_map(|(handle, groups)| {
            groups.iter().flat_map(move |(ip, ports)| {
                ports
                    .iter()
                    .map(move |port| (handle.as_str(), SocketAddr::new(*ip, *port)))
            })
        })
    }

    /// Keep only the endpoints for which `keep` returns true. Returns how many were dropped.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&str, SocketAddr) -> bool,
    {
        let mut dropped = 0;
        self.entries.retain(|handle, groups| {
            groups.retain(|ip, ports| {
                let before = ports.len();
                ports.retain(|port| keep(handle, SocketAddr::new(*ip, *port)));
                dropped += before - ports.len();
                !ports.is_empty()
            });
            !groups.is_empty()
        });
        dropped
    }

    /// Parse snapshot text. Empty text is an empty directory.
    pub fn parse(text: &str) -> Result<Self> {
        let mut directory = Directory::new();

        for entry in text.split(ENTRY_SEP).filter(|e| !e.is_empty()) {
            let (handle, groups) = entry.split_once(HANDLE_SEP).ok_or_else(|| {
                IpcError::InvalidSnapshot(format!(
                    "{}: {entry:?}",
                    constants::ERR_MISSING_HANDLE_SEPARATOR
                ))
            })?;
            validate_handle(handle).map_err(|e| IpcError::InvalidSnapshot(e.to_string()))?;

            for group in groups.split(GROUP_SEP).filter(|g| !g.is_empty()) {
                let (ip, ports) = group.split_once(IP_SEP).ok_or_else(|| {
                    IpcError::InvalidSnapshot(format!(
                        "{}: {group:?}",
                        constants::ERR_MISSING_IP_SEPARATOR
                    ))
                })?;
                let ip: IpAddr = ip
                    .parse()
                    .map_err(|_| IpcError::InvalidSnapshot(format!("Invalid IP address {ip:?}")))?;

                for port in ports.split(PORT_SEP).filter(|p| !p.is_empty()) {
                    let port: u16 = port
                        .parse()
                        .map_err(|_| IpcError::InvalidSnapshot(format!("Invalid port {port:?}")))?;
                    directory.insert(handle, SocketAddr::new(ip, port));
                }
            }
        }

        Ok(directory)
    }

    /// Serialize to snapshot text.
    pub fn to_snapshot(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (handle, groups) in &self.entries {
            write!(f, "{handle}{HANDLE_SEP}")?;
            for (ip, ports) in groups {
                write!(f, "{ip}{IP_SEP}")?;
                for port in ports {
                    write!(f, "{port}{PORT_SEP}")?;
                }
                write!(f, "{GROUP_SEP}")?;
            }
            write!(f, "{ENTRY_SEP}")?;
        }
        Ok(())
    }
}

impl FromStr for Directory {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self> {
        Directory::parse(s)
    }
}
