//! # Liveness Sweeper
//!
//! Removes directory entries whose endpoint is no longer backed by a listener.
//!
//! - **Local**: compares registered ports against the host's bound TCP ports.
//!   Cheap, no network traffic, only meaningful for a single-host directory.
//! - **Remote**: connect-probes every endpoint in parallel with a bounded timeout
//!   and rebuilds the directory from the endpoints that answered.

pub mod ports;

use std::net::SocketAddr;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::core::snapshot::Directory;
use crate::error::Result;
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::connect_with_timeout;

pub use ports::{BoundPorts, FixedPortTable, PortTable, SystemPortTable};

/// Drop every endpoint whose port is not bound on this host.
///
/// Returns the number of endpoints removed; zero means the directory is untouched.
pub fn prune_unbound(directory: &mut Directory, bound: &BoundPorts) -> usize {
    let dropped = directory.retain(|handle, endpoint| {
        let alive = bound.contains(endpoint.port());
        if !alive {
            debug!(handle, endpoint = %endpoint, "Pruning unbound endpoint");
        }
        alive
    });
    dropped
}

/// Result of a probing pass
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    /// Freshly built directory holding only the endpoints that answered
    pub directory: Directory,
    /// Endpoints that did not answer
    pub dropped: Vec<(String, SocketAddr)>,
}

impl SweepOutcome {
    pub fn changed(&self) -> bool {
        !self.dropped.is_empty()
    }
}

/// Open and immediately close a connection to `endpoint`.
pub async fn probe(endpoint: SocketAddr, timeout: Duration) -> Result<()> {
    let stream = connect_with_timeout(endpoint, timeout).await?;
    drop(stream);
    Ok(())
}

/// Probe every endpoint of `directory` concurrently.
#[instrument(skip(directory), fields(endpoints = directory.len()))]
pub async fn probe_directory(directory: &Directory, timeout: Duration) -> SweepOutcome {
    let probes = directory.iter().map(|(handle, endpoint)| async move {
        let result = probe(endpoint, timeout).await;
        global_metrics().probe(result.is_ok());
        if let Err(e) = &result {
            warn!(
                handle,
                peer = %endpoint.ip(),
                port = endpoint.port(),
                error = %e,
                "Liveness probe failed"
            );
        }
        (handle, endpoint, result.is_ok())
    });

    let mut outcome = SweepOutcome::default();
    for (handle, endpoint, alive) in join_all(probes).await {
        if alive {
            outcome.directory.insert(handle, endpoint);
        } else {
            outcome.dropped.push((handle.to_string(), endpoint));
        }
    }

    global_metrics().sweep(outcome.dropped.len() as u64);
    info!(
        kept = outcome.directory.len(),
        dropped = outcome.dropped.len(),
        "Liveness sweep finished"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_prune_unbound_keeps_bound_ports() {
        let mut dir = Directory::parse("A*10.0.0.1-9000+9001+,;B*10.0.0.1-9002+,;").unwrap();
        let bound = BoundPorts::Known(HashSet::from([9000]));

        assert_eq!(prune_unbound(&mut dir, &bound), 2);
        assert_eq!(dir.to_snapshot(), "A*10.0.0.1-9000+,;");
        assert_eq!(prune_unbound(&mut dir, &bound), 0);
    }

    #[tokio::test]
    async fn test_probe_directory_drops_closed_ports() {
        let alive = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let alive_addr = alive.local_addr().unwrap();
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let mut dir = Directory::new();
        dir.insert("A", alive_addr);
        dir.insert("A", dead_addr);

        let outcome = probe_directory(&dir, Duration::from_secs(2)).await;
        assert!(outcome.changed());
        assert_eq!(outcome.directory.endpoints("A"), vec![alive_addr]);
        assert_eq!(outcome.dropped, vec![("A".to_string(), dead_addr)]);
    }
}
