//! Timeout constants and async timeout wrappers.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{IpcError, Result};

/// Bound on a single TCP connect (sender fan-out, service client, liveness probe)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between two liveness sweeps of the directory service
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How long shutdown waits for open connections before giving up on them
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a future and map an elapsed deadline to `IpcError::Timeout`
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(IpcError::Timeout),
    }
}

/// Connect to `addr`, failing with `IpcError::Timeout` once `duration` has elapsed.
pub async fn connect_with_timeout(addr: SocketAddr, duration: Duration) -> Result<TcpStream> {
    debug!(peer = %addr, timeout_ms = duration.as_millis() as u64, "Connecting");
    with_timeout_error(
        async {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        },
        duration,
    )
    .await
}
