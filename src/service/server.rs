use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServiceConfig;
use crate::core::frame::FrameCodec;
use crate::core::snapshot::Directory;
use crate::error::Result;
use crate::sweep::{probe_directory, SweepOutcome};
use crate::utils::crypto::ChannelCipher;
use crate::utils::metrics::{global_metrics, Timer};
use crate::utils::net::bind_listener;
use crate::utils::timeout::SHUTDOWN_TIMEOUT;

/// Listen backlog of the service sockets
const SERVICE_BACKLOG: i32 = 128;

/// Authoritative directory plus a counter bumped on every replacement
#[derive(Debug, Default)]
struct Versioned {
    directory: Directory,
    generation: u64,
}

impl Versioned {
    fn replace(&mut self, directory: Directory) {
        self.directory = directory;
        self.generation += 1;
    }

    /// Apply a sweep that started at `generation`.
    fn install(&mut self, generation: u64, outcome: SweepOutcome) {
        if self.generation == generation {
            self.replace(outcome.directory);
        } else {
            for (handle, endpoint) in &outcome.dropped {
                self.directory.remove(handle, *endpoint);
            }
            self.generation += 1;
        }
    }
}

#[derive(Debug)]
struct ServiceState {
    directory: Mutex<Versioned>,
    cipher: Option<ChannelCipher>,
    active_connections: AtomicUsize,
}

impl ServiceState {
    /// Answer one request frame with the encoded current snapshot.
    async fn handle_request(&self, request: &[u8], peer: SocketAddr) -> Result<Bytes> {
        global_metrics().directory_request();
        let replacement = match self.decode_request(request) {
            Ok(text) if text.is_empty() => None,
            Ok(text) => match Directory::parse(&text) {
                Ok(directory) => Some(directory),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Ignoring malformed directory");
                    None
                }
            },
            Err(e) => {
                warn!(peer = %peer, error = %e, "Ignoring undecryptable request");
                None
            }
        };

        let snapshot = {
            let mut state = self.directory.lock().await;
            if let Some(directory) = replacement {
                debug!(peer = %peer, endpoints = directory.len(), "Directory replaced");
                state.replace(directory);
            }
            state.directory.to_snapshot()
        };

        match &self.cipher {
            Some(cipher) => Ok(Bytes::from(cipher.encrypt_text(&snapshot)?)),
            None => Ok(Bytes::from(snapshot)),
        }
    }

    fn decode_request(&self, request: &[u8]) -> Result<String> {
        let text = String::from_utf8_lossy(request);
        match &self.cipher {
            Some(_) if request.is_empty() => Ok(String::new()),
            Some(cipher) => cipher.decrypt_text(&text),
            None => Ok(text.into_owned()),
        }
    }

    /// Probe every endpoint and drop the unreachable ones.
    ///
    /// The lock is held only to copy the directory and to install the result;
    /// replacements made while probing survive because only the dropped
    /// endpoints are subtracted from a directory that changed meanwhile.
    async fn sweep(&self, probe_timeout: Duration) -> usize {
        let _timer = Timer::start("liveness_sweep");
        let (snapshot, generation) = {
            let state = self.directory.lock().await;
            (state.directory.clone(), state.generation)
        };
        if snapshot.is_empty() {
            return 0;
        }

        let outcome = probe_directory(&snapshot, probe_timeout).await;
        if !outcome.changed() {
            return 0;
        }

        let dropped = outcome.dropped.len();
        self.directory.lock().await.install(generation, outcome);
        dropped
    }
}

/// Network directory server with a periodic liveness sweep
#[derive(Debug)]
pub struct DirectoryService {
    state: Arc<ServiceState>,
    local_addrs: Vec<SocketAddr>,
    probe_timeout: Duration,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DirectoryService {
    /// Bind IPv4-any and IPv6-any on the configured port and start serving.
    ///
    /// Port 0 takes an ephemeral port for IPv4 and reuses it for IPv6. A host
    /// without IPv6 is served on IPv4 only.
    #[instrument(skip(config), fields(port = config.port))]
    pub async fn start(config: &ServiceConfig) -> Result<Self> {
        let cipher = config.cipher()?;

        let v4 = bind_listener(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port),
            SERVICE_BACKLOG,
        )?;
        let port = v4.local_addr()?.port();
        let mut listeners = vec![v4];
        match bind_listener(
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            SERVICE_BACKLOG,
        ) {
            Ok(v6) => listeners.push(v6),
            Err(e) => warn!(port, error = %e, "IPv6 listener unavailable, serving IPv4 only"),
        }

        let state = Arc::new(ServiceState {
            directory: Mutex::new(Versioned::default()),
            cipher,
            active_connections: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();

        let mut local_addrs = Vec::with_capacity(listeners.len());
        let mut tasks = Vec::with_capacity(listeners.len() + 1);
        for listener in listeners {
            let addr = listener.local_addr()?;
            info!(address = %addr, encrypted = state.cipher.is_some(), "Directory service listening");
            local_addrs.push(addr);
            tasks.push(tokio::spawn(accept_loop(
                listener,
                Arc::clone(&state),
                shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(sweep_loop(
            Arc::clone(&state),
            config.sweep_interval,
            config.probe_timeout,
            shutdown.clone(),
        )));

        Ok(Self {
            state,
            local_addrs,
            probe_timeout: config.probe_timeout,
            shutdown,
            tasks,
        })
    }

    /// Addresses actually bound (IPv4 first).
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn port(&self) -> u16 {
        self.local_addrs.first().map(SocketAddr::port).unwrap_or_default()
    }

    /// Copy of the authoritative directory.
    pub async fn directory(&self) -> Directory {
        self.state.directory.lock().await.directory.clone()
    }

    /// Run one liveness sweep now; returns the number of endpoints dropped.
    pub async fn sweep_now(&self) -> usize {
        self.state.sweep(self.probe_timeout).await
    }

    /// Number of client connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.state.active_connections.load(Ordering::Relaxed)
    }

    /// Stop listeners and sweeper, wait briefly for open connections, discard state.
    pub async fn shutdown(mut self) {
        info!("Shutting down directory service. Waiting for connections to close...");
        self.shutdown.cancel();

        let deadline = tokio::time::sleep(SHUTDOWN_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            let connections = self.state.active_connections.load(Ordering::Relaxed);
            if connections == 0 {
                info!("All connections closed, shutting down");
                break;
            }
            tokio::select! {
                _ = &mut deadline => {
                    warn!(connections, "Shutdown timeout reached, forcing exit");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        global_metrics().log_metrics();
    }
}

impl Drop for DirectoryService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ServiceState>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = Arc::clone(&state);
                    let shutdown = shutdown.clone();
                    state.active_connections.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(async move {
                        serve_connection(stream, peer, &state, shutdown).await;
                        state.active_connections.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                Err(e) => {
                    global_metrics().connection_error();
                    error!(error = %e, "Error accepting connection");
                }
            }
        }
    }
}

#[instrument(skip(stream, peer, state, shutdown), fields(peer = %peer))]
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: &ServiceState,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Could not disable Nagle");
    }
    let mut framed = Framed::new(stream, FrameCodec);

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = framed.next() => frame,
        };
        let request = match request {
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                global_metrics().connection_error();
                warn!(peer = %peer.ip(), port = peer.port(), error = %e, "Client read failed");
                break;
            }
            None => break,
        };

        let reply = match state.handle_request(&request, peer).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "Failed to encode directory reply");
                break;
            }
        };
        if let Err(e) = framed.send(reply).await {
            global_metrics().connection_error();
            warn!(peer = %peer.ip(), port = peer.port(), error = %e, "Client write failed");
            break;
        }
    }
    debug!("Connection closed");
}

async fn sweep_loop(
    state: Arc<ServiceState>,
    interval: Duration,
    probe_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let dropped = state.sweep(probe_timeout).await;
                if dropped > 0 {
                    info!(dropped, "Sweep pruned unreachable endpoints");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ServiceConnection;

    fn test_config() -> ServiceConfig {
        ServiceConfig {
            port: 0,
            probe_timeout: Duration::from_secs(2),
            ..ServiceConfig::default()
        }
    }

    fn loopback(service: &DirectoryService) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), service.port())
    }

    #[test]
    fn test_install_keeps_concurrent_registrations() {
        let a: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:9001".parse().unwrap();
        let c: SocketAddr = "10.0.0.2:9000".parse().unwrap();

        let mut state = Versioned::default();
        let mut dir = Directory::new();
        dir.insert("A", a);
        dir.insert("A", b);
        state.replace(dir);
        let started = state.generation;

        let mut fresh = Directory::new();
        fresh.insert("A", a);
        let outcome = SweepOutcome {
            directory: fresh,
            dropped: vec![("A".to_string(), b)],
        };

        // a registration lands while the probes run
        let mut registered = state.directory.clone();
        registered.insert("B", c);
        state.replace(registered);

        state.install(started, outcome);
        assert_eq!(state.directory.endpoints("A"), vec![a]);
        assert_eq!(state.directory.endpoints("B"), vec![c]);
    }

    #[tokio::test]
    async fn test_get_set_round_trip() {
        let service = DirectoryService::start(&test_config()).await.unwrap();
        let client = ServiceConnection::new(loopback(&service));

        assert!(client.get().await.unwrap().is_empty());

        let dir = Directory::parse("A*10.0.0.1-9000+,;").unwrap();
        assert_eq!(client.set(&dir).await.unwrap(), dir);
        assert_eq!(client.get().await.unwrap(), dir);
        assert_eq!(service.directory().await, dir);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_set_keeps_directory() {
        let service = DirectoryService::start(&test_config()).await.unwrap();
        let client = ServiceConnection::new(loopback(&service));

        let dir = Directory::parse("A*10.0.0.1-9000+,;").unwrap();
        client.set(&dir).await.unwrap();
        let reply = client.request("not a directory").await.unwrap();
        assert_eq!(Directory::parse(&reply).unwrap(), dir);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_drops_unreachable() {
        let service = DirectoryService::start(&test_config()).await.unwrap();
        let alive = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let alive_addr = alive.local_addr().unwrap();
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let mut dir = Directory::new();
        dir.insert("A", alive_addr);
        dir.insert("A", dead_addr);
        ServiceConnection::new(loopback(&service))
            .set(&dir)
            .await
            .unwrap();

        assert_eq!(service.sweep_now().await, 1);
        assert_eq!(service.directory().await.endpoints("A"), vec![alive_addr]);
        assert_eq!(service.sweep_now().await, 0);

        service.shutdown().await;
    }
}
