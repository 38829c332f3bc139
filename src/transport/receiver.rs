//! Handle-addressed receiver.
//!
//! A receiver registers one endpoint under its handle, listens on it and
//! publishes every envelope carrying that handle to its subscribers. Connections
//! are only accepted while somebody is subscribed; until then peers wait in the
//! listen backlog.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ReceiverConfig;
use crate::core::envelope::{Envelope, Payload};
use crate::core::snapshot::validate_handle;
use crate::directory::{DirectoryStore, RegisterOptions};
use crate::error::{IpcError, Result};
use crate::utils::metrics::global_metrics;
use crate::utils::net::bind_listener;

/// Messages buffered per subscriber before the oldest are overwritten
const MESSAGE_CAPACITY: usize = 1024;

/// Base pause between two registration attempts; a random jitter is added
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// A message published by a [`Receiver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub handle: String,
    pub payload: Payload,
}

impl ReceivedMessage {
    /// Decode an encoded payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        self.payload.decode()
    }

    /// Bytes of a raw payload.
    pub fn raw(&self) -> Option<&[u8]> {
        self.payload.as_raw().map(|bytes| &bytes[..])
    }
}

#[derive(Debug)]
struct ReceiverShared {
    handle: String,
    messages: broadcast::Sender<ReceivedMessage>,
    subscribed: Notify,
    shutdown: CancellationToken,
}

/// Listens for messages sent to one handle
#[derive(Debug)]
pub struct Receiver {
    shared: Arc<ReceiverShared>,
    endpoint: SocketAddr,
    local_addr: SocketAddr,
}

impl Receiver {
    /// Register under `handle` and start listening.
    ///
    /// Registration is retried `registration_attempts` times. Running out of
    /// ports is returned to the caller, as is an unreachable directory service
    /// when `store` is remote. Any other registration failure is logged and the
    /// receiver listens on a locally chosen endpoint that is not advertised.
    #[instrument(skip(store, config))]
    pub async fn new(
        handle: &str,
        store: Arc<dyn DirectoryStore>,
        config: ReceiverConfig,
    ) -> Result<Self> {
        validate_handle(handle)?;
        let options = RegisterOptions {
            ip: config.local_ip,
            allowed_ports: config.allowed_ports.clone(),
        };
        let backlog = listen_backlog(config.listen_backlog, store.is_remote());

        let (endpoint, listener) =
            register_and_bind(handle, store.as_ref(), &options, &config, backlog).await?;
        let local_addr = listener.local_addr()?;
        info!(handle, endpoint = %endpoint, local = %local_addr, "Receiver listening");

        let (messages, _) = broadcast::channel(MESSAGE_CAPACITY);
        let shared = Arc::new(ReceiverShared {
            handle: handle.to_string(),
            messages,
            subscribed: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(accept_loop(listener, Arc::clone(&shared)));

        Ok(Self {
            shared,
            endpoint,
            local_addr,
        })
    }

    pub fn handle(&self) -> &str {
        &self.shared.handle
    }

    /// Endpoint advertised in the directory.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive messages from now on. The accept loop runs while at least one
    /// subscription is alive.
    pub fn subscribe(&self) -> broadcast::Receiver<ReceivedMessage> {
        let subscription = self.shared.messages.subscribe();
        self.shared.subscribed.notify_one();
        subscription
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Stop listening and drop every open connection. The endpoint stays in the
    /// directory until a sweep removes it.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.is_cancelled() {
            debug!(handle = %self.shared.handle, "Receiver shutting down");
            self.shared.shutdown.cancel();
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Listen backlog for a receiver. A remote store gets one extra slot for the
/// service's liveness check racing a sender.
fn listen_backlog(configured: i32, remote: bool) -> i32 {
    configured + i32::from(remote)
}

async fn register_and_bind(
    handle: &str,
    store: &dyn DirectoryStore,
    options: &RegisterOptions,
    config: &ReceiverConfig,
    backlog: i32,
) -> Result<(SocketAddr, TcpListener)> {
    let attempts = config.registration_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        let result = match store.register(handle, options).await {
            Ok(endpoint) => listen_on(endpoint, backlog).map(|listener| (endpoint, listener)),
            Err(e) => Err(e),
        };
        match result {
            Ok(bound) => return Ok(bound),
            Err(IpcError::PortExhaustion) => return Err(IpcError::PortExhaustion),
            Err(e @ IpcError::InvalidArgument(_)) => return Err(e),
            Err(e) => {
                debug!(handle, attempt, error = %e, "Registration attempt failed");
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            let jitter = rand::rng().random_range(0..RETRY_BACKOFF.as_millis() as u64);
            tokio::time::sleep(RETRY_BACKOFF * attempt + Duration::from_millis(jitter)).await;
        }
    }

    match last_error {
        Some(e) if store.is_remote() && e.is_connection_error() => Err(e),
        Some(e) => {
            warn!(handle, error = %e, "Registration failed, listening unadvertised");
            let endpoint = store.select_endpoint(options)?;
            let listener = listen_on(endpoint, backlog)?;
            Ok((endpoint, listener))
        }
        None => Err(IpcError::PortExhaustion),
    }
}

/// Bind the registered endpoint. An address that is not local to this host
/// (a NAT override) falls back to the wildcard address of its family.
fn listen_on(endpoint: SocketAddr, backlog: i32) -> Result<TcpListener> {
    match bind_listener(endpoint, backlog) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrNotAvailable => {
            let any = match endpoint.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            debug!(endpoint = %endpoint, "Address not local, binding wildcard");
            Ok(bind_listener(SocketAddr::new(any, endpoint.port()), backlog)?)
        }
        Err(e) => Err(e.into()),
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<ReceiverShared>) {
    loop {
        if shared.messages.receiver_count() == 0 {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = shared.subscribed.notified() => continue,
            }
        }

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(stream, peer, Arc::clone(&shared)));
                }
                Err(e) => {
                    if shared.shutdown.is_cancelled() {
                        break;
                    }
                    debug!(error = %e, "Accept failed");
                }
            }
        }
    }
    debug!(handle = %shared.handle, "Accept loop stopped");
}

async fn serve_connection(mut stream: TcpStream, peer: SocketAddr, shared: Arc<ReceiverShared>) {
    loop {
        let envelope = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            envelope = Envelope::read_from(&mut stream, &shared.handle) => envelope,
        };
        match envelope {
            Ok(envelope) => {
                global_metrics().message_received(envelope.payload.bytes().len() as u64);
                // no subscribers left is fine
                let _ = shared.messages.send(ReceivedMessage {
                    handle: envelope.handle,
                    payload: envelope.payload,
                });
            }
            Err(IpcError::UnexpectedHandle) => {
                global_metrics().foreign_handle();
                debug!(peer = %peer, "Foreign handle, dropping connection");
                break;
            }
            Err(IpcError::ConnectionClosed) => break,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Connection failed");
                break;
            }
        }
    }
}
