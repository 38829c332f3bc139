//! Handle-addressed sender.
//!
//! Every send re-resolves the handle, reconciles the socket pool with the
//! resolved endpoints and writes the same envelope bytes to each of them
//! concurrently. Failures are reported as [`SenderEvent::SendFailed`]; an
//! endpoint that cannot be connected is skipped without an event, its
//! receiver is presumed gone and will be swept from the directory.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, instrument, warn};

use crate::config::SenderConfig;
use crate::core::envelope::{Envelope, Payload, PayloadKind};
use crate::core::snapshot::validate_handle;
use crate::directory::DirectoryStore;
use crate::error::{IpcError, Result};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::connect_with_timeout;

/// Buffered events per subscriber before the oldest are overwritten
const EVENT_CAPACITY: usize = 64;

/// Observations emitted around every send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderEvent {
    BeforeSend,
    /// The envelope was written to every reachable endpoint in `endpoints`
    AfterSend { endpoints: Vec<SocketAddr> },
    SendFailed { error: String },
}

/// Buffered-mode cache key: payload kind and message hash
type CacheKey = (PayloadKind, u64);

/// Pooled sockets and the last serialized envelope
#[derive(Debug, Default)]
struct SenderState {
    pool: HashMap<SocketAddr, Option<TcpStream>>,
    cache: Option<(CacheKey, Bytes)>,
}

impl SenderState {
    /// Keep sockets of endpoints that are still registered, add slots for new
    /// ones and close the rest.
    fn reconcile(&mut self, endpoints: &[SocketAddr]) {
        let current: HashSet<SocketAddr> = endpoints.iter().copied().collect();
        self.pool.retain(|endpoint, _| {
            let keep = current.contains(endpoint);
            if !keep {
                debug!(endpoint = %endpoint, "Endpoint vanished, closing socket");
            }
            keep
        });
        for endpoint in current {
            self.pool.entry(endpoint).or_insert(None);
        }
    }
}

/// Result of writing one envelope to one endpoint
enum Delivery {
    Written,
    Skipped,
    Failed(IpcError),
}

/// Sends messages to every receiver registered under one handle
#[derive(Debug)]
pub struct Sender {
    handle: String,
    store: Arc<dyn DirectoryStore>,
    config: SenderConfig,
    state: Mutex<SenderState>,
    events: broadcast::Sender<SenderEvent>,
    disposed: AtomicBool,
}

impl Sender {
    pub fn new(handle: &str, store: Arc<dyn DirectoryStore>, config: SenderConfig) -> Result<Self> {
        validate_handle(handle)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            handle: handle.to_string(),
            store,
            config,
            state: Mutex::new(SenderState::default()),
            events,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn is_buffered(&self) -> bool {
        self.config.buffered
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Observe sends made after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SenderEvent> {
        self.events.subscribe()
    }

    /// Encode `message` and send it to every receiver of the handle.
    ///
    /// In buffered mode a message whose hash equals the previous encoded
    /// message's hash is not serialized again; the previous bytes are resent.
    /// Two distinct values with colliding hashes are therefore
    /// indistinguishable. Raw and encoded sends never share cached bytes.
    pub async fn send<T>(&self, message: &T) -> Result<()>
    where
        T: Serialize + Hash + ?Sized,
    {
        let key = self.config.buffered.then(|| (PayloadKind::Encoded, hash_of(message)));
        self.dispatch(key, || Payload::encode(message)).await
    }

    /// Send bytes that receivers get back unchanged.
    pub async fn send_raw(&self, bytes: impl Into<Bytes>) -> Result<()> {
        let bytes = bytes.into();
        let key = self.config.buffered.then(|| (PayloadKind::Raw, hash_of(&bytes[..])));
        self.dispatch(key, || Ok(Payload::raw(bytes))).await
    }

    /// Close every pooled socket. Further sends fail with `Disposed`.
    pub async fn close(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.lock().await;
        state.pool.clear();
        state.cache = None;
        debug!(handle = %self.handle, "Sender closed");
    }

    #[instrument(skip(self, key, build), fields(handle = %self.handle))]
    async fn dispatch<F>(&self, key: Option<CacheKey>, build: F) -> Result<()>
    where
        F: FnOnce() -> Result<Payload>,
    {
        if self.is_disposed() {
            return Err(IpcError::Disposed);
        }
        let mut state = self.state.lock().await;
        // close() may have won the race for the lock
        if self.is_disposed() {
            return Err(IpcError::Disposed);
        }

        self.emit(SenderEvent::BeforeSend);
        match self.send_locked(&mut state, key, build).await {
            Ok(endpoints) => self.emit(SenderEvent::AfterSend { endpoints }),
            Err(e) => self.fail(&e),
        }
        Ok(())
    }

    async fn send_locked<F>(
        &self,
        state: &mut SenderState,
        key: Option<CacheKey>,
        build: F,
    ) -> Result<Vec<SocketAddr>>
    where
        F: FnOnce() -> Result<Payload>,
    {
        let endpoints = self.store.lookup(&self.handle).await?;
        state.reconcile(&endpoints);

        let bytes = match (key, &state.cache) {
            (Some(key), Some((cached, bytes))) if *cached == key => bytes.clone(),
            _ => {
                let bytes = Envelope::new(self.handle.as_str(), build()?).to_bytes();
                state.cache = key.map(|key| (key, bytes.clone()));
                bytes
            }
        };

        let timeout = self.config.connect_timeout;
        let writes = state.pool.iter_mut().map(|(endpoint, slot)| {
            let bytes = &bytes;
            async move { (*endpoint, deliver(*endpoint, slot, bytes, timeout).await) }
        });

        let mut addressed = Vec::with_capacity(endpoints.len());
        for (endpoint, delivery) in join_all(writes).await {
            addressed.push(endpoint);
            match delivery {
                Delivery::Written => global_metrics().message_sent(bytes.len() as u64),
                Delivery::Skipped => global_metrics().endpoint_skipped(),
                Delivery::Failed(e) => {
                    global_metrics().connection_error();
                    warn!(endpoint = %endpoint, error = %e, "Send failed");
                    self.fail(&e);
                }
            }
        }
        addressed.sort();
        Ok(addressed)
    }

    fn emit(&self, event: SenderEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn fail(&self, error: &IpcError) {
        self.emit(SenderEvent::SendFailed {
            error: error.to_string(),
        });
    }
}

/// Connect if needed and write `bytes`. A pooled socket that fails is replaced
/// by a fresh connection once, since its receiver may have restarted.
async fn deliver(
    endpoint: SocketAddr,
    slot: &mut Option<TcpStream>,
    bytes: &[u8],
    timeout: Duration,
) -> Delivery {
    let reused = slot.is_some();
    if reused {
        match write_envelope(slot, bytes).await {
            Ok(()) => return Delivery::Written,
            Err(e) => debug!(endpoint = %endpoint, error = %e, "Pooled socket failed, reconnecting"),
        }
    }

    match connect_with_timeout(endpoint, timeout).await {
        Ok(stream) => *slot = Some(stream),
        Err(e) => {
            debug!(endpoint = %endpoint, error = %e, "Receiver unreachable, skipping");
            return Delivery::Skipped;
        }
    }
    match write_envelope(slot, bytes).await {
        Ok(()) => Delivery::Written,
        Err(e) => Delivery::Failed(e),
    }
}

async fn write_envelope(slot: &mut Option<TcpStream>, bytes: &[u8]) -> Result<()> {
    let Some(stream) = slot.as_mut() else {
        return Err(IpcError::ConnectionClosed);
    };
    let written = async {
        stream.write_all(bytes).await?;
        stream.flush().await
    }
    .await;
    if let Err(e) = written {
        slot.take();
        return Err(e.into());
    }
    Ok(())
}

fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
