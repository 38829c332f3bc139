//! Client side of the directory service.
//!
//! A request is one frame carrying the directory snapshot text (empty for a
//! read), encrypted when the connection holds a [`ChannelCipher`]. The reply is
//! one frame with the service's current snapshot.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, instrument, warn};

use crate::config::ServiceConfig;
use crate::core::frame::FrameCodec;
use crate::core::snapshot::{validate_handle, Directory};
use crate::directory::{select_endpoint, DirectoryStore, RegisterOptions};
use crate::error::{constants, IpcError, Result};
use crate::sweep::{PortTable, SystemPortTable};
use crate::utils::crypto::ChannelCipher;
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::{connect_with_timeout, with_timeout_error, DEFAULT_TIMEOUT};

type ServiceStream = Framed<TcpStream, FrameCodec>;

/// Lazily opened, reused connection to a directory service
#[derive(Debug)]
pub struct ServiceConnection {
    addr: SocketAddr,
    cipher: Option<ChannelCipher>,
    timeout: Duration,
    stream: Mutex<Option<ServiceStream>>,
}

impl ServiceConnection {
    /// Plain-text connection.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            cipher: None,
            timeout: DEFAULT_TIMEOUT,
            stream: Mutex::new(None),
        }
    }

    /// Encrypted connection; derives the channel key from `password` and `salt`.
    pub fn with_encryption(addr: SocketAddr, password: &str, salt: &[u8]) -> Result<Self> {
        Ok(Self::new(addr).with_cipher(ChannelCipher::new(password, salt)?))
    }

    pub fn with_cipher(mut self, cipher: ChannelCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Bound on connecting and on each request/response turn.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connection to the service at `host` using the port and channel settings of `config`.
    pub fn from_config(host: std::net::IpAddr, config: &ServiceConfig) -> Result<Self> {
        let connection = Self::new(SocketAddr::new(host, config.port));
        Ok(match config.cipher()? {
            Some(cipher) => connection.with_cipher(cipher),
            None => connection,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Fetch the service's directory.
    pub async fn get(&self) -> Result<Directory> {
        let reply = self.request("").await?;
        Directory::parse(&reply)
    }

    /// Replace the service's directory; returns the directory the service now holds.
    ///
    /// An empty directory is refused with `InvalidArgument`: its snapshot is the
    /// empty request, which the service answers as a get.
    pub async fn set(&self, directory: &Directory) -> Result<Directory> {
        if directory.is_empty() {
            return Err(IpcError::InvalidArgument(
                constants::ERR_EMPTY_REMOTE_SET.to_string(),
            ));
        }
        let reply = self.request(&directory.to_snapshot()).await?;
        Directory::parse(&reply)
    }

    /// Drop the pooled socket; the next request reconnects.
    pub async fn close(&self) {
        self.stream.lock().await.take();
    }

    /// One request/response turn. A reused socket that fails is replaced and the
    /// request retried once on a fresh connection.
    #[instrument(skip(self, text), fields(service = %self.addr))]
    pub async fn request(&self, text: &str) -> Result<String> {
        let payload = match &self.cipher {
            Some(cipher) => Bytes::from(cipher.encrypt_text(text)?),
            None => Bytes::copy_from_slice(text.as_bytes()),
        };

        let mut slot = self.stream.lock().await;

        let reused = slot.is_some();
        let reply = match self.exchange(&mut slot, payload.clone()).await {
            Err(e) if reused && e.is_connection_error() => {
                debug!(error = %e, "Pooled service connection failed, reconnecting");
                slot.take();
                self.exchange(&mut slot, payload).await
            }
            other => other,
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                slot.take();
                global_metrics().connection_error();
                return Err(e);
            }
        };

        let text = match &self.cipher {
            Some(cipher) => cipher.decrypt_text(&String::from_utf8_lossy(&reply))?,
            None => String::from_utf8(reply.to_vec())
                .map_err(|e| IpcError::InvalidSnapshot(e.to_string()))?,
        };
        Ok(text)
    }

    async fn exchange(&self, slot: &mut Option<ServiceStream>, payload: Bytes) -> Result<Bytes> {
        if slot.is_none() {
            let stream = connect_with_timeout(self.addr, self.timeout)
                .await
                .map_err(|e| {
                    warn!(error = %e, "Directory service unreachable");
                    IpcError::ServiceUnavailable { addr: self.addr }
                })?;
            *slot = Some(Framed::new(stream, FrameCodec));
        }
        let Some(stream) = slot.as_mut() else {
            return Err(IpcError::ConnectionClosed);
        };

        with_timeout_error(
            async {
                stream.send(payload).await?;
                match stream.next().await {
                    Some(frame) => frame,
                    None => Err(IpcError::ConnectionClosed),
                }
            },
            self.timeout,
        )
        .await
    }
}

/// Directory held by a directory service
#[derive(Clone)]
pub struct RemoteStore {
    connection: Arc<ServiceConnection>,
    ports: Arc<dyn PortTable>,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl RemoteStore {
    pub fn new(connection: ServiceConnection) -> Self {
        Self::with_port_table(connection, Arc::new(SystemPortTable))
    }

    /// Store whose port selection consults `ports` for this host's bound ports.
    pub fn with_port_table(connection: ServiceConnection, ports: Arc<dyn PortTable>) -> Self {
        Self {
            connection: Arc::new(connection),
            ports,
        }
    }

    pub fn connection(&self) -> &ServiceConnection {
        &self.connection
    }
}

#[async_trait]
impl DirectoryStore for RemoteStore {
    async fn get_all(&self) -> Result<Directory> {
        self.connection.get().await
    }

    async fn set_all(&self, directory: &Directory) -> Result<()> {
        self.connection.set(directory).await.map(|_| ())
    }

    #[instrument(skip(self, options))]
    async fn register(&self, handle: &str, options: &RegisterOptions) -> Result<SocketAddr> {
        validate_handle(handle)?;
        let endpoint = self.select_endpoint(options)?;
        let mut directory = self.connection.get().await?;
        directory.insert(handle, endpoint);
        self.connection.set(&directory).await?;
        debug!(handle, endpoint = %endpoint, "Registered receiver with directory service");
        Ok(endpoint)
    }

    async fn lookup(&self, handle: &str) -> Result<Vec<SocketAddr>> {
        Ok(self.connection.get().await?.endpoints(handle))
    }

    fn select_endpoint(&self, options: &RegisterOptions) -> Result<SocketAddr> {
        select_endpoint(options, &self.ports.bound_ports()?)
    }

    fn is_remote(&self) -> bool {
        true
    }
}
