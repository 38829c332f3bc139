//! # handle-ipc
//!
//! Brokerless messaging between processes over plain TCP. Receivers register
//! an endpoint under a shared handle; senders resolve the handle before every
//! send and write to all registered endpoints.
//!
//! ## Directory backends
//! - [`LocalStore`]: per-user snapshot file guarded by a cross-process lock,
//!   for processes on one host
//! - [`RemoteStore`]: client of a [`DirectoryService`], optionally encrypted,
//!   for processes spread over several hosts
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use handle_ipc::{DirectoryStore, LocalStore, Receiver, Sender};
//!
//! # async fn run() -> handle_ipc::Result<()> {
//! let store: Arc<dyn DirectoryStore> = Arc::new(LocalStore::open(&Default::default())?);
//!
//! let receiver = Receiver::new("jobs", store.clone(), Default::default()).await?;
//! let mut messages = receiver.subscribe();
//!
//! let sender = Sender::new("jobs", store, Default::default())?;
//! sender.send("hello").await?;
//!
//! let message = messages.recv().await.expect("receiver alive");
//! assert_eq!(message.decode::<String>()?, "hello");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod directory;
pub mod error;
pub mod service;
pub mod sweep;
pub mod transport;
pub mod utils;

pub use crate::config::IpcConfig;
pub use crate::core::envelope::{Envelope, Payload, PayloadKind};
pub use crate::core::snapshot::Directory;
pub use crate::directory::{DirectoryStore, LocalStore, RegisterOptions, RemoteStore, ServiceConnection};
pub use crate::error::{IpcError, Result};
pub use crate::service::DirectoryService;
pub use crate::transport::{ReceivedMessage, Receiver, Sender, SenderEvent};
pub use crate::utils::crypto::ChannelCipher;
