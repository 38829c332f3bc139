//! # Error Types
//!
//! Error handling for handle-based messaging and the endpoint directory.
//!
//! This module defines every error variant that can surface from the wire codec,
//! the directory stores, the sender/receiver pair and the directory service.
//!
//! ## Error Categories
//! - **Connection Errors**: endpoint or directory service unreachable
//! - **Protocol Errors**: foreign handles, malformed frames, malformed snapshots
//! - **Registration Errors**: port exhaustion, invalid handles
//! - **Cryptographic Errors**: key derivation, encryption and decryption failures
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use handle_ipc::core::snapshot::validate_handle;
//! use handle_ipc::error::{IpcError, Result};
//! use tracing::error;
//!
//! fn check(handle: &str) -> Result<()> {
//!     validate_handle(handle)?;
//!     Ok(())
//! }
//!
//! if let Err(e) = check("bad;handle") {
//!     error!(error = %e, "Rejected handle");
//!     assert!(matches!(e, IpcError::InvalidArgument(_)));
//! }
//! ```

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Argument errors
    pub const ERR_BLANK_HANDLE: &str = "Handle must not be blank";
    pub const ERR_RESERVED_HANDLE: &str = "Handle contains a reserved character (; , * + -)";

    /// Directory errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
    pub const ERR_NO_LOCAL_ADDRESS: &str = "No non-loopback IPv4 or IPv6 address available";
    pub const ERR_NO_USER_DIRECTORY: &str = "No per-user data directory available";
    pub const ERR_EMPTY_REMOTE_SET: &str =
        "An empty directory reads as a get request and cannot be stored remotely";

    /// Snapshot grammar errors
    pub const ERR_MISSING_HANDLE_SEPARATOR: &str = "Entry is missing the '*' separator";
    pub const ERR_MISSING_IP_SEPARATOR: &str = "IP group is missing the '-' separator";

    /// Cryptographic errors
    pub const ERR_CIPHERTEXT_TOO_SHORT: &str = "Ciphertext shorter than nonce";
}

/// Primary error type for all handle-ipc operations
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Directory service unreachable at {addr}")]
    ServiceUnavailable { addr: SocketAddr },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unexpected handle on connection")]
    UnexpectedHandle,

    #[error("No free TCP port available for registration")]
    PortExhaustion,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(u64),

    #[error("Invalid payload kind flag: {0}")]
    InvalidPayloadKind(u8),

    #[error("Invalid directory snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Lock failed: {0}")]
    LockFailed(String),

    #[error("Instance disposed")]
    Disposed,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl IpcError {
    /// True for failures that mean a peer or the directory service could not be reached.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            IpcError::Connection(_)
                | IpcError::ServiceUnavailable { .. }
                | IpcError::ConnectionClosed
                | IpcError::Timeout
        ) || matches!(self, IpcError::Io(e) if is_connection_io_error(e))
    }
}

fn is_connection_io_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

/// Type alias for Results using IpcError
pub type Result<T> = std::result::Result<T, IpcError>;
