//! # Utility Modules
//!
//! Supporting utilities shared by the directory, transport and service layers.
//!
//! ## Components
//! - **Crypto**: Argon2id-derived XChaCha20-Poly1305 channel cipher
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Net**: Local address discovery and listener setup
//! - **Timeout**: Connect bounds and async timeout wrappers

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod net;
pub mod timeout;
