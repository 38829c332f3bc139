//! # Core Protocol Components
//!
//! Wire framing, the sender/receiver envelope and the directory snapshot format.
//!
//! ## Components
//! - **Frame**: 8-byte length-prefixed framing, async helpers and a tokio codec
//! - **Envelope**: handle-tagged raw or encoded payloads
//! - **Snapshot**: the `handle -> ip -> ports` directory and its text grammar
//!
//! ## Wire Format
//! ```text
//! Frame:    [Length(8)] [Payload(N)]
//! Envelope: Frame(handle) [Kind(1)] Frame(payload)
//! ```
//!
//! ## Security
//! - Maximum frame size: 64MB (prevents memory exhaustion)
//! - Length validation before allocation

pub mod envelope;
pub mod frame;
pub mod snapshot;
