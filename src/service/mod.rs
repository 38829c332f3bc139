//! # Directory Service
//!
//! Long-running TCP server that owns the authoritative in-memory directory for
//! a distributed deployment.
//!
//! ## Protocol
//! One framed request answered by one framed reply, repeated for the life of
//! the connection:
//! ```text
//! Request:  Frame(empty)      -> get
//!           Frame(snapshot)   -> replace
//! Reply:    Frame(current snapshot)
//! ```
//! With a configured password and salt both directions carry the snapshot
//! encrypted as base64 text.
//!
//! ## Liveness
//! A sweeper task connect-probes every endpoint on a fixed interval and drops
//! the ones that do not answer. The directory lock is taken only to copy the
//! directory and to install the result.

pub mod server;

pub use server::DirectoryService;
