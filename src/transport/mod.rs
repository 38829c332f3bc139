//! # Transport Layer
//!
//! Handle-addressed messaging between processes.
//!
//! - [`Sender`]: resolves its handle before every send, keeps one socket per
//!   resolved endpoint and fans each envelope out to all of them.
//! - [`Receiver`]: registers an endpoint under its handle and publishes the
//!   envelopes it receives to subscribers.
//!
//! Both take the directory as an `Arc<dyn DirectoryStore>`, so a local store
//! and a directory service client are interchangeable.

pub mod receiver;
pub mod sender;

pub use receiver::{ReceivedMessage, Receiver};
pub use sender::{Sender, SenderEvent};
