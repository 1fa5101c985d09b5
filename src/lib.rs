//! framelink - Framed, typed messaging over TCP, UDP and multicast
//!
//! Frames carry a fixed header (magic string, length, message id, response
//! address, archive type) followed by a body archived in one of several
//! formats. Transports hand complete frames to a [`network::MessageHandler`],
//! typically a [`threads::ConcurrentQueue`] drained by consumer threads.

pub mod archive;
pub mod config;
pub mod network;
pub mod protocol;
pub mod threads;

pub use archive::{ArchiveError, ArchiveResult};
pub use network::MessageHandler;
pub use protocol::{ArchiveType, Endpoint, ReceivedMessage};
