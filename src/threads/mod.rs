//! Threads module - Worker pools and message hand-off
//!
//! Provides:
//! - A blocking concurrent queue for passing messages between threads
//! - The I/O thread group that drives all sockets
//! - A consumer thread that dispatches queued messages by id

mod io_group;
mod message_queue_thread;
mod queue;

pub use io_group::*;
pub use message_queue_thread::*;
pub use queue::*;
