//! Protocol module - Defines the framed wire protocol
//!
//! Every frame is a fixed-size header followed by a variable-size body:
//! - 16 bytes magic string (NUL padded)
//! - 4 bytes total length, header included (big-endian)
//! - 4 bytes message id (big-endian, signed)
//! - 16 bytes response host (NUL padded) + 2 bytes response port
//! - 1 byte archive type
//! - Variable length body

mod builder;
mod codec;
mod header;

pub use builder::*;
pub use codec::*;
pub use header::*;

/// Default magic string stamped on every frame
pub const DEFAULT_MAGIC_STRING: &str = "_BEGIN_MESSAGE_";

/// Length of the magic string field
pub const MAGIC_STRING_LEN: usize = 16;

/// Length of the host part of the response address field
pub const RESPONSE_ADDRESS_LEN: usize = 16;

/// Size of the encoded header in bytes
pub const HEADER_LEN: usize = MAGIC_STRING_LEN + 4 + 4 + RESPONSE_ADDRESS_LEN + 2 + 1;

/// Default upper bound on a single frame (16 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
