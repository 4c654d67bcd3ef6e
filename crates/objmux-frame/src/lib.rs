//! Channel-addressed, length-prefixed framing.
//!
//! Every frame on an objmux connection carries an 8-byte header:
//! - a 4-byte little-endian channel id (the receiver's id)
//! - a 4-byte little-endian payload length
//!
//! followed by exactly that many payload bytes. [`FrameReader`] and
//! [`FrameWriter`] hide partial reads and writes from callers.

pub mod channel;
pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use channel::{is_control, CONTROL, FIRST_DYNAMIC_CHANNEL};
pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
