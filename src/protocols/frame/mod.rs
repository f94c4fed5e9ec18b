//! Length-prefixed frame protocol.
//!
//! Requests and responses share one wire format:
//!
//! ```text
//! +----------------+----------------------+
//! | length (4B LE) | payload (length B)   |
//! +----------------+----------------------+
//! ```
//!
//! `length` excludes itself and never exceeds [`MAX_MSG`]. A peer that
//! declares a longer frame has its connection closed; there is no error
//! frame on the wire.
//!
//! The server answers every request frame with a response frame carrying
//! the same payload.

pub mod codec;

pub use codec::{encode_into, try_decode, FrameError, MAX_FRAME, MAX_MSG};
