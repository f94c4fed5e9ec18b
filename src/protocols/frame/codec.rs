//! Frame codec: length prefix + payload.
//!
//! No I/O awareness; works on plain byte slices so the connection state
//! machine can decode straight out of its read buffer and encode straight
//! into its write buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Maximum payload length accepted or produced by either peer.
pub const MAX_MSG: usize = 4096;

/// Largest possible encoded frame.
pub const MAX_FRAME: usize = HEADER_LEN + MAX_MSG;

/// A fully buffered frame borrowed from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Payload bytes (prefix excluded).
    pub payload: &'a [u8],
    /// Bytes the frame occupies in the input (`HEADER_LEN + payload.len()`).
    pub consumed: usize,
}

/// Codec errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Declared or supplied payload length exceeds `max`.
    TooLarge { len: usize, max: usize },
    /// Output slice cannot hold the encoded frame.
    BufferTooSmall { needed: usize, available: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TooLarge { len, max } => {
                write!(f, "frame too long: {len} > {max}")
            }
            FrameError::BufferTooSmall { needed, available } => {
                write!(f, "buffer too small: need {needed}, have {available}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode `payload` into a newly allocated frame.
#[allow(dead_code)] // client side of the protocol
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    check_len(payload.len())?;
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u32_le(payload.len() as u32);
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Encode `payload` into the front of `output`.
///
/// Returns the number of bytes written.
pub fn encode_into(payload: &[u8], output: &mut [u8]) -> Result<usize, FrameError> {
    check_len(payload.len())?;
    let needed = HEADER_LEN + payload.len();
    if output.len() < needed {
        return Err(FrameError::BufferTooSmall {
            needed,
            available: output.len(),
        });
    }
    let mut dst = &mut output[..needed];
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    Ok(needed)
}

/// Try to decode one frame from the front of `input`.
///
/// `Ok(None)` means more bytes are needed. An oversized declared length is
/// an error even if the payload has not arrived yet: the caller must close
/// the connection instead of waiting.
pub fn try_decode(input: &[u8]) -> Result<Option<Frame<'_>>, FrameError> {
    if input.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = (&input[..HEADER_LEN]).get_u32_le() as usize;
    check_len(len)?;

    let consumed = HEADER_LEN + len;
    if input.len() < consumed {
        return Ok(None);
    }

    Ok(Some(Frame {
        payload: &input[HEADER_LEN..consumed],
        consumed,
    }))
}

fn check_len(len: usize) -> Result<(), FrameError> {
    if len > MAX_MSG {
        return Err(FrameError::TooLarge { len, max: MAX_MSG });
    }
    Ok(())
}
