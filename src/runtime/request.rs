//! Request dispatch for the event loop.
//!
//! Synchronous: decodes one frame from a raw input slice and writes the
//! encoded response into a raw output slice.

use crate::protocols::frame::{self, FrameError};

/// Result of processing the front of a read buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// No complete frame buffered yet.
    NeedData,
    /// One frame consumed from input, response written to output.
    Response {
        consumed: usize,
        response_len: usize,
    },
    /// Protocol violation, connection should be closed.
    Error(FrameError),
}

/// Process one frame: the response echoes the request payload.
pub fn process_frame(input: &[u8], output: &mut [u8]) -> ProcessResult {
    let frame = match frame::try_decode(input) {
        Ok(Some(frame)) => frame,
        Ok(None) => return ProcessResult::NeedData,
        Err(e) => return ProcessResult::Error(e),
    };

    match frame::encode_into(frame.payload, output) {
        Ok(response_len) => ProcessResult::Response {
            consumed: frame.consumed,
            response_len,
        },
        Err(e) => ProcessResult::Error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::frame::{MAX_FRAME, MAX_MSG};

    #[test]
    fn test_echo_response() {
        let mut out = [0u8; MAX_FRAME];
        let result = process_frame(b"\x02\x00\x00\x00hi\x01", &mut out);
        assert_eq!(
            result,
            ProcessResult::Response {
                consumed: 6,
                response_len: 6
            }
        );
        assert_eq!(&out[..6], b"\x02\x00\x00\x00hi");
    }

    #[test]
    fn test_need_data() {
        let mut out = [0u8; MAX_FRAME];
        assert_eq!(process_frame(b"\x02\x00", &mut out), ProcessResult::NeedData);
        assert_eq!(
            process_frame(b"\x02\x00\x00\x00h", &mut out),
            ProcessResult::NeedData
        );
    }

    #[test]
    fn test_oversize_is_error() {
        let mut out = [0u8; MAX_FRAME];
        let header = ((MAX_MSG + 1) as u32).to_le_bytes();
        assert!(matches!(
            process_frame(&header, &mut out),
            ProcessResult::Error(FrameError::TooLarge { .. })
        ));
    }
}
