//! Length-prefixed framing.
//!
//! Each message is a 4-byte big-endian length prefix followed by a UTF-8
//! JSON payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::{GatewayError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const FRAME_HEADER_LEN: usize = 4;

/// Bytes of an oversized frame kept for diagnostics.
const OVERSIZED_HEAD_LEN: usize = 256;

/// Append one frame to `out`.
pub fn encode_frame(payload: &[u8], max_frame: usize, out: &mut BytesMut) -> Result<()> {
    if payload.len() > max_frame || payload.len() > u32::MAX as usize {
        return Err(GatewayError::FrameTooLarge {
            size: payload.len(),
            max: max_frame,
        });
    }
    out.reserve(FRAME_HEADER_LEN + payload.len());
    out.put_u32(payload.len() as u32);
    out.extend_from_slice(payload);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Payload(Bytes),
    /// A frame longer than allowed; its payload is skipped.
    Oversized { size: usize, head: Bytes },
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame: usize,
    discard_remaining: usize,
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            discard_remaining: 0,
        }
    }

    /// Take the next complete frame out of `buf`, if there is one.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Option<Frame> {
        if self.discard_remaining > 0 {
            let skipped = self.discard_remaining.min(buf.len());
            buf.advance(skipped);
            self.discard_remaining -= skipped;
            if self.discard_remaining > 0 {
                return None;
            }
        }

        if buf.len() < FRAME_HEADER_LEN {
            return None;
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if len > self.max_frame {
            buf.advance(FRAME_HEADER_LEN);
            let head = buf.split_to(OVERSIZED_HEAD_LEN.min(len).min(buf.len())).freeze();
            let skipped = (len - head.len()).min(buf.len());
            buf.advance(skipped);
            self.discard_remaining = len - head.len() - skipped;
            return Some(Frame::Oversized { size: len, head });
        }

        if buf.len() < FRAME_HEADER_LEN + len {
            return None;
        }
        buf.advance(FRAME_HEADER_LEN);
        Some(Frame::Payload(buf.split_to(len).freeze()))
    }

    /// Forget any partially skipped frame.
    pub fn reset(&mut self) {
        self.discard_remaining = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_split_across_reads() {
        let mut encoded = BytesMut::new();
        encode_frame(b"hello world", 1024, &mut encoded).unwrap();

        let mut decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..6]);
        assert_eq!(decoder.decode(&mut buf), None);

        buf.extend_from_slice(&encoded[6..]);
        assert_eq!(
            decoder.decode(&mut buf),
            Some(Frame::Payload(Bytes::from_static(b"hello world")))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        encode_frame(b"one", 1024, &mut buf).unwrap();
        encode_frame(b"", 1024, &mut buf).unwrap();
        encode_frame(b"three", 1024, &mut buf).unwrap();

        let mut decoder = FrameDecoder::new(1024);
        assert_eq!(decoder.decode(&mut buf), Some(Frame::Payload(Bytes::from_static(b"one"))));
        assert_eq!(decoder.decode(&mut buf), Some(Frame::Payload(Bytes::new())));
        assert_eq!(decoder.decode(&mut buf), Some(Frame::Payload(Bytes::from_static(b"three"))));
        assert_eq!(decoder.decode(&mut buf), None);
    }

    #[test]
    fn test_encode_oversized_returns_error() {
        let mut out = BytesMut::new();
        let result = encode_frame(&[0u8; 32], 16, &mut out);
        assert!(matches!(result, Err(GatewayError::FrameTooLarge { size: 32, max: 16 })));
        assert!(out.is_empty());
    }

    #[test]
    fn test_oversized_frame_is_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u32(40);
        buf.extend_from_slice(&[b'x'; 10]);

        let mut decoder = FrameDecoder::new(16);
        match decoder.decode(&mut buf) {
            Some(Frame::Oversized { size, head }) => {
                assert_eq!(size, 40);
                assert_eq!(head.len(), 10);
            }
            other => panic!("Expected oversized frame, got: {:?}", other),
        }
        assert!(buf.is_empty());

        // The rest of the oversized payload arrives together with a good frame
        buf.extend_from_slice(&[b'x'; 30]);
        encode_frame(b"{}", 16, &mut buf).unwrap();
        assert_eq!(decoder.decode(&mut buf), Some(Frame::Payload(Bytes::from_static(b"{}"))));
    }
}
