//! Length-prefixed text frames: a big-endian `u16` length, then UTF-8 bytes.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest payload a frame can carry.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

const HEADER_LEN: usize = 2;

/// Framing errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("message of {0} bytes exceeds the {MAX_FRAME_LEN} byte frame limit")]
    TooLong(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec for the control channel. Symmetric for client and server.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlCodec;

impl Decoder for ControlCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = usize::from(u16::from_be_bytes([src[0], src[1]]));
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        // Invalid sequences become U+FFFD so every frame still gets a reply.
        Ok(Some(String::from_utf8_lossy(&payload).into_owned()))
    }
}

impl Encoder<String> for ControlCodec {
    type Error = FrameError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), FrameError> {
        Encoder::<&str>::encode(self, item.as_str(), dst)
    }
}

impl Encoder<&str> for ControlCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = u16::try_from(item.len()).map_err(|_| FrameError::TooLong(item.len()))?;
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u16(len);
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}
