//! Length-prefixed framing for the control channel
//!
//! Each frame is a u32 big-endian payload length followed by a bincode-encoded
//! [`ControlMessage`]. The message is decoded into its variant before any
//! dispatch happens; a frame that cannot be decoded is a protocol violation
//! and terminates the control connection that sent it.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::ControlMessage;

/// Frame header size: payload length (4 bytes, big-endian)
pub const FRAME_HEADER_LEN: usize = 4;

/// Control frames carry short commands; anything larger is malformed
pub const MAX_CONTROL_FRAME: u32 = 16 * 1024;

/// Codec for [`ControlMessage`] frames, used through `Framed`
#[derive(Debug, Default)]
pub struct ControlCodec;

impl ControlCodec {
    pub fn new() -> Self {
        Self
    }
}

/// Control framing errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Malformed frame payload: {0}")]
    Malformed(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; FRAME_HEADER_LEN];
        length_bytes.copy_from_slice(&src[..FRAME_HEADER_LEN]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_CONTROL_FRAME as usize {
            return Err(CodecError::FrameTooLarge(length));
        }

        if src.len() < FRAME_HEADER_LEN + length {
            // Wait for the rest of the frame
            src.reserve(FRAME_HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(length);

        let message = bincode::deserialize(&payload)?;
        Ok(Some(message))
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(&item)?;

        if payload.len() > MAX_CONTROL_FRAME as usize {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}
