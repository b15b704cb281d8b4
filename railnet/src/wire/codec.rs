//! Length-prefixed JSON frame codec.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame; a worker configuration comfortably
/// fits, anything bigger is a protocol violation.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the maximum of {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec turning a byte stream into typed frames.
///
/// `Tx` is the frame type written, `Rx` the frame type read; server and
/// client instantiate it with opposite orientations.
#[derive(Debug)]
pub struct JsonFrameCodec<Tx, Rx> {
    _marker: PhantomData<(Tx, Rx)>,
}

impl<Tx, Rx> JsonFrameCodec<Tx, Rx> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<Tx, Rx> Default for JsonFrameCodec<Tx, Rx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Tx: Serialize, Rx> Encoder<Tx> for JsonFrameCodec<Tx, Rx> {
    type Error = CodecError;

    fn encode(&mut self, item: Tx, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl<Tx, Rx: DeserializeOwned> Decoder for JsonFrameCodec<Tx, Rx> {
    type Item = Rx;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let payload = src.split_to(len);
        Ok(Some(serde_json::from_slice(&payload)?))
    }
}
