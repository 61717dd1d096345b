//! [`tokio_util::codec`] implementations of the wire frames, used by the async server.
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::ProtocolError,
    protocol::{DEFAULT_MAX_PAYLOAD_LEN, FRAME_LEN, Opcode, SampleBuffer},
};

/// Decodes 16-byte opcode frames.
///
/// Encodes opcode frames as well as raw sample buffers, which are the replies on the
/// buffer stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpcodeCodec;

impl Decoder for OpcodeCodec {
    type Item = Opcode;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Opcode>, ProtocolError> {
        if src.len() < FRAME_LEN {
            src.reserve(FRAME_LEN - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(FRAME_LEN);
        Ok(Some(Opcode::from_code(frame.get_u32_le())))
    }
}

impl Encoder<Opcode> for OpcodeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Opcode, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.reserve(FRAME_LEN);
        dst.put_u32_le(item.code());
        dst.put_bytes(0, FRAME_LEN - 4);
        Ok(())
    }
}

impl Encoder<&SampleBuffer> for OpcodeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &SampleBuffer, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.reserve(SampleBuffer::byte_len(item.samples_per_channel()));
        for sample in item.ch1().iter().chain(item.ch2()) {
            dst.put_f32_le(*sample);
        }
        Ok(())
    }
}

/// Length-prefixed JSON frames: a 16-byte header holding the payload length,
/// followed by the UTF-8 JSON payload.
///
/// Decodes into `T`; encodes any serializable value.
#[derive(Debug)]
pub struct JsonFrameCodec<T> {
    max_payload_len: usize,
    _item: PhantomData<fn() -> T>,
}

impl<T> JsonFrameCodec<T> {
    pub fn new(max_payload_len: usize) -> JsonFrameCodec<T> {
        JsonFrameCodec {
            max_payload_len,
            _item: PhantomData,
        }
    }
}

impl<T> Default for JsonFrameCodec<T> {
    fn default() -> Self {
        JsonFrameCodec::new(DEFAULT_MAX_PAYLOAD_LEN)
    }
}

impl<T: DeserializeOwned> Decoder for JsonFrameCodec<T> {
    type Item = T;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
        if src.len() < FRAME_LEN {
            src.reserve(FRAME_LEN - src.len());
            return Ok(None);
        }
        let mut len_field = &src[..4];
        let len = len_field.get_u32_le() as usize;
        if len > self.max_payload_len {
            return Err(ProtocolError::TooManyBytes {
                max: self.max_payload_len,
                got: len,
            });
        }
        if src.len() < FRAME_LEN + len {
            src.reserve(FRAME_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(FRAME_LEN);
        let payload = src.split_to(len);
        Ok(Some(serde_json::from_slice(&payload)?))
    }
}

impl<T, U: Serialize + ?Sized> Encoder<&U> for JsonFrameCodec<T> {
    type Error = ProtocolError;

    fn encode(&mut self, item: &U, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(item)?;
        let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::TooManyBytes {
            max: u32::MAX as usize,
            got: payload.len(),
        })?;
        dst.reserve(FRAME_LEN + payload.len());
        dst.put_u32_le(len);
        dst.put_bytes(0, FRAME_LEN - 4);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
