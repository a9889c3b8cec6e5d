//! tokio-util codec for relay -> client frames

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{ServerFrameHeader, PROTOCOL_VERSION};
use crate::error::{Error, Result};

/// Frames encoded payloads as `[version][length][payload]`.
///
/// The relay only ever encodes with it; the decoder half serves clients and
/// tests that consume the relay's output.
#[derive(Debug, Clone, Copy)]
pub struct ServerFrameCodec {
    max_length: usize,
}

impl ServerFrameCodec {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl Encoder<Bytes> for ServerFrameCodec {
    type Error = Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge {
                declared: payload.len(),
                max: u32::MAX as usize,
            });
        }
        let header = ServerFrameHeader::new(&payload);
        dst.reserve(ServerFrameHeader::SIZE + payload.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for ServerFrameCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < ServerFrameHeader::SIZE {
            return Ok(None);
        }
        let mut raw = [0u8; ServerFrameHeader::SIZE];
        raw.copy_from_slice(&src[..ServerFrameHeader::SIZE]);
        let header = ServerFrameHeader::from_bytes(&raw);

        if header.version != PROTOCOL_VERSION {
            return Err(Error::MalformedHeader(format!(
                "unsupported protocol version {}",
                header.version
            )));
        }
        let length = header.length as usize;
        if length > self.max_length {
            return Err(Error::FrameTooLarge {
                declared: length,
                max: self.max_length,
            });
        }
        if src.len() < ServerFrameHeader::SIZE + length {
            src.reserve(ServerFrameHeader::SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(ServerFrameHeader::SIZE);
        Ok(Some(src.split_to(length)))
    }
}
