use crate::{Message, ProtocolError, Result, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 8;

/// One length-prefixed, type-tagged unit on the wire.
///
/// The tag is kept as a raw integer so frames with unknown tags can still be
/// read off the stream and reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: i32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: i32, payload: impl Into<Bytes>) -> Self {
        Frame {
            message_type,
            payload: payload.into(),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: i32,
    pub length: usize,
}

impl FrameHeader {
    /// Parse and validate the 8 header bytes
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&bytes[0..4]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[4..8]);

        let message_type = i32::from_le_bytes(tag);
        let length = i32::from_le_bytes(len);

        if length < 0 {
            return Err(ProtocolError::NegativeLength(length));
        }
        let length = length as usize;
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(length));
        }

        Ok(FrameHeader {
            message_type,
            length,
        })
    }
}

/// Codec for the broker's framing.
///
/// Frame format: [4-byte message type (i32 LE)] [4-byte payload length (i32 LE)] [payload]
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&src[..HEADER_LEN]);
        let header = FrameHeader::parse(&header_bytes)?;

        // Wait for complete frame
        let total = HEADER_LEN + header.length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(header.length).freeze();

        Ok(Some(Frame {
            message_type: header.message_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let length = item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(length));
        }

        dst.reserve(HEADER_LEN + length);
        dst.put_i32_le(item.message_type);
        dst.put_i32_le(length as i32);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Encoder<&Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<()> {
        Encoder::<Frame>::encode(self, item.to_frame(), dst)
    }
}
