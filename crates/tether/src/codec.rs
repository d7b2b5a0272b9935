use crate::protocol::MAX_FRAME_BYTES;
use bytes::{Buf, BytesMut};
use prost::Message;
use tether_proto::ConnectionMessage;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Longest possible varint length prefix.
const MAX_PREFIX_BYTES: usize = 10;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("malformed length prefix")]
    BadPrefix,
    #[error("decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("encode failed: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Varint length-delimited protobuf framing for [`ConnectionMessage`].
///
/// Byte-compatible with protobuf's `writeDelimitedTo` / `parseDelimitedFrom`.
#[derive(Debug, Clone)]
pub struct ProtoCodec {
    max_frame_bytes: usize,
}

impl ProtoCodec {
    pub fn new() -> Self {
        Self::new_with_max_length(MAX_FRAME_BYTES)
    }

    pub fn new_with_max_length(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for ProtoCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ProtoCodec {
    type Item = ConnectionMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let prefix_len = match src
            .iter()
            .take(MAX_PREFIX_BYTES)
            .position(|b| b & 0x80 == 0)
        {
            Some(last) => last + 1,
            None if src.len() < MAX_PREFIX_BYTES => return Ok(None),
            None => return Err(CodecError::BadPrefix),
        };

        let len = prost::decode_length_delimiter(&src[..prefix_len])?;
        if len > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }

        let needed = prefix_len + len;
        if src.len() < needed {
            src.reserve(needed - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        let frame = src.split_to(len);
        Ok(Some(ConnectionMessage::decode(frame.freeze())?))
    }
}

impl<T: Into<ConnectionMessage>> Encoder<T> for ProtoCodec {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let msg: ConnectionMessage = item.into();
        let len = msg.encoded_len();
        if len > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        dst.reserve(prost::length_delimiter_len(len) + len);
        msg.encode_length_delimited(dst)?;
        Ok(())
    }
}
