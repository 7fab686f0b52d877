//! Framing of block payloads stored in L2.
//!
//! Every payload carries a one-byte tag: raw bytes follow `FRAME_RAW`, a
//! zstd stream follows `FRAME_ZSTD`. Compressed output is kept only when it
//! is actually smaller, so incompressible blocks cost a single byte.
//! Decoding honours the tag regardless of local settings, so sidecars with
//! different compression settings can share a fleet.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

const FRAME_RAW: u8 = 0;
const FRAME_ZSTD: u8 = 1;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Zstd failed: {0}")]
    Zstd(#[from] std::io::Error),

    #[error("Empty frame")]
    Empty,

    #[error("Unknown frame tag {0}")]
    UnknownTag(u8),
}

#[derive(Debug, Clone, Copy)]
pub struct BlockCodec {
    compress: bool,
    level: i32,
}

impl BlockCodec {
    pub fn new(compress: bool, level: i32) -> Self {
        Self { compress, level }
    }

    /// Codec that never compresses.
    pub fn raw() -> Self {
        Self::new(false, 0)
    }

    pub fn compresses(&self) -> bool {
        self.compress
    }

    pub fn encode(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        if self.compress {
            let compressed = zstd::encode_all(data, self.level)?;
            if compressed.len() < data.len() {
                return Ok(frame(FRAME_ZSTD, &compressed));
            }
        }
        Ok(frame(FRAME_RAW, data))
    }

    pub fn decode(&self, framed: &Bytes) -> Result<Bytes, CodecError> {
        let (&tag, _) = framed.split_first().ok_or(CodecError::Empty)?;
        let body = framed.slice(1..);
        match tag {
            FRAME_RAW => Ok(body),
            FRAME_ZSTD => Ok(Bytes::from(zstd::decode_all(body.as_ref())?)),
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

impl Default for BlockCodec {
    fn default() -> Self {
        Self::raw()
    }
}

fn frame(tag: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 1);
    buf.put_u8(tag);
    buf.put_slice(body);
    buf.freeze()
}
