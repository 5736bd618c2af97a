//! Wire codec: document encoding and stream framing.
//!
//! A `CertifiedMessage` is encoded as one JSON document. Datagram transports
//! send that document as-is; stream transports prefix it with its length:
//!
//!   [ len: u32 BE | document (len bytes) ]

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::envelope::CertifiedMessage;
use crate::error::ProtoError;

const LEN_PREFIX: usize = 4;

pub fn encode(message: &CertifiedMessage) -> Result<Bytes, ProtoError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode(packet: &[u8]) -> Result<CertifiedMessage, ProtoError> {
    Ok(serde_json::from_slice(packet)?)
}

/// Length-prefix one document for a stream transport.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    out.freeze()
}

/// Split one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. A length above `max_len`
/// is a protocol violation; the stream cannot be resynchronised after it.
pub fn decode_frame(buf: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>, ProtoError> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max_len {
        return Err(ProtoError::FrameTooLarge { len, max: max_len });
    }
    if buf.len() < LEN_PREFIX + len {
        buf.reserve(LEN_PREFIX + len - buf.len());
        return Ok(None);
    }
    buf.advance(LEN_PREFIX);
    Ok(Some(buf.split_to(len).freeze()))
}
