//! Length-prefixed frame layout.
//!
//! Every frame is `tag (4 ASCII bytes) ‖ length (u32 big-endian) ‖ payload`.
//! The framing itself is tag-agnostic; this pipeline uses exactly two tags:
//! `JDAT` carrying a data payload outbound and `ACKN` carrying an
//! acknowledgement inbound.
//!
//! An inbound payload larger than [`MAX_PAYLOAD`] resets the connection. The
//! receiver never allocates for an oversized length.

use bytes::{BufMut, Bytes, BytesMut};

/// Outbound data batch.
pub const TAG_JDAT: [u8; 4] = *b"JDAT";
/// Inbound acknowledgement.
pub const TAG_ACKN: [u8; 4] = *b"ACKN";

/// Bytes of tag + length prefix.
pub const HEADER_LEN: usize = 8;
/// Maximum accepted frame payload: 1 MiB.
pub const MAX_PAYLOAD: usize = 1024 * 1024;
/// Bytes of a payload nonce.
pub const NONCE_LEN: usize = 16;

/// Malformed or oversized frame data. Treated as connection loss by callers.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),

    #[error("truncated {0} payload")]
    Truncated(&'static str),
}

/// One parsed frame off the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    pub tag: [u8; 4],
    pub payload: Bytes,
}

/// A decoded `ACKN` payload: the first `sequence` events of the payload
/// identified by `nonce` are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub nonce: [u8; NONCE_LEN],
    pub sequence: u32,
}

/// Prepends the frame header to a payload.
#[must_use]
pub fn encode(tag: [u8; 4], payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&tag);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Splits a header into tag and payload length, enforcing [`MAX_PAYLOAD`].
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<([u8; 4], usize), FrameError> {
    let tag = [header[0], header[1], header[2], header[3]];
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(FrameError::TooLarge(len));
    }
    Ok((tag, len))
}

/// Builds an `ACKN` payload.
#[must_use]
pub fn encode_ackn(nonce: [u8; NONCE_LEN], sequence: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(NONCE_LEN + 4);
    buf.put_slice(&nonce);
    buf.put_u32(sequence);
    buf.freeze()
}

/// Decodes an `ACKN` payload.
pub fn decode_ackn(payload: &[u8]) -> Result<Ack, FrameError> {
    if payload.len() < NONCE_LEN + 4 {
        return Err(FrameError::Truncated("ACKN"));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&payload[..NONCE_LEN]);
    let sequence = u32::from_be_bytes([
        payload[NONCE_LEN],
        payload[NONCE_LEN + 1],
        payload[NONCE_LEN + 2],
        payload[NONCE_LEN + 3],
    ]);
    Ok(Ack { nonce, sequence })
}

/// Decodes a `JDAT` payload into its nonce and serialized event bodies.
///
/// The publisher only encodes this direction; decoding exists for the
/// receiving side of test rigs and diagnostic tooling.
pub fn decode_jdat(payload: &[u8]) -> Result<([u8; NONCE_LEN], Vec<Bytes>), FrameError> {
    if payload.len() < NONCE_LEN + 4 {
        return Err(FrameError::Truncated("JDAT"));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&payload[..NONCE_LEN]);
    let mut rest = &payload[NONCE_LEN..];
    let count = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    rest = &rest[4..];

    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        if rest.len() < 4 {
            return Err(FrameError::Truncated("JDAT"));
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            return Err(FrameError::Truncated("JDAT"));
        }
        events.push(Bytes::copy_from_slice(&rest[..len]));
        rest = &rest[len..];
    }
    Ok((nonce, events))
}
