//! Frame extraction over a streaming byte buffer.
//!
//! Every frame on the wire is `varint(len) ‖ body`. [`extract_frame`] is
//! the pump's single entry point for turning accumulated socket bytes
//! into complete frames: it never partially consumes a buffer, returning
//! `Ok(None)` whenever a caller should hold what it has and wait for more
//! bytes from the socket.

use crate::codec::{self, Cursor};
use crate::error::{ProxyError, Result};

/// Below this many buffered bytes, a leading VarInt byte with its
/// continuation bit set is treated as "maybe incomplete" rather than
/// decoded -- mirrors the source's `rx->C(data) < 129` guard, which
/// exists because a 5-byte VarInt length prefix plus a modest packet
/// body comfortably fits under 129 bytes, so there's no point racing
/// a partial length decode when that little data has even arrived.
const MIN_MULTIBYTE_LOOKAHEAD: usize = 129;

/// An oversize frame is a fatal protocol error (§5): the read side must
/// be bounded by frame extraction, not by however much a hostile length
/// prefix asks the peer to buffer.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Try to extract one complete frame from the front of `buf`.
///
/// Returns `Ok(Some((consumed, frame)))` when a full frame is present,
/// where `consumed` is the number of leading bytes (header + body) the
/// caller should drop from its buffer, and `frame` is the frame body
/// (still enveloped if compression is active -- this layer only knows
/// about length framing). Returns `Ok(None)` when `buf` doesn't yet
/// hold a complete frame; the caller should wait for more socket data.
/// Returns `Err` if the *declared* length already exceeds
/// [`MAX_FRAME_LEN`], before a single byte of that body is required to
/// have arrived -- otherwise a hostile peer could declare an arbitrarily
/// large frame and have the caller buffer it forever.
pub fn extract_frame(buf: &[u8]) -> Result<Option<(usize, &[u8])>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] & 0x80 != 0 && buf.len() < MIN_MULTIBYTE_LOOKAHEAD {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    let len = match codec::read_varint(&mut cursor) {
        Ok(len) => len as usize,
        Err(e) if e.is_recoverable() => return Ok(None),
        Err(e) => return Err(e),
    };

    if len > MAX_FRAME_LEN {
        return Err(ProxyError::Protocol(format!(
            "oversize frame: declared length {len} exceeds {MAX_FRAME_LEN}"
        )));
    }

    let header_len = cursor.position();
    let total = header_len + len;
    if total > buf.len() {
        return Ok(None);
    }

    Ok(Some((total, &buf[header_len..total])))
}

/// Drain every complete frame currently available at the front of `buf`,
/// removing consumed bytes as it goes and leaving any trailing partial
/// frame in place for the next read.
pub fn drain_frames(buf: &mut Vec<u8>) -> Result<Vec<Vec<u8>>> {
    let mut frames = Vec::new();
    loop {
        match extract_frame(buf)? {
            Some((consumed, frame)) => {
                frames.push(frame.to_vec());
                buf.drain(..consumed);
            }
            None => break,
        }
    }
    Ok(frames)
}

/// Write a length-prefixed frame: `varint(body.len()) ‖ body`.
pub fn write_frame(buf: &mut Vec<u8>, body: &[u8]) {
    codec::write_varint(buf, body.len() as u32);
    buf.extend_from_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_a_single_small_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello");

        let (consumed, frame) = extract_frame(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(frame, b"hello");
    }

    #[test]
    fn waits_for_incomplete_body() {
        let mut buf = Vec::new();
        codec::write_varint(&mut buf, 10);
        buf.extend_from_slice(b"short");

        assert!(extract_frame(&buf).unwrap().is_none());
    }

    #[test]
    fn waits_on_ambiguous_multibyte_prefix_under_lookahead() {
        // A continuation-bit byte with under 129 total bytes buffered:
        // must defer even though the VarInt itself might be decodable.
        let mut buf = vec![0x80];
        buf.extend_from_slice(&[0u8; 50]);
        assert!(extract_frame(&buf).unwrap().is_none());
    }

    #[test]
    fn decodes_multibyte_prefix_once_lookahead_is_met() {
        let mut buf = Vec::new();
        codec::write_varint(&mut buf, 200);
        buf.extend_from_slice(&vec![0xABu8; 200]);
        // total buffer is well past the 129-byte lookahead threshold
        let (consumed, frame) = extract_frame(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(frame.len(), 200);
    }

    #[test]
    fn drains_multiple_queued_frames_and_keeps_a_trailing_partial() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"one");
        write_frame(&mut buf, b"two");
        buf.extend_from_slice(&[0x03]); // a dangling partial frame header

        let frames = drain_frames(&mut buf).unwrap();
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(buf, vec![0x03]);
    }

    #[test]
    fn empty_buffer_yields_none() {
        assert!(extract_frame(&[]).unwrap().is_none());
    }

    #[test]
    fn oversize_declared_length_is_fatal_before_body_arrives() {
        // A hostile length prefix declaring far more than MAX_FRAME_LEN
        // must be rejected immediately, without waiting for that much
        // body to actually show up in the buffer.
        let mut buf = Vec::new();
        codec::write_varint(&mut buf, (MAX_FRAME_LEN + 1) as u32);
        buf.extend_from_slice(&[0u8; 200]);

        let err = extract_frame(&buf).unwrap_err();
        assert!(!err.is_recoverable());
    }
}
