//! Compression envelope (C2).
//!
//! When a session's compression threshold is `>= 0`, every frame payload
//! is wrapped as `varint(U) ‖ body`: `U == 0` means `body` is the raw
//! frame, `U > 0` means `body` is a zlib stream whose inflated length is
//! exactly `U`. Frames smaller than the threshold always use the `U=0`
//! form, matching `mcproxy.c`'s `write_packet`.

use crate::codec::{self, Cursor};
use crate::error::{ProxyError, Result};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};

/// -1 disables compression; any value >= 0 is the byte-size threshold
/// above (inclusive) which a frame gets deflated.
pub type Threshold = i32;

/// Compression is disabled.
pub const DISABLED: Threshold = -1;

/// Wrap `payload` in the compression envelope for the current `threshold`.
///
/// With `threshold < 0` this is the identity function (no envelope at
/// all -- the caller writes `payload` directly as the frame body).
pub fn compress_envelope(payload: &[u8], threshold: Threshold) -> Result<Vec<u8>> {
    if threshold < 0 {
        return Ok(payload.to_vec());
    }

    let mut out = Vec::new();
    if (payload.len() as i64) >= threshold as i64 {
        codec::write_varint(&mut out, payload.len() as u32);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload)?;
        out.extend_from_slice(&encoder.finish()?);
    } else {
        codec::write_varint(&mut out, 0);
        out.extend_from_slice(payload);
    }
    Ok(out)
}

/// Unwrap a compression-enveloped frame body back into its raw payload.
///
/// With `threshold < 0` this is the identity function.
pub fn decompress_envelope(body: &[u8], threshold: Threshold) -> Result<Vec<u8>> {
    if threshold < 0 {
        return Ok(body.to_vec());
    }

    let mut cursor = Cursor::new(body);
    let uncompressed_len = codec::read_varint(&mut cursor)?;
    let rest = &body[cursor.position()..];

    if uncompressed_len == 0 {
        return Ok(rest.to_vec());
    }

    let mut decoder = ZlibDecoder::new(rest);
    let mut out = Vec::with_capacity(uncompressed_len as usize);
    decoder.read_to_end(&mut out)?;

    if out.len() != uncompressed_len as usize {
        return Err(ProxyError::Protocol(format!(
            "zlib inflate length mismatch: expected {}, got {}",
            uncompressed_len,
            out.len()
        )));
    }

    Ok(out)
}

/// Wrap `payload` with an unconditional `U=0` envelope when compression
/// is active, regardless of payload size. Grounded on `mcproxy.c`'s
/// `process_encryption_request`/`process_encryption_response`, which
/// always emit a bare `write_varint(w, 0)` ahead of these two packets
/// even though a legitimate server never sends them once compression is
/// on -- a defensive quirk the source keeps rather than "fixes" (§9).
pub fn wrap_uncompressed(payload: &[u8], threshold: Threshold) -> Vec<u8> {
    if threshold < 0 {
        return payload.to_vec();
    }
    let mut out = Vec::with_capacity(payload.len() + 1);
    codec::write_varint(&mut out, 0);
    out.extend_from_slice(payload);
    out
}
