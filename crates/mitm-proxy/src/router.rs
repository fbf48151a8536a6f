//! Frame router (C7): PLAY-phase dispatch to an external handler
//! capability, grounded on the teacher crate's `MessageDispatcher`/
//! `HandlerRegistry` pattern -- generalized here to the single
//! `(frame, dir) -> (forward, reply)` capability the spec demands
//! instead of a message-type-keyed registry, since the core treats every
//! PLAY-phase payload as opaque.

use crate::handshake::Direction;
use async_trait::async_trait;
use mitm_common::error::{ProxyError, Result};

/// A decoded PLAY-phase frame, as handed to a [`FrameHandler`].
pub struct DecodedFrame<'a> {
    pub direction: Direction,
    pub type_id: u32,
    /// Opaque application payload (after the type varint).
    pub payload: &'a [u8],
    /// The original encoded bytes (type varint + payload), used to
    /// re-emit byte-for-byte when the handler leaves the frame alone.
    pub original: &'a [u8],
}

/// One frame queued for (re-)transmission by a [`FrameHandler`].
pub enum QueuedFrame {
    /// Forward the frame exactly as it arrived.
    Unmodified,
    /// Forward a frame with a changed payload; the router re-encodes it
    /// through `encoder` for `type_id`, since the core has no fixed
    /// codec table of its own (§7's "fatal programming error" invariant
    /// below is the fallback when no such encoder is supplied).
    Modified { type_id: u32, payload: Vec<u8> },
}

/// Two empty output queues handed to a handler invocation: `forward`
/// frames go to the peer opposite the arrival side, `reply` frames go
/// back to the side the frame arrived on.
#[derive(Default)]
pub struct OutputQueues {
    pub forward: Vec<QueuedFrame>,
    pub reply: Vec<QueuedFrame>,
}

/// External handler capability the frame router depends on. The default
/// [`IdentityHandler`] makes the proxy a pure forwarder.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(&self, frame: DecodedFrame<'_>, queues: &mut OutputQueues);
}

/// No-op handler: every frame is forwarded to the opposite peer
/// unmodified. This is the default per §9's "external handler as
/// capability" design note.
pub struct IdentityHandler;

#[async_trait]
impl FrameHandler for IdentityHandler {
    async fn handle(&self, _frame: DecodedFrame<'_>, queues: &mut OutputQueues) {
        queues.forward.push(QueuedFrame::Unmodified);
    }
}

/// Type alias for a registered re-encoder: given a modified payload,
/// produce the full wire bytes (type varint + payload) for `type_id`.
pub type Encoder = dyn Fn(u32, &[u8]) -> Vec<u8> + Send + Sync;

/// Re-encode a queued frame back into wire bytes, given the frame that
/// produced it and an optional encoder registry lookup.
///
/// Mirrors `mcp_packet.c`'s `encode_packet`: a frame whose payload was
/// never modified is re-emitted byte-for-byte; a modified frame without
/// a registered encoder is a fatal programming error, not something to
/// paper over.
pub fn encode_queued_frame(
    original: &DecodedFrame<'_>,
    queued: QueuedFrame,
    encoder: Option<&Encoder>,
) -> Result<Vec<u8>> {
    match queued {
        QueuedFrame::Unmodified => Ok(original.original.to_vec()),
        QueuedFrame::Modified { type_id, payload } => match encoder {
            Some(encode) => Ok(encode(type_id, &payload)),
            None => Err(ProxyError::Protocol(format!(
                "frame of type {type_id:#x} was modified but no encoder is registered"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mitm_common::codec;

    fn default_encoder(type_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        codec::write_varint(&mut out, type_id);
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn identity_handler_forwards_unmodified() {
        let handler = IdentityHandler;
        let original = vec![0x10, b'h', b'i'];
        let frame = DecodedFrame {
            direction: Direction::ClientToServer,
            type_id: 0x10,
            payload: b"hi",
            original: &original,
        };
        let mut queues = OutputQueues::default();
        handler.handle(frame, &mut queues).await;

        assert_eq!(queues.forward.len(), 1);
        assert_eq!(queues.reply.len(), 0);
    }

    #[test]
    fn unmodified_frame_reencodes_to_original_bytes() {
        let original = vec![0x10, b'h', b'i'];
        let frame = DecodedFrame {
            direction: Direction::ClientToServer,
            type_id: 0x10,
            payload: b"hi",
            original: &original,
        };
        let out = encode_queued_frame(&frame, QueuedFrame::Unmodified, None).unwrap();
        assert_eq!(out, original);
    }

    #[test]
    fn modified_frame_without_encoder_is_fatal() {
        let original = vec![0x10, b'h', b'i'];
        let frame = DecodedFrame {
            direction: Direction::ClientToServer,
            type_id: 0x10,
            payload: b"hi",
            original: &original,
        };
        let queued = QueuedFrame::Modified {
            type_id: 0x10,
            payload: b"bye".to_vec(),
        };
        let err = encode_queued_frame(&frame, queued, None).unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn modified_frame_with_encoder_re_encodes() {
        let original = vec![0x10, b'h', b'i'];
        let frame = DecodedFrame {
            direction: Direction::ClientToServer,
            type_id: 0x10,
            payload: b"hi",
            original: &original,
        };
        let queued = QueuedFrame::Modified {
            type_id: 0x10,
            payload: b"bye".to_vec(),
        };
        let out = encode_queued_frame(&frame, queued, Some(&default_encoder)).unwrap();
        let mut cursor = codec::Cursor::new(&out);
        let type_id = codec::read_varint(&mut cursor).unwrap();
        assert_eq!(type_id, 0x10);
        assert_eq!(&out[cursor.position()..], b"bye");
    }
}
