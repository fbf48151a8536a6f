//! Handshake state machine (C4): IDLE→STATUS/LOGIN→PLAY transitions and
//! interception of the encryption exchange, grounded on
//! `process_packet`/`process_encryption_request`/`process_encryption_response`.

use crate::session::{Phase, Session};
use mitm_common::codec::{self, Cursor};
use mitm_common::crypto;
use mitm_common::error::{ProxyError, Result};

/// Which leg a frame arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Outcome of processing one IDLE/STATUS/LOGIN-phase frame.
pub enum Action {
    /// Forward this exact frame body (type varint + payload, not yet
    /// length- or compression-framed) to the opposite peer, applying the
    /// session's ordinary compression envelope.
    Forward(Vec<u8>),
    /// Forward this frame body using the defensive unconditional `U=0`
    /// envelope (§4.4 point 7) rather than the ordinary threshold logic --
    /// only ever used for the synthesized EncryptionRequest/Response.
    ForwardRawEnvelope(Vec<u8>),
    /// Like `ForwardRawEnvelope`, but additionally signals the pump to
    /// invoke the auth bridge (C5): the client's AES key has just been
    /// decrypted and verified, so this is the point at which the
    /// rewritten join request gets posted to the real session server
    /// (§4.4 EncryptionResponse step 5, strictly before activation).
    EncryptionResponseReady(Vec<u8>),
    /// Fatal: tear down the session.
    Terminate(&'static str),
}

// Packet type ids relevant to the handshake. Values match the vanilla
// protocol's historical login/handshake ids; everything else is treated
// as opaque and forwarded unmodified regardless of numeric type.
const HANDSHAKE: u32 = 0x00;
const LOGIN_ENCRYPTION_RESPONSE_C2S: u32 = 0x01;
const LOGIN_ENCRYPTION_REQUEST_S2C: u32 = 0x01;
const LOGIN_SUCCESS_S2C: u32 = 0x02;
const LOGIN_SET_COMPRESSION_S2C: u32 = 0x03;

const NEXT_STATE_STATUS: u32 = 1;
const NEXT_STATE_LOGIN: u32 = 2;

/// Process one decompressed frame body (`type varint ‖ payload`) arriving
/// during IDLE, STATUS, or LOGIN. PLAY-phase frames never reach this
/// function -- they go to the frame router (C7) instead.
pub fn process_frame(session: &mut Session, dir: Direction, frame: &[u8]) -> Result<Action> {
    let mut cursor = Cursor::new(frame);
    let type_id = codec::read_varint(&mut cursor)?;
    let body = &frame[cursor.position()..];

    match (session.phase, dir, type_id) {
        (Phase::Idle, Direction::ClientToServer, HANDSHAKE) => {
            handle_handshake(session, body, frame)
        }
        (Phase::Login, Direction::ServerToClient, LOGIN_ENCRYPTION_REQUEST_S2C) => {
            handle_encryption_request(session, body)
        }
        (Phase::Login, Direction::ClientToServer, LOGIN_ENCRYPTION_RESPONSE_C2S) => {
            handle_encryption_response(session, body)
        }
        (Phase::Login, Direction::ServerToClient, LOGIN_SET_COMPRESSION_S2C) => {
            handle_set_compression(session, body, frame)
        }
        (Phase::Login, Direction::ServerToClient, LOGIN_SUCCESS_S2C) => {
            session.phase = Phase::Play;
            tracing::info!("login success, entering PLAY phase");
            Ok(Action::Forward(frame.to_vec()))
        }
        _ => Ok(Action::Forward(frame.to_vec())),
    }
}

fn handle_handshake(session: &mut Session, mut body: &[u8], frame: &[u8]) -> Result<Action> {
    let mut cursor = Cursor::new(body);
    let _protocol_version = codec::read_varint(&mut cursor)?;
    let _server_addr = codec::read_string(&mut cursor)?;
    let _server_port = codec::read_u16(&mut cursor)?;
    let next_state = codec::read_varint(&mut cursor)?;
    body = &body[cursor.position()..];
    debug_assert!(body.is_empty());

    session.phase = match next_state {
        NEXT_STATE_STATUS => Phase::Status,
        NEXT_STATE_LOGIN => Phase::Login,
        other => {
            return Err(ProxyError::Protocol(format!(
                "handshake requested unknown next state {other}"
            )));
        }
    };

    Ok(Action::Forward(frame.to_vec()))
}

fn handle_encryption_request(session: &mut Session, body: &[u8]) -> Result<Action> {
    let mut cursor = Cursor::new(body);
    let server_id = codec::read_string(&mut cursor)?;
    let server_pubkey_der = codec::read_bytes(&mut cursor)?.to_vec();
    let server_token_bytes = codec::read_bytes(&mut cursor)?.to_vec();

    tracing::info!(%server_id, "intercepted EncryptionRequest from real server");

    let server_public_key = crypto::decode_public_key_der(&server_pubkey_der)?;

    if server_token_bytes.len() != 4 {
        return Err(ProxyError::Protocol(
            "server verification token is not 4 bytes".into(),
        ));
    }
    let mut server_token = [0u8; 4];
    server_token.copy_from_slice(&server_token_bytes);

    session.server_crypto.server_id = server_id.clone();
    session.server_crypto.public_key = Some(server_public_key);
    session.server_crypto.public_key_der = server_pubkey_der;
    session.server_crypto.verification_token = Some(server_token);
    session.server_crypto.shared_key = crypto::generate_aes_key();

    let proxy_pubkey_der = session.client_crypto.keypair.public_key_der()?;
    let client_token = session.client_crypto.verification_token;

    let mut out = Vec::new();
    codec::write_varint(&mut out, LOGIN_ENCRYPTION_REQUEST_S2C);
    codec::write_string(&mut out, &server_id);
    codec::write_bytes(&mut out, &proxy_pubkey_der);
    codec::write_bytes(&mut out, &client_token);

    Ok(Action::ForwardRawEnvelope(out))
}

fn handle_encryption_response(session: &mut Session, body: &[u8]) -> Result<Action> {
    let mut cursor = Cursor::new(body);
    let encrypted_key = codec::read_bytes(&mut cursor)?.to_vec();
    let encrypted_token = codec::read_bytes(&mut cursor)?.to_vec();

    let decrypted_key = session.client_crypto.keypair.decrypt(&encrypted_key)?;
    let decrypted_token = session.client_crypto.keypair.decrypt(&encrypted_token)?;

    if decrypted_token != session.client_crypto.verification_token {
        tracing::error!("client verification token mismatch");
        return Ok(Action::Terminate("verification token mismatch"));
    }

    if decrypted_key.len() != 16 {
        return Err(ProxyError::Protocol(
            "decrypted client AES key is not 16 bytes".into(),
        ));
    }
    let mut client_key = [0u8; 16];
    client_key.copy_from_slice(&decrypted_key);
    session.client_crypto.shared_key = Some(client_key);

    let server_public_key = session
        .server_crypto
        .public_key
        .as_ref()
        .ok_or_else(|| ProxyError::Protocol("EncryptionResponse before EncryptionRequest".into()))?;
    let server_token = session.server_crypto.verification_token.ok_or_else(|| {
        ProxyError::Protocol("EncryptionResponse before EncryptionRequest".into())
    })?;

    let encrypted_server_key = crypto::rsa_encrypt(server_public_key, &session.server_crypto.shared_key)?;
    let encrypted_server_token = crypto::rsa_encrypt(server_public_key, &server_token)?;

    let mut out = Vec::new();
    codec::write_varint(&mut out, LOGIN_ENCRYPTION_RESPONSE_C2S);
    codec::write_bytes(&mut out, &encrypted_server_key);
    codec::write_bytes(&mut out, &encrypted_server_token);

    // Deferred: activation happens at the end of this pump iteration so
    // this very frame leaves the proxy in plaintext (§4.4 point 6).
    session.encryption_pending = true;

    Ok(Action::EncryptionResponseReady(out))
}

fn handle_set_compression(session: &mut Session, body: &[u8], frame: &[u8]) -> Result<Action> {
    let mut cursor = Cursor::new(body);
    let threshold = codec::read_varint(&mut cursor)? as i32;
    session.compression_threshold = threshold;
    tracing::info!(threshold, "compression enabled");
    Ok(Action::Forward(frame.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mitm_common::crypto::RsaKeypair;

    fn encode_handshake(next_state: u32) -> Vec<u8> {
        let mut out = Vec::new();
        codec::write_varint(&mut out, HANDSHAKE);
        codec::write_varint(&mut out, 340);
        codec::write_string(&mut out, "play.example.com");
        codec::write_u16(&mut out, 25565);
        codec::write_varint(&mut out, next_state);
        out
    }

    #[test]
    fn handshake_to_login_sets_phase() {
        let mut session = Session::new().unwrap();
        let frame = encode_handshake(NEXT_STATE_LOGIN);
        let action = process_frame(&mut session, Direction::ClientToServer, &frame).unwrap();
        assert_eq!(session.phase, Phase::Login);
        assert!(matches!(action, Action::Forward(f) if f == frame));
    }

    #[test]
    fn handshake_to_status_sets_phase() {
        let mut session = Session::new().unwrap();
        let frame = encode_handshake(NEXT_STATE_STATUS);
        process_frame(&mut session, Direction::ClientToServer, &frame).unwrap();
        assert_eq!(session.phase, Phase::Status);
    }

    #[test]
    fn encryption_request_rewrites_pubkey_and_token() {
        let mut session = Session::new().unwrap();
        session.phase = Phase::Login;

        let server_keypair = RsaKeypair::generate().unwrap();
        let server_der = server_keypair.public_key_der().unwrap();
        let server_token = [1u8, 2, 3, 4];

        let mut body = Vec::new();
        codec::write_varint(&mut body, LOGIN_ENCRYPTION_REQUEST_S2C);
        codec::write_string(&mut body, "serverid123");
        codec::write_bytes(&mut body, &server_der);
        codec::write_bytes(&mut body, &server_token);

        let action = process_frame(&mut session, Direction::ServerToClient, &body).unwrap();
        let rewritten = match action {
            Action::ForwardRawEnvelope(f) => f,
            _ => panic!("expected ForwardRawEnvelope"),
        };

        let mut cursor = Cursor::new(&rewritten);
        let type_id = codec::read_varint(&mut cursor).unwrap();
        assert_eq!(type_id, LOGIN_ENCRYPTION_REQUEST_S2C);
        let server_id = codec::read_string(&mut cursor).unwrap();
        assert_eq!(server_id, "serverid123");
        let sent_pubkey = codec::read_bytes(&mut cursor).unwrap();
        assert_ne!(sent_pubkey, server_der.as_slice());
        let sent_token = codec::read_bytes(&mut cursor).unwrap();
        assert_ne!(sent_token, server_token);
        assert_eq!(sent_token, session.client_crypto.verification_token);

        assert_eq!(session.server_crypto.server_id, "serverid123");
        assert!(session.server_crypto.public_key.is_some());
        assert_eq!(session.server_crypto.verification_token, Some(server_token));
    }

    #[test]
    fn encryption_response_token_mismatch_terminates() {
        let mut session = Session::new().unwrap();
        session.phase = Phase::Login;

        // Seed server crypto as if EncryptionRequest had already run.
        let server_keypair = RsaKeypair::generate().unwrap();
        session.server_crypto.public_key = Some(server_keypair.public);
        session.server_crypto.verification_token = Some([9, 9, 9, 9]);

        let wrong_token = [0xAAu8; 4];
        let encrypted_key =
            crypto::rsa_encrypt(&session.client_crypto.keypair.public, &[0u8; 16]).unwrap();
        let encrypted_token =
            crypto::rsa_encrypt(&session.client_crypto.keypair.public, &wrong_token).unwrap();

        let mut body = Vec::new();
        codec::write_varint(&mut body, LOGIN_ENCRYPTION_RESPONSE_C2S);
        codec::write_bytes(&mut body, &encrypted_key);
        codec::write_bytes(&mut body, &encrypted_token);

        let action = process_frame(&mut session, Direction::ClientToServer, &body).unwrap();
        assert!(matches!(action, Action::Terminate(_)));
        assert!(!session.encryption_pending);
    }

    #[test]
    fn encryption_response_success_arms_pending_activation() {
        let mut session = Session::new().unwrap();
        session.phase = Phase::Login;

        let server_keypair = RsaKeypair::generate().unwrap();
        session.server_crypto.public_key = Some(server_keypair.public.clone());
        session.server_crypto.verification_token = Some([9, 9, 9, 9]);
        session.server_crypto.shared_key = [7u8; 16];

        let client_aes_key = [3u8; 16];
        let encrypted_key =
            crypto::rsa_encrypt(&session.client_crypto.keypair.public, &client_aes_key).unwrap();
        let encrypted_token = crypto::rsa_encrypt(
            &session.client_crypto.keypair.public,
            &session.client_crypto.verification_token,
        )
        .unwrap();

        let mut body = Vec::new();
        codec::write_varint(&mut body, LOGIN_ENCRYPTION_RESPONSE_C2S);
        codec::write_bytes(&mut body, &encrypted_key);
        codec::write_bytes(&mut body, &encrypted_token);

        let action = process_frame(&mut session, Direction::ClientToServer, &body).unwrap();
        assert!(matches!(action, Action::EncryptionResponseReady(_)));
        assert!(session.encryption_pending);
        assert_eq!(session.client_crypto.shared_key, Some(client_aes_key));

        session.activate_encryption_if_pending();
        assert!(session.encryption_active);
    }

    #[test]
    fn set_compression_updates_threshold_and_forwards() {
        let mut session = Session::new().unwrap();
        session.phase = Phase::Login;

        let mut frame = Vec::new();
        codec::write_varint(&mut frame, LOGIN_SET_COMPRESSION_S2C);
        codec::write_varint(&mut frame, 256);

        let action = process_frame(&mut session, Direction::ServerToClient, &frame).unwrap();
        assert_eq!(session.compression_threshold, 256);
        assert!(matches!(action, Action::Forward(f) if f == frame));
    }

    #[test]
    fn unknown_packet_is_forwarded_opaque() {
        let mut session = Session::new().unwrap();
        session.phase = Phase::Play;
        let mut frame = Vec::new();
        codec::write_varint(&mut frame, 0x55);
        frame.extend_from_slice(b"opaque payload");

        let action = process_frame(&mut session, Direction::ClientToServer, &frame).unwrap();
        assert!(matches!(action, Action::Forward(f) if f == frame));
    }
}
