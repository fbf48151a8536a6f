//! Session context (§3 of the design): the single mutable aggregate the
//! pump threads through the handshake, compression, and crypto layers.
//! Owned outright by one task; never shared behind a `Mutex`/`Arc`.

use mitm_common::compression::{DISABLED, Threshold};
use mitm_common::crypto::{CipherContext, RsaKeypair};
use rsa::RsaPublicKey;

use crate::handshake::Direction;

/// High-level protocol phase, mirroring the source's `mitm.state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Status,
    Login,
    Play,
}

/// Client-side crypto material: our freshly minted RSA keypair (public
/// half advertised to the client) plus the client's eventual AES key.
pub struct ClientCrypto {
    pub keypair: RsaKeypair,
    pub verification_token: [u8; 4],
    pub shared_key: Option<[u8; 16]>,
}

/// Server-side crypto material: the real server's RSA public key and
/// token, plus our locally generated AES key sent to it.
#[derive(Default)]
pub struct ServerCrypto {
    pub public_key: Option<RsaPublicKey>,
    pub server_id: String,
    pub verification_token: Option<[u8; 4]>,
    pub public_key_der: Vec<u8>,
    pub shared_key: [u8; 16],
}

/// Fields scraped from the intercepted session-server join request and
/// the eventual synthesized POST to the real session server.
#[derive(Default)]
pub struct SessionIdentity {
    pub access_token: Option<String>,
    pub selected_profile: Option<String>,
    pub server_id: Option<String>,
}

/// The session context: one instance per live client↔server pair.
pub struct Session {
    pub phase: Phase,
    pub compression_threshold: Threshold,

    pub client_crypto: ClientCrypto,
    pub server_crypto: ServerCrypto,
    pub cipher: Option<CipherContext>,

    pub encryption_pending: bool,
    pub encryption_active: bool,

    pub identity: SessionIdentity,

    // Transmit buffering (retaining a partial write across iterations)
    // is handled by `AsyncWriteExt::write_all` inside the pump's task,
    // which already loops until the whole frame is accepted or the
    // socket errors -- a separate `client_tx`/`server_tx` byte vector
    // would just duplicate that retry loop by hand.
    pub client_rx: Vec<u8>,
    pub server_rx: Vec<u8>,
}

impl Session {
    /// Build a fresh session context, generating the client-facing RSA
    /// keypair and verification token up front (the source does the
    /// equivalent work lazily, in `process_encryption_request`; doing it
    /// eagerly here is equivalent since the client leg never needs
    /// anything from the server leg to exist).
    pub fn new() -> mitm_common::Result<Self> {
        Ok(Self {
            phase: Phase::Idle,
            compression_threshold: DISABLED,
            client_crypto: ClientCrypto {
                keypair: RsaKeypair::generate()?,
                verification_token: mitm_common::crypto::generate_verification_token(),
                shared_key: None,
            },
            server_crypto: ServerCrypto::default(),
            cipher: None,
            encryption_pending: false,
            encryption_active: false,
            identity: SessionIdentity::default(),
            client_rx: Vec::new(),
            server_rx: Vec::new(),
        })
    }

    /// Borrow the decode receive buffer for whichever leg `dir` arrived
    /// on -- the pump's single entry point for buffering newly-read
    /// socket bytes and draining frames off the front.
    pub fn rx_mut(&mut self, dir: Direction) -> &mut Vec<u8> {
        match dir {
            Direction::ClientToServer => &mut self.client_rx,
            Direction::ServerToClient => &mut self.server_rx,
        }
    }

    /// Activation rule from §4.4: run at the end of the pump iteration in
    /// which `encryption_pending` was set. Idempotent is not required --
    /// invariant #1 guarantees it only ever runs once.
    pub fn activate_encryption_if_pending(&mut self) {
        if !self.encryption_pending {
            return;
        }
        let client_key = self
            .client_crypto
            .shared_key
            .expect("encryption_pending implies the client key was decrypted");
        self.cipher = Some(CipherContext::activate(
            &client_key,
            &self.server_crypto.shared_key,
        ));
        self.encryption_pending = false;
        self.encryption_active = true;
    }
}
