//! Crypto engine (C3).
//!
//! RSA keypair generation and DER SubjectPublicKeyInfo (de)serialization,
//! PKCS#1 v1.5 encryption/decryption (no OAEP -- the real protocol never
//! used it), AES-128-CFB8 stream state with independently-advancing IV
//! cursors per direction, and the SHA-1 "session hash" used to bridge the
//! join request to the real session server.

use crate::error::{ProxyError, Result};
use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use cfb8::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};

/// 1024-bit RSA, `e = 65537`, matching the source's `RSA_generate_key(1024, RSA_F4, ...)`.
pub const RSA_KEY_BITS: usize = 1024;

/// A freshly generated RSA keypair, DER-SPKI-encoded for wire transmission.
pub struct RsaKeypair {
    pub private: RsaPrivateKey,
    pub public: RsaPublicKey,
}

impl RsaKeypair {
    /// Generate a new 1024-bit keypair.
    pub fn generate() -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| ProxyError::CryptoIntegrity(format!("RSA keygen failed: {e}")))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// DER SubjectPublicKeyInfo encoding of the public half, as advertised
    /// to a peer in an EncryptionRequest.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        self.public
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| ProxyError::CryptoIntegrity(format!("DER encode failed: {e}")))
    }

    /// PKCS#1 v1.5 decrypt with the private half.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|e| ProxyError::CryptoIntegrity(format!("RSA decrypt failed: {e}")))
    }
}

/// Decode a DER SubjectPublicKeyInfo blob into an `RsaPublicKey`.
///
/// Fails fast (returned as a fatal crypto-integrity error) on any
/// malformed input, matching the source's `if (mitm.s_rsa == NULL) exit(1)`.
pub fn decode_public_key_der(der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(der)
        .map_err(|e| ProxyError::CryptoIntegrity(format!("failed to decode RSA public key: {e}")))
}

/// PKCS#1 v1.5 encrypt with a peer's public key.
pub fn rsa_encrypt(public: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    public
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)
        .map_err(|e| ProxyError::CryptoIntegrity(format!("RSA encrypt failed: {e}")))
}

/// Generate a random 16-byte AES-128 key.
pub fn generate_aes_key() -> [u8; 16] {
    let mut key = [0u8; 16];
    OsRng.fill_bytes(&mut key);
    key
}

/// Generate a random 4-byte verification token.
pub fn generate_verification_token() -> [u8; 4] {
    let mut token = [0u8; 4];
    OsRng.fill_bytes(&mut token);
    token
}

/// AES-128-CFB8 cipher state for one direction of one leg.
///
/// Created once at encryption activation with `iv = key`; every
/// subsequent call to [`CipherStream::apply`] advances the feedback
/// register in place, exactly as the four long-lived IV cursors the
/// spec's invariant #2 requires.
pub struct CipherStream {
    inner: CipherInner,
}

enum CipherInner {
    Encrypt(cfb8::Encryptor<Aes128>),
    Decrypt(cfb8::Decryptor<Aes128>),
}

impl CipherStream {
    /// Build an encrypting stream with `iv = key` (the protocol's
    /// activation rule: the shared key doubles as the initial IV).
    pub fn new_encryptor(key: &[u8; 16]) -> Self {
        Self {
            inner: CipherInner::Encrypt(cfb8::Encryptor::<Aes128>::new(key.into(), key.into())),
        }
    }

    /// Build a decrypting stream with `iv = key`.
    pub fn new_decryptor(key: &[u8; 16]) -> Self {
        Self {
            inner: CipherInner::Decrypt(cfb8::Decryptor::<Aes128>::new(key.into(), key.into())),
        }
    }

    /// Encrypt or decrypt `data` in place, one byte at a time, advancing
    /// this stream's feedback register as it goes.
    pub fn apply(&mut self, data: &mut [u8]) {
        match &mut self.inner {
            CipherInner::Encrypt(c) => {
                for byte in data.iter_mut() {
                    let block = GenericArray::from_mut_slice(std::slice::from_mut(byte));
                    c.encrypt_block_mut(block);
                }
            }
            CipherInner::Decrypt(c) => {
                for byte in data.iter_mut() {
                    let block = GenericArray::from_mut_slice(std::slice::from_mut(byte));
                    c.decrypt_block_mut(block);
                }
            }
        }
    }
}

/// The four long-lived cipher cursors a session holds once encryption is
/// active: independent encrypt/decrypt state per leg (invariant #2/#4).
pub struct CipherContext {
    pub client_encrypt: CipherStream,
    pub client_decrypt: CipherStream,
    pub server_encrypt: CipherStream,
    pub server_decrypt: CipherStream,
}

impl CipherContext {
    /// Activate both legs' cipher state from their respective shared
    /// keys. Called exactly once per session (invariant #1/#2).
    pub fn activate(client_key: &[u8; 16], server_key: &[u8; 16]) -> Self {
        Self {
            client_encrypt: CipherStream::new_encryptor(client_key),
            client_decrypt: CipherStream::new_decryptor(client_key),
            server_encrypt: CipherStream::new_encryptor(server_key),
            server_decrypt: CipherStream::new_decryptor(server_key),
        }
    }
}

/// Compute the SHA-1 session hash the real session server expects:
/// `serverId ‖ sharedKey ‖ serverPublicKeyDer`, formatted with the
/// Notchian signed-bigint hex convention.
pub fn session_hash(server_id: &str, shared_key: &[u8], server_pubkey_der: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(server_id.as_bytes());
    hasher.update(shared_key);
    hasher.update(server_pubkey_der);
    let digest: [u8; 20] = hasher.finalize().into();
    format_signed_hex(digest)
}

/// Format a 20-byte SHA-1 digest as a signed two's-complement hex string:
/// if the digest's most significant bit is set, negate it (invert then
/// add one) and prefix with `-`; leading zeros are always stripped.
pub fn format_signed_hex(mut digest: [u8; 20]) -> String {
    let negative = digest[0] & 0x80 != 0;
    if negative {
        let mut carry = true;
        for byte in digest.iter_mut().rev() {
            *byte = !*byte;
            if carry {
                let (next, overflow) = byte.overflowing_add(1);
                *byte = next;
                carry = overflow;
            }
        }
    }

    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    let trimmed = hex.trim_start_matches('0');
    let trimmed = if trimmed.is_empty() { "0" } else { trimmed };

    if negative {
        format!("-{trimmed}")
    } else {
        trimmed.to_string()
    }
}
