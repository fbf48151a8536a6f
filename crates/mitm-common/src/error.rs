//! Error taxonomy for the proxy core.
//!
//! Variants are grouped the way the design's error-handling policy treats
//! them (see `mitm-proxy`'s pump): crypto integrity and protocol violations
//! are fatal to the session, I/O and decode gaps are not.

use thiserror::Error;

/// Errors raised by the wire codec, compression, crypto and framing layers.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A buffer doesn't yet contain a full value; never fatal, the caller
    /// should wait for more bytes.
    #[error("incomplete data: need at least {needed} bytes, have {have}")]
    Incomplete {
        /// Bytes required to make progress.
        needed: usize,
        /// Bytes currently available.
        have: usize,
    },

    /// Fatal crypto integrity failure: bad RSA key material, a failed
    /// decrypt, or a verification token mismatch.
    #[error("crypto integrity failure: {0}")]
    CryptoIntegrity(String),

    /// Fatal protocol violation: oversize frame, bad compression envelope,
    /// or an unexpected packet for the current phase.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// zlib inflate/deflate failure.
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),
}

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// True for errors that should never tear down a session on their own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProxyError::Incomplete { .. })
    }
}
