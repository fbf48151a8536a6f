//! Core wire, crypto and framing primitives shared by the proxy binary.
//!
//! This crate has no knowledge of sockets, configuration, or session
//! lifecycle -- it is the pure, unit-testable half of the system. Bytes
//! in, bytes (or typed values) out.

pub mod codec;
pub mod compression;
pub mod crypto;
pub mod error;
pub mod frame;

pub use error::{ProxyError, Result};
