#![deny(rust_2018_idioms)]

//! Shared primitives for the coldbak backup pipeline.
//!
//! Everything both the client and the receiver must agree on lives here: the
//! wire framing and messages, the dual-digest checksum engine, chunk
//! arithmetic, the resume-token format, and the HELLO credentials codec.

pub mod auth;
pub mod checksum;
pub mod chunk;
pub mod error;
pub mod frame;
pub mod message;
pub mod metadata;
pub mod token;

/// Version carried in HELLO. Both ends must match exactly.
pub const PROTOCOL_VERSION: u32 = 1;
