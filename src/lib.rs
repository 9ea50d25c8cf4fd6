//! Rust SDK for the Motoko inference and learning service.
//!
//! The crate is organized by concern:
//! - `stream`: streaming call sessions, transport seams, and the client.
//! - `upload`: chunked reading of large local inputs into a session.

/// Streaming sessions, protocol types, and the client facade.
pub mod stream;
/// Chunk sources and the upload pump.
pub mod upload;
