//! Chunked uploads.
//!
//! - `source`: finite byte sources readable by range.
//! - `pump`: sequential chunking into a sink or streaming session.

/// Chunk pump and session sink.
pub mod pump;
/// Source abstraction with in-memory and file implementations.
pub mod source;
