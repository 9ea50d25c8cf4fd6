//! Streaming RPC modules.
//!
//! - `transport`: seams to the external call transport.
//! - `listener`: ordered event fan-out used by sessions.
//! - `session`: lifecycle wrapper around one streaming call.
//! - `proto`: `pb.Motoko` messages and method descriptors.
//! - `client`: per-method session constructors and upload helpers.

/// Client facade and upload helpers.
pub mod client;
/// Event kinds and the listener registry.
pub mod listener;
/// Protocol messages.
pub mod proto;
/// Streaming session state machine and event dispatch.
pub mod session;
/// Transport traits and call status types.
pub mod transport;
