//! Seams to the external RPC transport.
//!
//! Connection setup, framing, and reconnection all live behind [`Transport`].
//! A session only ever sees one [`CallHandle`] per call plus the channel of
//! [`TransportEvent`]s produced for it.

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;

/// gRPC status code for a successful call.
pub const STATUS_OK: i32 = 0;
/// gRPC status code reported when a call was cancelled.
pub const STATUS_CANCELLED: i32 = 1;
/// gRPC status code for errors without a more specific code.
pub const STATUS_UNKNOWN: i32 = 2;
/// gRPC status code for internal errors, including undecodable messages.
pub const STATUS_INTERNAL: i32 = 13;

/// Shape of an RPC method.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MethodKind {
    /// Streaming request, single response.
    ClientStreaming,
    /// Streaming request and streaming response.
    Bidirectional,
}

/// Static description of one RPC method.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct MethodDescriptor {
    /// Fully qualified service name, eg `pb.Motoko`.
    pub service: &'static str,
    /// Method name within the service.
    pub method: &'static str,
    /// Streaming shape of the method.
    pub kind: MethodKind,
}

impl MethodDescriptor {
    /// Describes `service.method` with the given shape.
    pub const fn new(service: &'static str, method: &'static str, kind: MethodKind) -> Self {
        Self {
            service,
            method,
            kind,
        }
    }

    /// True when the method streams responses.
    pub fn is_bidirectional(&self) -> bool {
        self.kind == MethodKind::Bidirectional
    }

    /// Request path in the `/service/method` form used on the wire.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

/// Ordered key/value pairs forwarded to the transport untouched.
///
/// Used both for call-scoped request metadata and for trailers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CallMetadata {
    entries: Vec<(String, String)>,
}

impl CallMetadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. Repeated keys are kept in insertion order.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    /// Builder form of [`CallMetadata::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Returns the first value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries, counting repeated keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entry is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `self` with the entries of `defaults` whose keys are not
    /// already present appended after it.
    pub fn merged_over(mut self, defaults: &CallMetadata) -> Self {
        for (key, value) in defaults.iter() {
            if self.get(key).is_none() {
                self.insert(key, value);
            }
        }
        self
    }
}

impl<K, V> FromIterator<(K, V)> for CallMetadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Terminal outcome of a call as reported by the transport.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CallStatus {
    /// gRPC status code; `0` is success.
    pub code: i32,
    /// Human readable detail.
    pub details: String,
    /// Trailing metadata.
    pub trailers: CallMetadata,
}

impl CallStatus {
    /// Status with `code`, `details`, and no trailers.
    pub fn new(code: i32, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
            trailers: CallMetadata::default(),
        }
    }

    /// Successful status with empty details.
    pub fn ok() -> Self {
        Self::new(STATUS_OK, "")
    }

    /// Replaces the trailing metadata.
    pub fn with_trailers(mut self, trailers: CallMetadata) -> Self {
        self.trailers = trailers;
        self
    }

    /// True for code `0`.
    pub fn is_ok(&self) -> bool {
        self.code == STATUS_OK
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "status {}", self.code)
        } else {
            write!(f, "status {}: {}", self.code, self.details)
        }
    }
}

/// Activity delivered by the transport for one call.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// One encoded inbound message.
    Message(Bytes),
    /// Terminal status; nothing meaningful follows it.
    Status(CallStatus),
}

/// Per-call primitive owned by exactly one session.
///
/// Implementations must not block; they typically push onto a queue drained
/// by a connection worker.
pub trait CallHandle: Send {
    /// Starts the call with the given request metadata.
    fn start(&mut self, metadata: &CallMetadata);

    /// Sends one encoded request message.
    fn send(&mut self, message: Bytes);

    /// Signals that no more request messages follow.
    fn half_close(&mut self);

    /// Aborts the call. Must be safe to call after the call finished.
    fn abort(&mut self);
}

/// A call opened by [`Transport::open_call`] but not yet started.
pub struct OpenCall {
    /// Outbound side of the call; started by the session.
    pub handle: Box<dyn CallHandle>,
    /// Inbound messages and the terminal status, in arrival order.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl fmt::Debug for OpenCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenCall").finish_non_exhaustive()
    }
}

/// Factory for calls against a remote endpoint.
pub trait Transport: Send + Sync {
    /// Creates the per-call handle and registers for its inbound events.
    fn open_call(&self, method: &MethodDescriptor, endpoint: &str) -> OpenCall;
}
