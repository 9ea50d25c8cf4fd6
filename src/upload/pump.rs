//! Sequential chunked reads from a [`ChunkSource`] into a [`ChunkSink`].
//!
//! Exactly one chunk is in flight at a time: chunk `n + 1` is only requested
//! after chunk `n` was handed to the sink and its progress reported.

use std::fmt;
use std::num::NonZeroUsize;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use crate::stream::session::StreamingSession;
use crate::upload::source::{ChunkSource, SourceError};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: NonZeroUsize = match NonZeroUsize::new(1_000_000) {
    Some(size) => size,
    None => unreachable!(),
};

/// Errors that stop a pump run.
#[derive(Debug, Error)]
pub enum PumpError {
    /// Reading the source failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The source returned no bytes before reaching its declared size.
    #[error("source ended at offset {offset} of {total} bytes")]
    UnexpectedEof { offset: u64, total: u64 },
}

/// One slice of the source handed to [`ChunkSink::on_chunk`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Bytes consumed from the source before this chunk.
    pub offset: u64,
    /// Chunk contents, at most the pump's chunk size.
    pub bytes: Bytes,
    /// True when this chunk ends exactly at the end of the source.
    pub is_final: bool,
}

impl Chunk {
    /// Number of bytes in the chunk.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false for chunks produced by [`ChunkPump::run`].
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Receiver of a pump run.
pub trait ChunkSink {
    /// Receives the next chunk, in source order.
    fn on_chunk(&mut self, chunk: Chunk);

    /// Fraction of the source consumed so far, in `(0, 1]`.
    fn on_progress(&mut self, fraction: f64);

    /// Called once after the final chunk and its progress, or immediately for
    /// an empty source. Never called after an error.
    fn on_complete(&mut self);

    /// Called once when a read fails. The run stops afterwards.
    fn on_error(&mut self, error: &PumpError) {
        let _ = error;
    }

    /// True once the sink no longer accepts chunks. Checked before every
    /// read; the run then stops without `on_complete`.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Totals of a run that ended without a read error.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PumpReport {
    /// Bytes handed to the sink.
    pub bytes: u64,
    /// Number of `on_chunk` calls.
    pub chunks: usize,
    /// False when the sink closed before the end of the source.
    pub completed: bool,
}

/// Drives a source through a sink in bounded chunks.
#[derive(Clone, Copy, Debug)]
pub struct ChunkPump {
    chunk_size: NonZeroUsize,
}

impl ChunkPump {
    /// Pump reading at most `chunk_size` bytes per chunk.
    pub fn new(chunk_size: NonZeroUsize) -> Self {
        Self { chunk_size }
    }

    /// Upper bound on the length of each chunk.
    pub fn chunk_size(&self) -> NonZeroUsize {
        self.chunk_size
    }

    /// Reads `source` to the end, one chunk at a time.
    ///
    /// On a read failure the sink's `on_error` runs, `on_complete` does not,
    /// and the error is returned. Nothing is retried. A sink that reports
    /// [`ChunkSink::is_closed`] stops the run early with `completed == false`.
    pub async fn run<S, K>(&self, source: &mut S, sink: &mut K) -> Result<PumpReport, PumpError>
    where
        S: ChunkSource + ?Sized,
        K: ChunkSink + ?Sized,
    {
        let total = source.total_size();
        let chunk_size = self.chunk_size.get() as u64;
        let mut offset = 0u64;
        let mut chunks = 0usize;
        debug!(event = "pump_started", total, chunk_size);

        while offset < total {
            if sink.is_closed() {
                debug!(event = "pump_stopped_by_sink", offset, total, chunks);
                return Ok(PumpReport {
                    bytes: offset,
                    chunks,
                    completed: false,
                });
            }
            let length = chunk_size.min(total - offset) as usize;
            let mut bytes = match source.read_slice(offset, length).await {
                Ok(bytes) => bytes,
                Err(err) => return Err(fail(sink, err.into())),
            };
            if bytes.is_empty() {
                return Err(fail(sink, PumpError::UnexpectedEof { offset, total }));
            }
            bytes.truncate(length);

            let chunk_offset = offset;
            offset += bytes.len() as u64;
            chunks += 1;
            sink.on_chunk(Chunk {
                offset: chunk_offset,
                bytes,
                is_final: offset == total,
            });
            sink.on_progress(offset as f64 / total as f64);
            debug!(event = "pump_chunk", chunk = chunks, offset, total);
        }

        sink.on_complete();
        debug!(event = "pump_completed", total, chunks);
        Ok(PumpReport {
            bytes: total,
            chunks,
            completed: true,
        })
    }
}

impl Default for ChunkPump {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

fn fail<K: ChunkSink + ?Sized>(sink: &mut K, error: PumpError) -> PumpError {
    warn!(event = "pump_failed", error = %error);
    sink.on_error(&error);
    error
}

type ProgressFn<'a> = Box<dyn FnMut(f64) + Send + 'a>;
type ErrorFn<'a> = Box<dyn FnMut(&PumpError) + Send + 'a>;

/// Sink that writes each chunk into a session as a request message and
/// half-closes the session on completion.
///
/// The sink closes once the session is terminal, so a call the server already
/// ended stops the run before the next read. Read errors are passed to the
/// error callback; whether to cancel the session is left to the caller.
pub struct SessionSink<'a, Req, Resp, F> {
    session: &'a StreamingSession<Req, Resp>,
    to_request: F,
    on_progress: Option<ProgressFn<'a>>,
    on_error: Option<ErrorFn<'a>>,
}

impl<'a, Req, Resp, F> SessionSink<'a, Req, Resp, F>
where
    Req: prost::Message,
    F: FnMut(Bytes) -> Req,
{
    /// `to_request` wraps one chunk into the method's request message.
    pub fn new(session: &'a StreamingSession<Req, Resp>, to_request: F) -> Self {
        Self {
            session,
            to_request,
            on_progress: None,
            on_error: None,
        }
    }

    /// Receives the fraction of the source written so far.
    pub fn with_progress(mut self, on_progress: impl FnMut(f64) + Send + 'a) -> Self {
        self.on_progress = Some(Box::new(on_progress));
        self
    }

    /// Receives the read error that stopped the run.
    pub fn with_error(mut self, on_error: impl FnMut(&PumpError) + Send + 'a) -> Self {
        self.on_error = Some(Box::new(on_error));
        self
    }
}

impl<Req, Resp, F> ChunkSink for SessionSink<'_, Req, Resp, F>
where
    Req: prost::Message,
    F: FnMut(Bytes) -> Req,
{
    fn on_chunk(&mut self, chunk: Chunk) {
        let request = (self.to_request)(chunk.bytes);
        self.session.write(&request);
    }

    fn on_progress(&mut self, fraction: f64) {
        if let Some(on_progress) = self.on_progress.as_mut() {
            on_progress(fraction);
        }
    }

    fn on_complete(&mut self) {
        self.session.end();
    }

    fn on_error(&mut self, error: &PumpError) {
        if let Some(on_error) = self.on_error.as_mut() {
            on_error(error);
        }
    }

    fn is_closed(&self) -> bool {
        self.session.state().is_terminal()
    }
}

impl<Req, Resp, F> fmt::Debug for SessionSink<'_, Req, Resp, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSink")
            .field("method", &self.session.method())
            .finish_non_exhaustive()
    }
}
