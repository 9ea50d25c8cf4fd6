//! Finite, sliceable byte sources read by the chunk pump.
//!
//! Slicing at or past the end of a source yields an empty [`Bytes`], never an
//! error.

use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Errors produced while reading a source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The file could not be opened or its size read.
    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A positioned read failed.
    #[error("failed to read {length} bytes at offset {offset}: {source}")]
    Read {
        offset: u64,
        length: usize,
        #[source]
        source: io::Error,
    },
}

/// A finite byte sequence with a known size that can be read by range.
pub trait ChunkSource {
    /// Total size in bytes. Fixed for the lifetime of a pump run.
    fn total_size(&self) -> u64;

    /// Reads up to `length` bytes starting at `offset`.
    ///
    /// Returns fewer bytes only when the range crosses the end of the source,
    /// and an empty buffer when `offset >= total_size()`.
    fn read_slice(
        &mut self,
        offset: u64,
        length: usize,
    ) -> impl Future<Output = Result<Bytes, SourceError>> + Send;
}

impl ChunkSource for Bytes {
    fn total_size(&self) -> u64 {
        self.len() as u64
    }

    fn read_slice(
        &mut self,
        offset: u64,
        length: usize,
    ) -> impl Future<Output = Result<Bytes, SourceError>> + Send {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.len());
        let end = start.saturating_add(length).min(self.len());
        std::future::ready(Ok(self.slice(start..end)))
    }
}

/// File on local disk, read with positioned async reads.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    file: File,
    size: u64,
}

impl FileSource {
    /// Opens `path` and records its current size.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let open_error = |source| SourceError::Open {
            path: path.clone(),
            source,
        };
        let file = File::open(&path).await.map_err(open_error)?;
        let size = file.metadata().await.map_err(open_error)?.len();
        Ok(Self { path, file, size })
    }

    /// Path the source was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for FileSource {
    fn total_size(&self) -> u64 {
        self.size
    }

    fn read_slice(
        &mut self,
        offset: u64,
        length: usize,
    ) -> impl Future<Output = Result<Bytes, SourceError>> + Send {
        async move {
            if offset >= self.size || length == 0 {
                return Ok(Bytes::new());
            }
            let remaining = usize::try_from(self.size - offset).unwrap_or(usize::MAX);
            let length = length.min(remaining);
            let read_error = |source| SourceError::Read {
                offset,
                length,
                source,
            };

            self.file
                .seek(SeekFrom::Start(offset))
                .await
                .map_err(read_error)?;

            let mut buf = BytesMut::zeroed(length);
            let mut filled = 0;
            while filled < length {
                let n = self.file.read(&mut buf[filled..]).await.map_err(read_error)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(buf.freeze())
        }
    }
}
