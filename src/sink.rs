//! Where the finished artifact goes: a trace file, or chunks on the
//! debugger transport.

use std::fs::File;
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

/// Chunked channel to an attached debugger/profiler transport.
pub trait ChunkSink: Send + Sync {
    /// Send `parts`, concatenated, as one chunk tagged `chunk_type`.
    fn send_chunk(&self, chunk_type: u32, parts: &[&[u8]]) -> io::Result<()>;
}

/// Chunk tag for a streamed method profiling artifact (`MPSE` fourcc).
pub const CHUNK_METHOD_PROFILING_STREAM: u32 = u32::from_be_bytes(*b"MPSE");

/// Trace output file.
///
/// Either owns its descriptor (opened by path) or borrows one handed in by
/// the embedder, in which case dropping the sink leaves the descriptor open.
#[derive(Debug)]
pub struct TraceFile {
    file: Option<File>,
    auto_close: bool,
    name: String,
}

impl TraceFile {
    /// Create (or truncate) the file at `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            file: Some(file),
            auto_close: true,
            name: path.display().to_string(),
        })
    }

    /// Adopt an already-open descriptor without taking ownership of it.
    #[cfg(unix)]
    pub fn adopt_fd(fd: RawFd) -> Self {
        // SAFETY: the embedder guarantees `fd` is open and stays valid for
        // the session; `auto_close` keeps Drop from stealing it.
        let file = unsafe { File::from_raw_fd(fd) };
        Self {
            file: Some(file),
            auto_close: false,
            name: format!("fd:{fd}"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write all of `bytes` or fail.
    pub fn write_fully(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(bytes),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "trace file already released",
            )),
        }
    }
}

impl Drop for TraceFile {
    fn drop(&mut self) {
        if !self.auto_close {
            if let Some(file) = self.file.take() {
                #[cfg(unix)]
                {
                    // Hand the descriptor back to the embedder unclosed.
                    let _ = file.into_raw_fd();
                }
                #[cfg(not(unix))]
                std::mem::forget(file);
            }
        }
    }
}

/// The sink a session flushes to on stop.
pub enum TraceSink {
    File(TraceFile),
    Debugger(Arc<dyn ChunkSink>),
}
