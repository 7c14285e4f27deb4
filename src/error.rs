use std::io;

use thiserror::Error;

/// Failures surfaced from session boundaries.
///
/// The logging hot path never raises: it drops the event (buffer overflow)
/// or logs and continues. Start and stop report sink problems to the caller
/// only after the mutator world has been resumed.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("unable to open trace file '{path}': {source}")]
    SinkOpen {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("trace data write failed: {0}")]
    SinkWrite(#[from] io::Error),
}
