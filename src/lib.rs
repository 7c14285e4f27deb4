//! # vmtrace
//!
//! Method-level execution tracing for a managed runtime.
//!
//! While a session is active, every method entry, exit, and
//! exception-driven unwind on every runtime thread is recorded from the
//! instrumentation callbacks into a fixed in-memory buffer; stopping the
//! session emits a self-describing artifact, a textual preamble (counters,
//! live threads, visited methods) followed by the little-endian binary
//! event stream, to a trace file or an attached debugger transport.
//!
//! ## Shape
//!
//! The surrounding runtime is consumed through the narrow contracts in
//! [`runtime`]: thread suspension, the thread registry, allocation
//! statistics, instrumentation registration, and method symbol lookup. The
//! mutator world is suspended only around session start and stop; the
//! logging path itself is non-blocking (one compare-exchange per event) and
//! safe to call from any runtime thread.
//!
//! ## Use
//!
//! ```ignore
//! Trace::start(services, Some(Path::new("app.trace")), None, 8 << 20, 0, false)?;
//! // ... workload runs under instrumentation ...
//! Trace::stop()?;
//! ```

pub mod buffer;
pub mod clock;
pub mod encode;
pub mod error;
pub mod record;
pub mod runtime;
pub mod sink;
pub mod trace;

pub use clock::{measure_clock_overhead, ClockSource, SystemClock, TraceClock};
pub use error::TraceError;
pub use record::{MethodId, TraceAction, TraceRecord};
pub use runtime::{
    Instrumentation, InstrumentationListener, MethodRegistry, MethodSymbols, RuntimeEnv,
    RuntimeStat, ThreadInfo, TraceServices,
};
pub use sink::{ChunkSink, TraceFile, CHUNK_METHOD_PROFILING_STREAM};
pub use trace::{Trace, TRACE_COUNT_ALLOCS};
