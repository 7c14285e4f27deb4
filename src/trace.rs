//! Method trace sessions: the process-wide lifecycle, the logging hot path,
//! and finalization into the emitted artifact.
//!
//! At most one session exists at a time. Starting one suspends the mutator
//! world, opens the sink, installs the tracer as an instrumentation listener
//! for method entry/exit/unwind, and resumes; from then on every listener
//! callback appends one fixed-size record to the event buffer with a single
//! compare-exchange and no locks beyond a sharded map touched once per
//! thread. Stopping suspends the world again, walks the buffer to build the
//! textual preamble (counters, live threads, visited methods), flushes
//! preamble + buffer to the sink, and uninstalls the listener.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::buffer::EventBuffer;
use crate::clock::{measure_clock_overhead, supported_clock_source, ClockSource};
use crate::encode::{get_u32_le, put_u16_le, put_u32_le};
use crate::error::TraceError;
use crate::record::{
    decode_action, decode_method_id, encode_method_action, record_size, trace_version,
    write_header, MethodId, TraceAction, RECORD_SIZE_DUAL_CLOCK, TRACE_HEADER_LEN,
};
use crate::runtime::{events, InstrumentationListener, RuntimeStat, TraceServices};
use crate::sink::{TraceFile, TraceSink, CHUNK_METHOD_PROFILING_STREAM};

/// Flag bit for [`Trace::start`]: keep allocation counters while tracing and
/// report them in the preamble.
pub const TRACE_COUNT_ALLOCS: u32 = 1 << 0;

const LISTENER_EVENTS: u32 =
    events::METHOD_ENTERED | events::METHOD_EXITED | events::METHOD_UNWIND;

/// The process-wide session slot. A session exists iff this is non-empty,
/// iff the tracer is registered with instrumentation.
static THE_TRACE: Mutex<Option<Arc<Trace>>> = Mutex::new(None);

#[cfg(unix)]
const PLATFORM_DEFAULT_SOURCE: ClockSource = ClockSource::Dual;
#[cfg(not(unix))]
const PLATFORM_DEFAULT_SOURCE: ClockSource = ClockSource::Wall;

/// Clock source for new sessions, u8-encoded for atomic access.
static DEFAULT_CLOCK_SOURCE: AtomicU8 = AtomicU8::new(PLATFORM_DEFAULT_SOURCE.to_u8());

/// One tracing session.
///
/// Owns the event buffer for its lifetime; constructed only inside
/// [`Trace::start`]'s critical section while the world is stopped, dropped
/// by [`Trace::stop`] after finalization.
pub struct Trace {
    services: TraceServices,
    sink: Mutex<TraceSink>,
    buffer: EventBuffer,
    flags: u32,
    clock_source: ClockSource,
    /// Wall microseconds at construction; every wall delta is relative to
    /// this.
    start_time_us: u64,
    /// First-event CPU clock value per thread. Entries are only ever added,
    /// and only by the thread they belong to.
    thread_cpu_base: DashMap<u16, u64>,
}

impl Trace {
    fn new(
        services: TraceServices,
        sink: TraceSink,
        buffer_size: usize,
        flags: u32,
        clock_source: ClockSource,
    ) -> Arc<Trace> {
        let start_time_us = services.clock.wall_us();
        let mut header = [0u8; TRACE_HEADER_LEN];
        write_header(&mut header, clock_source, start_time_us);
        Arc::new(Trace {
            buffer: EventBuffer::new(buffer_size, &header),
            sink: Mutex::new(sink),
            services,
            flags,
            clock_source,
            start_time_us,
            thread_cpu_base: DashMap::new(),
        })
    }

    /// Start method tracing into a file (`filename` or an adopted `fd`), or
    /// stream the artifact over the host's debugger transport.
    ///
    /// A second start while a session is active logs an error and changes
    /// nothing. Sink failures are reported after the world has been resumed.
    pub fn start(
        services: TraceServices,
        filename: Option<&Path>,
        fd: Option<i32>,
        buffer_size: usize,
        flags: u32,
        direct_to_debugger: bool,
    ) -> Result<(), TraceError> {
        if THE_TRACE.lock().is_some() {
            error!("trace already in progress, ignoring this request");
            return Ok(());
        }

        let runtime = services.runtime.clone();
        runtime.suspend_all();

        let sink = if direct_to_debugger {
            match services.debugger.clone() {
                Some(chunks) => TraceSink::Debugger(chunks),
                None => {
                    runtime.resume_all();
                    return Err(TraceError::SinkOpen {
                        path: "<debugger>".into(),
                        source: io::Error::new(
                            io::ErrorKind::NotConnected,
                            "no debugger transport attached",
                        ),
                    });
                }
            }
        } else {
            let opened = match (fd, filename) {
                #[cfg(unix)]
                (Some(fd), _) => Ok(TraceFile::adopt_fd(fd)),
                #[cfg(not(unix))]
                (Some(_), _) => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "trace fd adoption requires a unix host",
                )),
                (None, Some(path)) => TraceFile::create(path),
                (None, None) => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no trace file specified",
                )),
            };
            match opened {
                Ok(file) => TraceSink::File(file),
                Err(source) => {
                    runtime.resume_all();
                    let path = filename
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| fd.map(|fd| format!("fd:{fd}")).unwrap_or_default());
                    return Err(TraceError::SinkOpen { path, source });
                }
            }
        };

        {
            let mut slot = THE_TRACE.lock();
            if slot.is_some() {
                // Raced with another starter between the early check and the
                // world stop.
                error!("trace already in progress, ignoring this request");
            } else {
                let clock_source = supported_clock_source(Self::default_clock_source());
                let trace = Trace::new(services, sink, buffer_size, flags, clock_source);
                *slot = Some(trace.clone());

                if trace.flags & TRACE_COUNT_ALLOCS != 0 {
                    trace.services.runtime.set_stats_enabled(true);
                }

                trace
                    .services
                    .instrumentation
                    .add_listener(trace.clone(), LISTENER_EVENTS);
                debug!(
                    buffer_size,
                    clock = ?clock_source,
                    "method tracing started"
                );
            }
        }

        runtime.resume_all();
        Ok(())
    }

    /// Stop the active session, finalize the artifact, and flush it.
    ///
    /// A stop with no active session logs an error and succeeds.
    pub fn stop() -> Result<(), TraceError> {
        let active = THE_TRACE.lock().clone();
        let Some(active) = active else {
            error!("trace stop requested, but no trace currently running");
            return Ok(());
        };

        let runtime = active.services.runtime.clone();
        runtime.suspend_all();

        let taken = THE_TRACE.lock().take();
        let result = match taken {
            Some(trace) => {
                let result = trace.finish_tracing();
                let listener: Arc<dyn InstrumentationListener> = trace.clone();
                trace
                    .services
                    .instrumentation
                    .remove_listener(&listener, LISTENER_EVENTS);
                result
            }
            None => {
                error!("trace stop requested, but no trace currently running");
                Ok(())
            }
        };

        runtime.resume_all();
        result
    }

    /// Stop tracing if a session is active. Called on runtime teardown.
    pub fn shutdown() -> Result<(), TraceError> {
        if Self::is_active() {
            Self::stop()
        } else {
            Ok(())
        }
    }

    pub fn is_active() -> bool {
        THE_TRACE.lock().is_some()
    }

    /// Pick the clock source future sessions record with. Degrades to the
    /// wall clock where per-thread CPU clocks are unavailable.
    pub fn set_default_clock_source(source: ClockSource) {
        DEFAULT_CLOCK_SOURCE.store(supported_clock_source(source).to_u8(), Ordering::Relaxed);
    }

    fn default_clock_source() -> ClockSource {
        ClockSource::from_u8(DEFAULT_CLOCK_SOURCE.load(Ordering::Relaxed))
    }

    /// The hot path: append one record for `action` on `method`, called on
    /// the thread the event happened on.
    ///
    /// Non-blocking and allocation-free apart from the sharded base-map
    /// insert on a thread's first event. When the buffer is exhausted the
    /// event is dropped and the session keeps running with the overflow
    /// flag latched.
    fn log_method_trace_event(&self, tid: u16, method: MethodId, action: TraceAction) {
        let size = record_size(self.clock_source);
        let Some(offset) = self.buffer.reserve(size) else {
            return;
        };

        let mut staged = [0u8; RECORD_SIZE_DUAL_CLOCK];
        put_u16_le(&mut staged, tid);
        put_u32_le(&mut staged[2..], encode_method_action(method, action));
        let mut at = 6;

        if self.clock_source.uses_thread_cpu() {
            let dt = match self.thread_cpu_base.get(&tid) {
                Some(base) => self.services.clock.thread_cpu_us().wrapping_sub(*base) as u32,
                None => {
                    // First event on this thread: record its clock base, the
                    // delta is zero by definition.
                    self.thread_cpu_base
                        .insert(tid, self.services.clock.thread_cpu_us());
                    0
                }
            };
            put_u32_le(&mut staged[at..], dt);
            at += 4;
        }
        if self.clock_source.uses_wall() {
            let dt = self.services.clock.wall_us().wrapping_sub(self.start_time_us) as u32;
            put_u32_le(&mut staged[at..], dt);
            at += 4;
        }

        debug_assert_eq!(at, size);
        self.buffer.commit(offset, &staged[..at]);
    }

    /// Derive the preamble from the quiesced buffer and flush preamble +
    /// buffer to the sink. Runs with the world stopped.
    fn finish_tracing(&self) -> Result<(), TraceError> {
        let clock = &self.services.clock;
        let elapsed = clock.wall_us().saturating_sub(self.start_time_us);
        // World is stopped: the cursor is stable and every record below it
        // is fully written.
        let final_offset = self.buffer.published_len();
        let clock_overhead_ns = measure_clock_overhead(clock.as_ref(), self.clock_source);

        if self.flags & TRACE_COUNT_ALLOCS != 0 {
            self.services.runtime.set_stats_enabled(false);
        }

        // SAFETY: stop() runs under the suspend bracket; no callback can be
        // mid-commit.
        let bytes = unsafe { self.buffer.bytes() };
        let data = &bytes[..final_offset];
        let visited = visited_methods(data, self.clock_source);
        let preamble = self.build_preamble(elapsed, final_offset, clock_overhead_ns, &visited);

        debug!(
            records = (final_offset - TRACE_HEADER_LEN) / record_size(self.clock_source),
            methods = visited.len(),
            overflowed = self.buffer.overflowed(),
            "finishing method trace"
        );
        if tracing::enabled!(tracing::Level::TRACE) {
            dump_records(data, self.clock_source);
        }

        let mut sink = self.sink.lock();
        match &mut *sink {
            TraceSink::Debugger(chunks) => {
                chunks.send_chunk(CHUNK_METHOD_PROFILING_STREAM, &[preamble.as_bytes(), data])?;
            }
            TraceSink::File(file) => {
                file.write_fully(preamble.as_bytes())?;
                file.write_fully(data)?;
            }
        }
        Ok(())
    }

    fn build_preamble(
        &self,
        elapsed_us: u64,
        final_offset: usize,
        clock_overhead_ns: u32,
        visited: &BTreeSet<MethodId>,
    ) -> String {
        let mut os = String::new();
        let _ = writeln!(os, "*version");
        let _ = writeln!(os, "{}", trace_version(self.clock_source));
        let _ = writeln!(os, "data-file-overflow={}", self.buffer.overflowed());
        let clock_name = match self.clock_source {
            ClockSource::Wall => "wall",
            ClockSource::ThreadCpu => "thread-cpu",
            ClockSource::Dual => "dual",
        };
        let _ = writeln!(os, "clock={clock_name}");
        let _ = writeln!(os, "elapsed-time-usec={elapsed_us}");
        let num_records = (final_offset - TRACE_HEADER_LEN) / record_size(self.clock_source);
        let _ = writeln!(os, "num-method-calls={num_records}");
        let _ = writeln!(os, "clock-call-overhead-nsec={clock_overhead_ns}");
        let _ = writeln!(os, "vm=art");
        if self.flags & TRACE_COUNT_ALLOCS != 0 {
            let runtime = &self.services.runtime;
            let _ = writeln!(
                os,
                "alloc-count={}",
                runtime.stat(RuntimeStat::AllocatedObjects)
            );
            let _ = writeln!(
                os,
                "alloc-size={}",
                runtime.stat(RuntimeStat::AllocatedBytes)
            );
            let _ = writeln!(os, "gc-count={}", runtime.stat(RuntimeStat::GcInvocations));
        }

        let _ = writeln!(os, "*threads");
        for thread in self.services.runtime.thread_list() {
            let _ = writeln!(os, "{}\t{}", thread.tid, thread.name);
        }

        let _ = writeln!(os, "*methods");
        for method in visited {
            let symbols = self.services.methods.describe(*method);
            let _ = writeln!(
                os,
                "{:#x}\t{}\t{}\t{}\t{}",
                method.0,
                symbols.class_descriptor,
                symbols.name,
                symbols.signature,
                symbols.source_file
            );
        }
        let _ = writeln!(os, "*end");
        os
    }
}

impl InstrumentationListener for Trace {
    fn method_entered(&self, tid: u16, method: MethodId) {
        self.log_method_trace_event(tid, method, TraceAction::MethodEnter);
    }

    fn method_exited(&self, tid: u16, method: MethodId, _return_value: u64) {
        self.log_method_trace_event(tid, method, TraceAction::MethodExit);
    }

    fn method_unwind(&self, tid: u16, method: MethodId) {
        self.log_method_trace_event(tid, method, TraceAction::MethodUnwind);
    }

    fn dex_pc_moved(&self, tid: u16, method: MethodId, new_dex_pc: u32) {
        // Not registered for this event; firing it is an instrumentation
        // defect. Nothing is recorded.
        error!(
            "unexpected dex PC event in tracing: method {:#x}, pc {} (tid {})",
            method.0, new_dex_pc, tid
        );
    }

    fn exception_caught(&self, tid: u16) {
        error!("unexpected exception caught event in tracing (tid {tid})");
    }
}

/// Every method referenced by the records in `data` (the artifact slice,
/// header included), in id order.
fn visited_methods(data: &[u8], source: ClockSource) -> BTreeSet<MethodId> {
    let size = record_size(source);
    let mut visited = BTreeSet::new();
    let mut at = TRACE_HEADER_LEN;
    while at + size <= data.len() {
        // The packed method word sits two bytes into every record.
        visited.insert(decode_method_id(get_u32_le(&data[at + 2..])));
        at += size;
    }
    visited
}

fn dump_records(data: &[u8], source: ClockSource) {
    let size = record_size(source);
    let mut at = TRACE_HEADER_LEN;
    while at + size <= data.len() {
        let tmid = get_u32_le(&data[at + 2..]);
        trace!(
            "trace record: method {:#x} {:?}",
            decode_method_id(tmid).0,
            decode_action(tmid)
        );
        at += size;
    }
}
