//! Contracts the tracer consumes from the surrounding runtime.
//!
//! The tracer never touches runtime internals directly: thread suspension,
//! the thread registry, allocation statistics, instrumentation dispatch, and
//! method symbol lookup all arrive through the traits below, so the host
//! wires them up once and tests substitute doubles.

use std::sync::Arc;

use crate::clock::{SystemClock, TraceClock};
use crate::record::MethodId;
use crate::sink::ChunkSink;

/// A live runtime thread, as reported by the thread registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: u16,
    pub name: String,
}

/// Counters the runtime maintains while allocation statistics are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStat {
    AllocatedObjects,
    AllocatedBytes,
    GcInvocations,
}

/// Runtime services the tracer needs at session boundaries.
///
/// `suspend_all` must park every mutator thread at a safepoint before
/// returning; `resume_all` releases them. The tracer brackets listener
/// installation/removal and finalization with this pair so that no
/// instrumentation callback can run concurrently with either.
pub trait RuntimeEnv: Send + Sync {
    fn suspend_all(&self);
    fn resume_all(&self);

    /// Enumerate live threads. Called with the world stopped.
    fn thread_list(&self) -> Vec<ThreadInfo>;

    fn set_stats_enabled(&self, enabled: bool);
    fn stat(&self, kind: RuntimeStat) -> u64;
}

/// Instrumentation event bits for listener registration.
pub mod events {
    pub const METHOD_ENTERED: u32 = 1 << 0;
    pub const METHOD_EXITED: u32 = 1 << 1;
    pub const METHOD_UNWIND: u32 = 1 << 2;
    pub const DEX_PC_MOVED: u32 = 1 << 3;
    pub const EXCEPTION_CAUGHT: u32 = 1 << 4;
}

/// Callbacks the instrumentation subsystem delivers to a registered
/// listener, on the thread the event happened on.
pub trait InstrumentationListener: Send + Sync {
    fn method_entered(&self, tid: u16, method: MethodId);
    fn method_exited(&self, tid: u16, method: MethodId, return_value: u64);
    fn method_unwind(&self, tid: u16, method: MethodId);
    fn dex_pc_moved(&self, tid: u16, method: MethodId, new_dex_pc: u32);
    fn exception_caught(&self, tid: u16);
}

/// The instrumentation subsystem's registration surface.
///
/// Listener mutation happens only with the world stopped, so implementations
/// need not support concurrent registration against in-flight dispatch.
pub trait Instrumentation: Send + Sync {
    fn add_listener(&self, listener: Arc<dyn InstrumentationListener>, event_mask: u32);
    fn remove_listener(&self, listener: &Arc<dyn InstrumentationListener>, event_mask: u32);
}

/// Human-readable method identity for the `*methods` dictionary.
#[derive(Debug, Clone)]
pub struct MethodSymbols {
    pub class_descriptor: String,
    pub name: String,
    pub signature: String,
    pub source_file: String,
}

/// The runtime's method metadata facade.
pub trait MethodRegistry: Send + Sync {
    fn describe(&self, method: MethodId) -> MethodSymbols;
}

/// Everything a tracing session needs from its host, bundled so `start`
/// takes one argument instead of five.
#[derive(Clone)]
pub struct TraceServices {
    pub runtime: Arc<dyn RuntimeEnv>,
    pub instrumentation: Arc<dyn Instrumentation>,
    pub methods: Arc<dyn MethodRegistry>,
    /// Transport for streaming the artifact to an attached debugger instead
    /// of a file. Only consulted when a session starts in streaming mode.
    pub debugger: Option<Arc<dyn ChunkSink>>,
    pub clock: Arc<dyn TraceClock>,
}

impl TraceServices {
    pub fn new(
        runtime: Arc<dyn RuntimeEnv>,
        instrumentation: Arc<dyn Instrumentation>,
        methods: Arc<dyn MethodRegistry>,
    ) -> Self {
        Self {
            runtime,
            instrumentation,
            methods,
            debugger: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_debugger(mut self, debugger: Arc<dyn ChunkSink>) -> Self {
        self.debugger = Some(debugger);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn TraceClock>) -> Self {
        self.clock = clock;
        self
    }
}
