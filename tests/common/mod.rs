//! Shared collaborator doubles and artifact re-parsing for the integration
//! tests.

#![allow(dead_code)] // each test binary uses a subset of this module

use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use vmtrace::encode::{get_u16_le, get_u32_le, get_u64_le};
use vmtrace::record::{record_size, TRACE_HEADER_LEN, TRACE_MAGIC};
use vmtrace::runtime::events;
use vmtrace::{
    ChunkSink, ClockSource, Instrumentation, InstrumentationListener, MethodId, MethodRegistry,
    MethodSymbols, RuntimeEnv, RuntimeStat, ThreadInfo, TraceClock, TraceRecord, TraceServices,
};

/// The trace slot is process-wide, so lifecycle tests in one binary
/// serialize on this.
static SESSION_LOCK: Mutex<()> = Mutex::new(());

pub fn session_lock() -> MutexGuard<'static, ()> {
    SESSION_LOCK.lock()
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

static PATH_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn temp_trace_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "vmtrace-{}-{}-{tag}.trace",
        process::id(),
        PATH_COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Runtime double: counts suspend/resume brackets and models the stats
/// switch.
pub struct MockRuntime {
    pub suspend_count: AtomicUsize,
    pub resume_count: AtomicUsize,
    pub stats_enabled: AtomicBool,
    pub threads: Mutex<Vec<ThreadInfo>>,
    pub alloc_objects: AtomicU64,
    pub alloc_bytes: AtomicU64,
    pub gc_count: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            suspend_count: AtomicUsize::new(0),
            resume_count: AtomicUsize::new(0),
            stats_enabled: AtomicBool::new(false),
            threads: Mutex::new(vec![ThreadInfo {
                tid: 1,
                name: "main".into(),
            }]),
            alloc_objects: AtomicU64::new(11),
            alloc_bytes: AtomicU64::new(2048),
            gc_count: AtomicU64::new(3),
        })
    }
}

impl RuntimeEnv for MockRuntime {
    fn suspend_all(&self) {
        self.suspend_count.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_all(&self) {
        self.resume_count.fetch_add(1, Ordering::SeqCst);
    }

    fn thread_list(&self) -> Vec<ThreadInfo> {
        self.threads.lock().clone()
    }

    fn set_stats_enabled(&self, enabled: bool) {
        self.stats_enabled.store(enabled, Ordering::SeqCst);
    }

    fn stat(&self, kind: RuntimeStat) -> u64 {
        match kind {
            RuntimeStat::AllocatedObjects => self.alloc_objects.load(Ordering::SeqCst),
            RuntimeStat::AllocatedBytes => self.alloc_bytes.load(Ordering::SeqCst),
            RuntimeStat::GcInvocations => self.gc_count.load(Ordering::SeqCst),
        }
    }
}

/// Instrumentation double: records registrations and re-dispatches fired
/// events to whatever is registered for them.
pub struct MockInstrumentation {
    listeners: Mutex<Vec<(Arc<dyn InstrumentationListener>, u32)>>,
}

impl MockInstrumentation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// The first registered listener, for tests that dispatch from their
    /// own threads.
    pub fn listener(&self) -> Option<Arc<dyn InstrumentationListener>> {
        self.listeners.lock().first().map(|(l, _)| l.clone())
    }

    pub fn fire_entered(&self, tid: u16, method: MethodId) {
        for (listener, mask) in self.listeners.lock().iter() {
            if mask & events::METHOD_ENTERED != 0 {
                listener.method_entered(tid, method);
            }
        }
    }

    pub fn fire_exited(&self, tid: u16, method: MethodId, return_value: u64) {
        for (listener, mask) in self.listeners.lock().iter() {
            if mask & events::METHOD_EXITED != 0 {
                listener.method_exited(tid, method, return_value);
            }
        }
    }

    pub fn fire_unwind(&self, tid: u16, method: MethodId) {
        for (listener, mask) in self.listeners.lock().iter() {
            if mask & events::METHOD_UNWIND != 0 {
                listener.method_unwind(tid, method);
            }
        }
    }
}

fn thin_ptr(listener: &Arc<dyn InstrumentationListener>) -> *const u8 {
    Arc::as_ptr(listener) as *const u8
}

impl Instrumentation for MockInstrumentation {
    fn add_listener(&self, listener: Arc<dyn InstrumentationListener>, event_mask: u32) {
        self.listeners.lock().push((listener, event_mask));
    }

    fn remove_listener(&self, listener: &Arc<dyn InstrumentationListener>, event_mask: u32) {
        self.listeners
            .lock()
            .retain(|(l, mask)| thin_ptr(l) != thin_ptr(listener) || *mask != event_mask);
    }
}

/// Method registry double with deterministic symbols derived from the id.
pub struct FixtureMethods;

impl MethodRegistry for FixtureMethods {
    fn describe(&self, method: MethodId) -> MethodSymbols {
        MethodSymbols {
            class_descriptor: "LFixture;".into(),
            name: format!("m{:x}", method.0),
            signature: "()V".into(),
            source_file: "Fixture.java".into(),
        }
    }
}

/// Captures streamed chunks instead of sending them anywhere.
pub struct MockChunkSink {
    pub chunks: Mutex<Vec<(u32, Vec<Vec<u8>>)>>,
}

impl MockChunkSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            chunks: Mutex::new(Vec::new()),
        })
    }
}

impl ChunkSink for MockChunkSink {
    fn send_chunk(&self, chunk_type: u32, parts: &[&[u8]]) -> io::Result<()> {
        self.chunks
            .lock()
            .push((chunk_type, parts.iter().map(|p| p.to_vec()).collect()));
        Ok(())
    }
}

/// Replays scripted readings; the last value repeats once the script runs
/// dry (which also keeps the overhead calibration loop cheap).
pub struct ScriptedClock {
    wall: Mutex<Vec<u64>>,
    cpu: Mutex<Vec<u64>>,
}

impl ScriptedClock {
    pub fn new(wall: &[u64], cpu: &[u64]) -> Arc<Self> {
        Arc::new(Self {
            wall: Mutex::new(wall.to_vec()),
            cpu: Mutex::new(cpu.to_vec()),
        })
    }

    fn next(values: &Mutex<Vec<u64>>) -> u64 {
        let mut values = values.lock();
        if values.len() > 1 {
            values.remove(0)
        } else {
            values.first().copied().unwrap_or(0)
        }
    }
}

impl TraceClock for ScriptedClock {
    fn wall_us(&self) -> u64 {
        Self::next(&self.wall)
    }

    fn thread_cpu_us(&self) -> u64 {
        Self::next(&self.cpu)
    }
}

/// One fully wired set of collaborators.
pub struct TestHost {
    pub runtime: Arc<MockRuntime>,
    pub instrumentation: Arc<MockInstrumentation>,
    pub clock: Arc<ScriptedClock>,
    pub services: TraceServices,
}

pub fn test_host(wall: &[u64], cpu: &[u64]) -> TestHost {
    let runtime = MockRuntime::new();
    let instrumentation = MockInstrumentation::new();
    let clock = ScriptedClock::new(wall, cpu);
    let services = TraceServices::new(
        runtime.clone(),
        instrumentation.clone(),
        Arc::new(FixtureMethods),
    )
    .with_clock(clock.clone());
    TestHost {
        runtime,
        instrumentation,
        clock,
        services,
    }
}

/// A re-parsed trace artifact.
pub struct Artifact {
    pub preamble: String,
    pub version: u16,
    pub offset_to_data: u16,
    pub start_time_us: u64,
    pub clock_source: ClockSource,
    /// The binary payload, 32-byte header included.
    pub binary: Vec<u8>,
    pub records: Vec<TraceRecord>,
}

/// Split and decode an emitted artifact per the on-disk format.
pub fn parse_artifact(bytes: &[u8]) -> Artifact {
    let terminator = b"*end\n";
    let end = bytes
        .windows(terminator.len())
        .position(|window| window == terminator)
        .expect("preamble terminator")
        + terminator.len();
    let preamble = String::from_utf8(bytes[..end].to_vec()).expect("preamble is text");
    let binary = bytes[end..].to_vec();

    assert!(binary.len() >= TRACE_HEADER_LEN, "truncated trace header");
    assert_eq!(get_u32_le(&binary), TRACE_MAGIC);
    let version = get_u16_le(&binary[4..]);
    let offset_to_data = get_u16_le(&binary[6..]);
    let start_time_us = get_u64_le(&binary[8..]);

    let clock_line = preamble
        .lines()
        .find_map(|line| line.strip_prefix("clock="))
        .expect("clock line");
    let clock_source = match clock_line {
        "wall" => ClockSource::Wall,
        "thread-cpu" => ClockSource::ThreadCpu,
        "dual" => ClockSource::Dual,
        other => panic!("unknown clock '{other}'"),
    };
    if version >= 3 {
        assert_eq!(
            get_u16_le(&binary[16..]) as usize,
            record_size(clock_source)
        );
    }

    let records = binary[TRACE_HEADER_LEN..]
        .chunks_exact(record_size(clock_source))
        .map(|chunk| TraceRecord::decode(chunk, clock_source))
        .collect();

    Artifact {
        preamble,
        version,
        offset_to_data,
        start_time_us,
        clock_source,
        binary,
        records,
    }
}

/// Value of a `key=value` preamble line.
pub fn preamble_value<'a>(preamble: &'a str, key: &str) -> Option<&'a str> {
    preamble
        .lines()
        .find_map(|line| line.strip_prefix(key)?.strip_prefix('='))
}
