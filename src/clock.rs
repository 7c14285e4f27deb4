//! Wall and per-thread CPU microsecond clocks, and the overhead calibration
//! reported in the trace preamble.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

/// Which clocks a tracing session samples for every event.
///
/// The choice fixes the record size and artifact version for the whole
/// session; the logging path branches on it once per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// Wall-clock delta only (10-byte records).
    Wall,
    /// Per-thread CPU delta only (10-byte records).
    ThreadCpu,
    /// Both deltas per record (14-byte records).
    Dual,
}

impl ClockSource {
    pub fn uses_wall(self) -> bool {
        matches!(self, ClockSource::Wall | ClockSource::Dual)
    }

    pub fn uses_thread_cpu(self) -> bool {
        matches!(self, ClockSource::ThreadCpu | ClockSource::Dual)
    }

    pub(crate) const fn to_u8(self) -> u8 {
        match self {
            ClockSource::Wall => 0,
            ClockSource::ThreadCpu => 1,
            ClockSource::Dual => 2,
        }
    }

    pub(crate) fn from_u8(val: u8) -> ClockSource {
        match val {
            0 => ClockSource::Wall,
            1 => ClockSource::ThreadCpu,
            _ => ClockSource::Dual,
        }
    }
}

/// Clock readings a session records deltas against.
///
/// Sessions normally use [`SystemClock`]; tests substitute scripted
/// implementations to make timestamps deterministic.
pub trait TraceClock: Send + Sync {
    /// Monotonic wall time in microseconds.
    fn wall_us(&self) -> u64;

    /// CPU time consumed by the calling thread, in microseconds.
    ///
    /// Only meaningful on platforms where [`SystemClock::has_thread_cpu`]
    /// holds; elsewhere implementations may fall back to wall time.
    fn thread_cpu_us(&self) -> u64;
}

/// The platform clocks.
#[derive(Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Whether this platform exposes a per-thread CPU clock.
    pub fn has_thread_cpu() -> bool {
        cfg!(unix)
    }
}

#[cfg(unix)]
fn clock_us(clock_id: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer and both clock ids used in this
    // module exist on the unix targets we build for.
    unsafe {
        libc::clock_gettime(clock_id, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

impl TraceClock for SystemClock {
    fn wall_us(&self) -> u64 {
        #[cfg(unix)]
        {
            clock_us(libc::CLOCK_MONOTONIC)
        }
        #[cfg(not(unix))]
        {
            use std::sync::OnceLock;
            use std::time::Instant;
            static EPOCH: OnceLock<Instant> = OnceLock::new();
            EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
        }
    }

    fn thread_cpu_us(&self) -> u64 {
        #[cfg(unix)]
        {
            clock_us(libc::CLOCK_THREAD_CPUTIME_ID)
        }
        #[cfg(not(unix))]
        {
            self.wall_us()
        }
    }
}

/// Clamp a requested clock source to what the platform can deliver.
///
/// Where per-thread CPU clocks are unavailable the request degrades to the
/// wall clock, with a warning logged once per process.
pub fn supported_clock_source(requested: ClockSource) -> ClockSource {
    if requested.uses_thread_cpu() && !SystemClock::has_thread_cpu() {
        static WARNED: AtomicBool = AtomicBool::new(false);
        if !WARNED.swap(true, Ordering::Relaxed) {
            warn!("per-thread CPU clock unavailable on this platform, tracing with the wall clock");
        }
        return ClockSource::Wall;
    }
    requested
}

/// Cost in nanoseconds of one round of clock samples for `source`.
///
/// Runs 4000 outer iterations of 8 samples each (each sample reads every
/// enabled clock once); 32000 samples at thread-CPU-microsecond resolution
/// make the elapsed microseconds divided by 32 the per-sample nanosecond
/// cost.
pub fn measure_clock_overhead(clock: &dyn TraceClock, source: ClockSource) -> u32 {
    let start = clock.thread_cpu_us();

    for _ in 0..4000 {
        for _ in 0..8 {
            if source.uses_thread_cpu() {
                clock.thread_cpu_us();
            }
            if source.uses_wall() {
                clock.wall_us();
            }
        }
    }

    let elapsed = clock.thread_cpu_us().saturating_sub(start);
    (elapsed / 32) as u32
}
