//! Binary codec for the trace header and per-event records.
//!
//! Artifact layout:
//!
//! ```text
//!     header
//!     record 0
//!     record 1
//!     ...
//! ```
//!
//! Header (32 bytes):
//!
//! ```text
//!     u4  magic ('SLOW')
//!     u2  version (2 = single clock, 3 = dual clock)
//!     u2  offset to data
//!     u8  start time in usec
//!     u2  record size in bytes (version 3 only)
//!     ... zero padding to 32 bytes
//! ```
//!
//! Records (10 or 14 bytes, packed):
//!
//! ```text
//!     u2  thread ID
//!     u4  method ID | method action
//!     u4  thread CPU delta in usec (thread-cpu and dual clocks)
//!     u4  wall delta in usec (wall and dual clocks)
//! ```
//!
//! All values little-endian. 32 bits of microseconds is about 70 minutes;
//! deltas wrap beyond that.

use crate::clock::ClockSource;
use crate::encode::{get_u16_le, get_u32_le, put_u16_le, put_u32_le, put_u64_le};

/// `'SLOW'` interpreted as a little-endian u32.
pub const TRACE_MAGIC: u32 = 0x574f_4c53;
pub const TRACE_HEADER_LEN: usize = 32;
pub const TRACE_VERSION_SINGLE_CLOCK: u16 = 2;
pub const TRACE_VERSION_DUAL_CLOCK: u16 = 3;
pub const RECORD_SIZE_SINGLE_CLOCK: usize = 10;
pub const RECORD_SIZE_DUAL_CLOCK: usize = 14;

/// Two low bits of the packed method word.
const ACTION_MASK: u32 = 0x3;

/// Opaque method reference assigned by the runtime's method table.
///
/// The table guarantees at least 4-byte alignment, leaving the low two bits
/// of the raw value free to carry the trace action in encoded records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodId(pub u32);

/// What happened to the method: the action bits of a record. Value 3 is
/// reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TraceAction {
    MethodEnter = 0,
    MethodExit = 1,
    MethodUnwind = 2,
}

pub fn trace_version(source: ClockSource) -> u16 {
    if source == ClockSource::Dual {
        TRACE_VERSION_DUAL_CLOCK
    } else {
        TRACE_VERSION_SINGLE_CLOCK
    }
}

pub fn record_size(source: ClockSource) -> usize {
    if source == ClockSource::Dual {
        RECORD_SIZE_DUAL_CLOCK
    } else {
        RECORD_SIZE_SINGLE_CLOCK
    }
}

/// Pack a method reference and an action into one record word.
pub fn encode_method_action(method: MethodId, action: TraceAction) -> u32 {
    assert_eq!(
        method.0 & ACTION_MASK,
        0,
        "method reference {:#x} is not 4-byte aligned",
        method.0
    );
    method.0 | action as u32
}

pub fn decode_method_id(tmid: u32) -> MethodId {
    MethodId(tmid & !ACTION_MASK)
}

pub fn decode_action(tmid: u32) -> TraceAction {
    match tmid & ACTION_MASK {
        0 => TraceAction::MethodEnter,
        1 => TraceAction::MethodExit,
        2 => TraceAction::MethodUnwind,
        _ => panic!("reserved trace action in record word {tmid:#x}"),
    }
}

/// One decoded trace event.
///
/// The clock deltas present depend on the session's [`ClockSource`]; the
/// encoded field order is `tid, method|action, dt_cpu, dt_wall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub tid: u16,
    pub method: MethodId,
    pub action: TraceAction,
    pub dt_cpu: Option<u32>,
    pub dt_wall: Option<u32>,
}

impl TraceRecord {
    /// Encode into the front of `buf`, returning the encoded length.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        put_u16_le(buf, self.tid);
        put_u32_le(&mut buf[2..], encode_method_action(self.method, self.action));
        let mut at = 6;
        if let Some(dt) = self.dt_cpu {
            put_u32_le(&mut buf[at..], dt);
            at += 4;
        }
        if let Some(dt) = self.dt_wall {
            put_u32_le(&mut buf[at..], dt);
            at += 4;
        }
        at
    }

    /// Decode one record from the front of `buf` under `source`.
    pub fn decode(buf: &[u8], source: ClockSource) -> TraceRecord {
        let tid = get_u16_le(buf);
        let tmid = get_u32_le(&buf[2..]);
        let mut at = 6;
        let dt_cpu = if source.uses_thread_cpu() {
            let dt = get_u32_le(&buf[at..]);
            at += 4;
            Some(dt)
        } else {
            None
        };
        let dt_wall = if source.uses_wall() {
            Some(get_u32_le(&buf[at..]))
        } else {
            None
        };
        TraceRecord {
            tid,
            method: decode_method_id(tmid),
            action: decode_action(tmid),
            dt_cpu,
            dt_wall,
        }
    }
}

/// Fill in the artifact header. `buf` arrives zeroed; fields not written
/// here stay zero, which is the required padding.
pub fn write_header(buf: &mut [u8; TRACE_HEADER_LEN], source: ClockSource, start_time_us: u64) {
    let version = trace_version(source);
    put_u32_le(buf, TRACE_MAGIC);
    put_u16_le(&mut buf[4..], version);
    put_u16_le(&mut buf[6..], TRACE_HEADER_LEN as u16);
    put_u64_le(&mut buf[8..], start_time_us);
    if version >= TRACE_VERSION_DUAL_CLOCK {
        put_u16_le(&mut buf[16..], record_size(source) as u16);
    }
}
