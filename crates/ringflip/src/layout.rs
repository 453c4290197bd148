//! Shared-region memory layout.
//!
//! The region is a plain file mapped into both the producer process
//! (read-write) and the daemon (read-only):
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ RegionHeader (repr(C), written once by the   │
//! │ producer before the daemon opens the file)   │
//! │  ├─ magic / version / producer_pid / half_len│
//! │  ├─ drop counters (monotone atomics)         │
//! │  ├─ writer_detached (set-once)               │
//! │  └─ RingControl                              │
//! │      ├─ switch_count (low bit = active half) │
//! │      ├─ HalfControl for half 0               │
//! │      └─ HalfControl for half 1               │
//! ├──────────────────────────────────────────────┤
//! │ half 0 (half_len bytes, packed entries)      │
//! ├──────────────────────────────────────────────┤
//! │ half 1 (half_len bytes, packed entries)      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! All cross-process state lives in atomics inside the header. The counters
//! must be lock-free on the target; builds on targets without native 32/64-bit
//! atomics are rejected below.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64};

#[cfg(not(target_has_atomic = "64"))]
compile_error!("ringflip requires native lock-free 64-bit atomics in shared memory");

/// Region magic: `"RFLP"`.
pub const REGION_MAGIC: u32 = 0x5246_4C50;

/// Bumped on any change to the structures in this module.
pub const LAYOUT_VERSION: u32 = 1;

/// Per-half writer-side control block.
///
/// `write_cursor` is the byte reservation cursor inside the half. It may
/// transiently exceed the half length while concurrent overflowing
/// reservations compensate themselves back; readers clamp it.
#[repr(C)]
pub struct HalfControl {
    /// Next free byte offset inside the half.
    pub write_cursor: AtomicU32,
    /// Writers that started a reservation on this half.
    pub acquired: AtomicU32,
    /// Writers that finished (or abandoned) a reservation on this half.
    pub released: AtomicU32,
}

impl HalfControl {
    pub(crate) const fn new() -> Self {
        Self {
            write_cursor: AtomicU32::new(0),
            acquired: AtomicU32::new(0),
            released: AtomicU32::new(0),
        }
    }
}

/// The alternating-ring control block.
///
/// The low bit of `switch_count` selects the half that accepts new writes.
/// The counter only ever increments; the pre-increment value identifies the
/// retired half towards the daemon.
#[repr(C)]
pub struct RingControl {
    /// Monotone switch counter; low bit selects the active half.
    pub switch_count: CachePadded<AtomicU32>,
    /// Control blocks for half 0 and half 1.
    pub halves: [CachePadded<HalfControl>; 2],
}

impl RingControl {
    pub(crate) fn new() -> Self {
        Self {
            switch_count: CachePadded::new(AtomicU32::new(0)),
            halves: [
                CachePadded::new(HalfControl::new()),
                CachePadded::new(HalfControl::new()),
            ],
        }
    }

    /// Control block of the half identified by a switch-count value.
    #[inline]
    pub fn half(&self, switch_count: u32) -> &HalfControl {
        &*self.halves[(switch_count & 1) as usize]
    }
}

/// Fixed header at offset 0 of every region file.
///
/// `producer_pid` and `half_len` are written exactly once, before the
/// producer advertises the file over the control channel; the daemon treats
/// them as immutable. The drop counters are monotone. `writer_detached` is
/// set-once.
#[repr(C)]
pub struct RegionHeader {
    /// [`REGION_MAGIC`] once initialization completed.
    pub magic: AtomicU32,
    /// [`LAYOUT_VERSION`] of the producing binary.
    pub version: u32,
    /// Pid of the producer that created the region.
    pub producer_pid: u32,
    /// Length in bytes of each buffer half.
    pub half_len: u32,
    /// Records dropped because the active half was full.
    pub drops_buffer_full: AtomicU64,
    /// Bytes lost to buffer-full drops.
    pub size_drops_buffer_full: AtomicU64,
    /// Records dropped because the payload size was rejected.
    pub drops_invalid_size: AtomicU64,
    /// Records dropped because their type never registered.
    pub drops_type_registration_failed: AtomicU64,
    /// Set once by the producer at teardown; enables the post-mortem drain.
    pub writer_detached: AtomicU32,
    /// The alternating ring control block.
    pub control: RingControl,
}

impl RegionHeader {
    pub(crate) fn new(producer_pid: u32, half_len: u32) -> Self {
        Self {
            magic: AtomicU32::new(REGION_MAGIC),
            version: LAYOUT_VERSION,
            producer_pid,
            half_len,
            drops_buffer_full: AtomicU64::new(0),
            size_drops_buffer_full: AtomicU64::new(0),
            drops_invalid_size: AtomicU64::new(0),
            drops_type_registration_failed: AtomicU64::new(0),
            writer_detached: AtomicU32::new(0),
            control: RingControl::new(),
        }
    }

    /// Byte offset of buffer half 0 within the region file.
    #[inline]
    pub const fn half_offset(half: usize, half_len: u32) -> usize {
        std::mem::size_of::<Self>() + half * half_len as usize
    }

    /// Total file length for a given half size.
    #[inline]
    pub const fn region_len(half_len: u32) -> usize {
        std::mem::size_of::<Self>() + 2 * half_len as usize
    }
}
