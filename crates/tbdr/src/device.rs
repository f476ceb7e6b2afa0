//! Device-wide state shared by every command buffer.
//!
//! Two things are mutable after creation: the visibility-stream pitches, which grow when the
//! GPU reports an overflow, and the scratch buffer cache. Both sit behind one mutex; nothing
//! else about a device changes while command buffers are recorded.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tbdr_cs::StreamId;
use tracing::{debug, info};

use crate::cache::FlushContext;
use crate::config::{DebugFlags, DeviceConfig, DeviceInfo, MAX_VSC_PIPES, VSC_PAD};
use crate::error::{RecordError, Result};
use crate::stats::RecordStats;

/// GPU address of the device's global block.
pub const GLOBAL_IOVA: u64 = 0x0100_0000;
/// Target of timestamp events nobody waits on.
pub const GLOBAL_SEQNO_DUMMY: u64 = 0x0;
/// Written by the GPU with the draw-stream pitch that overflowed.
pub const GLOBAL_VSC_DRAW_OVERFLOW: u64 = 0x8;
/// Written by the GPU with the primitive-stream pitch that overflowed.
pub const GLOBAL_VSC_PRIM_OVERFLOW: u64 = 0xc;
/// Built-in border colors.
pub const GLOBAL_BCOLOR_BUILTIN: u64 = 0x40;
/// Transform-feedback flush targets, 8 bytes per buffer.
pub const GLOBAL_FLUSH_BASE: u64 = 0x80;
/// Staging for indirect dispatch sizes that are not 16-byte aligned.
pub const GLOBAL_CS_INDIRECT_XYZ: u64 = 0xa0;

const SCRATCH_IOVA_BASE: u64 = 0x4000_0000;
const MIN_SCRATCH_BO_SIZE_LOG2: u32 = 12;
const MAX_SCRATCH_BO_SIZE_LOG2: u32 = 29;
const SCRATCH_SLOTS: usize = (MAX_SCRATCH_BO_SIZE_LOG2 - MIN_SCRATCH_BO_SIZE_LOG2 + 1) as usize;

/// A device-owned buffer reused by every command buffer that asks for one at least as small.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchBo {
    pub iova: u64,
    pub size: u64,
}

/// Visibility-stream layout captured for one command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VscSetup {
    pub draw_strm_pitch: u32,
    pub prim_strm_pitch: u32,
    pub bo: ScratchBo,
}

impl VscSetup {
    /// Size of the per-pipe primitive streams, which come first in the buffer.
    pub fn prim_strm_size(&self) -> u64 {
        u64::from(self.prim_strm_pitch) * u64::from(MAX_VSC_PIPES)
    }

    /// Offset of the per-pipe size words after both stream arrays.
    pub fn size_array_offset(&self) -> u64 {
        self.prim_strm_size() + u64::from(self.draw_strm_pitch) * u64::from(MAX_VSC_PIPES)
    }
}

struct SharedState {
    vsc_draw_strm_pitch: u32,
    vsc_prim_strm_pitch: u32,
    scratch: [Option<ScratchBo>; SCRATCH_SLOTS],
    next_scratch_iova: u64,
}

struct GlobalBlock {
    vsc_draw_overflow: AtomicU32,
    vsc_prim_overflow: AtomicU32,
}

pub struct Device {
    config: DeviceConfig,
    stats: RecordStats,
    next_stream: AtomicU32,
    shared: Mutex<SharedState>,
    global: GlobalBlock,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        info!(
            debug = ?config.debug,
            gmem = config.info.ccu_offset_gmem,
            "device created"
        );
        Self {
            shared: Mutex::new(SharedState {
                vsc_draw_strm_pitch: config.vsc_draw_strm_pitch,
                vsc_prim_strm_pitch: config.vsc_prim_strm_pitch,
                scratch: [None; SCRATCH_SLOTS],
                next_scratch_iova: SCRATCH_IOVA_BASE,
            }),
            config,
            stats: RecordStats::new(),
            next_stream: AtomicU32::new(0),
            global: GlobalBlock {
                vsc_draw_overflow: AtomicU32::new(0),
                vsc_prim_overflow: AtomicU32::new(0),
            },
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.config.info
    }

    pub fn debug(&self) -> DebugFlags {
        self.config.debug
    }

    pub fn stats(&self) -> &RecordStats {
        &self.stats
    }

    /// Reserve a fresh GPU address window for a stream.
    pub(crate) fn alloc_stream_id(&self) -> StreamId {
        StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed))
    }

    pub fn global_iova(offset: u64) -> u64 {
        GLOBAL_IOVA + offset
    }

    pub(crate) fn flush_context(&self) -> FlushContext {
        FlushContext {
            debug: self.config.debug,
            has_ccu_flush_bug: self.config.info.has_ccu_flush_bug,
            seqno_iova: Self::global_iova(GLOBAL_SEQNO_DUMMY),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current visibility-stream pitches as `(draw, prim)`.
    pub fn vsc_pitches(&self) -> (u32, u32) {
        let shared = self.lock();
        (shared.vsc_draw_strm_pitch, shared.vsc_prim_strm_pitch)
    }

    /// Grow the pitches the GPU reported as overflowing, capture them, and get a buffer big
    /// enough for every pipe's streams.
    pub(crate) fn setup_vsc(&self) -> Result<VscSetup> {
        let mut shared = self.lock();
        // Read under the lock so the counters are compared with the pitch they were reported
        // against.
        let draw_overflow = self.global.vsc_draw_overflow.load(Ordering::Acquire);
        let prim_overflow = self.global.vsc_prim_overflow.load(Ordering::Acquire);
        if draw_overflow >= shared.vsc_draw_strm_pitch {
            shared.vsc_draw_strm_pitch = (shared.vsc_draw_strm_pitch - VSC_PAD) * 2 + VSC_PAD;
            self.stats.inc_vsc_pitch_grows();
            info!(pitch = shared.vsc_draw_strm_pitch, "draw stream overflowed, pitch grown");
        }
        if prim_overflow >= shared.vsc_prim_strm_pitch {
            shared.vsc_prim_strm_pitch = (shared.vsc_prim_strm_pitch - VSC_PAD) * 2 + VSC_PAD;
            self.stats.inc_vsc_pitch_grows();
            info!(pitch = shared.vsc_prim_strm_pitch, "primitive stream overflowed, pitch grown");
        }
        let draw_strm_pitch = shared.vsc_draw_strm_pitch;
        let prim_strm_pitch = shared.vsc_prim_strm_pitch;

        let size = (u64::from(prim_strm_pitch) + u64::from(draw_strm_pitch) + 4)
            * u64::from(MAX_VSC_PIPES);
        let bo = self.scratch_locked(&mut shared, size)?;

        Ok(VscSetup {
            draw_strm_pitch,
            prim_strm_pitch,
            bo,
        })
    }

    /// Get a scratch buffer of at least `size` bytes.
    ///
    /// Sizes are rounded up to a power of two; any already-allocated buffer at least that
    /// large is returned instead of allocating a new one.
    pub fn get_scratch_bo(&self, size: u64) -> Result<ScratchBo> {
        let mut shared = self.lock();
        self.scratch_locked(&mut shared, size)
    }

    fn scratch_locked(&self, shared: &mut SharedState, size: u64) -> Result<ScratchBo> {
        let size_log2 = size
            .max(1)
            .next_power_of_two()
            .trailing_zeros()
            .max(MIN_SCRATCH_BO_SIZE_LOG2);
        if size_log2 > MAX_SCRATCH_BO_SIZE_LOG2 {
            return Err(RecordError::ScratchTooLarge { size });
        }
        let index = (size_log2 - MIN_SCRATCH_BO_SIZE_LOG2) as usize;

        if let Some(bo) = shared.scratch[index..].iter().flatten().next() {
            return Ok(*bo);
        }

        let bo = ScratchBo {
            iova: shared.next_scratch_iova,
            size: 1 << size_log2,
        };
        shared.next_scratch_iova += bo.size;
        shared.scratch[index] = Some(bo);
        self.stats.inc_scratch_allocations();
        debug!(iova = bo.iova, size = bo.size, "scratch buffer allocated");
        Ok(bo)
    }

    /// Store a word into the global block the way the GPU does when executing a memory write.
    ///
    /// Returns false if `iova` is not a GPU-writable word of the global block.
    pub fn write_global_u32(&self, iova: u64, value: u32) -> bool {
        let Some(offset) = iova.checked_sub(GLOBAL_IOVA) else {
            return false;
        };
        let slot = match offset {
            GLOBAL_VSC_DRAW_OVERFLOW => &self.global.vsc_draw_overflow,
            GLOBAL_VSC_PRIM_OVERFLOW => &self.global.vsc_prim_overflow,
            _ => return false,
        };
        slot.store(value, Ordering::Release);
        true
    }

    pub fn read_global_u32(&self, iova: u64) -> Option<u32> {
        let offset = iova.checked_sub(GLOBAL_IOVA)?;
        let slot = match offset {
            GLOBAL_VSC_DRAW_OVERFLOW => &self.global.vsc_draw_overflow,
            GLOBAL_VSC_PRIM_OVERFLOW => &self.global.vsc_prim_overflow,
            _ => return None,
        };
        Some(slot.load(Ordering::Acquire))
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new(DeviceConfig::default())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (draw, prim) = self.vsc_pitches();
        f.debug_struct("Device")
            .field("debug", &self.config.debug)
            .field("vsc_draw_strm_pitch", &draw)
            .field("vsc_prim_strm_pitch", &prim)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_buffers_are_shared_by_size_class() {
        let dev = Device::default();
        let small = dev.get_scratch_bo(100).unwrap();
        assert_eq!(small.size, 4096);
        assert_eq!(dev.get_scratch_bo(4096).unwrap(), small);

        let big = dev.get_scratch_bo(10_000).unwrap();
        assert_eq!(big.size, 16384);
        assert_ne!(big.iova, small.iova);
        // A larger buffer satisfies a smaller request once the exact class is taken.
        assert_eq!(dev.get_scratch_bo(5000).unwrap(), big);
        assert_eq!(dev.stats().snapshot().scratch_allocations, 2);
    }

    #[test]
    fn oversized_scratch_is_rejected() {
        let dev = Device::default();
        assert_eq!(
            dev.get_scratch_bo(1 << 40),
            Err(RecordError::ScratchTooLarge { size: 1 << 40 })
        );
    }

    #[test]
    fn overflow_report_grows_pitch_once() {
        let dev = Device::default();
        let (p0, prim0) = dev.vsc_pitches();

        let setup = dev.setup_vsc().unwrap();
        assert_eq!(setup.draw_strm_pitch, p0);

        assert!(dev.write_global_u32(Device::global_iova(GLOBAL_VSC_DRAW_OVERFLOW), p0));
        let setup = dev.setup_vsc().unwrap();
        assert_eq!(setup.draw_strm_pitch, (p0 - VSC_PAD) * 2 + VSC_PAD);
        assert_eq!(setup.prim_strm_pitch, prim0);

        // The stale report is below the new pitch.
        let again = dev.setup_vsc().unwrap();
        assert_eq!(again.draw_strm_pitch, setup.draw_strm_pitch);
    }

    #[test]
    fn concurrent_setups_grow_each_report_once() {
        let dev = Device::default();
        let (p0, prim0) = dev.vsc_pitches();
        assert!(dev.write_global_u32(Device::global_iova(GLOBAL_VSC_PRIM_OVERFLOW), prim0));
        let grown = (prim0 - VSC_PAD) * 2 + VSC_PAD;

        let start = std::sync::Barrier::new(8);
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        start.wait();
                        dev.setup_vsc().unwrap()
                    })
                })
                .collect();
            for handle in handles {
                let setup = handle.join().unwrap();
                assert_eq!(setup.prim_strm_pitch, grown);
                assert_eq!(setup.draw_strm_pitch, p0);
            }
        });
        assert_eq!(dev.vsc_pitches(), (p0, grown));
        assert_eq!(dev.stats().snapshot().vsc_pitch_grows, 1);
    }

    #[test]
    fn only_overflow_words_are_gpu_writable() {
        let dev = Device::default();
        assert!(!dev.write_global_u32(Device::global_iova(GLOBAL_SEQNO_DUMMY), 1));
        assert!(!dev.write_global_u32(0x10, 1));
        assert_eq!(dev.read_global_u32(Device::global_iova(GLOBAL_VSC_PRIM_OVERFLOW)), Some(0));
    }
}
