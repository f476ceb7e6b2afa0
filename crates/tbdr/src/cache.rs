//! Cache coherency tracking.
//!
//! The GPU has three caches that do not snoop each other: UCHE (shader/texture/vertex data),
//! and the color and depth halves of the CCU (render backend writes). Every barrier and every
//! implicit access is described as a set of [`AccessMask`] bits for the producer and the
//! consumer; [`CacheState::record_access`] turns that into flush and invalidate work, deferring
//! as much of it as possible until something actually consumes the data.

use bitflags::bitflags;
use tbdr_cs::{Emit, Opcode, VgtEvent};
use tracing::trace;

use crate::config::DebugFlags;

bitflags! {
    /// Cache maintenance and synchronization work.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct FlushBits: u32 {
        const CCU_FLUSH_DEPTH = 1 << 0;
        const CCU_FLUSH_COLOR = 1 << 1;
        const CCU_INVALIDATE_DEPTH = 1 << 2;
        const CCU_INVALIDATE_COLOR = 1 << 3;
        const CACHE_FLUSH = 1 << 4;
        const CACHE_INVALIDATE = 1 << 5;
        const WAIT_MEM_WRITES = 1 << 6;
        const WAIT_FOR_IDLE = 1 << 7;
        const WAIT_FOR_ME = 1 << 8;

        const ALL_FLUSH = Self::CCU_FLUSH_DEPTH.bits()
            | Self::CCU_FLUSH_COLOR.bits()
            | Self::CACHE_FLUSH.bits()
            // Treat the CP as a sort of "cache" which may need to be "flushed" by waiting for
            // writes to land.
            | Self::WAIT_MEM_WRITES.bits();

        const ALL_INVALIDATE = Self::CCU_INVALIDATE_DEPTH.bits()
            | Self::CCU_INVALIDATE_COLOR.bits()
            | Self::CACHE_INVALIDATE.bits()
            // Likewise the CP prefetches, so it is "invalidated" by waiting for it to catch up.
            | Self::WAIT_FOR_ME.bits();
    }
}

bitflags! {
    /// Memory access classified by the cache domain it goes through.
    ///
    /// `*_INCOHERENT_*` accesses go through a cache that may hold stale lines from before the
    /// last invalidate, so they need maintenance even when the previous access used the same
    /// domain.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct AccessMask: u32 {
        const UCHE_READ = 1 << 0;
        const UCHE_WRITE = 1 << 1;
        const CCU_COLOR_READ = 1 << 2;
        const CCU_COLOR_WRITE = 1 << 3;
        const CCU_DEPTH_READ = 1 << 4;
        const CCU_DEPTH_WRITE = 1 << 5;
        const CCU_COLOR_INCOHERENT_READ = 1 << 6;
        const CCU_COLOR_INCOHERENT_WRITE = 1 << 7;
        const CCU_DEPTH_INCOHERENT_READ = 1 << 8;
        const CCU_DEPTH_INCOHERENT_WRITE = 1 << 9;
        /// Written by the command processor directly, bypassing every cache.
        const CP_WRITE = 1 << 10;
        /// Uncached access by something outside the GPU caches (host, CP reads, GMEM
        /// loads and stores).
        const SYSMEM_READ = 1 << 11;
        const SYSMEM_WRITE = 1 << 12;
        /// Pseudo access requiring the pipeline to drain.
        const WFI_READ = 1 << 13;

        const SYSMEM = Self::SYSMEM_READ.bits() | Self::SYSMEM_WRITE.bits();
        const READ = Self::UCHE_READ.bits()
            | Self::CCU_COLOR_READ.bits()
            | Self::CCU_DEPTH_READ.bits()
            | Self::CCU_COLOR_INCOHERENT_READ.bits()
            | Self::CCU_DEPTH_INCOHERENT_READ.bits()
            | Self::SYSMEM_READ.bits();
        const WRITE = Self::UCHE_WRITE.bits()
            | Self::CCU_COLOR_WRITE.bits()
            | Self::CCU_DEPTH_WRITE.bits()
            | Self::CCU_COLOR_INCOHERENT_WRITE.bits()
            | Self::CCU_DEPTH_INCOHERENT_WRITE.bits()
            | Self::CP_WRITE.bits()
            | Self::SYSMEM_WRITE.bits();
    }
}

/// One of the three non-coherent caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Domain {
    Uche,
    CcuColor,
    CcuDepth,
}

impl Domain {
    const ALL: [Domain; 3] = [Domain::Uche, Domain::CcuColor, Domain::CcuDepth];

    fn flush(self) -> FlushBits {
        match self {
            Domain::Uche => FlushBits::CACHE_FLUSH,
            Domain::CcuColor => FlushBits::CCU_FLUSH_COLOR,
            Domain::CcuDepth => FlushBits::CCU_FLUSH_DEPTH,
        }
    }

    fn invalidate(self) -> FlushBits {
        match self {
            Domain::Uche => FlushBits::CACHE_INVALIDATE,
            Domain::CcuColor => FlushBits::CCU_INVALIDATE_COLOR,
            Domain::CcuDepth => FlushBits::CCU_INVALIDATE_DEPTH,
        }
    }

    /// Coherent read and write bits.
    fn coherent(self) -> (AccessMask, AccessMask) {
        match self {
            Domain::Uche => (AccessMask::UCHE_READ, AccessMask::UCHE_WRITE),
            Domain::CcuColor => (AccessMask::CCU_COLOR_READ, AccessMask::CCU_COLOR_WRITE),
            Domain::CcuDepth => (AccessMask::CCU_DEPTH_READ, AccessMask::CCU_DEPTH_WRITE),
        }
    }

    /// Incoherent read and write bits; UCHE has none.
    fn incoherent(self) -> (AccessMask, AccessMask) {
        match self {
            Domain::Uche => (AccessMask::empty(), AccessMask::empty()),
            Domain::CcuColor => (
                AccessMask::CCU_COLOR_INCOHERENT_READ,
                AccessMask::CCU_COLOR_INCOHERENT_WRITE,
            ),
            Domain::CcuDepth => (
                AccessMask::CCU_DEPTH_INCOHERENT_READ,
                AccessMask::CCU_DEPTH_INCOHERENT_WRITE,
            ),
        }
    }
}

/// Point in the pipeline where an access happens, ordered front to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Command processor: indirect parameters, predicates.
    Cp,
    /// Front end: vertex and index fetch.
    Fe,
    /// Shaders up to and including geometry.
    SpVs,
    /// Fragment and compute shaders.
    SpPs,
    /// Everything from the rasterizer back.
    Ps,
}

/// Pending and ready cache maintenance for one command stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheState {
    /// Work that must be emitted at the next flush point.
    pub flush_bits: FlushBits,
    /// Work owed by earlier writes, promoted once a consumer shows up.
    pub pending_flush_bits: FlushBits,
}

impl CacheState {
    /// State at the start of a command buffer: anything could have touched memory before, so
    /// every cache may be stale.
    pub fn new() -> Self {
        Self {
            flush_bits: FlushBits::empty(),
            pending_flush_bits: FlushBits::ALL_INVALIDATE,
        }
    }

    /// Record that `src` accesses must be visible to later `dst` accesses.
    pub fn record_access(&mut self, src: AccessMask, dst: AccessMask) {
        let mut flush = FlushBits::empty();

        // Writes that bypass every cache still leave stale lines behind.
        if src.contains(AccessMask::SYSMEM_WRITE) {
            self.pending_flush_bits |= FlushBits::ALL_INVALIDATE;
        }
        if src.contains(AccessMask::CP_WRITE) {
            self.pending_flush_bits |= FlushBits::WAIT_MEM_WRITES | FlushBits::ALL_INVALIDATE;
        }

        for domain in Domain::ALL {
            let (_, write) = domain.coherent();
            if src.intersects(write) {
                // Data sits in this cache; everyone else may hold stale copies.
                self.pending_flush_bits |= domain.flush() | FlushBits::ALL_INVALIDATE;
            }

            let (_, incoherent_write) = domain.incoherent();
            if src.intersects(incoherent_write) {
                flush |= domain.flush();
                self.pending_flush_bits |= FlushBits::ALL_INVALIDATE & !domain.invalidate();
            }
        }

        // Uncached consumers only need the caches written back.
        if dst.intersects(AccessMask::SYSMEM) {
            flush |= self.pending_flush_bits & FlushBits::ALL_FLUSH;
        }

        for domain in Domain::ALL {
            let (read, write) = domain.coherent();
            if dst.intersects(read | write) {
                flush |= self.pending_flush_bits & (domain.invalidate() | FlushBits::ALL_FLUSH);
            }

            let (incoherent_read, incoherent_write) = domain.incoherent();
            if dst.intersects(incoherent_read | incoherent_write) {
                flush |= domain.invalidate()
                    | (self.pending_flush_bits & (FlushBits::ALL_FLUSH & !domain.flush()));
            }
        }

        if dst.contains(AccessMask::WFI_READ) {
            flush |= self.pending_flush_bits & FlushBits::WAIT_FOR_IDLE;
        }

        if !flush.is_empty() {
            trace!(?src, ?dst, ?flush, "cache flush scheduled");
        }
        self.flush_bits |= flush;
        self.pending_flush_bits &= !flush;
    }

    /// Order `src_stage` before `dst_stage`.
    ///
    /// Cache maintenance events are executed at the end of the pipeline, so once any are
    /// queued the producer is effectively the last stage.
    pub fn stage_dependency(&mut self, src_stage: Stage, dst_stage: Stage) {
        let src_stage = if self
            .flush_bits
            .intersects(FlushBits::ALL_FLUSH | FlushBits::ALL_INVALIDATE)
        {
            Stage::Ps
        } else {
            src_stage
        };

        // A CP consumer also waits for outstanding WFIs, which draws and indirect reads
        // already do, so idling is enough for every destination.
        if src_stage > dst_stage {
            self.flush_bits |= FlushBits::WAIT_FOR_IDLE;
        }
    }

    /// Promote everything pending into the ready set.
    pub fn flush_all_pending(&mut self) {
        self.flush_bits |= self.pending_flush_bits;
        self.pending_flush_bits = FlushBits::empty();
    }

    pub fn take_flush_bits(&mut self) -> FlushBits {
        std::mem::take(&mut self.flush_bits)
    }
}

/// Device properties that change how flushes are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushContext {
    pub debug: DebugFlags,
    pub has_ccu_flush_bug: bool,
    /// Destination of timestamp events.
    pub seqno_iova: u64,
}

/// Emit the events and waits for `flushes`, in the order the hardware needs them.
///
/// CCU invalidates are only reliable on a clean cache, so any CCU invalidate is preceded by
/// a flush of the same half.
pub fn emit_flushes(cs: &mut impl Emit, ctx: &FlushContext, flushes: FlushBits) {
    let mut flushes = flushes;
    if ctx.debug.contains(DebugFlags::FLUSHALL) {
        flushes |= FlushBits::ALL_FLUSH | FlushBits::ALL_INVALIDATE;
    }
    if ctx.debug.contains(DebugFlags::SYNCDRAW) {
        flushes |= FlushBits::WAIT_MEM_WRITES | FlushBits::WAIT_FOR_IDLE | FlushBits::WAIT_FOR_ME;
    }

    if flushes.intersects(FlushBits::CCU_FLUSH_COLOR | FlushBits::CCU_INVALIDATE_COLOR) {
        cs.emit_event_write_ts(VgtEvent::PcCcuFlushColorTs, ctx.seqno_iova, 0);
    }
    if flushes.intersects(FlushBits::CCU_FLUSH_DEPTH | FlushBits::CCU_INVALIDATE_DEPTH) {
        cs.emit_event_write_ts(VgtEvent::PcCcuFlushDepthTs, ctx.seqno_iova, 0);
    }
    if flushes.contains(FlushBits::CCU_INVALIDATE_COLOR) {
        cs.emit_event_write(VgtEvent::PcCcuInvalidateColor);
    }
    if flushes.contains(FlushBits::CCU_INVALIDATE_DEPTH) {
        cs.emit_event_write(VgtEvent::PcCcuInvalidateDepth);
    }
    if flushes.contains(FlushBits::CACHE_FLUSH) {
        cs.emit_event_write_ts(VgtEvent::CacheFlushTs, ctx.seqno_iova, 0);
    }
    if flushes.contains(FlushBits::CACHE_INVALIDATE) {
        cs.emit_event_write(VgtEvent::CacheInvalidate);
    }
    if flushes.contains(FlushBits::WAIT_MEM_WRITES) {
        cs.emit_pkt7(Opcode::WaitMemWrites, 0);
    }
    let ccu_flush = FlushBits::CCU_FLUSH_COLOR | FlushBits::CCU_FLUSH_DEPTH;
    if flushes.contains(FlushBits::WAIT_FOR_IDLE)
        || (ctx.has_ccu_flush_bug && flushes.intersects(ccu_flush))
    {
        cs.emit_wfi();
    }
    if flushes.contains(FlushBits::WAIT_FOR_ME) {
        cs.emit_pkt7(Opcode::WaitForMe, 0);
    }
}

/// Emit `event`, giving timestamp events the context's seqno target.
pub fn emit_event(cs: &mut impl Emit, ctx: &FlushContext, event: VgtEvent) {
    if event.writes_seqno() {
        cs.emit_event_write_ts(event, ctx.seqno_iova, 0);
    } else {
        cs.emit_event_write(event);
    }
}

bitflags! {
    /// API-level memory access kinds.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const INDIRECT_COMMAND_READ = 0x0000_0001;
        const INDEX_READ = 0x0000_0002;
        const VERTEX_ATTRIBUTE_READ = 0x0000_0004;
        const UNIFORM_READ = 0x0000_0008;
        const INPUT_ATTACHMENT_READ = 0x0000_0010;
        const SHADER_READ = 0x0000_0020;
        const SHADER_WRITE = 0x0000_0040;
        const COLOR_ATTACHMENT_READ = 0x0000_0080;
        const COLOR_ATTACHMENT_WRITE = 0x0000_0100;
        const DEPTH_STENCIL_ATTACHMENT_READ = 0x0000_0200;
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 0x0000_0400;
        const TRANSFER_READ = 0x0000_0800;
        const TRANSFER_WRITE = 0x0000_1000;
        const HOST_READ = 0x0000_2000;
        const HOST_WRITE = 0x0000_4000;
        const MEMORY_READ = 0x0000_8000;
        const MEMORY_WRITE = 0x0001_0000;
        const COLOR_ATTACHMENT_READ_NONCOHERENT = 0x0008_0000;
        const CONDITIONAL_RENDERING_READ = 0x0010_0000;
        const TRANSFORM_FEEDBACK_WRITE = 0x0200_0000;
        const TRANSFORM_FEEDBACK_COUNTER_READ = 0x0400_0000;
        const TRANSFORM_FEEDBACK_COUNTER_WRITE = 0x0800_0000;
    }
}

bitflags! {
    /// API-level pipeline stages.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 0x0000_0001;
        const DRAW_INDIRECT = 0x0000_0002;
        const VERTEX_INPUT = 0x0000_0004;
        const VERTEX_SHADER = 0x0000_0008;
        const TESSELLATION_CONTROL_SHADER = 0x0000_0010;
        const TESSELLATION_EVALUATION_SHADER = 0x0000_0020;
        const GEOMETRY_SHADER = 0x0000_0040;
        const FRAGMENT_SHADER = 0x0000_0080;
        const EARLY_FRAGMENT_TESTS = 0x0000_0100;
        const LATE_FRAGMENT_TESTS = 0x0000_0200;
        const COLOR_ATTACHMENT_OUTPUT = 0x0000_0400;
        const COMPUTE_SHADER = 0x0000_0800;
        const TRANSFER = 0x0000_1000;
        const BOTTOM_OF_PIPE = 0x0000_2000;
        const HOST = 0x0000_4000;
        const ALL_GRAPHICS = 0x0000_8000;
        const ALL_COMMANDS = 0x0001_0000;
        const CONDITIONAL_RENDERING = 0x0004_0000;
        const TRANSFORM_FEEDBACK = 0x0100_0000;

        /// Stages whose work is confined to the pixel being rendered.
        const FRAMEBUFFER_SPACE = Self::FRAGMENT_SHADER.bits()
            | Self::EARLY_FRAGMENT_TESTS.bits()
            | Self::LATE_FRAGMENT_TESTS.bits()
            | Self::COLOR_ATTACHMENT_OUTPUT.bits();
    }
}

/// Map API access kinds to cache domains.
///
/// `gmem` is set when attachment and transfer accesses are known to run while the CCU is in
/// GMEM mode, where they bypass it and go straight to memory.
pub fn translate_access(flags: AccessFlags, gmem: bool) -> AccessMask {
    let mut mask = AccessMask::empty();
    let any = |bits: AccessFlags| flags.intersects(bits);

    if any(AccessFlags::INDIRECT_COMMAND_READ
        | AccessFlags::CONDITIONAL_RENDERING_READ
        | AccessFlags::TRANSFORM_FEEDBACK_COUNTER_READ
        | AccessFlags::MEMORY_READ)
    {
        mask |= AccessMask::SYSMEM_READ;
    }
    if any(AccessFlags::TRANSFORM_FEEDBACK_COUNTER_WRITE | AccessFlags::MEMORY_WRITE) {
        mask |= AccessMask::CP_WRITE;
    }
    if any(AccessFlags::HOST_READ | AccessFlags::MEMORY_WRITE) {
        mask |= AccessMask::SYSMEM_READ;
    }
    if any(AccessFlags::HOST_WRITE | AccessFlags::MEMORY_WRITE) {
        mask |= AccessMask::SYSMEM_WRITE;
    }
    if any(AccessFlags::INDEX_READ
        | AccessFlags::VERTEX_ATTRIBUTE_READ
        | AccessFlags::UNIFORM_READ
        | AccessFlags::INPUT_ATTACHMENT_READ
        | AccessFlags::SHADER_READ
        | AccessFlags::MEMORY_READ)
    {
        mask |= AccessMask::UCHE_READ;
    }
    if any(AccessFlags::SHADER_WRITE
        | AccessFlags::TRANSFORM_FEEDBACK_WRITE
        | AccessFlags::MEMORY_WRITE)
    {
        mask |= AccessMask::UCHE_WRITE;
    }

    // Attachment traffic goes through the CCU, which is set up for the attachment the whole
    // time; other users of the same memory are not coherent with it.
    if any(AccessFlags::COLOR_ATTACHMENT_READ
        | AccessFlags::COLOR_ATTACHMENT_READ_NONCOHERENT
        | AccessFlags::MEMORY_READ)
    {
        mask |= if gmem {
            AccessMask::SYSMEM_READ
        } else {
            AccessMask::CCU_COLOR_INCOHERENT_READ
        };
    }
    if any(AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | AccessFlags::MEMORY_READ) {
        mask |= if gmem {
            AccessMask::SYSMEM_READ
        } else {
            AccessMask::CCU_DEPTH_INCOHERENT_READ
        };
    }
    if any(AccessFlags::COLOR_ATTACHMENT_WRITE | AccessFlags::MEMORY_WRITE) {
        mask |= if gmem {
            AccessMask::SYSMEM_WRITE
        } else {
            AccessMask::CCU_COLOR_INCOHERENT_WRITE
        };
    }
    if any(AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE | AccessFlags::MEMORY_WRITE) {
        mask |= if gmem {
            AccessMask::SYSMEM_WRITE
        } else {
            AccessMask::CCU_DEPTH_INCOHERENT_WRITE
        };
    }

    // Blits write through the CCU color path unless it is in GMEM mode.
    if any(AccessFlags::TRANSFER_WRITE | AccessFlags::MEMORY_WRITE) {
        mask |= if gmem {
            AccessMask::SYSMEM_WRITE
        } else {
            AccessMask::CCU_COLOR_WRITE
        };
    }
    if any(AccessFlags::TRANSFER_READ | AccessFlags::MEMORY_READ) {
        mask |= AccessMask::UCHE_READ;
    }

    mask
}

fn single_stage(stage: PipelineStages, dst: bool) -> Stage {
    if stage == PipelineStages::TOP_OF_PIPE
        || stage == PipelineStages::DRAW_INDIRECT
        || stage == PipelineStages::CONDITIONAL_RENDERING
    {
        Stage::Cp
    } else if stage == PipelineStages::VERTEX_INPUT {
        Stage::Fe
    } else if stage == PipelineStages::VERTEX_SHADER
        || stage == PipelineStages::TESSELLATION_CONTROL_SHADER
        || stage == PipelineStages::TESSELLATION_EVALUATION_SHADER
        || stage == PipelineStages::GEOMETRY_SHADER
    {
        Stage::SpVs
    } else if stage == PipelineStages::FRAGMENT_SHADER || stage == PipelineStages::COMPUTE_SHADER {
        Stage::SpPs
    } else if stage == PipelineStages::TRANSFER {
        // Blits read in the shader stage and write at the back end.
        if dst {
            Stage::SpPs
        } else {
            Stage::Ps
        }
    } else if stage == PipelineStages::ALL_GRAPHICS || stage == PipelineStages::ALL_COMMANDS {
        if dst {
            Stage::Cp
        } else {
            Stage::Ps
        }
    } else if stage == PipelineStages::HOST {
        // Host work happens outside the pipeline: nothing to wait for before, nothing
        // further along the pipeline to wait for after.
        if dst {
            Stage::Ps
        } else {
            Stage::Cp
        }
    } else {
        // Transform feedback, fragment tests, color output, bottom of pipe.
        Stage::Ps
    }
}

/// Latest stage among `stages` that produces data.
pub fn src_stage(stages: PipelineStages) -> Stage {
    stages
        .iter()
        .map(|s| single_stage(s, false))
        .fold(Stage::Cp, Stage::max)
}

/// Earliest stage among `stages` that consumes data.
pub fn dst_stage(stages: PipelineStages) -> Stage {
    stages
        .iter()
        .map(|s| single_stage(s, true))
        .fold(Stage::Ps, Stage::min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tbdr_cs::{packets, CommandStream, StreamId};

    fn events(flushes: FlushBits, debug: DebugFlags, has_ccu_flush_bug: bool) -> Vec<String> {
        let mut cs = CommandStream::new(StreamId(0), 256);
        cs.begin();
        let ctx = FlushContext {
            debug,
            has_ccu_flush_bug,
            seqno_iova: 0x1000,
        };
        emit_flushes(&mut cs, &ctx, flushes);
        cs.end();
        packets(&cs.words())
            .unwrap()
            .iter()
            .map(|p| match p.opcode() {
                Some(Opcode::EventWrite) => {
                    format!("{:?}", VgtEvent::from_u32(p.payload[0]).unwrap())
                }
                Some(op) => format!("{op:?}"),
                None => "reg".to_string(),
            })
            .collect()
    }

    #[test]
    fn coherent_write_then_read_moves_only_that_domain() {
        let mut cache = CacheState::default();
        cache.record_access(AccessMask::UCHE_WRITE, AccessMask::empty());
        assert!(cache.flush_bits.is_empty());
        assert!(cache.pending_flush_bits.contains(FlushBits::CACHE_FLUSH));

        let pending_before = cache.pending_flush_bits;
        cache.record_access(AccessMask::empty(), AccessMask::UCHE_READ);

        let moved = FlushBits::CACHE_FLUSH | FlushBits::CACHE_INVALIDATE;
        assert_eq!(cache.flush_bits, moved);
        assert_eq!(cache.pending_flush_bits, pending_before - moved);
        assert!(cache
            .pending_flush_bits
            .contains(FlushBits::CCU_INVALIDATE_COLOR | FlushBits::CCU_INVALIDATE_DEPTH));
    }

    #[test]
    fn incoherent_write_flushes_immediately() {
        let mut cache = CacheState::default();
        cache.record_access(AccessMask::CCU_COLOR_INCOHERENT_WRITE, AccessMask::empty());
        assert_eq!(cache.flush_bits, FlushBits::CCU_FLUSH_COLOR);
        assert!(!cache
            .pending_flush_bits
            .contains(FlushBits::CCU_INVALIDATE_COLOR));
        assert!(cache.pending_flush_bits.contains(FlushBits::CACHE_INVALIDATE));
    }

    #[test]
    fn incoherent_read_always_invalidates() {
        let mut cache = CacheState::default();
        cache.record_access(AccessMask::empty(), AccessMask::CCU_DEPTH_INCOHERENT_READ);
        assert_eq!(cache.flush_bits, FlushBits::CCU_INVALIDATE_DEPTH);
    }

    #[test]
    fn sysmem_consumer_only_takes_flushes() {
        let mut cache = CacheState::new();
        cache.record_access(AccessMask::UCHE_WRITE, AccessMask::SYSMEM_READ);
        assert_eq!(cache.flush_bits, FlushBits::CACHE_FLUSH);
        assert_eq!(cache.pending_flush_bits, FlushBits::ALL_INVALIDATE);
    }

    #[test]
    fn flush_bits_and_pending_stay_disjoint() {
        let mut cache = CacheState::new();
        let accesses = [
            (AccessMask::CP_WRITE, AccessMask::UCHE_READ),
            (AccessMask::CCU_COLOR_WRITE, AccessMask::CCU_DEPTH_READ),
            (AccessMask::SYSMEM_WRITE, AccessMask::SYSMEM_READ),
            (AccessMask::UCHE_WRITE, AccessMask::CCU_COLOR_INCOHERENT_WRITE),
        ];
        for (src, dst) in accesses {
            cache.record_access(src, dst);
            assert!(
                (cache.flush_bits & cache.pending_flush_bits).is_empty(),
                "{src:?} -> {dst:?}"
            );
        }
    }

    #[test]
    fn stage_dependency_waits_for_idle_when_going_backwards() {
        let mut cache = CacheState::default();
        cache.stage_dependency(Stage::SpVs, Stage::Ps);
        assert!(cache.flush_bits.is_empty());

        cache.stage_dependency(Stage::Ps, Stage::Fe);
        assert_eq!(cache.flush_bits, FlushBits::WAIT_FOR_IDLE);

        let mut cache = CacheState::default();
        cache.stage_dependency(Stage::SpPs, Stage::Cp);
        assert_eq!(cache.flush_bits, FlushBits::WAIT_FOR_IDLE);
        assert!(cache.pending_flush_bits.is_empty());
    }

    #[test]
    fn queued_cache_work_forces_a_wait() {
        let mut cache = CacheState::default();
        cache.flush_bits = FlushBits::CACHE_INVALIDATE;
        cache.stage_dependency(Stage::Cp, Stage::SpVs);
        assert!(cache.flush_bits.contains(FlushBits::WAIT_FOR_IDLE));
    }

    #[test]
    fn flush_all_pending_drains() {
        let mut cache = CacheState::new();
        cache.flush_all_pending();
        assert_eq!(cache.flush_bits, FlushBits::ALL_INVALIDATE);
        assert!(cache.pending_flush_bits.is_empty());
    }

    #[test]
    fn ccu_invalidate_is_preceded_by_flush() {
        assert_eq!(
            events(FlushBits::CCU_INVALIDATE_COLOR, DebugFlags::empty(), false),
            vec!["PcCcuFlushColorTs", "PcCcuInvalidateColor"]
        );
    }

    #[test]
    fn emission_order_is_fixed() {
        let all = FlushBits::ALL_FLUSH | FlushBits::ALL_INVALIDATE | FlushBits::WAIT_FOR_IDLE;
        assert_eq!(
            events(all, DebugFlags::empty(), false),
            vec![
                "PcCcuFlushColorTs",
                "PcCcuFlushDepthTs",
                "PcCcuInvalidateColor",
                "PcCcuInvalidateDepth",
                "CacheFlushTs",
                "CacheInvalidate",
                "WaitMemWrites",
                "WaitForIdle",
                "WaitForMe",
            ]
        );
    }

    #[test]
    fn ccu_flush_bug_adds_wait() {
        assert_eq!(
            events(FlushBits::CCU_FLUSH_DEPTH, DebugFlags::empty(), true),
            vec!["PcCcuFlushDepthTs", "WaitForIdle"]
        );
    }

    #[test]
    fn debug_switches_widen_flushes() {
        assert_eq!(
            events(FlushBits::empty(), DebugFlags::SYNCDRAW, false),
            vec!["WaitMemWrites", "WaitForIdle", "WaitForMe"]
        );
        assert_eq!(events(FlushBits::empty(), DebugFlags::FLUSHALL, false).len(), 9);
    }

    #[test]
    fn attachment_access_depends_on_ccu_mode() {
        assert_eq!(
            translate_access(AccessFlags::COLOR_ATTACHMENT_WRITE, false),
            AccessMask::CCU_COLOR_INCOHERENT_WRITE
        );
        assert_eq!(
            translate_access(AccessFlags::COLOR_ATTACHMENT_WRITE, true),
            AccessMask::SYSMEM_WRITE
        );
        assert_eq!(
            translate_access(AccessFlags::TRANSFER_WRITE, false),
            AccessMask::CCU_COLOR_WRITE
        );
        assert_eq!(
            translate_access(AccessFlags::INDIRECT_COMMAND_READ, false),
            AccessMask::SYSMEM_READ
        );
    }

    #[test]
    fn stage_translation_picks_extremes() {
        let stages = PipelineStages::VERTEX_SHADER | PipelineStages::FRAGMENT_SHADER;
        assert_eq!(src_stage(stages), Stage::SpPs);
        assert_eq!(dst_stage(stages), Stage::SpVs);
        assert_eq!(src_stage(PipelineStages::empty()), Stage::Cp);
        assert_eq!(dst_stage(PipelineStages::empty()), Stage::Ps);
        assert_eq!(dst_stage(PipelineStages::ALL_COMMANDS), Stage::Cp);
        assert_eq!(src_stage(PipelineStages::HOST), Stage::Cp);
    }
}
