//! Pipeline barriers and events.

use tbdr_cs::{Emit, Opcode, VgtEvent};
use tracing::{debug, trace};

use crate::cache::{dst_stage, src_stage, translate_access, AccessFlags, AccessMask, PipelineStages};
use crate::cmd_buffer::{CcuState, CmdState, CommandBuffer};
use crate::pass::SubpassBarrier;
use crate::regs::{COND_FUNCTION_WRITE_EQ, WAIT_REG_MEM_POLL_MEMORY};

/// Layout an image barrier transitions from, as far as cache maintenance cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageLayout {
    /// Contents are discarded; the memory may hold stale CCU lines of another resource.
    Undefined,
    #[default]
    Defined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryBarrier {
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageBarrier {
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub old_layout: ImageLayout,
}

/// A dependency between the commands before and after it.
///
/// Buffer barriers carry nothing beyond their access masks here, so they are passed as
/// memory barriers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Barrier {
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
    pub memory: Vec<MemoryBarrier>,
    pub images: Vec<ImageBarrier>,
}

impl Barrier {
    pub fn new(src_stages: PipelineStages, dst_stages: PipelineStages) -> Self {
        Self {
            src_stages,
            dst_stages,
            ..Self::default()
        }
    }

    pub fn with_memory(mut self, src_access: AccessFlags, dst_access: AccessFlags) -> Self {
        self.memory.push(MemoryBarrier {
            src_access,
            dst_access,
        });
        self
    }

    pub fn with_image(mut self, barrier: ImageBarrier) -> Self {
        self.images.push(barrier);
        self
    }
}

/// A GPU-visible event word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    pub iova: u64,
}

/// Apply a subpass boundary's barrier to `state`'s active cache.
///
/// Attachment accesses are assumed to go through the CCU unless `gmem` is known.
pub(crate) fn subpass_barrier(state: &mut CmdState, barrier: &SubpassBarrier, gmem: bool) {
    let mut src = translate_access(barrier.src_access, gmem);
    let dst = translate_access(barrier.dst_access, gmem);

    if barrier.incoherent_ccu_color {
        src |= AccessMask::CCU_COLOR_INCOHERENT_WRITE;
    }
    if barrier.incoherent_ccu_depth {
        src |= AccessMask::CCU_DEPTH_INCOHERENT_WRITE;
    }

    let cache = state.active_cache();
    cache.record_access(src, dst);
    cache.stage_dependency(src_stage(barrier.src_stages), dst_stage(barrier.dst_stages));
}

impl CommandBuffer {
    pub fn pipeline_barrier(&mut self, barrier: &Barrier) {
        self.barrier(barrier, &[]);
    }

    /// Wait for `events` to be set, then apply `barrier`.
    pub fn wait_events(&mut self, events: &[Event], barrier: &Barrier) {
        self.barrier(barrier, events);
    }

    fn barrier(&mut self, barrier: &Barrier, events: &[Event]) {
        // Inside a pass the render mode is not decided yet, so assume sysmem.
        let gmem = self.state.ccu_state == CcuState::Gmem && !self.state.in_pass();

        let mut src = AccessMask::empty();
        let mut dst = AccessMask::empty();
        for mb in &barrier.memory {
            src |= translate_access(mb.src_access, gmem);
            dst |= translate_access(mb.dst_access, gmem);
        }
        for ib in &barrier.images {
            if ib.old_layout == ImageLayout::Undefined {
                // Stale lines left by whatever used this memory before could be written back
                // over the image later.
                src |= AccessMask::CCU_COLOR_INCOHERENT_WRITE;
            }
            src |= translate_access(ib.src_access, gmem);
            dst |= translate_access(ib.dst_access, gmem);
        }

        if self.state.in_pass() {
            let outside = !PipelineStages::FRAMEBUFFER_SPACE;
            if barrier.src_stages.intersects(outside) || barrier.dst_stages.intersects(outside) {
                if !self.state.disable_gmem {
                    debug!(
                        src = ?barrier.src_stages,
                        dst = ?barrier.dst_stages,
                        "barrier outside framebuffer space, render pass falls back to sysmem"
                    );
                }
                self.state.disable_gmem = true;
            }
        }

        let cache = self.state.active_cache();
        cache.record_access(src, dst);

        let cs = if self.state.in_pass() {
            &mut self.draw_cs
        } else {
            &mut self.cs
        };
        for event in events {
            cs.emit_pkt7(Opcode::WaitRegMem, 6);
            cs.emit(COND_FUNCTION_WRITE_EQ | WAIT_REG_MEM_POLL_MEMORY);
            cs.emit_qw(event.iova);
            cs.emit(1);
            cs.emit(u32::MAX);
            cs.emit(20);
        }

        let cache = self.state.active_cache();
        cache.stage_dependency(src_stage(barrier.src_stages), dst_stage(barrier.dst_stages));
        trace!(?src, ?dst, events = events.len(), "barrier recorded");
    }

    pub fn set_event(&mut self, event: Event, stages: PipelineStages) {
        self.write_event(event, stages, 1);
    }

    pub fn reset_event(&mut self, event: Event, stages: PipelineStages) {
        self.write_event(event, stages, 0);
    }

    fn write_event(&mut self, event: Event, stages: PipelineStages, value: u32) {
        assert!(!self.state.in_pass(), "events cannot be written inside a render pass");
        self.emit_cache_flush();

        // Indirect parameters are read by the CP, so that stage is as early as the top.
        let top_of_pipe = PipelineStages::TOP_OF_PIPE | PipelineStages::DRAW_INDIRECT;
        let cs = &mut self.cs;
        if (stages & !top_of_pipe).is_empty() {
            cs.emit_pkt7(Opcode::MemWrite, 3);
            cs.emit_qw(event.iova);
            cs.emit(value);
        } else {
            // Lands once everything before it has retired.
            cs.emit_event_write_ts(VgtEvent::RbDoneTs, event.iova, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cache::FlushBits;
    use crate::cmd_buffer::{CommandBufferLevel, UsageFlags};
    use crate::device::Device;
    use pretty_assertions::assert_eq;
    use tbdr_cs::packets;

    fn recording() -> CommandBuffer {
        let mut cmd = CommandBuffer::new(Arc::new(Device::default()), CommandBufferLevel::Primary);
        cmd.begin(UsageFlags::empty(), None);
        cmd
    }

    #[test]
    fn shader_write_then_vertex_read_flushes_uche() {
        let mut cmd = recording();
        cmd.state.cache = Default::default();

        cmd.pipeline_barrier(
            &Barrier::new(PipelineStages::COMPUTE_SHADER, PipelineStages::VERTEX_INPUT)
                .with_memory(AccessFlags::SHADER_WRITE, AccessFlags::VERTEX_ATTRIBUTE_READ),
        );
        let flush = cmd.cache_state().flush_bits;
        assert!(flush.contains(FlushBits::CACHE_FLUSH | FlushBits::CACHE_INVALIDATE));
        // Compute runs after vertex fetch, so the fetch has to wait.
        assert!(flush.contains(FlushBits::WAIT_FOR_IDLE));
        assert!(!flush.intersects(FlushBits::CCU_FLUSH_COLOR | FlushBits::CCU_FLUSH_DEPTH));
    }

    #[test]
    fn undefined_layout_flushes_ccu_color() {
        let mut cmd = recording();
        cmd.state.cache = Default::default();

        cmd.pipeline_barrier(
            &Barrier::new(PipelineStages::TOP_OF_PIPE, PipelineStages::TRANSFER).with_image(
                ImageBarrier {
                    src_access: AccessFlags::empty(),
                    dst_access: AccessFlags::TRANSFER_WRITE,
                    old_layout: ImageLayout::Undefined,
                },
            ),
        );
        assert!(cmd
            .cache_state()
            .flush_bits
            .contains(FlushBits::CCU_FLUSH_COLOR));
    }

    #[test]
    fn events_choose_write_by_stage() {
        let mut cmd = recording();
        let start = cmd.cs().len_words();
        cmd.set_event(Event { iova: 0x4000 }, PipelineStages::TOP_OF_PIPE);
        cmd.reset_event(Event { iova: 0x4000 }, PipelineStages::FRAGMENT_SHADER);

        let words = cmd.cs().words();
        let decoded = packets(&words[start..]).unwrap();
        let ops: Vec<_> = decoded.iter().filter_map(|p| p.opcode()).collect();
        assert!(ops.contains(&Opcode::MemWrite));
        let ts = decoded
            .iter()
            .rev()
            .find(|p| p.is(Opcode::EventWrite))
            .unwrap();
        assert_eq!(ts.payload, &[VgtEvent::RbDoneTs as u32, 0x4000, 0, 0]);
    }

    #[test]
    fn wait_events_poll_before_barrier() {
        let mut cmd = recording();
        let start = cmd.cs().len_words();
        cmd.wait_events(
            &[Event { iova: 0x8000 }, Event { iova: 0x8100 }],
            &Barrier::new(PipelineStages::HOST, PipelineStages::VERTEX_SHADER),
        );
        let words = cmd.cs().words();
        let waits: Vec<_> = packets(&words[start..])
            .unwrap()
            .into_iter()
            .filter(|p| p.is(Opcode::WaitRegMem))
            .map(|p| p.payload[1])
            .collect();
        assert_eq!(waits, vec![0x8000, 0x8100]);
    }
}
