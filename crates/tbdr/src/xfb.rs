//! Transform feedback.
//!
//! Everything here is recorded into the draw stream inside a `SYSMEM | BINNING` conditional
//! region: in a tiled render stream-out runs during the binning pass only, so the draw pass
//! must not write the buffers a second time.

use tbdr_cs::{CondExec, Emit, Opcode, VgtEvent};
use tracing::trace;

use crate::cmd_buffer::CommandBuffer;
use crate::device::{Device, GLOBAL_FLUSH_BASE};
use crate::regs::*;

/// A transform feedback target range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XfbBuffer {
    pub iova: u64,
    pub size: u32,
}

fn so_buffer_reg(idx: u32, field: u32) -> u32 {
    VPC_SO_BUFFER_BASE0 + VPC_SO_BUFFER_STRIDE * idx + field
}

fn flush_base_iova(idx: u32) -> u64 {
    Device::global_iova(GLOBAL_FLUSH_BASE + 8 * u64::from(idx))
}

impl CommandBuffer {
    pub fn bind_transform_feedback_buffers(&mut self, first: u32, buffers: &[XfbBuffer]) {
        assert!(
            first as usize + buffers.len() <= MAX_SO_BUFFERS as usize,
            "transform feedback binding out of range"
        );
        let cs = &mut self.draw_cs;
        cs.begin_conditional(CondExec::SYSMEM | CondExec::BINNING);
        for (i, buffer) in buffers.iter().enumerate() {
            let idx = first + i as u32;
            // The base must be 32-byte aligned; the remainder moves into the offset.
            let offset = (buffer.iova & 0x1f) as u32;
            let iova = buffer.iova & !0x1f;

            cs.emit_pkt4(so_buffer_reg(idx, 0), 3);
            cs.emit_qw(iova);
            cs.emit(buffer.size + offset);
            self.state.streamout_offset[idx as usize] = offset;
        }
        cs.end_conditional();
    }

    /// Start writing. `counters` holds, per buffer from `first_counter`, the address of a saved
    /// byte count to resume from.
    pub fn begin_transform_feedback(&mut self, first_counter: u32, counters: &[Option<u64>]) {
        let cs = &mut self.draw_cs;
        let offsets = self.state.streamout_offset;
        cs.begin_conditional(CondExec::SYSMEM | CondExec::BINNING);

        for (idx, offset) in offsets.iter().enumerate() {
            cs.emit_write_reg(so_buffer_reg(idx as u32, VPC_SO_BUFFER_OFFSET_OFFSET), *offset);
        }

        for (i, counter) in counters.iter().enumerate() {
            let Some(counter) = counter else {
                continue;
            };
            let idx = first_counter + i as u32;
            let offset_reg = so_buffer_reg(idx, VPC_SO_BUFFER_OFFSET_OFFSET);

            cs.emit_pkt7(Opcode::MemToReg, 3);
            cs.emit(reg_cnt(offset_reg, 1) | MEM_TO_REG_UNK31);
            cs.emit_qw(*counter);

            let offset = offsets[idx as usize];
            if offset != 0 {
                cs.emit_pkt7(Opcode::RegRmw, 3);
                cs.emit(offset_reg | REG_RMW_SRC1_ADD);
                cs.emit(u32::MAX);
                cs.emit(offset);
            }
        }
        cs.end_conditional();
    }

    /// Stop writing and save each buffer's byte count to the matching entry of `counters`.
    pub fn end_transform_feedback(&mut self, first_counter: u32, counters: &[Option<u64>]) {
        let cs = &mut self.draw_cs;
        let offsets = self.state.streamout_offset;
        cs.begin_conditional(CondExec::SYSMEM | CondExec::BINNING);

        const FLUSH_EVENTS: [VgtEvent; MAX_SO_BUFFERS as usize] = [
            VgtEvent::FlushSo0,
            VgtEvent::FlushSo1,
            VgtEvent::FlushSo2,
            VgtEvent::FlushSo3,
        ];
        for (idx, event) in FLUSH_EVENTS.into_iter().enumerate() {
            let idx = idx as u32;
            cs.emit_regs(
                so_buffer_reg(idx, VPC_SO_FLUSH_BASE_OFFSET),
                &lo_hi(flush_base_iova(idx)),
            );
            cs.emit_event_write(event);
        }

        for (i, counter) in counters.iter().enumerate() {
            let Some(counter) = counter else {
                continue;
            };
            let idx = first_counter + i as u32;

            // The flushed count is in dwords; the counter buffer holds bytes.
            cs.emit_pkt7(Opcode::MemToReg, 3);
            cs.emit(reg_cnt(CP_SCRATCH_REG0, 1) | MEM_TO_REG_SHIFT_BY_2 | MEM_TO_REG_UNK31);
            cs.emit_qw(flush_base_iova(idx));

            let offset = offsets[idx as usize];
            if offset != 0 {
                cs.emit_pkt7(Opcode::RegRmw, 3);
                cs.emit(CP_SCRATCH_REG0 | REG_RMW_SRC1_ADD);
                cs.emit(u32::MAX);
                cs.emit(offset.wrapping_neg());
            }

            cs.emit_pkt7(Opcode::RegToMem, 3);
            cs.emit(reg_to_mem_0(CP_SCRATCH_REG0, 1));
            cs.emit_qw(*counter);
        }
        cs.end_conditional();

        self.state.xfb_used = true;
        trace!(first_counter, counters = counters.len(), "transform feedback ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cmd_buffer::{CommandBufferLevel, UsageFlags};
    use crate::config::DeviceConfig;
    use pretty_assertions::assert_eq;
    use tbdr_cs::{packets, COND_REG_EXEC_MODE_RENDER_MODE};

    fn recording() -> CommandBuffer {
        let device = Arc::new(Device::new(DeviceConfig::default()));
        let mut cmd = CommandBuffer::new(device, CommandBufferLevel::Primary);
        cmd.begin(UsageFlags::empty(), None);
        cmd
    }

    #[test]
    fn unaligned_base_moves_into_offset() {
        let mut cmd = recording();
        cmd.bind_transform_feedback_buffers(
            1,
            &[XfbBuffer {
                iova: 0x1000_0024,
                size: 0x100,
            }],
        );
        assert_eq!(cmd.state.streamout_offset, [0, 4, 0, 0]);

        let words = cmd.draw_cs.words();
        let decoded = packets(&words).unwrap();
        assert!(decoded[0].is(Opcode::CondRegExec));
        assert_eq!(
            decoded[0].payload[0],
            COND_REG_EXEC_MODE_RENDER_MODE | (CondExec::SYSMEM | CondExec::BINNING).bits()
        );
        let base = decoded
            .iter()
            .find(|p| p.reg() == Some(so_buffer_reg(1, 0)))
            .unwrap();
        assert_eq!(base.payload, &[0x1000_0020, 0, 0x104]);
    }

    #[test]
    fn counters_round_trip_through_the_flush_base() {
        let mut cmd = recording();
        cmd.bind_transform_feedback_buffers(
            0,
            &[XfbBuffer {
                iova: 0x2000_0008,
                size: 64,
            }],
        );
        cmd.begin_transform_feedback(0, &[Some(0x3000_0000)]);
        assert!(!cmd.state.xfb_used);
        cmd.end_transform_feedback(0, &[Some(0x3000_0000), None]);
        assert!(cmd.state.xfb_used);

        let words = cmd.draw_cs.words();
        let decoded = packets(&words).unwrap();

        let rmw: Vec<_> = decoded.iter().filter(|p| p.is(Opcode::RegRmw)).collect();
        assert_eq!(rmw.len(), 2);
        assert_eq!(rmw[0].payload[2], 8);
        assert_eq!(rmw[1].payload[2], 8u32.wrapping_neg());

        let saves: Vec<_> = decoded.iter().filter(|p| p.is(Opcode::RegToMem)).collect();
        assert_eq!(saves.len(), 1);
        assert_eq!(&saves[0].payload[1..], &[0x3000_0000, 0]);

        let flushes = decoded
            .iter()
            .filter(|p| p.is(Opcode::EventWrite))
            .count();
        assert_eq!(flushes, MAX_SO_BUFFERS as usize);
    }
}
