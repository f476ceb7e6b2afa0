//! Dynamic state setters.
//!
//! Setters backed by their own draw-state group build a fresh sub-stream right away and, unless
//! every group is about to be re-emitted anyway, bind it in the draw stream. Setters for
//! registers shared with the pipeline only update the shadow value and mark it dirty; the draw
//! path merges and emits those.

use tbdr_cs::{Emit, Opcode, SubStream};

use crate::cmd_buffer::{emit_draw_state, CmdState, CommandBuffer, Dirty};
use crate::error::Result;
use crate::pipeline::{CompareOp, CullMode, DynamicSlot, PrimitiveTopology, StencilFaces, StencilOp};
use crate::regs::*;
use crate::tiling::Rect2D;

pub const MAX_VIEWPORTS: usize = 16;
pub const MAX_SCISSORS: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    /// May be negative to flip the viewport.
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Guardband adjustment for one axis: how far past the viewport edges primitives may extend
/// before the clipper has to cut them, in the register's log2 fixed-point units.
fn calc_guardband(offset: f32, scale: f32) -> u32 {
    const GB_MIN: f32 = -24576.0;
    const GB_MAX: f32 = 40960.0;

    let scale = scale.abs();
    if scale == 0.0 {
        return 511;
    }
    let room = (offset - GB_MIN).min(GB_MAX - offset) / scale;
    if room <= 1.0 {
        return 0;
    }
    ((room.log2() * 8.0) as u32).min(511)
}

pub(crate) fn emit_viewport(cs: &mut impl Emit, viewports: &[Viewport]) {
    let mut guardband = (511u32, 511u32);

    cs.emit_pkt4(GRAS_CL_VPORT_XOFFSET0, 6 * viewports.len() as u32);
    for vp in viewports {
        let scale = [vp.width / 2.0, vp.height / 2.0, vp.max_depth - vp.min_depth];
        let offset = [vp.x + scale[0], vp.y + scale[1], vp.min_depth];
        for (o, s) in offset.iter().zip(&scale) {
            cs.emit(o.to_bits());
            cs.emit(s.to_bits());
        }
        guardband.0 = guardband.0.min(calc_guardband(offset[0], scale[0]));
        guardband.1 = guardband.1.min(calc_guardband(offset[1], scale[1]));
    }

    cs.emit_pkt4(GRAS_SC_VIEWPORT_SCISSOR_TL0, 2 * viewports.len() as u32);
    for vp in viewports {
        let mut min_x = vp.x as i32;
        let mut max_x = (vp.x + vp.width).ceil() as i32;
        let (mut min_y, mut max_y) = if vp.height >= 0.0 {
            (vp.y as i32, (vp.y + vp.height).ceil() as i32)
        } else {
            ((vp.y + vp.height) as i32, vp.y.ceil() as i32)
        };
        // Zero-sized viewports are allowed.
        if min_y == max_y {
            max_y += 1;
        }
        if min_x == max_x {
            max_x += 1;
        }
        min_x = min_x.max(0);
        min_y = min_y.max(0);
        debug_assert!(min_x < max_x && min_y < max_y);

        cs.emit(xy(min_x as u32, min_y as u32));
        cs.emit(xy((max_x - 1) as u32, (max_y - 1) as u32));
    }

    cs.emit_pkt4(GRAS_CL_Z_CLAMP0, 2 * viewports.len() as u32);
    for vp in viewports {
        cs.emit(vp.min_depth.min(vp.max_depth).to_bits());
        cs.emit(vp.min_depth.max(vp.max_depth).to_bits());
    }

    cs.emit_write_reg(
        GRAS_CL_GUARDBAND_CLIP_ADJ,
        (guardband.0 & 0x1ff) | (guardband.1 & 0x1ff) << 10,
    );

    // The depth clamp only follows the first viewport.
    let (z_min, z_max) = viewports
        .first()
        .map_or((0.0f32, 0.0f32), |vp| {
            (vp.min_depth.min(vp.max_depth), vp.min_depth.max(vp.max_depth))
        });
    cs.emit_regs(RB_Z_CLAMP_MIN, &[z_min.to_bits(), z_max.to_bits()]);
}

pub(crate) fn emit_scissor(cs: &mut impl Emit, scissors: &[Rect2D]) {
    const SCISSOR_MAX: u32 = (1 << 15) - 1;

    cs.emit_pkt4(GRAS_SC_SCREEN_SCISSOR_TL0, 2 * scissors.len() as u32);
    for s in scissors {
        let (min, max) = if s.is_empty() {
            // An inverted rectangle rejects everything.
            ((1, 1), (0, 0))
        } else {
            (
                (s.x.min(SCISSOR_MAX), s.y.min(SCISSOR_MAX)),
                (
                    (s.x + s.width - 1).min(SCISSOR_MAX),
                    (s.y + s.height - 1).min(SCISSOR_MAX),
                ),
            )
        };
        cs.emit(xy(min.0, min.1));
        cs.emit(xy(max.0, max.1));
    }
}

fn update_stencil_mask(value: &mut u32, faces: StencilFaces, mask: u32) {
    if faces.contains(StencilFaces::FRONT) {
        *value = (*value & 0xff00) | (mask & 0xff);
    }
    if faces.contains(StencilFaces::BACK) {
        *value = (*value & 0xff) | (mask & 0xff) << 8;
    }
}

fn set_bits(reg: &mut u32, mask: u32, value: u32) {
    *reg = (*reg & !mask) | (value & mask);
}

impl CommandBuffer {
    /// Rebuild a dynamic-state slot from `emit` and bind it unless all groups get re-emitted
    /// before the next draw.
    fn set_dynamic(
        &mut self,
        slot: DynamicSlot,
        words: usize,
        emit: impl FnOnce(&mut SubStream, &CmdState),
    ) {
        let result = self.try_set_dynamic(slot, words, emit);
        self.record(result);
    }

    pub(crate) fn try_set_dynamic(
        &mut self,
        slot: DynamicSlot,
        words: usize,
        emit: impl FnOnce(&mut SubStream, &CmdState),
    ) -> Result<()> {
        let mut sub = self.sub_cs.begin_sub_stream(words)?;
        emit(&mut sub, &self.state);
        let ds = self.sub_cs.end_sub_stream(sub)?;
        self.state.dynamic[slot as usize] = ds;

        if !self.state.dirty.contains(Dirty::DRAW_STATE) {
            self.draw_cs.emit_pkt7(Opcode::SetDrawState, 3);
            emit_draw_state(&mut self.draw_cs, slot.group(), ds);
        }
        Ok(())
    }

    pub fn set_viewport(&mut self, first: u32, viewports: &[Viewport]) {
        let first = first as usize;
        assert!(first + viewports.len() <= MAX_VIEWPORTS, "viewport index out of range");
        self.state.viewports[first..first + viewports.len()].copy_from_slice(viewports);
        self.state.max_viewport = self.state.max_viewport.max((first + viewports.len()) as u32);

        let count = self.state.max_viewport as usize;
        self.set_dynamic(DynamicSlot::Viewport, 8 + 10 * count, |cs, state| {
            emit_viewport(cs, &state.viewports[..count]);
        });
    }

    pub fn set_scissor(&mut self, first: u32, scissors: &[Rect2D]) {
        let first = first as usize;
        assert!(first + scissors.len() <= MAX_SCISSORS, "scissor index out of range");
        self.state.scissors[first..first + scissors.len()].copy_from_slice(scissors);
        self.state.max_scissor = self.state.max_scissor.max((first + scissors.len()) as u32);

        let count = self.state.max_scissor as usize;
        self.set_dynamic(DynamicSlot::Scissor, 1 + 2 * count, |cs, state| {
            emit_scissor(cs, &state.scissors[..count]);
        });
    }

    pub fn set_line_width(&mut self, width: f32) {
        // Half width in 1/4 pixel units.
        let half = ((width / 2.0 * 4.0) as u32) << GRAS_SU_CNTL_LINEHALFWIDTH_SHIFT;
        set_bits(&mut self.state.gras_su_cntl, GRAS_SU_CNTL_LINEHALFWIDTH_MASK, half);
        self.state.dirty |= Dirty::GRAS_SU_CNTL;
    }

    pub fn set_depth_bias(&mut self, constant: f32, clamp: f32, slope: f32) {
        self.set_dynamic(DynamicSlot::DepthBias, 4, |cs, _| {
            cs.emit_regs(
                GRAS_SU_POLY_OFFSET_SCALE,
                &[slope.to_bits(), constant.to_bits(), clamp.to_bits()],
            );
        });
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.set_dynamic(DynamicSlot::BlendConstants, 5, |cs, _| {
            cs.emit_regs(RB_BLEND_RED_F32, &constants.map(f32::to_bits));
        });
    }

    pub fn set_depth_bounds(&mut self, min: f32, max: f32) {
        self.set_dynamic(DynamicSlot::DepthBounds, 3, |cs, _| {
            cs.emit_regs(RB_Z_BOUNDS_MIN, &[min.to_bits(), max.to_bits()]);
        });
    }

    pub fn set_stencil_compare_mask(&mut self, faces: StencilFaces, mask: u32) {
        update_stencil_mask(&mut self.state.stencil_compare_mask, faces, mask);
        self.set_dynamic(DynamicSlot::StencilCompareMask, 2, |cs, state| {
            cs.emit_write_reg(RB_STENCILMASK, state.stencil_compare_mask);
        });
    }

    pub fn set_stencil_write_mask(&mut self, faces: StencilFaces, mask: u32) {
        update_stencil_mask(&mut self.state.stencil_wrmask, faces, mask);
        self.set_dynamic(DynamicSlot::StencilWriteMask, 2, |cs, state| {
            cs.emit_write_reg(RB_STENCILWRMASK, state.stencil_wrmask);
        });
        // Stencil writes feed the LRZ decision.
        self.state.dirty |= Dirty::LRZ;
    }

    pub fn set_stencil_reference(&mut self, faces: StencilFaces, reference: u32) {
        update_stencil_mask(&mut self.state.stencil_reference, faces, reference);
        self.set_dynamic(DynamicSlot::StencilReference, 2, |cs, state| {
            cs.emit_write_reg(RB_STENCILREF, state.stencil_reference);
        });
    }

    pub fn set_cull_mode(&mut self, mode: CullMode) {
        let mut bits = 0;
        if mode.contains(CullMode::FRONT) {
            bits |= GRAS_SU_CNTL_CULL_FRONT;
        }
        if mode.contains(CullMode::BACK) {
            bits |= GRAS_SU_CNTL_CULL_BACK;
        }
        set_bits(
            &mut self.state.gras_su_cntl,
            GRAS_SU_CNTL_CULL_FRONT | GRAS_SU_CNTL_CULL_BACK,
            bits,
        );
        self.state.dirty |= Dirty::GRAS_SU_CNTL;
    }

    pub fn set_front_face_clockwise(&mut self, clockwise: bool) {
        let bits = if clockwise { GRAS_SU_CNTL_FRONT_CW } else { 0 };
        set_bits(&mut self.state.gras_su_cntl, GRAS_SU_CNTL_FRONT_CW, bits);
        self.state.dirty |= Dirty::GRAS_SU_CNTL;
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.state.topology = topology;
    }

    pub fn set_primitive_restart_enable(&mut self, enable: bool) {
        self.state.primitive_restart_enable = enable;
    }

    pub fn set_depth_test_enable(&mut self, enable: bool) {
        let bits = if enable { RB_DEPTH_CNTL_Z_TEST_ENABLE } else { 0 };
        set_bits(&mut self.state.rb_depth_cntl, RB_DEPTH_CNTL_Z_TEST_ENABLE, bits);
        self.state.dirty |= Dirty::RB_DEPTH_CNTL;
    }

    pub fn set_depth_write_enable(&mut self, enable: bool) {
        let bits = if enable { RB_DEPTH_CNTL_Z_WRITE_ENABLE } else { 0 };
        set_bits(&mut self.state.rb_depth_cntl, RB_DEPTH_CNTL_Z_WRITE_ENABLE, bits);
        self.state.dirty |= Dirty::RB_DEPTH_CNTL;
    }

    pub fn set_depth_compare_op(&mut self, op: CompareOp) {
        set_bits(
            &mut self.state.rb_depth_cntl,
            RB_DEPTH_CNTL_ZFUNC_MASK,
            (op as u32) << RB_DEPTH_CNTL_ZFUNC_SHIFT,
        );
        self.state.dirty |= Dirty::RB_DEPTH_CNTL;
    }

    pub fn set_depth_bounds_test_enable(&mut self, enable: bool) {
        let bits = if enable { RB_DEPTH_CNTL_Z_BOUNDS_ENABLE } else { 0 };
        set_bits(&mut self.state.rb_depth_cntl, RB_DEPTH_CNTL_Z_BOUNDS_ENABLE, bits);
        self.state.dirty |= Dirty::RB_DEPTH_CNTL;
    }

    pub fn set_stencil_test_enable(&mut self, enable: bool) {
        let mask = RB_STENCIL_CNTL_STENCIL_ENABLE
            | RB_STENCIL_CNTL_STENCIL_ENABLE_BF
            | RB_STENCIL_CNTL_STENCIL_READ;
        set_bits(&mut self.state.rb_stencil_cntl, mask, if enable { mask } else { 0 });
        self.state.dirty |= Dirty::RB_STENCIL_CNTL;
    }

    pub fn set_stencil_op(
        &mut self,
        faces: StencilFaces,
        fail: StencilOp,
        pass: StencilOp,
        depth_fail: StencilOp,
        compare: CompareOp,
    ) {
        let pack = |func_shift: u32, fail_shift: u32, zpass_shift: u32, zfail_shift: u32| {
            let mask = 0x7 << func_shift | 0x7 << fail_shift | 0x7 << zpass_shift | 0x7 << zfail_shift;
            let value = (compare as u32) << func_shift
                | (fail as u32) << fail_shift
                | (pass as u32) << zpass_shift
                | (depth_fail as u32) << zfail_shift;
            (mask, value)
        };

        if faces.contains(StencilFaces::FRONT) {
            let (mask, value) = pack(
                RB_STENCIL_CNTL_FUNC_SHIFT,
                RB_STENCIL_CNTL_FAIL_SHIFT,
                RB_STENCIL_CNTL_ZPASS_SHIFT,
                RB_STENCIL_CNTL_ZFAIL_SHIFT,
            );
            set_bits(&mut self.state.rb_stencil_cntl, mask, value);
        }
        if faces.contains(StencilFaces::BACK) {
            let (mask, value) = pack(
                RB_STENCIL_CNTL_FUNC_BF_SHIFT,
                RB_STENCIL_CNTL_FAIL_BF_SHIFT,
                RB_STENCIL_CNTL_ZPASS_BF_SHIFT,
                RB_STENCIL_CNTL_ZFAIL_BF_SHIFT,
            );
            set_bits(&mut self.state.rb_stencil_cntl, mask, value);
        }
        self.state.dirty |= Dirty::RB_STENCIL_CNTL;
    }

    pub fn set_depth_bias_enable(&mut self, enable: bool) {
        let bits = if enable { GRAS_SU_CNTL_POLY_OFFSET } else { 0 };
        set_bits(&mut self.state.gras_su_cntl, GRAS_SU_CNTL_POLY_OFFSET, bits);
        self.state.dirty |= Dirty::GRAS_SU_CNTL;
    }

    pub fn set_rasterizer_discard_enable(&mut self, enable: bool) {
        let (raster, vpc) = if enable {
            (PC_RASTER_CNTL_DISCARD, VPC_UNKNOWN_9107_RASTER_DISCARD)
        } else {
            (0, 0)
        };
        set_bits(&mut self.state.pc_raster_cntl, PC_RASTER_CNTL_DISCARD, raster);
        set_bits(&mut self.state.vpc_unknown_9107, VPC_UNKNOWN_9107_RASTER_DISCARD, vpc);
        self.state.dirty |= Dirty::RASTERIZER_DISCARD;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cmd_buffer::{CommandBufferLevel, UsageFlags};
    use crate::device::Device;
    use pretty_assertions::assert_eq;
    use tbdr_cs::{packets, CommandStream, StreamId};

    fn recording() -> CommandBuffer {
        let mut cmd = CommandBuffer::new(Arc::new(Device::default()), CommandBufferLevel::Primary);
        cmd.begin(UsageFlags::empty(), None);
        cmd
    }

    #[test]
    fn viewport_state_has_fixed_size() {
        let mut cs = CommandStream::new(StreamId(0), 256);
        cs.begin();
        let vps = [Viewport::new(0.0, 0.0, 640.0, 480.0), Viewport::new(10.0, 480.0, 20.0, -40.0)];
        emit_viewport(&mut cs, &vps);
        cs.end();
        assert_eq!(cs.len_words(), 8 + 10 * vps.len());

        let words = cs.words();
        let decoded = packets(&words).unwrap();
        let scissor = decoded
            .iter()
            .find(|p| p.reg() == Some(GRAS_SC_VIEWPORT_SCISSOR_TL0))
            .unwrap();
        assert_eq!(scissor.payload, &[xy(0, 0), xy(639, 479), xy(10, 440), xy(29, 479)]);
    }

    #[test]
    fn empty_scissor_rejects_everything() {
        let mut cs = CommandStream::new(StreamId(0), 64);
        cs.begin();
        emit_scissor(&mut cs, &[Rect2D::new(5, 5, 0, 10), Rect2D::new(1, 2, 3, 4)]);
        cs.end();
        let words = cs.words();
        let decoded = packets(&words).unwrap();
        assert_eq!(decoded[0].payload, &[xy(1, 1), xy(0, 0), xy(1, 2), xy(3, 5)]);
    }

    #[test]
    fn dynamic_slot_is_bound_only_when_draw_states_are_live() {
        let mut cmd = recording();
        cmd.set_blend_constants([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(cmd.draw_cs.len_words(), 0);
        assert_eq!(cmd.state.dynamic[DynamicSlot::BlendConstants as usize].size, 5);

        cmd.state.dirty.remove(Dirty::DRAW_STATE);
        cmd.set_blend_constants([0.0; 4]);
        let words = cmd.draw_cs.words();
        let decoded = packets(&words).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].is(Opcode::SetDrawState));
        assert_eq!(
            decoded[0].payload[0] >> 24,
            DynamicSlot::BlendConstants.group()
        );
    }

    #[test]
    fn stencil_masks_update_per_face() {
        let mut cmd = recording();
        cmd.set_stencil_write_mask(StencilFaces::FRONT | StencilFaces::BACK, 0x0f);
        cmd.set_stencil_write_mask(StencilFaces::BACK, 0xf0);
        assert_eq!(cmd.state.stencil_wrmask, 0xf00f);
        assert!(cmd.state.dirty.contains(Dirty::LRZ));
    }

    #[test]
    fn register_setters_only_touch_their_fields() {
        let mut cmd = recording();
        cmd.set_cull_mode(CullMode::BACK);
        cmd.set_line_width(2.0);
        cmd.set_front_face_clockwise(true);
        cmd.set_cull_mode(CullMode::empty());
        assert_eq!(
            cmd.state.gras_su_cntl,
            GRAS_SU_CNTL_FRONT_CW | 4 << GRAS_SU_CNTL_LINEHALFWIDTH_SHIFT
        );

        cmd.set_depth_compare_op(CompareOp::Greater);
        cmd.set_depth_test_enable(true);
        assert_eq!(
            cmd.state.rb_depth_cntl,
            RB_DEPTH_CNTL_Z_TEST_ENABLE | (CompareOp::Greater as u32) << RB_DEPTH_CNTL_ZFUNC_SHIFT
        );

        cmd.set_rasterizer_discard_enable(true);
        assert_eq!(cmd.state.pc_raster_cntl, PC_RASTER_CNTL_DISCARD);
        assert!(cmd.state.dirty.contains(Dirty::RASTERIZER_DISCARD));
    }
}
