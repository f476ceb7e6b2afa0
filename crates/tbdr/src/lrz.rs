//! Low-resolution depth (LRZ) tracking.
//!
//! The LRZ buffer keeps a conservative min or max depth per block of pixels and lets the
//! rasterizer reject whole blocks before shading. It only stays meaningful while every draw
//! that writes depth compares in the same direction, so the command buffer tracks:
//! - whether the buffer is valid for the current render pass (it is cleared at pass begin and
//!   invalidated for good once a draw could corrupt it),
//! - the last depth-writing compare direction,
//! - per draw, whether LRZ can be used at all ([`LrzState::enabled`]).

use tbdr_cs::{DrawState, Emit, SubStream, VgtEvent};
use tracing::{debug, trace};

use crate::cache::FlushBits;
use crate::cmd_buffer::{CcuState, CmdState, CommandBuffer, Dirty};
use crate::config::DebugFlags;
use crate::error::Result;
use crate::image::{Aspects, ClearValue, Format, LrzBuffer};
use crate::pipeline::{CompareOp, DynamicStates, GraphicsPipeline, LrzForceDisable, StencilOp};
use crate::regs::*;

/// Depth compare direction the LRZ buffer was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LrzDirection {
    Less,
    Greater,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LrzState {
    /// The buffer holds usable values for the current depth attachment.
    pub valid: bool,
    /// The last computed control state left LRZ on.
    pub enabled: bool,
    pub prev_direction: Option<LrzDirection>,
    pub buffer: Option<LrzBuffer>,
}

impl LrzState {
    fn invalidate(&mut self, reason: &'static str) {
        if self.valid {
            debug!(reason, "lrz invalidated");
        }
        self.valid = false;
    }
}

/// Stencil write mask of both faces, front in the low byte.
fn stencil_wrmask(state: &CmdState, pipeline: &GraphicsPipeline) -> u32 {
    if pipeline.dynamic.contains(DynamicStates::STENCIL_WRITE_MASK) {
        state.stencil_wrmask
    } else {
        pipeline.stencil_wrmask
    }
}

fn stencil_func(cntl: u32, shift: u32) -> CompareOp {
    CompareOp::from_bits(cntl >> shift)
}

fn stencil_op(cntl: u32, shift: u32) -> u32 {
    (cntl >> shift) & 0x7
}

/// Apply one stencil face to `cntl`. Returns true when the face writes stencil ahead of the
/// depth test, which leaves the LRZ buffer behind the real depth buffer.
fn stencil_face(cntl: &mut u32, func: CompareOp, writes: bool) -> bool {
    // Anything but Always decides coverage only after binning.
    if func != CompareOp::Always {
        *cntl &= !GRAS_LRZ_CNTL_LRZ_WRITE;
    }
    // A face that never passes never writes.
    if writes && func != CompareOp::Never {
        *cntl &= !(GRAS_LRZ_CNTL_ENABLE | GRAS_LRZ_CNTL_Z_TEST_ENABLE);
        return true;
    }
    false
}

/// GRAS_LRZ_CNTL for the next draw. Updates the validity and direction tracking.
pub(crate) fn lrz_cntl(state: &mut CmdState, pipeline: &GraphicsPipeline, debug: DebugFlags) -> u32 {
    state.lrz.enabled = false;

    if pipeline.lrz.force_disable.contains(LrzForceDisable::LRZ) {
        state.lrz.invalidate("pipeline disables lrz");
        return 0;
    }

    let Some(pass) = &state.pass else {
        return 0;
    };
    let has_depth = pass.subpass().depth_stencil_attachment.is_some();
    // Secondary buffers do not know the attachment they render to.
    let has_target = pass.target.is_some();

    let depth = state.rb_depth_cntl;
    let z_test = depth & RB_DEPTH_CNTL_Z_TEST_ENABLE != 0;
    if !has_depth || !has_target || !z_test || debug.contains(DebugFlags::NOLRZ) {
        return 0;
    }

    let z_write = depth & RB_DEPTH_CNTL_Z_WRITE_ENABLE != 0;
    let mut cntl = GRAS_LRZ_CNTL_ENABLE;
    if z_write && !pipeline.lrz.force_disable.contains(LrzForceDisable::WRITE) {
        cntl |= GRAS_LRZ_CNTL_LRZ_WRITE;
    }
    if depth & RB_DEPTH_CNTL_Z_READ_ENABLE != 0 {
        cntl |= GRAS_LRZ_CNTL_Z_TEST_ENABLE;
    }
    if depth & RB_DEPTH_CNTL_Z_BOUNDS_ENABLE != 0 {
        cntl |= GRAS_LRZ_CNTL_Z_BOUNDS_ENABLE;
    }

    let mut invalidate = None;

    let direction = match CompareOp::from_bits(depth >> RB_DEPTH_CNTL_ZFUNC_SHIFT) {
        // Either direction may pass, so the stored bound no longer holds.
        CompareOp::Always | CompareOp::NotEqual => {
            invalidate = Some("depth compare has no direction");
            cntl &= !GRAS_LRZ_CNTL_LRZ_WRITE;
            None
        }
        CompareOp::Equal | CompareOp::Never => {
            cntl &= !GRAS_LRZ_CNTL_LRZ_WRITE;
            None
        }
        CompareOp::Greater | CompareOp::GreaterOrEqual => {
            cntl |= GRAS_LRZ_CNTL_GREATER;
            Some(LrzDirection::Greater)
        }
        CompareOp::Less | CompareOp::LessOrEqual => Some(LrzDirection::Less),
    };

    // The stored values cannot be read back in the other direction. Directionless draws in
    // between keep the last known one.
    if let Some(direction) = direction {
        if state.lrz.prev_direction.is_some_and(|prev| prev != direction) {
            invalidate = Some("depth compare direction changed");
        }
        state.lrz.prev_direction = Some(direction);
    }

    let stencil = state.rb_stencil_cntl;
    if stencil & RB_STENCIL_CNTL_STENCIL_ENABLE != 0 {
        let wrmask = stencil_wrmask(state, pipeline);
        let front = stencil_face(
            &mut cntl,
            stencil_func(stencil, RB_STENCIL_CNTL_FUNC_SHIFT),
            wrmask & 0xff != 0,
        );
        let back = stencil_face(
            &mut cntl,
            stencil_func(stencil, RB_STENCIL_CNTL_FUNC_BF_SHIFT),
            (wrmask >> 8) & 0xff != 0,
        );
        if front || back {
            invalidate = Some("stencil writes before the depth test");
        }
    }

    if let Some(reason) = invalidate {
        state.lrz.invalidate(reason);
    }

    state.lrz.enabled = state.lrz.valid && cntl & GRAS_LRZ_CNTL_ENABLE != 0;
    if !state.lrz.enabled {
        return 0;
    }
    cntl
}

fn writes_depth(state: &CmdState) -> bool {
    let depth = state.rb_depth_cntl;
    depth & RB_DEPTH_CNTL_Z_TEST_ENABLE != 0
        && depth & RB_DEPTH_CNTL_Z_WRITE_ENABLE != 0
        && CompareOp::from_bits(depth >> RB_DEPTH_CNTL_ZFUNC_SHIFT) != CompareOp::Never
}

/// Any stencil op other than KEEP on a face with a non-zero write mask writes stencil.
fn writes_stencil(state: &CmdState, pipeline: &GraphicsPipeline) -> bool {
    let cntl = state.rb_stencil_cntl;
    if cntl & RB_STENCIL_CNTL_STENCIL_ENABLE == 0 {
        return false;
    }
    let keep = StencilOp::Keep as u32;
    let face_writes = |shifts: [u32; 3]| shifts.iter().any(|&s| stencil_op(cntl, s) != keep);

    let wrmask = stencil_wrmask(state, pipeline);
    let front = wrmask & 0xff != 0
        && face_writes([
            RB_STENCIL_CNTL_FAIL_SHIFT,
            RB_STENCIL_CNTL_ZPASS_SHIFT,
            RB_STENCIL_CNTL_ZFAIL_SHIFT,
        ]);
    let back = (wrmask >> 8) & 0xff != 0
        && face_writes([
            RB_STENCIL_CNTL_FAIL_BF_SHIFT,
            RB_STENCIL_CNTL_ZPASS_BF_SHIFT,
            RB_STENCIL_CNTL_ZFAIL_BF_SHIFT,
        ]);
    front || back
}

/// Where the depth test runs relative to the fragment shader.
pub(crate) fn z_mode(state: &CmdState, pipeline: &GraphicsPipeline) -> u32 {
    let lrz = &pipeline.lrz;
    let depth_test = state.rb_depth_cntl & RB_DEPTH_CNTL_Z_TEST_ENABLE != 0;

    // The fragment shader reads the depth attachment it is rendering to.
    let feedback_loop_ds = state
        .pass
        .as_ref()
        .is_some_and(|pass| pass.subpass().feedback_loop_ds);

    let mut mode = Z_MODE_EARLY;
    // A killed fragment must not have written depth or stencil already.
    if (lrz.fs_has_kill || feedback_loop_ds)
        && (writes_depth(state) || writes_stencil(state, pipeline))
    {
        mode = if state.lrz.valid {
            Z_MODE_EARLY_LRZ_LATE
        } else {
            Z_MODE_LATE
        };
    }
    if lrz.force_late_z || !depth_test {
        mode = Z_MODE_LATE;
    }
    if lrz.early_fragment_tests {
        mode = Z_MODE_EARLY;
    }
    mode
}

/// Program the LRZ buffer of the bound depth attachment, or none.
pub(crate) fn emit_lrz_buffer(cs: &mut impl Emit, buffer: Option<&LrzBuffer>) {
    let words = match buffer {
        Some(lrz) => {
            let [lo, hi] = lo_hi(lrz.iova);
            [lo, hi, lrz_buffer_pitch(lrz.pitch), 0, 0]
        }
        None => [0; 5],
    };
    cs.emit_regs(GRAS_LRZ_BUFFER_BASE, &words);
}

impl CommandBuffer {
    /// Rebuild the LRZ and depth-plane draw states from the current depth/stencil state.
    pub(crate) fn build_lrz_states(&mut self, pipeline: &GraphicsPipeline) -> Result<()> {
        let debug = self.device.debug();
        let cntl = lrz_cntl(&mut self.state, pipeline, debug);
        let rb = if cntl & GRAS_LRZ_CNTL_ENABLE != 0 {
            RB_LRZ_CNTL_ENABLE
        } else {
            0
        };

        let mut sub = self.sub_cs.begin_sub_stream(4)?;
        sub.emit_write_reg(GRAS_LRZ_CNTL, cntl);
        sub.emit_write_reg(RB_LRZ_CNTL, rb);
        self.state.lrz_state = self.sub_cs.end_sub_stream(sub)?;

        let mode = z_mode(&self.state, pipeline);
        self.state.depth_plane_state = self.depth_plane_state(mode)?;
        trace!(cntl, z_mode = mode, valid = self.state.lrz.valid, "lrz state built");
        Ok(())
    }

    fn depth_plane_state(&mut self, mode: u32) -> Result<DrawState> {
        let mut sub: SubStream = self.sub_cs.begin_sub_stream(4)?;
        sub.emit_write_reg(GRAS_SU_DEPTH_PLANE_CNTL, mode);
        sub.emit_write_reg(RB_DEPTH_PLANE_CNTL, mode);
        Ok(self.sub_cs.end_sub_stream(sub)?)
    }

    /// Decide whether the first subpass's depth attachment starts with a usable LRZ buffer,
    /// clearing it when so.
    pub(crate) fn lrz_begin_pass(&mut self, clear_values: &[ClearValue]) {
        let Some(pass) = &self.state.pass else {
            return;
        };
        let Some(a) = pass.subpass().depth_stencil_attachment else {
            self.state.lrz = LrzState::default();
            return;
        };
        let clear_mask = pass.pass.attachments[a as usize].clear_mask;
        let buffer = pass
            .target
            .as_ref()
            .and_then(|target| target.attachments[a as usize].lrz);

        self.state.dirty |= Dirty::LRZ;
        let Some(buffer) = buffer else {
            self.state.lrz = LrzState::default();
            return;
        };
        // A stencil-only clear leaves the depth values unknown.
        if !clear_mask.intersects(Aspects::COLOR | Aspects::DEPTH) {
            self.state.lrz = LrzState {
                buffer: Some(buffer),
                ..LrzState::default()
            };
            return;
        }

        self.state.lrz = LrzState {
            valid: true,
            enabled: false,
            prev_direction: None,
            buffer: Some(buffer),
        };
        let value = clear_values.get(a as usize).copied().unwrap_or_default();
        self.clear_lrz(&buffer, value);

        // Cleared through CCU color at the back end, read through UCHE by GRAS.
        self.state.cache.flush_bits |=
            FlushBits::CCU_FLUSH_COLOR | FlushBits::CACHE_INVALIDATE | FlushBits::WAIT_FOR_IDLE;
        debug!(iova = buffer.iova, "lrz cleared for render pass");
    }

    fn clear_lrz(&mut self, buffer: &LrzBuffer, value: ClearValue) {
        self.flush_ccu(CcuState::Sysmem);
        let depth = match value {
            ClearValue::DepthStencil { depth, .. } => depth,
            ClearValue::Color(words) => f32::from_bits(words[0]),
        };
        let cs = &mut self.cs;
        crate::blit::emit_solid_clear_2d(
            cs,
            Format::D16Unorm,
            Aspects::DEPTH,
            [depth.to_bits(), 0, 0, 0],
            buffer.iova,
            buffer.pitch * 2,
            buffer.pitch,
            buffer.height,
        );
    }

    /// Forget the LRZ contents; the depth attachment or its contents changed.
    pub(crate) fn lrz_invalidate(&mut self, reason: &'static str) {
        self.state.lrz.invalidate(reason);
        self.state.dirty |= Dirty::LRZ;
    }
}

/// End of a tiled render: stop LRZ and flush what it cached.
pub(crate) fn emit_lrz_disable_and_flush(cs: &mut impl Emit) {
    cs.emit_write_reg(GRAS_LRZ_CNTL, 0);
    cs.emit_event_write(VgtEvent::LrzFlush);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cmd_buffer::{PassState, PassTarget};
    use crate::config::DeviceInfo;
    use crate::image::ImageView;
    use crate::pass::{AttachmentDescription, RenderPass, RenderPassDescription, SubpassDescription};
    use crate::tiling::{Framebuffer, Rect2D};
    use pretty_assertions::assert_eq;

    const LRZ: LrzBuffer = LrzBuffer {
        iova: 0x20_0000,
        pitch: 16,
        width: 16,
        height: 8,
    };

    fn depth_pass_state() -> CmdState {
        let info = DeviceInfo::default();
        let desc = RenderPassDescription {
            attachments: vec![AttachmentDescription::new(Format::D32Sfloat)],
            subpasses: vec![SubpassDescription {
                depth_stencil_attachment: Some(0),
                ..Default::default()
            }],
            dependencies: Vec::new(),
        };
        let pass = Arc::new(RenderPass::new(&info, &desc));
        let view = Arc::new(ImageView::new(Format::D32Sfloat, 128, 64, 0x10_0000).with_lrz(LRZ));
        let fb = Arc::new(Framebuffer::new(
            &info,
            DebugFlags::empty(),
            &pass,
            vec![Arc::clone(&view)],
            128,
            64,
            1,
        ));

        let mut state = CmdState::new();
        state.pass = Some(PassState {
            pass,
            subpass: 0,
            target: Some(PassTarget {
                framebuffer: fb,
                attachments: vec![view],
                render_area: Rect2D::from_extent(128, 64),
            }),
        });
        state.lrz = LrzState {
            valid: true,
            buffer: Some(LRZ),
            ..LrzState::default()
        };
        state
    }

    fn depth_cntl(op: CompareOp, write: bool) -> u32 {
        let mut cntl = RB_DEPTH_CNTL_Z_TEST_ENABLE
            | RB_DEPTH_CNTL_Z_READ_ENABLE
            | (op as u32) << RB_DEPTH_CNTL_ZFUNC_SHIFT;
        if write {
            cntl |= RB_DEPTH_CNTL_Z_WRITE_ENABLE;
        }
        cntl
    }

    fn draw(state: &mut CmdState, op: CompareOp, write: bool) -> u32 {
        state.rb_depth_cntl = depth_cntl(op, write);
        lrz_cntl(state, &GraphicsPipeline::default(), DebugFlags::empty())
    }

    #[test]
    fn same_family_keeps_lrz_valid() {
        let mut state = depth_pass_state();
        let ops = [
            CompareOp::Less,
            CompareOp::LessOrEqual,
            CompareOp::Equal,
            CompareOp::Less,
            CompareOp::LessOrEqual,
        ];
        for op in ops {
            draw(&mut state, op, true);
            assert!(state.lrz.valid, "{op:?} invalidated lrz");
        }
        assert_eq!(state.lrz.prev_direction, Some(LrzDirection::Less));

        let cntl = draw(&mut state, CompareOp::Less, true);
        assert_eq!(
            cntl,
            GRAS_LRZ_CNTL_ENABLE | GRAS_LRZ_CNTL_LRZ_WRITE | GRAS_LRZ_CNTL_Z_TEST_ENABLE
        );
    }

    #[test]
    fn direction_switch_invalidates() {
        let mut state = depth_pass_state();
        let cntl = draw(&mut state, CompareOp::GreaterOrEqual, true);
        assert_ne!(cntl & GRAS_LRZ_CNTL_GREATER, 0);

        // A directionless draw in between does not reset the direction.
        draw(&mut state, CompareOp::Equal, true);
        assert!(state.lrz.valid);

        assert_eq!(draw(&mut state, CompareOp::Less, true), 0);
        assert!(!state.lrz.valid);
        // Stays off for the rest of the pass.
        assert_eq!(draw(&mut state, CompareOp::Less, true), 0);
    }

    #[test]
    fn directionless_compares_invalidate_without_depth_write() {
        for op in [CompareOp::Always, CompareOp::NotEqual] {
            let mut state = depth_pass_state();
            assert_eq!(draw(&mut state, op, false), 0);
            assert!(!state.lrz.valid, "{op:?} without depth write left lrz valid");
        }
    }

    #[test]
    fn equal_tests_but_never_writes() {
        let mut state = depth_pass_state();
        let cntl = draw(&mut state, CompareOp::Equal, true);
        assert_eq!(cntl, GRAS_LRZ_CNTL_ENABLE | GRAS_LRZ_CNTL_Z_TEST_ENABLE);
        assert!(state.lrz.valid);
    }

    fn stencil_cntl(func: CompareOp) -> u32 {
        RB_STENCIL_CNTL_STENCIL_ENABLE
            | (func as u32) << RB_STENCIL_CNTL_FUNC_SHIFT
            | (func as u32) << RB_STENCIL_CNTL_FUNC_BF_SHIFT
    }

    #[test]
    fn writing_stencil_invalidates_lrz() {
        for func in [CompareOp::Always, CompareOp::Less] {
            let mut state = depth_pass_state();
            let mut pipeline = GraphicsPipeline::default();
            pipeline.stencil_wrmask = 0xff00;
            state.rb_depth_cntl = depth_cntl(CompareOp::Less, false);
            state.rb_stencil_cntl = stencil_cntl(func);

            assert_eq!(lrz_cntl(&mut state, &pipeline, DebugFlags::empty()), 0);
            assert!(!state.lrz.valid, "stencil {func:?} with writes left lrz valid");
        }
    }

    #[test]
    fn stencil_without_writes_keeps_lrz() {
        let mut state = depth_pass_state();
        let pipeline = GraphicsPipeline::default();
        state.rb_depth_cntl = depth_cntl(CompareOp::Less, true);

        state.rb_stencil_cntl = stencil_cntl(CompareOp::Always);
        let cntl = lrz_cntl(&mut state, &pipeline, DebugFlags::empty());
        assert_ne!(cntl & GRAS_LRZ_CNTL_LRZ_WRITE, 0);

        // Coverage depends on the stencil test, so LRZ only tests.
        state.rb_stencil_cntl = stencil_cntl(CompareOp::Greater);
        let cntl = lrz_cntl(&mut state, &pipeline, DebugFlags::empty());
        assert_eq!(cntl, GRAS_LRZ_CNTL_ENABLE | GRAS_LRZ_CNTL_Z_TEST_ENABLE);
        assert!(state.lrz.valid);
    }

    #[test]
    fn no_depth_test_or_nolrz_leaves_state_alone() {
        let mut state = depth_pass_state();
        state.rb_depth_cntl = 0;
        assert_eq!(lrz_cntl(&mut state, &GraphicsPipeline::default(), DebugFlags::empty()), 0);

        state.rb_depth_cntl = depth_cntl(CompareOp::Less, true);
        assert_eq!(lrz_cntl(&mut state, &GraphicsPipeline::default(), DebugFlags::NOLRZ), 0);
        assert!(state.lrz.valid);
        assert_eq!(state.lrz.prev_direction, None);
    }

    #[test]
    fn kill_with_depth_write_goes_late() {
        let mut state = depth_pass_state();
        let mut pipeline = GraphicsPipeline::default();
        state.rb_depth_cntl = depth_cntl(CompareOp::Less, true);
        assert_eq!(z_mode(&state, &pipeline), Z_MODE_EARLY);

        pipeline.lrz.fs_has_kill = true;
        assert_eq!(z_mode(&state, &pipeline), Z_MODE_EARLY_LRZ_LATE);
        state.lrz.valid = false;
        assert_eq!(z_mode(&state, &pipeline), Z_MODE_LATE);

        pipeline.lrz.early_fragment_tests = true;
        assert_eq!(z_mode(&state, &pipeline), Z_MODE_EARLY);
    }

    #[test]
    fn reading_the_depth_attachment_goes_late() {
        let mut state = depth_pass_state();
        let pipeline = GraphicsPipeline::default();
        state.rb_depth_cntl = depth_cntl(CompareOp::Less, true);

        let pass = state.pass.as_mut().unwrap();
        let mut feedback = (*pass.pass).clone();
        feedback.subpasses[0].feedback_loop_ds = true;
        pass.pass = Arc::new(feedback);
        assert_eq!(z_mode(&state, &pipeline), Z_MODE_EARLY_LRZ_LATE);

        // Nothing written, nothing to protect.
        state.rb_depth_cntl = depth_cntl(CompareOp::Less, false);
        assert_eq!(z_mode(&state, &pipeline), Z_MODE_EARLY);
    }

    #[test]
    fn lrz_buffer_registers() {
        let mut sub = Vec::new();
        struct Sink<'a>(&'a mut Vec<u32>, usize);
        impl Emit for Sink<'_> {
            fn reserve(&mut self, _: usize) {}
            fn push_word(&mut self, word: u32) {
                self.0.push(word);
            }
            fn owed_words(&mut self) -> &mut usize {
                &mut self.1
            }
        }
        emit_lrz_buffer(&mut Sink(&mut sub, 0), Some(&LRZ));
        let decoded = tbdr_cs::packets(&sub).unwrap();
        assert_eq!(decoded[0].reg(), Some(GRAS_LRZ_BUFFER_BASE));
        assert_eq!(decoded[0].payload, &[0x20_0000, 0, 16, 0, 0]);
    }

    fn family(op: CompareOp) -> Option<LrzDirection> {
        match op {
            CompareOp::Less | CompareOp::LessOrEqual => Some(LrzDirection::Less),
            CompareOp::Greater | CompareOp::GreaterOrEqual => Some(LrzDirection::Greater),
            _ => None,
        }
    }

    proptest::proptest! {
        #![proptest_config(proptest::test_runner::Config {
            cases: 256,
            rng_algorithm: proptest::test_runner::RngAlgorithm::ChaCha,
            rng_seed: proptest::test_runner::RngSeed::Fixed(0x12_7a_e5),
            .. proptest::test_runner::Config::default()
        })]

        #[test]
        fn only_a_direction_change_invalidates(
            ops in proptest::collection::vec(
                proptest::sample::select(vec![
                    CompareOp::Never,
                    CompareOp::Less,
                    CompareOp::Equal,
                    CompareOp::LessOrEqual,
                    CompareOp::Greater,
                    CompareOp::GreaterOrEqual,
                ]),
                1..24,
            ),
        ) {
            let mut state = depth_pass_state();
            let mut first = None;
            let mut switched = false;
            for op in ops {
                draw(&mut state, op, true);
                if let Some(direction) = family(op) {
                    switched |= first.is_some_and(|first| first != direction);
                    first.get_or_insert(direction);
                }
                proptest::prop_assert_eq!(state.lrz.valid, !switched, "after {:?}", op);
            }
        }
    }
}
