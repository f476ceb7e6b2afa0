//! Replaying a recorded render pass.
//!
//! When a render pass ends its draws sit in `draw_cs` and its GMEM stores in `tile_store_cs`.
//! Here they are called from the primary stream, either once for a direct render to system
//! memory or once per tile, optionally after a binning pass that records which draws touch
//! which tile.

use std::sync::Arc;

use tbdr_cs::{CommandStream, Emit, Opcode, VgtEvent};
use tracing::{debug, trace};

use crate::cache::{emit_event, FlushContext};
use crate::cmd_buffer::{CcuState, CommandBuffer, PassState, PassTarget};
use crate::config::{DebugFlags, DeviceInfo, MAX_VSC_PIPES, VSC_PAD};
use crate::device::{Device, VscSetup, GLOBAL_VSC_DRAW_OVERFLOW, GLOBAL_VSC_PRIM_OVERFLOW};
use crate::lrz::emit_lrz_disable_and_flush;
use crate::pipeline::DrawStateGroup;
use crate::regs::*;
use crate::render_pass::{emit_render_cntl, emit_sysmem_resolves};
use crate::tiling::TilingConfig;

pub(crate) fn emit_window_scissor(cs: &mut impl Emit, x1: u32, y1: u32, x2: u32, y2: u32) {
    cs.emit_regs(GRAS_SC_WINDOW_SCISSOR_TL, &[xy(x1, y1), xy(x2, y2)]);
    cs.emit_regs(GRAS_2D_RESOLVE_CNTL_1, &[xy(x1, y1), xy(x2, y2)]);
}

pub(crate) fn emit_window_offset(cs: &mut impl Emit, x: u32, y: u32) {
    cs.emit_write_reg(RB_WINDOW_OFFSET, xy(x, y));
    cs.emit_write_reg(RB_WINDOW_OFFSET2, xy(x, y));
    cs.emit_write_reg(SP_WINDOW_OFFSET, xy(x, y));
    cs.emit_write_reg(SP_TP_WINDOW_OFFSET, xy(x, y));
}

fn emit_bin_size(cs: &mut impl Emit, width: u32, height: u32, flags: u32) {
    cs.emit_write_reg(GRAS_BIN_CONTROL, bin_control(width, height, flags));
    cs.emit_write_reg(RB_BIN_CONTROL, bin_control(width, height, flags));
    cs.emit_write_reg(RB_BIN_CONTROL2, bin_control(width, height, 0));
}

fn emit_marker(cs: &mut impl Emit, mode: u32) {
    cs.emit_pkt7(Opcode::SetMarker, 1);
    cs.emit(mode);
}

fn emit_set_mode(cs: &mut impl Emit, mode: u32) {
    cs.emit_pkt7(Opcode::SetMode, 1);
    cs.emit(mode);
}

fn emit_visibility_override(cs: &mut impl Emit, enable: bool) {
    cs.emit_pkt7(Opcode::SetVisibilityOverride, 1);
    cs.emit(u32::from(enable));
}

/// Bin geometry, pipe layout and stream pitches for the binning pass.
fn emit_vsc_pipes(cs: &mut impl Emit, tiling: &TilingConfig, vsc: &VscSetup) {
    cs.emit_write_reg(VSC_BIN_SIZE, xy(tiling.tile0.width, tiling.tile0.height));
    cs.emit_write_reg(
        VSC_BIN_COUNT,
        vsc_bin_count(tiling.tile_count.width, tiling.tile_count.height),
    );
    cs.emit_regs(VSC_PIPE_CONFIG_REG0, &tiling.pipe_config);
    cs.emit_regs(
        VSC_PRIM_STRM_PITCH,
        &[vsc.prim_strm_pitch, vsc.prim_strm_pitch - VSC_PAD],
    );
    cs.emit_regs(
        VSC_DRAW_STRM_PITCH,
        &[vsc.draw_strm_pitch, vsc.draw_strm_pitch - VSC_PAD],
    );
}

/// Report pipes whose visibility streams reached the pitch.
///
/// The GPU writes the pitch that was too small into the device's global overflow words, and the
/// next command buffer to start grows it. The current frame is not recovered.
fn emit_vsc_overflow_test(cs: &mut impl Emit, pipes: u32, vsc: &VscSetup) {
    let streams = [
        (VSC_DRAW_STRM_SIZE_REG0, GLOBAL_VSC_DRAW_OVERFLOW, vsc.draw_strm_pitch),
        (VSC_PRIM_STRM_SIZE_REG0, GLOBAL_VSC_PRIM_OVERFLOW, vsc.prim_strm_pitch),
    ];
    for pipe in 0..pipes {
        for (size_reg, global, pitch) in streams {
            cs.emit_pkt7(Opcode::CondWrite5, 8);
            cs.emit(COND_FUNCTION_WRITE_GE | COND_WRITE5_WRITE_MEMORY);
            cs.emit_qw(u64::from(size_reg + pipe));
            cs.emit(pitch - VSC_PAD);
            cs.emit(u32::MAX);
            cs.emit_qw(Device::global_iova(global));
            cs.emit(pitch);
        }
    }
    cs.emit_pkt7(Opcode::WaitMemWrites, 0);
}

/// Per-render state the tile loop reads.
struct TileRender<'a> {
    info: &'a DeviceInfo,
    target: &'a PassTarget,
    binning: Option<&'a VscSetup>,
}

impl TileRender<'_> {
    fn tiling(&self) -> &TilingConfig {
        &self.target.framebuffer.tiling
    }

    fn emit_binning_pass(&self, cs: &mut CommandStream, draw_cs: &CommandStream, ctx: &FlushContext) {
        let Some(vsc) = self.binning else {
            return;
        };
        let fb = &self.target.framebuffer;
        let tiling = self.tiling();

        emit_window_scissor(cs, 0, 0, fb.width - 1, fb.height - 1);
        emit_marker(cs, RM6_BINNING);
        emit_visibility_override(cs, true);
        emit_set_mode(cs, SET_MODE_BINNING);
        cs.emit_pkt7(Opcode::WaitForMe, 0);
        cs.emit_write_reg(VFD_MODE_CNTL, VFD_MODE_CNTL_BINNING_PASS);
        emit_vsc_pipes(cs, tiling, vsc);
        cs.emit_write_reg(PC_POWER_CNTL, self.info.pc_power_cntl);
        cs.emit_write_reg(VFD_POWER_CNTL, self.info.pc_power_cntl);
        cs.emit_event_write(VgtEvent::BinningStart);
        emit_window_offset(cs, 0, 0);

        cs.emit_call(draw_cs);

        // Leaving the binning program invalidates the geometry stage constants.
        cs.emit_pkt7(Opcode::SetDrawState, 3);
        cs.emit(DRAW_STATE_DISABLE | draw_state_group(DrawStateGroup::ShaderGeomConst as u32));
        cs.emit_qw(0);
        cs.emit_event_write(VgtEvent::BinningEnd);

        // The visibility streams are written through UCHE and read by the CP uncached.
        emit_event(cs, ctx, VgtEvent::CacheFlushTs);
        cs.emit_wfi();
        cs.emit_pkt7(Opcode::WaitForMe, 0);

        emit_vsc_overflow_test(cs, tiling.used_pipe_count(), vsc);

        emit_visibility_override(cs, false);
        emit_set_mode(cs, 0);
    }

    fn emit_tile_select(&self, cs: &mut impl Emit, tx: u32, ty: u32, pipe: u32, slot: u32) {
        let tiling = self.tiling();
        emit_marker(cs, RM6_GMEM);

        let x1 = tiling.tile0.width * tx;
        let y1 = tiling.tile0.height * ty;
        let x2 = (x1 + tiling.tile0.width - 1).min(MAX_VIEWPORT_SIZE - 1);
        let y2 = (y1 + tiling.tile0.height - 1).min(MAX_VIEWPORT_SIZE - 1);
        emit_window_scissor(cs, x1, y1, x2, y2);
        emit_window_offset(cs, x1, y1);

        // Every tile is part of the one draw pass.
        cs.emit_write_reg(VPC_SO_DISABLE, 0);

        match self.binning {
            Some(vsc) => {
                cs.emit_pkt7(Opcode::WaitForMe, 0);
                emit_set_mode(cs, 0);
                cs.emit_pkt7(Opcode::SetBinData5Offset, 4);
                cs.emit(tiling.pipe_sizes[pipe as usize] | bin_data5_vsc_n(slot));
                cs.emit(pipe * vsc.draw_strm_pitch);
                cs.emit(pipe * 4);
                cs.emit(pipe * vsc.prim_strm_pitch);
                emit_visibility_override(cs, false);
                emit_set_mode(cs, 0);
            }
            None => {
                emit_visibility_override(cs, true);
                emit_set_mode(cs, 0);
            }
        }
    }
}

impl CommandBuffer {
    /// Whether the render pass being ended has to bypass GMEM.
    pub(crate) fn use_sysmem_rendering(&self) -> bool {
        let Some(PassState {
            pass,
            target: Some(target),
            ..
        }) = &self.state.pass
        else {
            return true;
        };

        let reason = if self.device.debug().contains(DebugFlags::SYSMEM) {
            Some("forced by debug option")
        } else if !pass.gmem_capable() {
            Some("render pass does not fit GMEM")
        } else if target.framebuffer.layers > 1 {
            Some("layered framebuffer")
        } else if target.render_area.is_empty() {
            Some("empty render area")
        } else if self.state.has_tess {
            Some("tessellation")
        } else if self.state.disable_gmem {
            Some("barrier outside framebuffer space")
        } else if !target.framebuffer.fits_gmem(pass) {
            Some("framebuffer tiles do not fit GMEM")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                debug!(reason, "rendering to system memory");
                true
            }
            None => false,
        }
    }

    /// Whether the tiled render runs a binning pass first.
    pub(crate) fn use_hw_binning(&self) -> bool {
        let Some(target) = self.state.pass.as_ref().and_then(|p| p.target.as_ref()) else {
            return false;
        };
        if self.vsc.is_none() {
            return false;
        }
        // Transform feedback writes must happen exactly once, in the binning pass.
        if self.state.xfb_used {
            return true;
        }
        let debug = self.device.debug();
        if debug.contains(DebugFlags::NOBIN) {
            return false;
        }
        if debug.contains(DebugFlags::FORCEBIN) {
            return true;
        }
        target.framebuffer.tiling.tile_count.area() > 2
    }

    /// Replay the render pass once, directly to system memory.
    pub(crate) fn render_sysmem(&mut self) {
        let ctx = self.flush_context();
        let Some(target) = self.state.pass.as_ref().and_then(|p| p.target.clone()) else {
            return;
        };
        let fb = &target.framebuffer;

        let cs = &mut self.cs;
        emit_window_scissor(cs, 0, 0, fb.width - 1, fb.height - 1);
        emit_window_offset(cs, 0, 0);
        emit_bin_size(cs, 0, 0, BIN_CONTROL_BUFFERS_IN_SYSMEM);
        cs.emit_event_write(VgtEvent::LrzFlush);
        emit_marker(cs, RM6_BYPASS);

        self.flush_ccu(CcuState::Sysmem);

        let cs = &mut self.cs;
        // A single pass over the geometry, so stream-out runs here.
        cs.emit_write_reg(VPC_SO_DISABLE, 0);
        emit_visibility_override(cs, true);
        emit_set_mode(cs, 0);

        cs.emit_call(&self.draw_cs);

        // Resolves of the last subpass; the tiled path does them per tile.
        if let Some(pass) = &self.state.pass {
            emit_sysmem_resolves(cs, &ctx, pass.subpass(), &target);
        }
        cs.emit_call(&self.draw_epilogue_cs);
        cs.emit_event_write(VgtEvent::LrzFlush);

        self.device.stats().inc_render_passes_sysmem();
        trace!(words = self.draw_cs.len_words(), "render pass replayed in sysmem");
    }

    /// Replay the render pass once per tile, pipe by pipe.
    pub(crate) fn render_tiles(&mut self) {
        let ctx = self.flush_context();
        let device = Arc::clone(&self.device);
        let Some(pass) = self.state.pass.clone() else {
            return;
        };
        let Some(target) = &pass.target else {
            return;
        };
        let vsc = self.vsc;
        let render = TileRender {
            info: device.info(),
            target,
            binning: vsc.as_ref().filter(|_| self.use_hw_binning()),
        };
        let tiling = render.tiling();

        self.cs.emit_event_write(VgtEvent::LrzFlush);
        self.flush_ccu(CcuState::Gmem);

        let cs = &mut self.cs;
        if render.binning.is_some() {
            // Stream-out runs during the binning pass only.
            cs.emit_write_reg(VPC_SO_DISABLE, 0);
            emit_bin_size(
                cs,
                tiling.tile0.width,
                tiling.tile0.height,
                BIN_CONTROL_BINNING_PASS | BIN_CONTROL_MAGIC,
            );
            emit_render_cntl(
                cs,
                render.info,
                &pass.pass.subpasses[0],
                &target.attachments,
                true,
            );
            render.emit_binning_pass(cs, &self.draw_cs, &ctx);

            cs.emit_write_reg(VPC_SO_DISABLE, 1);
            emit_bin_size(
                cs,
                tiling.tile0.width,
                tiling.tile0.height,
                BIN_CONTROL_FORCE_LRZ_WRITE_DIS | BIN_CONTROL_MAGIC,
            );
            cs.emit_write_reg(VFD_MODE_CNTL, 0);
            cs.emit_write_reg(PC_POWER_CNTL, render.info.pc_power_cntl);
            cs.emit_write_reg(VFD_POWER_CNTL, render.info.pc_power_cntl);
            device.stats().inc_binning_passes();
        } else {
            cs.emit_write_reg(VPC_SO_DISABLE, 0);
            emit_bin_size(cs, tiling.tile0.width, tiling.tile0.height, BIN_CONTROL_MAGIC);
        }

        let mut pipe = 0;
        for py in 0..tiling.pipe_count.height {
            for px in 0..tiling.pipe_count.width {
                let tx1 = px * tiling.pipe0.width;
                let ty1 = py * tiling.pipe0.height;
                let tx2 = (tx1 + tiling.pipe0.width).min(tiling.tile_count.width);
                let ty2 = (ty1 + tiling.pipe0.height).min(tiling.tile_count.height);

                let mut slot = 0;
                for ty in ty1..ty2 {
                    for tx in tx1..tx2 {
                        render.emit_tile_select(cs, tx, ty, pipe, slot);
                        cs.emit_call(&self.draw_cs);
                        if render.binning.is_some() {
                            emit_marker(cs, RM6_ENDVIS);
                        }
                        cs.emit_call(&self.tile_store_cs);
                        slot += 1;
                    }
                }
                pipe += 1;
            }
        }
        debug_assert!(pipe <= MAX_VSC_PIPES);

        cs.emit_call(&self.draw_epilogue_cs);
        emit_lrz_disable_and_flush(cs);
        emit_event(cs, &ctx, VgtEvent::PcCcuResolveTs);

        let tiles = tiling.tile_count.area();
        device.stats().inc_render_passes_gmem();
        device.stats().add_tiles_rendered(u64::from(tiles));
        debug!(
            tiles,
            pipes = pipe,
            binning = render.binning.is_some(),
            "render pass replayed in gmem"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_buffer::{CommandBufferLevel, UsageFlags};
    use crate::config::DeviceConfig;
    use crate::image::{Format, ImageView};
    use crate::pass::{AttachmentDescription, RenderPass, RenderPassDescription, SubpassDescription};
    use crate::tiling::{Framebuffer, Rect2D};
    use pretty_assertions::assert_eq;
    use tbdr_cs::{packets, Packet};

    fn recording(debug: DebugFlags) -> CommandBuffer {
        let device = Device::new(DeviceConfig {
            debug,
            ..DeviceConfig::default()
        });
        let mut cmd = CommandBuffer::new(Arc::new(device), CommandBufferLevel::Primary);
        cmd.begin(UsageFlags::empty(), None);
        cmd
    }

    fn color_pass(cmd: &CommandBuffer) -> Arc<RenderPass> {
        Arc::new(RenderPass::new(
            cmd.device().info(),
            &RenderPassDescription {
                attachments: vec![AttachmentDescription::new(Format::R8G8B8A8Unorm)],
                subpasses: vec![SubpassDescription {
                    color_attachments: vec![Some(0)],
                    ..Default::default()
                }],
                dependencies: Vec::new(),
            },
        ))
    }

    fn render(cmd: &mut CommandBuffer, width: u32, height: u32, layers: u32) -> usize {
        let pass = color_pass(cmd);
        let view = ImageView::new(Format::R8G8B8A8Unorm, width, height, 0x100_0000);
        let fb = Arc::new(Framebuffer::new(
            cmd.device().info(),
            cmd.device().debug(),
            &pass,
            vec![Arc::new(view)],
            width,
            height,
            layers,
        ));
        let start = cmd.cs().len_words();
        cmd.begin_render_pass(pass, fb, Rect2D::from_extent(width, height), &[]);
        cmd.end_render_pass();
        start
    }

    fn tail(cmd: &CommandBuffer, start: usize) -> Vec<u32> {
        cmd.cs().words()[start..].to_vec()
    }

    fn count(words: &[u32], pred: impl Fn(&Packet<'_>) -> bool) -> usize {
        packets(words).unwrap().iter().filter(|p| pred(p)).count()
    }

    fn markers(words: &[u32]) -> Vec<u32> {
        packets(words)
            .unwrap()
            .iter()
            .filter(|p| p.is(Opcode::SetMarker))
            .map(|p| p.payload[0])
            .collect()
    }

    #[test]
    fn small_framebuffer_renders_one_tile_without_binning() {
        let mut cmd = recording(DebugFlags::empty());
        let start = render(&mut cmd, 256, 256, 1);
        let words = tail(&cmd, start);

        assert_eq!(cmd.ccu_state(), CcuState::Gmem);
        assert_eq!(markers(&words), vec![RM6_GMEM]);
        assert_eq!(count(&words, |p| p.is(Opcode::SetBinData5Offset)), 0);
        assert_eq!(cmd.device().stats().snapshot().render_passes_gmem, 1);
        assert_eq!(cmd.device().stats().snapshot().tiles_rendered, 1);
    }

    #[test]
    fn layered_framebuffer_renders_in_sysmem() {
        let mut cmd = recording(DebugFlags::empty());
        let start = render(&mut cmd, 256, 256, 2);
        let words = tail(&cmd, start);

        assert_eq!(cmd.ccu_state(), CcuState::Sysmem);
        assert_eq!(markers(&words), vec![RM6_BYPASS]);
        assert_eq!(cmd.device().stats().snapshot().render_passes_sysmem, 1);
    }

    #[test]
    fn forced_binning_tests_every_pipe_for_overflow() {
        let mut cmd = recording(DebugFlags::FORCEBIN);
        let start = render(&mut cmd, 256, 256, 1);
        let words = tail(&cmd, start);
        let decoded = packets(&words).unwrap();

        // Forced binning splits into 2x2 tiles, one pipe each.
        let offsets: Vec<&Packet<'_>> =
            decoded.iter().filter(|p| p.is(Opcode::SetBinData5Offset)).collect();
        assert_eq!(offsets.len(), 4);
        let (draw_pitch, prim_pitch) = cmd.device().vsc_pitches();
        assert_eq!(offsets[3].payload[1], 3 * draw_pitch);
        assert_eq!(offsets[3].payload[3], 3 * prim_pitch);

        let tests: Vec<&Packet<'_>> = decoded.iter().filter(|p| p.is(Opcode::CondWrite5)).collect();
        assert_eq!(tests.len(), 8);
        assert_eq!(tests[6].payload[1], VSC_DRAW_STRM_SIZE_REG0 + 3);
        assert_eq!(tests[6].payload[3], draw_pitch - VSC_PAD);
        assert_eq!(
            u64::from(tests[6].payload[5]) | u64::from(tests[6].payload[6]) << 32,
            Device::global_iova(GLOBAL_VSC_DRAW_OVERFLOW)
        );
        assert_eq!(tests[6].payload[7], draw_pitch);

        let modes = markers(&words);
        assert_eq!(modes[0], RM6_BINNING);
        assert_eq!(modes.iter().filter(|&&m| m == RM6_ENDVIS).count(), 4);
        assert_eq!(cmd.device().stats().snapshot().binning_passes, 1);
    }

    #[test]
    fn overflow_tests_wait_for_their_writes() {
        let mut cmd = recording(DebugFlags::FORCEBIN);
        let start = render(&mut cmd, 256, 256, 1);
        let words = tail(&cmd, start);
        let decoded = packets(&words).unwrap();

        let last_test = decoded
            .iter()
            .rposition(|p| p.is(Opcode::CondWrite5))
            .unwrap();
        assert!(decoded[last_test + 1].is(Opcode::WaitMemWrites));
    }

    fn is_lrz_flush(p: &Packet<'_>) -> bool {
        p.is(Opcode::EventWrite) && p.payload[0] == VgtEvent::LrzFlush as u32
    }

    #[test]
    fn tiled_render_flushes_lrz_before_switching_ccu() {
        let mut cmd = recording(DebugFlags::empty());
        let start = render(&mut cmd, 256, 256, 1);
        let words = tail(&cmd, start);
        let decoded = packets(&words).unwrap();

        let first_flush = decoded.iter().position(|p| is_lrz_flush(p)).unwrap();
        let first_tile = decoded.iter().position(|p| p.is(Opcode::SetMarker)).unwrap();
        assert!(first_flush < first_tile);
    }

    #[test]
    fn sysmem_render_overrides_visibility() {
        let mut cmd = recording(DebugFlags::SYSMEM);
        let start = render(&mut cmd, 256, 256, 1);
        let words = tail(&cmd, start);
        let decoded = packets(&words).unwrap();

        let overrides: Vec<u32> = decoded
            .iter()
            .filter(|p| p.is(Opcode::SetVisibilityOverride))
            .map(|p| p.payload[0])
            .collect();
        assert_eq!(overrides, vec![1]);
        assert_eq!(
            decoded.iter().find_map(|p| p.reg_value(GRAS_BIN_CONTROL)),
            Some(bin_control(0, 0, BIN_CONTROL_BUFFERS_IN_SYSMEM))
        );
    }

    #[test]
    fn nobin_skips_binning_even_with_many_tiles() {
        let mut cmd = recording(DebugFlags::FORCEBIN | DebugFlags::NOBIN);
        let start = render(&mut cmd, 256, 256, 1);
        let words = tail(&cmd, start);
        assert_eq!(count(&words, |p| p.is(Opcode::CondWrite5)), 0);
        assert_eq!(markers(&words), vec![RM6_GMEM; 4]);
    }

    #[test]
    fn tile_windows_cover_the_framebuffer() {
        let mut cmd = recording(DebugFlags::FORCEBIN | DebugFlags::NOBIN);
        let start = render(&mut cmd, 200, 100, 1);
        let words = tail(&cmd, start);
        let offsets: Vec<u32> = packets(&words)
            .unwrap()
            .iter()
            .filter_map(|p| p.reg_value(RB_WINDOW_OFFSET))
            .collect();
        // Tiles are 128x64 after alignment.
        assert_eq!(offsets, vec![xy(0, 0), xy(128, 0), xy(0, 64), xy(128, 64)]);
    }
}
