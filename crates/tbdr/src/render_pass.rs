//! Render pass recording.
//!
//! Whether a render pass runs tiled through GMEM or directly in system memory is only decided
//! when it ends, so everything recorded into `draw_cs` while it is active has to work for both.
//! Mode-specific work (loads, clears, resolves) is wrapped in `CP_COND_REG_EXEC` regions keyed
//! on the render mode, and the tile driver picks which ones run.

use std::sync::Arc;

use tbdr_cs::{CondExec, DrawState, Emit, Opcode, SubStreamPool};
use tracing::{debug, trace};

use crate::barrier::subpass_barrier;
use crate::blit::{
    clear_gmem_attachment, clear_sysmem_attachment, emit_blit_scissor, emit_sysmem_resolve_barrier,
    load_gmem_attachment, resolve_sysmem, GmemStore,
};
use crate::cache::{FlushBits, FlushContext};
use crate::cmd_buffer::{
    emit_draw_state, emit_disable_draw_states, CommandBuffer, CommandBufferLevel, Dirty,
    PassState, PassTarget,
};
use crate::config::DeviceInfo;
use crate::error::{RecordError, Result};
use crate::image::{ClearValue, Format, ImageView};
use crate::lrz::emit_lrz_buffer;
use crate::pass::{PassAttachment, RenderPass, Subpass};
use crate::pipeline::DrawStateGroup;
use crate::regs::*;
use crate::tiling::{Framebuffer, Rect2D};

fn emit_zs(cs: &mut impl Emit, pass: &RenderPass, subpass: &Subpass, target: &PassTarget) {
    let Some(a) = subpass.depth_stencil_attachment else {
        cs.emit_regs(RB_DEPTH_BUFFER_INFO, &[0; 6]);
        cs.emit_write_reg(GRAS_SU_DEPTH_BUFFER_INFO, 0);
        emit_lrz_buffer(cs, None);
        cs.emit_write_reg(RB_STENCIL_INFO, 0);
        return;
    };
    let att = &pass.attachments[a as usize];
    let view = &target.attachments[a as usize];

    if att.format.has_depth() {
        let format = att.format.depth_code();
        let [pitch, layer_size, lo, hi] = ImageView::plane_words(&view.plane);
        cs.emit_regs(
            RB_DEPTH_BUFFER_INFO,
            &[format, pitch, layer_size, lo, hi, att.gmem_offset.unwrap_or(0)],
        );
        cs.emit_write_reg(GRAS_SU_DEPTH_BUFFER_INFO, format);
        cs.emit_regs(RB_DEPTH_FLAG_BUFFER_BASE, &view.flag_words());
        emit_lrz_buffer(cs, view.lrz.as_ref());
    } else {
        cs.emit_regs(RB_DEPTH_BUFFER_INFO, &[0; 6]);
        cs.emit_write_reg(GRAS_SU_DEPTH_BUFFER_INFO, 0);
        emit_lrz_buffer(cs, None);
    }

    let stencil = match att.format {
        Format::D32SfloatS8Uint => view.stencil.map(|plane| (plane, att.gmem_offset_stencil)),
        Format::S8Uint => Some((view.plane, att.gmem_offset)),
        _ => None,
    };
    match stencil {
        Some((plane, gmem_offset)) => {
            let [pitch, layer_size, lo, hi] = ImageView::plane_words(&plane);
            cs.emit_regs(
                RB_STENCIL_INFO,
                &[
                    RB_STENCIL_INFO_SEPARATE_STENCIL,
                    pitch,
                    layer_size,
                    lo,
                    hi,
                    gmem_offset.unwrap_or(0),
                ],
            );
        }
        None => cs.emit_write_reg(RB_STENCIL_INFO, 0),
    }
}

fn emit_mrt(cs: &mut impl Emit, pass: &RenderPass, subpass: &Subpass, target: &PassTarget) {
    for (i, a) in subpass.color_attachments.iter().enumerate() {
        let Some(a) = *a else { continue };
        let view = &target.attachments[a as usize];
        let gmem_offset = pass.attachments[a as usize].gmem_offset.unwrap_or(0);
        let [pitch, layer_size, lo, hi] = ImageView::plane_words(&view.plane);
        let i = i as u32;

        cs.emit_regs(
            RB_MRT_BUF_INFO0 + RB_MRT_STRIDE * i,
            &[view.mrt_buf_info(), pitch, layer_size, lo, hi, gmem_offset],
        );
        cs.emit_write_reg(SP_FS_MRT_REG0 + i, view.sp_fs_mrt_reg());
        cs.emit_regs(RB_MRT_FLAG_BUFFER_ADDR0 + 3 * i, &view.flag_words());
    }

    cs.emit_write_reg(RB_SRGB_CNTL, subpass.srgb_cntl);
    cs.emit_write_reg(SP_SRGB_CNTL, subpass.srgb_cntl);
    cs.emit_write_reg(
        GRAS_MAX_LAYER_INDEX,
        target.framebuffer.layers.saturating_sub(1),
    );

    // Reading an attachment while rendering to it only works one primitive at a time.
    let single_prim = if subpass.feedback_loop_color {
        GRAS_SC_CNTL_FLUSH_PER_OVERLAP_AND_OVERWRITE
    } else if subpass.feedback_loop_ds {
        GRAS_SC_CNTL_FLUSH_PER_OVERLAP
    } else {
        0
    };
    cs.emit_write_reg(GRAS_SC_CNTL, GRAS_SC_CNTL_CCUSINGLECACHELINESIZE_2 | single_prim);
}

fn emit_msaa(cs: &mut impl Emit, samples: u32) {
    let ras = msaa_samples(samples);
    let dest = if samples == 1 { ras | MSAA_DISABLE } else { ras };
    cs.emit_regs(SP_TP_RAS_MSAA_CNTL, &[ras, dest]);
    cs.emit_regs(GRAS_RAS_MSAA_CNTL, &[ras, dest]);
    cs.emit_regs(RB_RAS_MSAA_CNTL, &[ras, dest]);
}

/// `RB_RENDER_CNTL` for `subpass`, tracked by the CP when it can be so the binning pass can
/// override it.
pub(crate) fn emit_render_cntl(
    cs: &mut impl Emit,
    info: &DeviceInfo,
    subpass: &Subpass,
    attachments: &[Arc<ImageView>],
    binning: bool,
) {
    let mut cntl = RENDER_CNTL_CCUSINGLECACHELINESIZE_2;
    if binning {
        cntl |= RENDER_CNTL_BINNING;
    } else {
        let ubwc = |a: &Option<u32>| a.is_some_and(|a| attachments[a as usize].ubwc_enabled());
        let mrts = subpass
            .color_attachments
            .iter()
            .enumerate()
            .filter(|(_, a)| ubwc(a))
            .fold(0, |mask, (i, _)| mask | 1 << i);
        cntl |= render_cntl_flag_mrts(mrts);
        if ubwc(&subpass.depth_stencil_attachment) {
            cntl |= RENDER_CNTL_FLAG_DEPTH;
        }
    }

    if info.has_cp_reg_write {
        cs.emit_pkt7(Opcode::RegWrite, 3);
        cs.emit(TRACK_RENDER_CNTL);
        cs.emit(RB_RENDER_CNTL);
        cs.emit(cntl);
    } else {
        cs.emit_write_reg(RB_RENDER_CNTL, cntl);
    }
}

/// Point a texture descriptor at an attachment's GMEM copy.
fn patch_gmem_descriptor(
    desc: &mut [u32; TEX_CONST_DWORDS],
    info: &DeviceInfo,
    tile_width: u32,
    att: &PassAttachment,
) {
    let Some(gmem_offset) = att.gmem_offset else {
        return;
    };

    desc[0] &= !(TEX_CONST_0_SWAP_MASK | TEX_CONST_0_TILE_MODE_MASK);
    desc[0] |= TILE6_2;
    if att.format == Format::S8Uint {
        desc[0] = (desc[0] & !TEX_CONST_0_FMT_MASK) | FMT6_8_UINT << TEX_CONST_0_FMT_SHIFT;
    }
    desc[2] &= !(TEX_CONST_2_PITCHALIGN_MASK | TEX_CONST_2_PITCH_MASK);
    desc[2] |= TEX_CONST_2_TYPE_2D | (tile_width * att.cpp) << TEX_CONST_2_PITCH_SHIFT;
    desc[3] = 0;
    let [lo, _] = lo_hi(info.gmem_base + u64::from(gmem_offset));
    desc[4] = lo;
    desc[5] = TEX_CONST_5_DEPTH_1;
    desc[6..].fill(0);
}

/// Input attachment descriptors of `pass`'s current subpass, sampling GMEM or memory.
fn input_attachment_state(
    pool: &mut SubStreamPool,
    info: &DeviceInfo,
    pass: &PassState,
    target: &PassTarget,
    gmem: bool,
) -> Result<DrawState> {
    let inputs = &pass.subpass().input_attachments;
    if inputs.is_empty() {
        return Ok(DrawState::EMPTY);
    }

    let alloc = pool.alloc(inputs.len(), TEX_CONST_DWORDS)?;
    for (i, input) in inputs.iter().enumerate() {
        let desc = match input.attachment {
            Some(a) => {
                let mut desc = target.attachments[a as usize].descriptor();
                if gmem && input.patch_input_gmem {
                    patch_gmem_descriptor(
                        &mut desc,
                        info,
                        target.framebuffer.tiling.tile0.width,
                        &pass.pass.attachments[a as usize],
                    );
                }
                desc
            }
            None => [0; TEX_CONST_DWORDS],
        };
        pool.write(&alloc, i * TEX_CONST_DWORDS, &desc)?;
    }

    let count = inputs.len() as u32;
    let mut sub = pool.begin_sub_stream(9)?;
    sub.emit_pkt7(Opcode::LoadState6Frag, 3);
    sub.emit(load_state6_0(0, ST6_CONSTANTS, SS6_INDIRECT, SB6_FS_TEX, count));
    sub.emit_qw(alloc.iova);
    sub.emit_regs(SP_FS_TEX_CONST, &lo_hi(alloc.iova));
    sub.emit_write_reg(SP_FS_TEX_COUNT, count);
    Ok(pool.end_sub_stream(sub)?)
}

/// Resolves of `subpass` done directly in memory.
pub(crate) fn emit_sysmem_resolves(
    cs: &mut impl Emit,
    ctx: &FlushContext,
    subpass: &Subpass,
    target: &PassTarget,
) {
    if subpass.resolve_attachments.iter().all(Option::is_none) {
        return;
    }
    emit_sysmem_resolve_barrier(cs, ctx);
    for (i, a) in subpass.resolve_attachments.iter().enumerate() {
        let (Some(a), Some(src)) = (*a, subpass.attachment_to_resolve(i)) else {
            continue;
        };
        resolve_sysmem(
            cs,
            &target.attachments[src as usize],
            &target.attachments[a as usize],
            target.render_area,
            target.framebuffer.layers,
        );
    }
}

impl CommandBuffer {
    fn gmem_store<'a>(info: &'a DeviceInfo, target: &'a PassTarget) -> GmemStore<'a> {
        GmemStore {
            info,
            tiling: &target.framebuffer.tiling,
            fb_width: target.framebuffer.width,
            fb_height: target.framebuffer.height,
            render_area: target.render_area,
        }
    }

    /// Begin `pass` on `framebuffer`. `clear_values` is indexed by attachment.
    pub fn begin_render_pass(
        &mut self,
        pass: Arc<RenderPass>,
        framebuffer: Arc<Framebuffer>,
        render_area: Rect2D,
        clear_values: &[ClearValue],
    ) {
        assert_eq!(
            self.level(),
            CommandBufferLevel::Primary,
            "render passes begin in primary command buffers"
        );
        assert!(!self.state.in_pass(), "render pass already active");
        assert_eq!(
            framebuffer.attachments.len(),
            pass.attachment_count(),
            "framebuffer does not match the render pass"
        );

        let result = self.try_begin_render_pass(pass, framebuffer, render_area, clear_values);
        self.record(result);
    }

    fn try_begin_render_pass(
        &mut self,
        pass: Arc<RenderPass>,
        framebuffer: Arc<Framebuffer>,
        render_area: Rect2D,
        clear_values: &[ClearValue],
    ) -> Result<()> {
        // The render mode is not known yet, so attachment accesses are assumed to go through
        // the CCU.
        subpass_barrier(&mut self.state, &pass.subpasses[0].start_barrier, false);

        let mut attachments = Vec::new();
        attachments
            .try_reserve_exact(framebuffer.attachments.len())
            .map_err(|_| RecordError::OutOfHostMemory("render pass attachment table"))?;
        attachments.extend(framebuffer.attachments.iter().cloned());

        debug!(
            attachments = attachments.len(),
            subpasses = pass.subpass_count(),
            ?render_area,
            gmem_capable = pass.gmem_capable(),
            "render pass begun"
        );
        self.state.pass = Some(PassState {
            pass: Arc::clone(&pass),
            subpass: 0,
            target: Some(PassTarget {
                framebuffer,
                attachments,
                render_area,
            }),
        });

        let outer = &self.state.cache;
        self.state.renderpass_cache.pending_flush_bits = outer.pending_flush_bits;
        self.state.renderpass_cache.flush_bits = FlushBits::empty();
        if pass.subpasses[0].feedback_invalidate {
            self.state.renderpass_cache.flush_bits |= FlushBits::CACHE_INVALIDATE;
        }
        if self.state.pipeline.as_ref().is_some_and(|p| p.has_tess()) {
            self.state.has_tess = true;
        }

        self.lrz_begin_pass(clear_values);
        self.emit_load_clear(clear_values);
        self.emit_subpass_state()
    }

    /// Attachment loads and clears for both render modes.
    fn emit_load_clear(&mut self, clear_values: &[ClearValue]) {
        let ctx = self.flush_context();
        let device = Arc::clone(&self.device);
        let info = device.info();
        let Some(PassState {
            pass,
            target: Some(target),
            ..
        }) = &self.state.pass
        else {
            return;
        };
        let clear_value = |a: usize| clear_values.get(a).copied().unwrap_or_default();
        let cs = &mut self.draw_cs;

        cs.begin_conditional(CondExec::GMEM);
        emit_blit_scissor(cs, info, target.render_area, true);
        for (att, view) in pass.attachments.iter().zip(&target.attachments) {
            load_gmem_attachment(cs, att, view, false);
        }
        emit_blit_scissor(cs, info, target.render_area, false);
        for (a, att) in pass.attachments.iter().enumerate() {
            clear_gmem_attachment(cs, att, clear_value(a));
        }
        cs.end_conditional();

        cs.begin_conditional(CondExec::SYSMEM);
        for (a, (att, view)) in pass.attachments.iter().zip(&target.attachments).enumerate() {
            clear_sysmem_attachment(
                cs,
                &ctx,
                att,
                view,
                clear_value(a),
                target.render_area,
                target.framebuffer.layers,
            );
        }
        cs.end_conditional();
    }

    /// Target, MSAA and input attachment state of the current subpass.
    fn emit_subpass_state(&mut self) -> Result<()> {
        let device = Arc::clone(&self.device);
        let info = device.info();
        let Some(pass_state) = &self.state.pass else {
            return Ok(());
        };
        let Some(target) = &pass_state.target else {
            return Ok(());
        };
        let pass = &pass_state.pass;
        let subpass = pass_state.subpass();
        let cs = &mut self.draw_cs;

        emit_zs(cs, pass, subpass, target);
        emit_mrt(cs, pass, subpass, target);
        emit_msaa(cs, subpass.samples);

        // The binning pass programs its own render control.
        cs.begin_conditional(CondExec::GMEM | CondExec::SYSMEM);
        emit_render_cntl(cs, info, subpass, &target.attachments, false);
        cs.end_conditional();

        let ia_gmem = input_attachment_state(&mut self.sub_cs, info, pass_state, target, true)?;
        let ia_sysmem = input_attachment_state(&mut self.sub_cs, info, pass_state, target, false)?;
        trace!(
            subpass = pass_state.subpass,
            inputs = subpass.input_attachments.len(),
            feedback = subpass.has_feedback_loop(),
            "subpass state emitted"
        );

        self.state.ia_gmem = ia_gmem;
        self.state.ia_sysmem = ia_sysmem;
        let cs = &mut self.draw_cs;
        cs.emit_pkt7(Opcode::SetDrawState, 6);
        emit_draw_state(cs, DrawStateGroup::InputAttachmentsGmem as u32, ia_gmem);
        emit_draw_state(cs, DrawStateGroup::InputAttachmentsSysmem as u32, ia_sysmem);
        Ok(())
    }

    pub fn next_subpass(&mut self) {
        let Some(pass_state) = &self.state.pass else {
            panic!("next_subpass outside a render pass");
        };
        assert!(
            (pass_state.subpass as usize) + 1 < pass_state.pass.subpass_count(),
            "no subpass left"
        );
        let result = self.try_next_subpass();
        self.record(result);
    }

    fn try_next_subpass(&mut self) -> Result<()> {
        self.emit_subpass_resolves();

        let Some(pass_state) = &mut self.state.pass else {
            return Ok(());
        };
        pass_state.subpass += 1;
        let subpass = pass_state.subpass();
        let barrier = subpass.start_barrier;
        let feedback_invalidate = subpass.feedback_invalidate;
        trace!(subpass = pass_state.subpass, "next subpass");

        subpass_barrier(&mut self.state, &barrier, false);
        if feedback_invalidate {
            self.state.renderpass_cache.flush_bits |= FlushBits::CACHE_INVALIDATE;
        }

        self.emit_subpass_state()?;
        // The depth attachment may have changed.
        self.lrz_invalidate("subpass change");
        Ok(())
    }

    /// Resolves declared by the current subpass, as GMEM stores and as sysmem blits.
    fn emit_subpass_resolves(&mut self) {
        let ctx = self.flush_context();
        let device = Arc::clone(&self.device);
        let info = device.info();
        let Some(pass_state) = &self.state.pass else {
            return;
        };
        let Some(target) = &pass_state.target else {
            return;
        };
        let pass = &pass_state.pass;
        let subpass = pass_state.subpass();
        if subpass.resolve_attachments.iter().all(Option::is_none) {
            return;
        }
        let store = Self::gmem_store(info, target);
        let cs = &mut self.draw_cs;

        cs.begin_conditional(CondExec::GMEM);
        emit_blit_scissor(cs, info, target.render_area, true);
        for (i, a) in subpass.resolve_attachments.iter().enumerate() {
            let (Some(a), Some(src)) = (*a, subpass.attachment_to_resolve(i)) else {
                continue;
            };
            let dst = &pass.attachments[a as usize];
            let view = &target.attachments[a as usize];
            store.store(cs, &ctx, dst, view, &pass.attachments[src as usize], true);
            // Later subpasses may render to the resolve target in GMEM.
            if dst.gmem_offset.is_some() {
                load_gmem_attachment(cs, dst, view, true);
            }
        }
        cs.end_conditional();

        cs.begin_conditional(CondExec::SYSMEM);
        emit_sysmem_resolves(cs, &ctx, subpass, target);
        cs.end_conditional();
    }

    /// GMEM stores of every stored attachment, and the last subpass's resolves, run after
    /// each tile.
    fn emit_tile_store(&mut self) {
        let ctx = self.flush_context();
        let device = Arc::clone(&self.device);
        let info = device.info();
        let Some(pass_state) = &self.state.pass else {
            return;
        };
        let Some(target) = &pass_state.target else {
            return;
        };
        let pass = &pass_state.pass;
        let subpass = pass_state.subpass();
        let store = Self::gmem_store(info, target);
        let cs = &mut self.tile_store_cs;

        cs.emit_pkt7(Opcode::SetMarker, 1);
        cs.emit(RM6_RESOLVE);
        emit_blit_scissor(cs, info, target.render_area, true);

        for (att, view) in pass.attachments.iter().zip(&target.attachments) {
            if att.gmem_offset.is_some() {
                store.store(cs, &ctx, att, view, att, false);
            }
        }
        for (i, a) in subpass.resolve_attachments.iter().enumerate() {
            let (Some(a), Some(src)) = (*a, subpass.attachment_to_resolve(i)) else {
                continue;
            };
            store.store(
                cs,
                &ctx,
                &pass.attachments[a as usize],
                &target.attachments[a as usize],
                &pass.attachments[src as usize],
                true,
            );
        }
    }

    pub fn end_render_pass(&mut self) {
        let Some(pass_state) = &self.state.pass else {
            panic!("end_render_pass outside a render pass");
        };
        assert!(
            pass_state.target.is_some(),
            "render pass continuation cannot end the render pass"
        );
        assert_eq!(
            pass_state.subpass as usize + 1,
            pass_state.pass.subpass_count(),
            "render pass ended before its last subpass"
        );

        self.emit_tile_store();

        if self.use_sysmem_rendering() {
            self.render_sysmem();
        } else {
            self.render_tiles();
        }

        // Outside render passes every draw state is disabled.
        emit_disable_draw_states(&mut self.cs);
        self.state.dirty |= Dirty::DRAW_STATE;

        // The streams were called from `cs`; their chunks stay addressable until reset.
        self.draw_cs.discard_entries();
        self.tile_store_cs.discard_entries();
        self.draw_epilogue_cs.discard_entries();

        self.state.cache.pending_flush_bits |= self.state.renderpass_cache.pending_flush_bits;
        let pass = self.state.pass.take().map(|p| p.pass);
        if let Some(pass) = pass {
            subpass_barrier(&mut self.state, &pass.end_barrier, false);
        }

        self.state.has_tess = false;
        self.state.disable_gmem = false;
        self.state.ia_gmem = DrawState::EMPTY;
        self.state.ia_sysmem = DrawState::EMPTY;
        // Not valid the next time it is used.
        self.state.lrz.valid = false;
        self.state.dirty |= Dirty::LRZ;
        debug!("render pass ended");
    }
}
