//! Draw and dispatch recording.
//!
//! Each draw first brings the hardware state up to date: ready flushes, the dirty register
//! state shared between pipeline and dynamic state, shader constants, tessellation buffers and
//! finally the draw-state groups. A group is only re-bound when it changed, except after
//! something disabled all of them, in which case every group is emitted again.

use std::sync::Arc;

use tbdr_cs::{DrawState, Emit, Opcode, SubStreamPool, VgtEvent};
use tracing::trace;

use crate::cache::{emit_event, FlushBits};
use crate::cmd_buffer::{emit_draw_state, CommandBuffer, Dirty, PipelineBindPoint};
use crate::config::DebugFlags;
use crate::descriptor::DescriptorState;
use crate::device::{Device, GLOBAL_CS_INDIRECT_XYZ};
use crate::error::Result;
use crate::pipeline::{
    CompareOp, ComputePipeline, DrawStateGroup, DynamicSlot, DynamicStates, GraphicsPipeline,
    PrimitiveTopology, ShaderStage, ShaderStages, StageConsts, DRAW_STATE_COUNT,
};
use crate::regs::*;

/// Vertex count assumed when sizing tessellation buffers for draws whose count is unknown.
const INDIRECT_TESS_VERTEX_COUNT: u32 = 2048;

/// Driver parameter words of a direct dispatch.
const CS_DRIVER_PARAMS: usize = 8;
const CS_DP_BASE_GROUP: u32 = 4;

/// One promoted uniform buffer range, split into what the buffer backs and what reads past
/// its end.
struct UboUpload {
    /// Byte offset in the constant file.
    offset: u32,
    src: u64,
    size: u32,
    zero_size: u32,
}

fn ubo_uploads<'a>(
    consts: &'a StageConsts,
    descriptors: &'a DescriptorState,
) -> impl Iterator<Item = UboUpload> + 'a {
    consts.ubo_ranges.iter().filter_map(move |range| {
        // The range may start inside the constant file and still run past its end.
        let size = (range.end - range.start).min((16 * consts.constlen).saturating_sub(range.offset));
        if size == 0 {
            return None;
        }
        let binding = range.binding?;
        // Null descriptors and reads past the end read as zero.
        let ubo = descriptors.ubo(binding).unwrap_or_default();
        let available = (ubo.size.div_ceil(16) * 16).saturating_sub(range.start);
        let loaded = size.min(available);
        Some(UboUpload {
            offset: range.offset,
            src: ubo.iova + u64::from(range.start),
            size: loaded,
            zero_size: size - loaded,
        })
    })
}

fn user_consts_words(consts: &StageConsts, descriptors: &DescriptorState) -> usize {
    let mut words = 0;
    if consts.push_consts.count > 0 {
        words += 4 + 4 * consts.push_consts.count as usize;
    }
    for upload in ubo_uploads(consts, descriptors) {
        if upload.zero_size > 0 {
            words += 4 + (upload.zero_size / 4) as usize;
        }
        if upload.size > 0 {
            words += 4;
        }
    }
    words
}

fn emit_user_consts(
    cs: &mut impl Emit,
    stage: ShaderStage,
    consts: &StageConsts,
    descriptors: &DescriptorState,
    push_constants: &[u32],
) {
    let opcode = stage.load_opcode();
    let block = stage.state_block();

    let push = consts.push_consts;
    if push.count > 0 {
        cs.emit_pkt7(opcode, 3 + 4 * push.count);
        cs.emit(load_state6_0(push.lo, ST6_CONSTANTS, SS6_DIRECT, block, push.count));
        cs.emit_qw(0);
        let first = 4 * push.lo as usize;
        for i in 0..4 * push.count as usize {
            cs.emit(push_constants.get(first + i).copied().unwrap_or(0));
        }
    }

    for upload in ubo_uploads(consts, descriptors) {
        if upload.zero_size > 0 {
            let zero_offset = upload.offset + upload.size;
            cs.emit_pkt7(opcode, 3 + upload.zero_size / 4);
            cs.emit(load_state6_0(
                zero_offset / 16,
                ST6_CONSTANTS,
                SS6_DIRECT,
                block,
                upload.zero_size / 16,
            ));
            cs.emit_qw(0);
            for _ in 0..upload.zero_size / 4 {
                cs.emit(0);
            }
        }
        if upload.size > 0 {
            cs.emit_pkt7(opcode, 3);
            cs.emit(load_state6_0(
                upload.offset / 16,
                ST6_CONSTANTS,
                SS6_INDIRECT,
                block,
                upload.size / 16,
            ));
            cs.emit_qw(upload.src);
        }
    }
}

/// Build one constant draw state covering `stages`.
fn build_consts(
    pool: &mut SubStreamPool,
    stages: &[(ShaderStage, &StageConsts)],
    descriptors: &DescriptorState,
    push_constants: &[u32],
) -> Result<DrawState> {
    let words: usize = stages
        .iter()
        .map(|(_, consts)| user_consts_words(consts, descriptors))
        .sum();
    if words == 0 {
        return Ok(DrawState::EMPTY);
    }

    let mut sub = pool.begin_sub_stream(words)?;
    for (stage, consts) in stages {
        emit_user_consts(&mut sub, *stage, consts, descriptors, push_constants);
    }
    Ok(pool.end_sub_stream(sub)?)
}

/// Where an indirect draw's arguments live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectArgs {
    pub iova: u64,
    pub draw_count: u32,
    /// Bytes between consecutive argument records.
    pub stride: u32,
}

/// Draw count read from memory, capped at `max_draw_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectCount {
    pub iova: u64,
    pub max_draw_count: u32,
}

impl CommandBuffer {
    fn bound_pipeline(&self) -> Arc<GraphicsPipeline> {
        assert!(self.state.in_pass(), "draw outside a render pass");
        match &self.state.pipeline {
            Some(pipeline) => Arc::clone(pipeline),
            None => panic!("draw without a bound graphics pipeline"),
        }
    }

    fn vs_params_offset(pipeline: &GraphicsPipeline) -> Option<u32> {
        let constlen = pipeline.stage_consts(ShaderStage::Vertex).constlen;
        pipeline.vs_driver_params.filter(|offset| *offset < constlen)
    }

    /// Rebuild the vertex shader's draw parameters unless they are already current.
    fn emit_vs_params(&mut self, vertex_offset: u32, first_instance: u32) {
        let values = (vertex_offset, first_instance);
        if !self.state.dirty.intersects(Dirty::DRAW_STATE | Dirty::VS_PARAMS)
            && self.state.last_vs_params == Some(values)
        {
            return;
        }
        let result = self.try_emit_vs_params(vertex_offset, first_instance);
        self.record(result);
    }

    fn try_emit_vs_params(&mut self, vertex_offset: u32, first_instance: u32) -> Result<()> {
        let pipeline = self.bound_pipeline();
        let offset = Self::vs_params_offset(&pipeline);

        let mut sub = self
            .sub_cs
            .begin_sub_stream(3 + if offset.is_some() { 8 } else { 0 })?;
        sub.emit_regs(VFD_INDEX_OFFSET, &[vertex_offset, first_instance]);
        if let Some(offset) = offset {
            sub.emit_pkt7(Opcode::LoadState6Geom, 3 + 4);
            sub.emit(load_state6_0(offset, ST6_CONSTANTS, SS6_DIRECT, SB6_VS_SHADER, 1));
            sub.emit_qw(0);
            sub.emit_array(&[0, vertex_offset, first_instance, 0]);
        }
        self.state.vs_params = self.sub_cs.end_sub_stream(sub)?;
        self.state.last_vs_params = Some((vertex_offset, first_instance));
        self.state.dirty |= Dirty::VS_PARAMS;
        Ok(())
    }

    /// Indirect draws load the parameters themselves.
    fn emit_empty_vs_params(&mut self) {
        if !self.state.vs_params.is_empty() {
            self.state.vs_params = DrawState::EMPTY;
            self.state.last_vs_params = None;
            self.state.dirty |= Dirty::VS_PARAMS;
        }
    }

    /// Indirect draws read their arguments with the CP, so a pending wait for earlier CP
    /// writes must happen now.
    fn draw_wait_for_me(&mut self) {
        let cache = &mut self.state.renderpass_cache;
        cache.flush_bits |= cache.pending_flush_bits & FlushBits::WAIT_FOR_ME;
        cache.pending_flush_bits &= !FlushBits::WAIT_FOR_ME;
    }

    fn emit_rasterizer_discard(&mut self) -> Result<()> {
        let (raster, vpc) = (self.state.pc_raster_cntl, self.state.vpc_unknown_9107);
        self.try_set_dynamic(DynamicSlot::RasterizerDiscard, 4, |cs, _| {
            cs.emit_write_reg(PC_RASTER_CNTL, raster);
            cs.emit_write_reg(VPC_UNKNOWN_9107, vpc);
        })
    }

    fn depth_cntl_value(&self, pipeline: &GraphicsPipeline) -> u32 {
        if pipeline.rb_depth_cntl_disable {
            return 0;
        }
        let mut cntl = self.state.rb_depth_cntl;
        if cntl & (RB_DEPTH_CNTL_Z_TEST_ENABLE | RB_DEPTH_CNTL_Z_BOUNDS_ENABLE) != 0 {
            cntl |= RB_DEPTH_CNTL_Z_READ_ENABLE;
        }
        // Some parts only run the bounds test with the depth test enabled.
        if self.device.info().depth_bounds_require_depth_test_quirk
            && cntl & RB_DEPTH_CNTL_Z_BOUNDS_ENABLE != 0
            && cntl & RB_DEPTH_CNTL_Z_TEST_ENABLE == 0
        {
            cntl |= RB_DEPTH_CNTL_Z_TEST_ENABLE
                | (CompareOp::Always as u32) << RB_DEPTH_CNTL_ZFUNC_SHIFT;
        }
        cntl
    }

    fn emit_tess_consts(&mut self, pipeline: &GraphicsPipeline, draw_count: u32) -> Result<u64> {
        let tess = &pipeline.tess;
        let Some(patch_type) = tess.patch_type else {
            self.state.tess = DrawState::EMPTY;
            return Ok(0);
        };

        let hs_constlen = pipeline.stage_consts(ShaderStage::TessCtrl).constlen;
        let ds_constlen = pipeline.stage_consts(ShaderStage::TessEval).constlen;
        let hs_regid = tess.hs_bo_regid.filter(|regid| *regid < hs_constlen);
        let ds_regid = tess.ds_bo_regid.filter(|regid| *regid < ds_constlen);

        let vertices = if draw_count == 0 {
            INDIRECT_TESS_VERTEX_COUNT
        } else {
            draw_count
        };
        let patches = u64::from(vertices / tess.patch_control_points.max(1));
        let factor_size = patch_type.factor_stride() * patches;
        let param_size = u64::from(tess.param_stride) * patches;

        let mut sub = self.sub_cs.begin_sub_stream(16)?;
        let mut factor_iova = 0;
        if (hs_regid.is_some() || ds_regid.is_some()) && factor_size + param_size > 0 {
            let bo = self.device.get_scratch_bo(factor_size + param_size)?;
            factor_iova = bo.iova;
            let param_iova = factor_iova + factor_size;

            for (regid, block) in [(hs_regid, SB6_HS_SHADER), (ds_regid, SB6_DS_SHADER)] {
                let Some(regid) = regid else {
                    continue;
                };
                sub.emit_pkt7(Opcode::LoadState6Geom, 3 + 4);
                sub.emit(load_state6_0(regid, ST6_CONSTANTS, SS6_DIRECT, block, 1));
                sub.emit_qw(0);
                sub.emit_qw(param_iova);
                sub.emit_qw(factor_iova);
            }
        }
        self.state.tess = self.sub_cs.end_sub_stream(sub)?;
        Ok(factor_iova)
    }

    /// Bring all draw state up to date before a draw packet.
    fn draw_common(&mut self, pipeline: &GraphicsPipeline, indexed: bool, draw_count: u32) -> Result<()> {
        self.emit_cache_flush_renderpass();

        let restart = if pipeline.dynamic.contains(DynamicStates::PRIMITIVE_RESTART_ENABLE) {
            self.state.primitive_restart_enable
        } else {
            pipeline.primitive_restart
        };
        let mut primitive_cntl = 0;
        if restart && indexed {
            primitive_cntl |= PC_PRIMITIVE_CNTL_0_RESTART;
        }
        if pipeline.provoking_vertex_last {
            primitive_cntl |= PC_PRIMITIVE_CNTL_0_PROVOKING_VTX_LAST;
        }
        if pipeline.tess.upper_left_domain_origin {
            primitive_cntl |= PC_PRIMITIVE_CNTL_0_TESS_UPPER_LEFT_DOMAIN_ORIGIN;
        }
        self.draw_cs.emit_write_reg(PC_PRIMITIVE_CNTL_0, primitive_cntl);

        let has_tess = pipeline.has_tess();
        let dirty = self.state.dirty;
        if (dirty - Dirty::COMPUTE_DESC_SETS_LOAD).is_empty() && !has_tess {
            return Ok(());
        }

        let dirty_lrz = dirty.intersects(Dirty::LRZ | Dirty::RB_DEPTH_CNTL | Dirty::RB_STENCIL_CNTL);
        if dirty_lrz {
            self.build_lrz_states(pipeline)?;
        }

        if dirty.contains(Dirty::RASTERIZER_DISCARD) {
            self.emit_rasterizer_discard()?;
        }
        if dirty.contains(Dirty::GRAS_SU_CNTL) {
            let value = self.state.gras_su_cntl;
            self.try_set_dynamic(DynamicSlot::GrasSuCntl, 2, |cs, _| {
                cs.emit_write_reg(GRAS_SU_CNTL, value);
            })?;
        }
        if dirty.contains(Dirty::RB_DEPTH_CNTL) {
            let value = self.depth_cntl_value(pipeline);
            self.try_set_dynamic(DynamicSlot::RbDepthCntl, 2, |cs, _| {
                cs.emit_write_reg(RB_DEPTH_CNTL, value);
            })?;
        }
        if dirty.contains(Dirty::RB_STENCIL_CNTL) {
            let value = self.state.rb_stencil_cntl;
            self.try_set_dynamic(DynamicSlot::RbStencilCntl, 2, |cs, _| {
                cs.emit_write_reg(RB_STENCIL_CONTROL, value);
            })?;
        }

        if dirty.contains(Dirty::SHADER_CONSTS) {
            let descriptors = &self.state.descriptors[PipelineBindPoint::Graphics as usize];
            let geometry: Vec<_> = ShaderStage::GEOMETRY
                .into_iter()
                .map(|stage| (stage, pipeline.stage_consts(stage)))
                .collect();
            let fragment = [(ShaderStage::Fragment, pipeline.stage_consts(ShaderStage::Fragment))];
            let geometry = build_consts(&mut self.sub_cs, &geometry, descriptors, &self.state.push_constants)?;
            let fragment = build_consts(&mut self.sub_cs, &fragment, descriptors, &self.state.push_constants)?;
            self.state.shader_const = [geometry, fragment];
        }

        if has_tess {
            let factor_iova = self.emit_tess_consts(pipeline, draw_count)?;
            let cs = &mut self.draw_cs;
            // PC_TESSFACTOR_ADDR is not a context register.
            cs.emit_wfi();
            cs.emit_regs(PC_TESSFACTOR_ADDR, &lo_hi(factor_iova));
            cs.emit_pkt7(Opcode::SetSubdrawSize, 1);
            cs.emit(draw_count);
        }

        let state = &self.state;
        let cs = &mut self.draw_cs;
        if dirty.contains(Dirty::DRAW_STATE) {
            // The input attachment groups belong to the render pass, which a secondary
            // continuing it never sets.
            let groups = [
                (DrawStateGroup::ProgramConfig, pipeline.program.config),
                (DrawStateGroup::Program, pipeline.program.state),
                (DrawStateGroup::ProgramBinning, pipeline.program.binning),
                (DrawStateGroup::Tess, state.tess),
                (DrawStateGroup::Vb, state.vertex_buffers),
                (DrawStateGroup::Vi, pipeline.vi),
                (DrawStateGroup::ViBinning, pipeline.vi_binning),
                (DrawStateGroup::Rast, pipeline.rast),
                (DrawStateGroup::Blend, pipeline.blend),
                (DrawStateGroup::ShaderGeomConst, state.shader_const[0]),
                (DrawStateGroup::FsConst, state.shader_const[1]),
                (DrawStateGroup::DescSets, state.desc_sets),
                (DrawStateGroup::DescSetsLoad, pipeline.load_state),
                (DrawStateGroup::VsParams, state.vs_params),
                (DrawStateGroup::Lrz, state.lrz_state),
                (DrawStateGroup::DepthPlane, state.depth_plane_state),
            ];
            cs.emit_pkt7(Opcode::SetDrawState, 3 * (DRAW_STATE_COUNT - 2));
            for (group, ds) in groups {
                emit_draw_state(cs, group as u32, ds);
            }
            for slot in DynamicSlot::ALL {
                emit_draw_state(cs, slot.group(), pipeline.slot_state(slot, &state.dynamic));
            }
        } else {
            let mut groups: Vec<(u32, DrawState)> = Vec::with_capacity(9);
            if has_tess {
                groups.push((DrawStateGroup::Tess as u32, state.tess));
            }
            if dirty.contains(Dirty::SHADER_CONSTS) {
                groups.push((DrawStateGroup::ShaderGeomConst as u32, state.shader_const[0]));
                groups.push((DrawStateGroup::FsConst as u32, state.shader_const[1]));
            }
            if dirty.contains(Dirty::DESC_SETS_LOAD) {
                groups.push((DrawStateGroup::DescSetsLoad as u32, pipeline.load_state));
            }
            if dirty.contains(Dirty::VERTEX_BUFFERS) {
                groups.push((DrawStateGroup::Vb as u32, state.vertex_buffers));
            }
            if dirty.contains(Dirty::VB_STRIDE) && pipeline.dynamic.contains(DynamicStates::VB_STRIDE) {
                groups.push((
                    DynamicSlot::VbStride.group(),
                    state.dynamic[DynamicSlot::VbStride as usize],
                ));
            }
            if dirty.contains(Dirty::VS_PARAMS) {
                groups.push((DrawStateGroup::VsParams as u32, state.vs_params));
            }
            if dirty_lrz {
                groups.push((DrawStateGroup::Lrz as u32, state.lrz_state));
                groups.push((DrawStateGroup::DepthPlane as u32, state.depth_plane_state));
            }

            if !groups.is_empty() {
                cs.emit_pkt7(Opcode::SetDrawState, 3 * groups.len() as u32);
                for (group, ds) in groups {
                    emit_draw_state(cs, group, ds);
                }
            }
        }

        // Compute descriptors are loaded by the next dispatch.
        self.state.dirty &= Dirty::COMPUTE_DESC_SETS_LOAD;
        if has_tess {
            self.state.has_tess = true;
        }
        Ok(())
    }

    fn draw_initiator(&self, pipeline: &GraphicsPipeline, source: u32) -> u32 {
        let topology = if pipeline.dynamic.contains(DynamicStates::PRIMITIVE_TOPOLOGY)
            && pipeline.topology != PrimitiveTopology::PatchList
        {
            self.state.topology
        } else {
            pipeline.topology
        };
        let mut prim_type = topology as u32;
        if topology == PrimitiveTopology::PatchList {
            prim_type += pipeline.tess.patch_control_points;
        }

        let index_size = self.state.index.ty.map_or(0, |ty| ty.size_code());
        let patch_type = pipeline.tess.patch_type.map_or(0, |ty| ty as u32);
        let mut initiator = draw_initiator(prim_type, source, index_size, patch_type);
        if pipeline.stages.contains(ShaderStages::GEOMETRY) {
            initiator |= DI_GS_ENABLE;
        }
        if pipeline.tess.patch_type.is_some() {
            initiator |= DI_TESS_ENABLE;
        }
        initiator
    }

    /// Shared prologue of every draw: state update, then the initiator for `source`.
    fn prepare_draw(&mut self, indexed: bool, draw_count: u32, source: u32) -> u32 {
        let pipeline = self.bound_pipeline();
        let result = self.draw_common(&pipeline, indexed, draw_count);
        self.record(result);
        self.device.stats().inc_draws();
        self.draw_initiator(&pipeline, source)
    }

    fn flush_after_draw(&mut self) {
        if self.device.debug().contains(DebugFlags::SYNCDRAW) {
            let ctx = self.flush_context();
            self.draw_cs.emit_wfi();
            emit_event(&mut self.draw_cs, &ctx, VgtEvent::CacheFlushTs);
        }
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.emit_vs_params(first_vertex, first_instance);
        let initiator = self.prepare_draw(false, vertex_count, DI_SRC_SEL_AUTO_INDEX);

        let cs = &mut self.draw_cs;
        cs.emit_pkt7(Opcode::DrawIndxOffset, 3);
        cs.emit(initiator);
        cs.emit(instance_count);
        cs.emit(vertex_count);
        self.flush_after_draw();
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.emit_vs_params(vertex_offset as u32, first_instance);
        let initiator = self.prepare_draw(true, index_count, DI_SRC_SEL_DMA);

        let index = self.state.index;
        let cs = &mut self.draw_cs;
        cs.emit_pkt7(Opcode::DrawIndxOffset, 7);
        cs.emit(initiator);
        cs.emit(instance_count);
        cs.emit(index_count);
        cs.emit(first_index);
        cs.emit_qw(index.iova);
        cs.emit(index.max_count);
        self.flush_after_draw();
    }

    fn prepare_indirect_draw(&mut self, indexed: bool, source: u32, always_wait: bool) -> (u32, u32) {
        self.emit_empty_vs_params();
        if always_wait || self.device.info().indirect_draw_wfm_quirk {
            self.draw_wait_for_me();
        }
        let dst_off = self
            .state
            .pipeline
            .as_deref()
            .and_then(Self::vs_params_offset)
            .unwrap_or(0);
        (self.prepare_draw(indexed, 0, source), dst_off)
    }

    pub fn draw_indirect(&mut self, args: IndirectArgs) {
        let (initiator, dst_off) = self.prepare_indirect_draw(false, DI_SRC_SEL_AUTO_INDEX, false);

        let cs = &mut self.draw_cs;
        cs.emit_pkt7(Opcode::DrawIndirectMulti, 6);
        cs.emit(initiator);
        cs.emit(indirect_multi_1(INDIRECT_OP_NORMAL, dst_off));
        cs.emit(args.draw_count);
        cs.emit_qw(args.iova);
        cs.emit(args.stride);
        self.flush_after_draw();
    }

    pub fn draw_indexed_indirect(&mut self, args: IndirectArgs) {
        let (initiator, dst_off) = self.prepare_indirect_draw(true, DI_SRC_SEL_DMA, false);

        let index = self.state.index;
        let cs = &mut self.draw_cs;
        cs.emit_pkt7(Opcode::DrawIndirectMulti, 9);
        cs.emit(initiator);
        cs.emit(indirect_multi_1(INDIRECT_OP_INDEXED, dst_off));
        cs.emit(args.draw_count);
        cs.emit_qw(index.iova);
        cs.emit(index.max_count);
        cs.emit_qw(args.iova);
        cs.emit(args.stride);
        self.flush_after_draw();
    }

    pub fn draw_indirect_count(&mut self, iova: u64, stride: u32, count: IndirectCount) {
        // The CP reads the count as well, so it always has to wait.
        let (initiator, dst_off) = self.prepare_indirect_draw(false, DI_SRC_SEL_AUTO_INDEX, true);

        let cs = &mut self.draw_cs;
        cs.emit_pkt7(Opcode::DrawIndirectMulti, 8);
        cs.emit(initiator);
        cs.emit(indirect_multi_1(INDIRECT_OP_INDIRECT_COUNT, dst_off));
        cs.emit(count.max_draw_count);
        cs.emit_qw(iova);
        cs.emit_qw(count.iova);
        cs.emit(stride);
        self.flush_after_draw();
    }

    pub fn draw_indexed_indirect_count(&mut self, iova: u64, stride: u32, count: IndirectCount) {
        let (initiator, dst_off) = self.prepare_indirect_draw(true, DI_SRC_SEL_DMA, true);

        let index = self.state.index;
        let cs = &mut self.draw_cs;
        cs.emit_pkt7(Opcode::DrawIndirectMulti, 11);
        cs.emit(initiator);
        cs.emit(indirect_multi_1(INDIRECT_OP_INDIRECT_COUNT_INDEXED, dst_off));
        cs.emit(count.max_draw_count);
        cs.emit_qw(index.iova);
        cs.emit(index.max_count);
        cs.emit_qw(iova);
        cs.emit_qw(count.iova);
        cs.emit(stride);
        self.flush_after_draw();
    }

    /// Draw as many vertices as transform feedback wrote into the buffer whose byte count is
    /// stored at `counter_iova`.
    pub fn draw_indirect_byte_count(
        &mut self,
        instance_count: u32,
        first_instance: u32,
        counter_iova: u64,
        counter_offset: u32,
        vertex_stride: u32,
    ) {
        self.emit_vs_params(0, first_instance);
        self.draw_wait_for_me();
        let initiator = self.prepare_draw(false, 0, DI_SRC_SEL_AUTO_XFB);

        let cs = &mut self.draw_cs;
        cs.emit_pkt7(Opcode::DrawAuto, 6);
        cs.emit(initiator);
        cs.emit(instance_count);
        cs.emit_qw(counter_iova);
        cs.emit(counter_offset);
        cs.emit(vertex_stride);
        self.flush_after_draw();
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.dispatch_base([0; 3], [x, y, z]);
    }

    pub fn dispatch_base(&mut self, base: [u32; 3], groups: [u32; 3]) {
        if groups.contains(&0) {
            return;
        }
        let result = self.try_dispatch(Dispatch::Direct { base, groups });
        self.record(result);
    }

    /// Dispatch with the group counts read from three words at `iova`.
    pub fn dispatch_indirect(&mut self, iova: u64) {
        let result = self.try_dispatch(Dispatch::Indirect { iova });
        self.record(result);
    }

    fn emit_compute_driver_params(&mut self, pipeline: &ComputePipeline, dispatch: Dispatch) {
        let Some(offset) = pipeline
            .driver_params
            .filter(|offset| *offset < pipeline.consts.constlen)
        else {
            return;
        };
        let num_consts = CS_DRIVER_PARAMS.min(4 * (pipeline.consts.constlen - offset) as usize) as u32;
        let block = ShaderStage::Compute.state_block();
        let ctx = self.flush_context();
        let cs = &mut self.cs;

        match dispatch {
            Dispatch::Direct { base, groups } => {
                let params = [
                    groups[0],
                    groups[1],
                    groups[2],
                    0,
                    base[0],
                    base[1],
                    base[2],
                    pipeline.subgroup_size,
                ];
                cs.emit_pkt7(Opcode::LoadState6Frag, 3 + num_consts);
                cs.emit(load_state6_0(offset, ST6_CONSTANTS, SS6_DIRECT, block, num_consts / 4));
                cs.emit_qw(0);
                cs.emit_array(&params[..num_consts as usize]);
            }
            Dispatch::Indirect { iova } => {
                let src = if iova & 0xf == 0 {
                    iova
                } else {
                    // The constant loader needs 16-byte aligned sources; stage the counts.
                    let staging = Device::global_iova(GLOBAL_CS_INDIRECT_XYZ);
                    for i in 0..3 {
                        cs.emit_pkt7(Opcode::MemToMem, 5);
                        cs.emit(0);
                        cs.emit_qw(staging + 4 * i);
                        cs.emit_qw(iova + 4 * i);
                    }
                    cs.emit_pkt7(Opcode::WaitMemWrites, 0);
                    emit_event(cs, &ctx, VgtEvent::CacheInvalidate);
                    staging
                };
                cs.emit_pkt7(Opcode::LoadState6Frag, 3);
                cs.emit(load_state6_0(offset, ST6_CONSTANTS, SS6_INDIRECT, block, 1));
                cs.emit_qw(src);

                if num_consts > CS_DP_BASE_GROUP {
                    cs.emit_pkt7(Opcode::LoadState6Frag, 3 + 4);
                    cs.emit(load_state6_0(offset + 1, ST6_CONSTANTS, SS6_DIRECT, block, 1));
                    cs.emit_qw(0);
                    cs.emit_array(&[0, 0, 0, pipeline.subgroup_size]);
                }
            }
        }
    }

    fn try_dispatch(&mut self, dispatch: Dispatch) -> Result<()> {
        assert!(!self.state.in_pass(), "dispatch inside a render pass");
        let pipeline = match &self.state.compute_pipeline {
            Some(pipeline) => Arc::clone(pipeline),
            None => panic!("dispatch without a bound compute pipeline"),
        };

        self.emit_cache_flush();

        let consts = build_consts(
            &mut self.sub_cs,
            &[(ShaderStage::Compute, &pipeline.consts)],
            &self.state.descriptors[PipelineBindPoint::Compute as usize],
            &self.state.push_constants,
        )?;
        self.cs.emit_call_raw(consts.iova, consts.size);

        self.emit_compute_driver_params(&pipeline, dispatch);

        if self.state.dirty.contains(Dirty::COMPUTE_DESC_SETS_LOAD) {
            self.cs
                .emit_call_raw(pipeline.load_state.iova, pipeline.load_state.size);
        }
        self.state.dirty.remove(Dirty::COMPUTE_DESC_SETS_LOAD);

        let local = pipeline.local_size;
        let groups = match dispatch {
            Dispatch::Direct { groups, .. } => groups,
            Dispatch::Indirect { .. } => [0; 3],
        };
        let cs = &mut self.cs;
        cs.emit_pkt7(Opcode::SetMarker, 1);
        cs.emit(RM6_COMPUTE);
        cs.emit_regs(
            HLSQ_CS_NDRANGE_0,
            &[
                HLSQ_CS_NDRANGE_0_KERNELDIM_3 | cs_local_size(local),
                local[0] * groups[0],
                0,
                local[1] * groups[1],
                0,
                local[2] * groups[2],
                0,
            ],
        );
        cs.emit_regs(HLSQ_CS_KERNEL_GROUP_X, &[1, 1, 1]);

        match dispatch {
            Dispatch::Direct { groups, .. } => {
                cs.emit_pkt7(Opcode::ExecCs, 4);
                cs.emit(0);
                cs.emit_array(&groups);
            }
            Dispatch::Indirect { iova } => {
                cs.emit_pkt7(Opcode::ExecCsIndirect, 4);
                cs.emit(0);
                cs.emit_qw(iova);
                cs.emit(cs_local_size(local));
            }
        }
        cs.emit_wfi();

        self.device.stats().inc_dispatches();
        trace!(?dispatch, ?local, "dispatch recorded");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Dispatch {
    Direct { base: [u32; 3], groups: [u32; 3] },
    Indirect { iova: u64 },
}
