//! Command buffer recording.
//!
//! A [`CommandBuffer`] records into four command streams:
//! - `cs`: executed once, in order, when the buffer is submitted;
//! - `draw_cs`: everything recorded inside a render pass, replayed by the tile driver once per
//!   tile (or once in sysmem mode) when the pass ends;
//! - `draw_epilogue_cs`: replayed once after the last tile;
//! - `tile_store_cs`: GMEM stores and resolves, called after every tile.
//!
//! Short-lived state blocks (dynamic state, constants, descriptor pointers) live in a
//! [`SubStreamPool`] and are bound through `CP_SET_DRAW_STATE`.
//!
//! Recoverable failures do not interrupt recording: the first one is kept and returned by
//! [`CommandBuffer::end`].

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use tbdr_cs::{CommandStream, DrawState, Emit, IovaResolver, Opcode, SubStreamPool, VgtEvent};
use tracing::{debug, trace, warn};

use crate::cache::{emit_flushes, CacheState, FlushBits, FlushContext};
use crate::config::DeviceInfo;
use crate::descriptor::{DescriptorSet, DescriptorState, UboDescriptor, MAX_SETS};
use crate::device::{Device, VscSetup, GLOBAL_BCOLOR_BUILTIN};
use crate::dynamic::{Viewport, MAX_SCISSORS, MAX_VIEWPORTS};
use crate::error::{RecordError, Result};
use crate::image::ImageView;
use crate::lrz::LrzState;
use crate::pass::{RenderPass, Subpass};
use crate::pipeline::{
    ComputePipeline, DrawStateGroup, DynamicSlot, DynamicStates, GraphicsPipeline,
    PrimitiveTopology, DYNAMIC_SLOT_COUNT,
};
use crate::regs::*;
use crate::tiling::{Framebuffer, Rect2D};

/// Vertex buffer bindings.
pub const MAX_VBS: usize = 32;
/// Push constant words.
pub const MAX_PUSH_CONSTANTS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferLevel {
    Primary,
    Secondary,
}

bitflags! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct UsageFlags: u32 {
        const ONE_TIME_SUBMIT = 1 << 0;
        /// A secondary buffer executed entirely inside one subpass of a render pass.
        const RENDER_PASS_CONTINUE = 1 << 1;
        const SIMULTANEOUS_USE = 1 << 2;
    }
}

/// Render pass state a secondary command buffer continues.
#[derive(Debug, Clone)]
pub struct InheritanceInfo {
    pub pass: Arc<RenderPass>,
    pub subpass: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineBindPoint {
    Graphics = 0,
    Compute = 1,
}

/// Mode the CCU is programmed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcuState {
    /// Whatever a secondary command buffer left behind.
    Unknown,
    Sysmem,
    Gmem,
}

bitflags! {
    /// State that must be re-emitted before the next draw or dispatch.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct Dirty: u32 {
        const VERTEX_BUFFERS = 1 << 0;
        const VB_STRIDE = 1 << 1;
        const GRAS_SU_CNTL = 1 << 2;
        const RB_DEPTH_CNTL = 1 << 3;
        const RB_STENCIL_CNTL = 1 << 4;
        const DESC_SETS_LOAD = 1 << 5;
        const COMPUTE_DESC_SETS_LOAD = 1 << 6;
        const SHADER_CONSTS = 1 << 7;
        const LRZ = 1 << 8;
        const VS_PARAMS = 1 << 9;
        const RASTERIZER_DISCARD = 1 << 10;
        /// Every draw-state group was disabled; the next draw re-emits all of them.
        const DRAW_STATE = 1 << 11;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VertexBuffer {
    pub iova: u64,
    /// Bytes from `iova` to the end of the buffer.
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    U8,
    U16,
    U32,
}

impl IndexType {
    pub(crate) fn size_code(self) -> u32 {
        match self {
            IndexType::U8 => 0,
            IndexType::U16 => 1,
            IndexType::U32 => 2,
        }
    }

    pub(crate) fn shift(self) -> u32 {
        match self {
            IndexType::U8 => 0,
            IndexType::U16 => 1,
            IndexType::U32 => 2,
        }
    }

    fn restart_index(self) -> u32 {
        match self {
            IndexType::U8 => 0xff,
            IndexType::U16 => 0xffff,
            IndexType::U32 => 0xffff_ffff,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct IndexBinding {
    pub ty: Option<IndexType>,
    pub iova: u64,
    /// Indices addressable from `iova`.
    pub max_count: u32,
}

/// Render pass being recorded into `draw_cs`.
#[derive(Debug, Clone)]
pub(crate) struct PassState {
    pub pass: Arc<RenderPass>,
    pub subpass: u32,
    /// Absent for secondary buffers continuing a pass begun elsewhere.
    pub target: Option<PassTarget>,
}

impl PassState {
    pub fn subpass(&self) -> &Subpass {
        &self.pass.subpasses[self.subpass as usize]
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PassTarget {
    pub framebuffer: Arc<Framebuffer>,
    pub attachments: Vec<Arc<ImageView>>,
    pub render_area: Rect2D,
}

/// Everything a command buffer tracks between commands.
#[derive(Debug, Clone)]
pub(crate) struct CmdState {
    pub cache: CacheState,
    pub renderpass_cache: CacheState,
    pub ccu_state: CcuState,
    pub dirty: Dirty,

    pub pipeline: Option<Arc<GraphicsPipeline>>,
    pub compute_pipeline: Option<Arc<ComputePipeline>>,
    pub descriptors: [DescriptorState; 2],
    pub desc_sets: DrawState,
    pub push_constants: [u32; MAX_PUSH_CONSTANTS],

    pub vb: [VertexBuffer; MAX_VBS],
    pub vb_stride: [u32; MAX_VBS],
    pub max_vbs_bound: u32,
    pub vertex_buffers: DrawState,
    pub index: IndexBinding,

    pub dynamic: [DrawState; DYNAMIC_SLOT_COUNT],
    pub viewports: [Viewport; MAX_VIEWPORTS],
    pub max_viewport: u32,
    pub scissors: [Rect2D; MAX_SCISSORS],
    pub max_scissor: u32,
    pub gras_su_cntl: u32,
    pub rb_depth_cntl: u32,
    pub rb_stencil_cntl: u32,
    pub pc_raster_cntl: u32,
    pub vpc_unknown_9107: u32,
    pub stencil_compare_mask: u32,
    pub stencil_wrmask: u32,
    pub stencil_reference: u32,
    pub topology: PrimitiveTopology,
    pub primitive_restart_enable: bool,

    pub shader_const: [DrawState; 2],
    pub tess: DrawState,
    pub vs_params: DrawState,
    pub last_vs_params: Option<(u32, u32)>,
    pub lrz_state: DrawState,
    pub depth_plane_state: DrawState,
    pub lrz: LrzState,
    pub ia_gmem: DrawState,
    pub ia_sysmem: DrawState,

    /// Offsets into the bound transform feedback buffers, in bytes.
    pub streamout_offset: [u32; MAX_SO_BUFFERS as usize],
    pub xfb_used: bool,
    pub has_tess: bool,
    pub disable_gmem: bool,

    pub pass: Option<PassState>,
}

impl CmdState {
    pub fn new() -> Self {
        Self {
            cache: CacheState::new(),
            renderpass_cache: CacheState::new(),
            ccu_state: CcuState::Unknown,
            dirty: Dirty::DRAW_STATE,
            pipeline: None,
            compute_pipeline: None,
            descriptors: Default::default(),
            desc_sets: DrawState::EMPTY,
            push_constants: [0; MAX_PUSH_CONSTANTS],
            vb: [VertexBuffer::default(); MAX_VBS],
            vb_stride: [0; MAX_VBS],
            max_vbs_bound: 0,
            vertex_buffers: DrawState::EMPTY,
            index: IndexBinding::default(),
            dynamic: [DrawState::EMPTY; DYNAMIC_SLOT_COUNT],
            viewports: [Viewport::default(); MAX_VIEWPORTS],
            max_viewport: 1,
            scissors: [Rect2D::default(); MAX_SCISSORS],
            max_scissor: 1,
            gras_su_cntl: 0,
            rb_depth_cntl: 0,
            rb_stencil_cntl: 0,
            pc_raster_cntl: 0,
            vpc_unknown_9107: 0,
            stencil_compare_mask: 0,
            stencil_wrmask: 0,
            stencil_reference: 0,
            topology: PrimitiveTopology::default(),
            primitive_restart_enable: false,
            shader_const: [DrawState::EMPTY; 2],
            tess: DrawState::EMPTY,
            vs_params: DrawState::EMPTY,
            last_vs_params: None,
            lrz_state: DrawState::EMPTY,
            depth_plane_state: DrawState::EMPTY,
            lrz: LrzState::default(),
            ia_gmem: DrawState::EMPTY,
            ia_sysmem: DrawState::EMPTY,
            streamout_offset: [0; MAX_SO_BUFFERS as usize],
            xfb_used: false,
            has_tess: false,
            disable_gmem: false,
            pass: None,
        }
    }

    pub fn in_pass(&self) -> bool {
        self.pass.is_some()
    }

    /// Cache state of the stream commands currently go to.
    pub fn active_cache(&mut self) -> &mut CacheState {
        if self.pass.is_some() {
            &mut self.renderpass_cache
        } else {
            &mut self.cache
        }
    }

    /// Switch the CCU between GMEM and sysmem layouts, flushing what the old layout left
    /// behind. Only valid outside a render pass's draw stream.
    pub fn flush_ccu(
        &mut self,
        cs: &mut impl Emit,
        ctx: &FlushContext,
        info: &DeviceInfo,
        ccu: CcuState,
    ) {
        debug_assert_ne!(ccu, CcuState::Unknown);

        if self.ccu_state != ccu {
            let flush = FlushBits::CCU_FLUSH_COLOR | FlushBits::CCU_FLUSH_DEPTH;
            let invalidate = FlushBits::CCU_INVALIDATE_COLOR
                | FlushBits::CCU_INVALIDATE_DEPTH
                | FlushBits::WAIT_FOR_IDLE;
            // Unknown may be either layout, so both directions write back.
            self.cache.flush_bits |= flush | invalidate;
            self.cache.pending_flush_bits &= !(flush | invalidate);
            trace!(from = ?self.ccu_state, to = ?ccu, "ccu mode switch");
        }

        let flushes = self.cache.take_flush_bits();
        emit_flushes(cs, ctx, flushes);

        if self.ccu_state != ccu {
            let offset = match ccu {
                CcuState::Gmem => info.ccu_offset_gmem,
                _ => info.ccu_offset_bypass,
            };
            cs.emit_write_reg(RB_CCU_CNTL, ccu_cntl(offset, ccu == CcuState::Gmem));
            self.ccu_state = ccu;
        }
    }
}

impl Default for CmdState {
    fn default() -> Self {
        Self::new()
    }
}

/// `CP_SET_DRAW_STATE` entry for one group.
///
/// Empty states are still emitted, disabled, so the group stops applying.
pub(crate) fn emit_draw_state(cs: &mut impl Emit, group: u32, state: DrawState) {
    const PROGRAM: u32 = DrawStateGroup::Program as u32;
    const PROGRAM_BINNING: u32 = DrawStateGroup::ProgramBinning as u32;
    const VI: u32 = DrawStateGroup::Vi as u32;
    const VI_BINNING: u32 = DrawStateGroup::ViBinning as u32;
    const FS_CONST: u32 = DrawStateGroup::FsConst as u32;
    const DESC_SETS_LOAD: u32 = DrawStateGroup::DescSetsLoad as u32;
    const INPUT_GMEM: u32 = DrawStateGroup::InputAttachmentsGmem as u32;
    const INPUT_SYSMEM: u32 = DrawStateGroup::InputAttachmentsSysmem as u32;

    let mut enable_mask = match group {
        // Descriptor prefetch is not worth it for the binning shader.
        PROGRAM | VI | FS_CONST | DESC_SETS_LOAD => DRAW_STATE_GMEM | DRAW_STATE_SYSMEM,
        PROGRAM_BINNING | VI_BINNING => DRAW_STATE_BINNING,
        INPUT_GMEM => DRAW_STATE_GMEM,
        INPUT_SYSMEM => DRAW_STATE_SYSMEM,
        _ => DRAW_STATE_GMEM | DRAW_STATE_SYSMEM | DRAW_STATE_BINNING,
    };
    // The prefetch depends on the descriptor contents, not only on the state words.
    if group == DESC_SETS_LOAD {
        enable_mask |= DRAW_STATE_DIRTY;
    }
    if state.is_empty() {
        enable_mask |= DRAW_STATE_DISABLE;
    }

    cs.emit(state.size | enable_mask | draw_state_group(group));
    cs.emit_qw(state.iova);
}

/// Disable every draw-state group.
pub(crate) fn emit_disable_draw_states(cs: &mut impl Emit) {
    cs.emit_pkt7(Opcode::SetDrawState, 3);
    cs.emit(DRAW_STATE_DISABLE_ALL_GROUPS | draw_state_group(0));
    cs.emit_qw(0);
}

pub struct CommandBuffer {
    pub(crate) device: Arc<Device>,
    level: CommandBufferLevel,
    usage: UsageFlags,
    status: RecordingState,
    record_result: Option<RecordError>,

    pub(crate) cs: CommandStream,
    pub(crate) draw_cs: CommandStream,
    pub(crate) draw_epilogue_cs: CommandStream,
    pub(crate) tile_store_cs: CommandStream,
    pub(crate) sub_cs: SubStreamPool,

    pub(crate) state: CmdState,
    pub(crate) vsc: Option<VscSetup>,
}

impl CommandBuffer {
    pub fn new(device: Arc<Device>, level: CommandBufferLevel) -> Self {
        let config = device.config();
        let chunk_words = config.chunk_words;
        let sub_capacity = config.sub_stream_capacity_words;

        let cs = CommandStream::new(device.alloc_stream_id(), chunk_words);
        let draw_cs = CommandStream::new(device.alloc_stream_id(), chunk_words);
        let draw_epilogue_cs = CommandStream::new(device.alloc_stream_id(), chunk_words);
        let tile_store_cs = CommandStream::new(device.alloc_stream_id(), chunk_words);
        let sub_cs = SubStreamPool::new(device.alloc_stream_id(), sub_capacity);

        Self {
            device,
            level,
            usage: UsageFlags::empty(),
            status: RecordingState::Initial,
            record_result: None,
            cs,
            draw_cs,
            draw_epilogue_cs,
            tile_store_cs,
            sub_cs,
            state: CmdState::new(),
            vsc: None,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    pub fn status(&self) -> RecordingState {
        self.status
    }

    /// The stream executed on submission.
    pub fn cs(&self) -> &CommandStream {
        &self.cs
    }

    /// The in-pass stream a secondary buffer hands to `execute_commands`.
    pub fn draw_cs(&self) -> &CommandStream {
        &self.draw_cs
    }

    pub fn sub_streams(&self) -> &SubStreamPool {
        &self.sub_cs
    }

    /// Every stream this buffer's calls may land in.
    pub fn resolvers(&self) -> [&dyn IovaResolver; 5] {
        [
            &self.cs,
            &self.draw_cs,
            &self.draw_epilogue_cs,
            &self.tile_store_cs,
            &self.sub_cs,
        ]
    }

    pub fn ccu_state(&self) -> CcuState {
        self.state.ccu_state
    }

    pub fn dirty(&self) -> Dirty {
        self.state.dirty
    }

    /// Outer (outside any render pass) cache state.
    pub fn cache_state(&self) -> CacheState {
        self.state.cache
    }

    pub fn renderpass_cache_state(&self) -> CacheState {
        self.state.renderpass_cache
    }

    /// The first recording failure, if any.
    pub fn record_result(&self) -> Option<&RecordError> {
        self.record_result.as_ref()
    }

    /// Keep the first failure; later ones are only counted.
    pub(crate) fn record(&mut self, result: Result<()>) {
        let Err(err) = result else {
            return;
        };
        self.device.stats().inc_record_errors();
        match &self.record_result {
            Some(first) => debug!(%err, %first, "further recording failure ignored"),
            None => {
                warn!(%err, "recording failed; the command buffer will fail to end");
                self.record_result = Some(err);
            }
        }
    }

    pub(crate) fn flush_context(&self) -> FlushContext {
        self.device.flush_context()
    }

    pub fn reset(&mut self) {
        self.cs.reset();
        self.draw_cs.reset();
        self.draw_epilogue_cs.reset();
        self.tile_store_cs.reset();
        self.sub_cs.reset();
        self.record_result = None;
        self.vsc = None;
        self.state = CmdState::new();
        self.status = RecordingState::Initial;
        debug!(level = ?self.level, "command buffer reset");
    }

    pub fn begin(&mut self, usage: UsageFlags, inheritance: Option<InheritanceInfo>) {
        if self.status != RecordingState::Initial {
            self.reset();
        }

        self.usage = usage;
        self.status = RecordingState::Recording;
        self.state = CmdState::new();

        self.cs.begin();
        self.draw_cs.begin();
        self.draw_epilogue_cs.begin();
        self.tile_store_cs.begin();

        match self.level {
            CommandBufferLevel::Primary => {
                let result = self.init_hw();
                self.record(result);
            }
            CommandBufferLevel::Secondary => {
                if usage.contains(UsageFlags::RENDER_PASS_CONTINUE) {
                    let Some(info) = inheritance else {
                        panic!("render pass continuation requires inheritance info");
                    };
                    assert!(
                        (info.subpass as usize) < info.pass.subpass_count(),
                        "inherited subpass {} out of range",
                        info.subpass
                    );
                    self.state.pass = Some(PassState {
                        pass: info.pass,
                        subpass: info.subpass,
                        target: None,
                    });
                }
            }
        }
        debug!(level = ?self.level, ?usage, "recording begun");
    }

    /// Finish recording. Returns the first failure recorded since `begin`.
    pub fn end(&mut self) -> Result<()> {
        assert_eq!(
            self.status,
            RecordingState::Recording,
            "end() without begin()"
        );
        let ctx = self.flush_context();

        if self.state.in_pass() {
            self.state.renderpass_cache.flush_all_pending();
            let flushes = self.state.renderpass_cache.take_flush_bits();
            emit_flushes(&mut self.draw_cs, &ctx, flushes);
        } else {
            self.state.cache.flush_all_pending();
            self.state.cache.flush_bits |= FlushBits::CCU_FLUSH_COLOR | FlushBits::CCU_FLUSH_DEPTH;
            let flushes = self.state.cache.take_flush_bits();
            emit_flushes(&mut self.cs, &ctx, flushes);
        }

        self.cs.end();
        self.draw_cs.end();
        self.draw_epilogue_cs.end();
        self.tile_store_cs.end();
        self.status = RecordingState::Executable;
        self.device.stats().inc_command_buffers_recorded();

        debug!(
            level = ?self.level,
            words = self.cs.len_words(),
            sub_stream_words = self.sub_cs.used_words(),
            failed = self.record_result.is_some(),
            "recording ended"
        );
        match &self.record_result {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn init_hw(&mut self) -> Result<()> {
        let device = Arc::clone(&self.device);
        let info = device.info();
        let cs = &mut self.cs;

        cs.emit_event_write(VgtEvent::CacheInvalidate);
        cs.emit_write_reg(
            HLSQ_INVALIDATE_CMD,
            HLSQ_INVALIDATE_STATE | HLSQ_INVALIDATE_CS_BINDLESS | HLSQ_INVALIDATE_GFX_BINDLESS,
        );
        cs.emit_wfi();
        self.state.cache.pending_flush_bits &=
            !(FlushBits::WAIT_FOR_IDLE | FlushBits::CACHE_INVALIDATE);

        cs.emit_write_reg(RB_CCU_CNTL, ccu_cntl(info.ccu_offset_bypass, false));
        self.state.ccu_state = CcuState::Sysmem;

        cs.emit_write_reg(VPC_SO_DISABLE, 1);
        emit_disable_draw_states(cs);
        cs.emit_regs(
            SP_TP_BORDER_COLOR_BASE_ADDR,
            &lo_hi(Device::global_iova(GLOBAL_BCOLOR_BUILTIN)),
        );

        let vsc = device.setup_vsc()?;
        cs.emit_regs(
            VSC_DRAW_STRM_SIZE_ADDRESS,
            &lo_hi(vsc.bo.iova + vsc.size_array_offset()),
        );
        cs.emit_regs(VSC_PRIM_STRM_ADDRESS, &lo_hi(vsc.bo.iova));
        cs.emit_regs(VSC_DRAW_STRM_ADDRESS, &lo_hi(vsc.bo.iova + vsc.prim_strm_size()));
        trace!(
            draw_pitch = vsc.draw_strm_pitch,
            prim_pitch = vsc.prim_strm_pitch,
            bo = vsc.bo.iova,
            "visibility streams programmed"
        );
        self.vsc = Some(vsc);
        Ok(())
    }

    /// Emit the outer cache state's ready flushes into `cs`.
    pub(crate) fn emit_cache_flush(&mut self) {
        let ctx = self.flush_context();
        let flushes = self.state.cache.take_flush_bits();
        emit_flushes(&mut self.cs, &ctx, flushes);
    }

    /// Emit the render pass cache state's ready flushes into `draw_cs`.
    pub(crate) fn emit_cache_flush_renderpass(&mut self) {
        let ctx = self.flush_context();
        let flushes = self.state.renderpass_cache.take_flush_bits();
        emit_flushes(&mut self.draw_cs, &ctx, flushes);
    }

    pub(crate) fn flush_ccu(&mut self, ccu: CcuState) {
        let ctx = self.flush_context();
        let device = Arc::clone(&self.device);
        self.state.flush_ccu(&mut self.cs, &ctx, device.info(), ccu);
    }

    pub fn bind_graphics_pipeline(&mut self, pipeline: Arc<GraphicsPipeline>) {
        let state = &mut self.state;
        let num_vbs_changed = state
            .pipeline
            .as_ref()
            .map_or(true, |prev| prev.num_vbs != pipeline.num_vbs);

        state.dirty |= Dirty::DESC_SETS_LOAD | Dirty::SHADER_CONSTS | Dirty::LRZ | Dirty::VS_PARAMS;
        if num_vbs_changed {
            state.dirty |= Dirty::VERTEX_BUFFERS;
            if pipeline.dynamic.contains(DynamicStates::VB_STRIDE) {
                state.dirty |= Dirty::VB_STRIDE;
            }
        }
        if pipeline.has_tess() {
            state.has_tess = true;
        }

        // With DRAW_STATE dirty the next draw emits everything anyway.
        if !state.dirty.contains(Dirty::DRAW_STATE) {
            let static_slots: Vec<DynamicSlot> = DynamicSlot::ALL
                .into_iter()
                .filter(|slot| !pipeline.dynamic.contains(slot.flag()))
                .collect();
            let groups = [
                (DrawStateGroup::ProgramConfig, pipeline.program.config),
                (DrawStateGroup::Program, pipeline.program.state),
                (DrawStateGroup::ProgramBinning, pipeline.program.binning),
                (DrawStateGroup::Vi, pipeline.vi),
                (DrawStateGroup::ViBinning, pipeline.vi_binning),
                (DrawStateGroup::Rast, pipeline.rast),
                (DrawStateGroup::Blend, pipeline.blend),
            ];

            let cs = &mut self.draw_cs;
            cs.emit_pkt7(
                Opcode::SetDrawState,
                (3 * (groups.len() + static_slots.len())) as u32,
            );
            for (group, ds) in groups {
                emit_draw_state(cs, group as u32, ds);
            }
            for slot in static_slots {
                emit_draw_state(cs, slot.group(), pipeline.static_states[slot as usize]);
            }
        }

        // Registers shared between pipeline and dynamic state. When the pipeline does not
        // leave one dynamic, its draw state already has the register and a dynamic re-emit
        // would override it.
        let shared = [
            (pipeline.gras_su_cntl, &mut state.gras_su_cntl, Dirty::GRAS_SU_CNTL, DynamicStates::GRAS_SU_CNTL),
            (pipeline.rb_depth_cntl, &mut state.rb_depth_cntl, Dirty::RB_DEPTH_CNTL, DynamicStates::RB_DEPTH_CNTL),
            (pipeline.rb_stencil_cntl, &mut state.rb_stencil_cntl, Dirty::RB_STENCIL_CNTL, DynamicStates::RB_STENCIL_CNTL),
            (pipeline.pc_raster_cntl, &mut state.pc_raster_cntl, Dirty::RASTERIZER_DISCARD, DynamicStates::RASTERIZER_DISCARD),
            (pipeline.vpc_unknown_9107, &mut state.vpc_unknown_9107, Dirty::RASTERIZER_DISCARD, DynamicStates::RASTERIZER_DISCARD),
        ];
        let mut set = Dirty::empty();
        let mut clear = Dirty::empty();
        for (reg, current, dirty, dynamic) in shared {
            if reg.apply(current) {
                set |= dirty;
            }
            if !pipeline.dynamic.contains(dynamic) {
                clear |= dirty;
            }
        }
        state.dirty |= set;
        state.dirty &= !clear;

        if pipeline.rb_depth_cntl_disable {
            state.dirty |= Dirty::RB_DEPTH_CNTL;
        }

        trace!(num_vbs = pipeline.num_vbs, dynamic = ?pipeline.dynamic, "graphics pipeline bound");
        state.pipeline = Some(pipeline);
    }

    pub fn bind_compute_pipeline(&mut self, pipeline: Arc<ComputePipeline>) {
        self.cs
            .emit_call_raw(pipeline.program.iova, pipeline.program.size);
        self.state.dirty |= Dirty::COMPUTE_DESC_SETS_LOAD;
        self.state.compute_pipeline = Some(pipeline);
    }

    /// Bind vertex buffers starting at `first`. `strides`, when given, has one entry per buffer
    /// and feeds the dynamic stride state.
    pub fn bind_vertex_buffers(
        &mut self,
        first: u32,
        buffers: &[VertexBuffer],
        strides: Option<&[u32]>,
    ) {
        let result = self.try_bind_vertex_buffers(first, buffers, strides);
        self.record(result);
    }

    fn try_bind_vertex_buffers(
        &mut self,
        first: u32,
        buffers: &[VertexBuffer],
        strides: Option<&[u32]>,
    ) -> Result<()> {
        let first = first as usize;
        assert!(first + buffers.len() <= MAX_VBS, "too many vertex buffers");
        if let Some(strides) = strides {
            assert_eq!(strides.len(), buffers.len(), "one stride per vertex buffer");
        }

        let state = &mut self.state;
        state.max_vbs_bound = state.max_vbs_bound.max((first + buffers.len()) as u32);
        for (i, vb) in buffers.iter().enumerate() {
            state.vb[first + i] = *vb;
            if let Some(strides) = strides {
                state.vb_stride[first + i] = strides[i];
            }
        }

        let bound = state.max_vbs_bound as usize;
        let mut sub = self.sub_cs.begin_sub_stream(4 * bound)?;
        for (i, vb) in state.vb[..bound].iter().enumerate() {
            let [lo, hi] = lo_hi(vb.iova);
            sub.emit_regs(VFD_FETCH_BASE0 + VFD_FETCH_STRIDE_REGS * i as u32, &[lo, hi, vb.size]);
        }
        state.vertex_buffers = self.sub_cs.end_sub_stream(sub)?;
        state.dirty |= Dirty::VERTEX_BUFFERS;

        if strides.is_some() {
            let mut sub = self.sub_cs.begin_sub_stream(2 * bound)?;
            for (i, stride) in state.vb_stride[..bound].iter().enumerate() {
                sub.emit_write_reg(VFD_FETCH_BASE0 + VFD_FETCH_STRIDE_REGS * i as u32 + 3, *stride);
            }
            state.dynamic[DynamicSlot::VbStride as usize] = self.sub_cs.end_sub_stream(sub)?;
            state.dirty |= Dirty::VB_STRIDE;
        }
        Ok(())
    }

    /// Bind an index buffer of `size` bytes at `iova`, starting `offset` bytes in.
    pub fn bind_index_buffer(&mut self, iova: u64, size: u64, offset: u64, ty: IndexType) {
        assert!(offset <= size, "index buffer offset past the end");
        if self.state.index.ty != Some(ty) {
            self.draw_cs.emit_write_reg(PC_RESTART_INDEX, ty.restart_index());
        }
        self.state.index = IndexBinding {
            ty: Some(ty),
            iova: iova + offset,
            max_count: ((size - offset) >> ty.shift()) as u32,
        };
    }

    /// Bind descriptor sets from `first_set`. `dynamic_ubos` replaces the dynamic uniform
    /// buffers of the bind point.
    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: PipelineBindPoint,
        first_set: u32,
        sets: &[DescriptorSet],
        dynamic_ubos: &[UboDescriptor],
    ) {
        let result = self.try_bind_descriptor_sets(bind_point, first_set, sets, dynamic_ubos);
        self.record(result);
    }

    fn try_bind_descriptor_sets(
        &mut self,
        bind_point: PipelineBindPoint,
        first_set: u32,
        sets: &[DescriptorSet],
        dynamic_ubos: &[UboDescriptor],
    ) -> Result<()> {
        let first = first_set as usize;
        assert!(first + sets.len() <= MAX_SETS, "descriptor set index out of range");

        let descriptors = &mut self.state.descriptors[bind_point as usize];
        for (i, set) in sets.iter().enumerate() {
            descriptors.sets[first + i] = Some(set.clone());
        }
        descriptors.dynamic_ubos.clear();
        descriptors.dynamic_ubos.extend_from_slice(dynamic_ubos);

        // Bindless bases: one per set, then the dynamic descriptors.
        let mut bases = [0u64; MAX_SETS + 1];
        for (base, set) in bases.iter_mut().zip(&descriptors.sets) {
            if let Some(set) = set {
                *base = set.iova | 3;
            }
        }
        if !descriptors.dynamic_ubos.is_empty() {
            let alloc = self
                .sub_cs
                .alloc(descriptors.dynamic_ubos.len(), TEX_CONST_DWORDS)?;
            for (i, ubo) in descriptors.dynamic_ubos.iter().enumerate() {
                let [lo, hi] = lo_hi(ubo.iova);
                let size_vec4 = ubo.size.div_ceil(16);
                self.sub_cs
                    .write(&alloc, i * TEX_CONST_DWORDS, &[lo, hi | size_vec4 << 17])?;
            }
            bases[MAX_SETS] = alloc.iova | 3;
        }

        let mut words = [0u32; 2 * (MAX_SETS + 1)];
        for (pair, base) in words.chunks_exact_mut(2).zip(bases) {
            pair.copy_from_slice(&lo_hi(base));
        }

        match bind_point {
            PipelineBindPoint::Graphics => {
                let mut sub = self.sub_cs.begin_sub_stream(24)?;
                sub.emit_regs(SP_BINDLESS_BASE0, &words);
                sub.emit_regs(HLSQ_BINDLESS_BASE0, &words);
                sub.emit_write_reg(HLSQ_INVALIDATE_CMD, HLSQ_INVALIDATE_GFX_BINDLESS);
                self.state.desc_sets = self.sub_cs.end_sub_stream(sub)?;
                self.state.dirty |= Dirty::DESC_SETS_LOAD | Dirty::SHADER_CONSTS;

                if !self.state.dirty.contains(Dirty::DRAW_STATE) {
                    self.draw_cs.emit_pkt7(Opcode::SetDrawState, 3);
                    emit_draw_state(
                        &mut self.draw_cs,
                        DrawStateGroup::DescSets as u32,
                        self.state.desc_sets,
                    );
                }
            }
            PipelineBindPoint::Compute => {
                self.cs.emit_regs(SP_CS_BINDLESS_BASE0, &words);
                self.cs.emit_regs(HLSQ_CS_BINDLESS_BASE0, &words);
                self.cs
                    .emit_write_reg(HLSQ_INVALIDATE_CMD, HLSQ_INVALIDATE_CS_BINDLESS);
                self.state.dirty |= Dirty::COMPUTE_DESC_SETS_LOAD;
            }
        }
        Ok(())
    }

    /// Update push constants starting `offset` bytes into the block.
    pub fn push_constants(&mut self, offset: u32, values: &[u32]) {
        let start = (offset / 4) as usize;
        assert!(
            start + values.len() <= MAX_PUSH_CONSTANTS,
            "push constants out of range"
        );
        self.state.push_constants[start..start + values.len()].copy_from_slice(values);
        self.state.dirty |= Dirty::SHADER_CONSTS;
    }

    /// Splice executable secondary command buffers into this primary.
    pub fn execute_commands(&mut self, secondaries: &[&CommandBuffer]) {
        assert_eq!(
            self.level,
            CommandBufferLevel::Primary,
            "only primary command buffers execute others"
        );
        assert!(!secondaries.is_empty());

        if self.state.in_pass() {
            self.state.renderpass_cache.flush_all_pending();
            self.emit_cache_flush_renderpass();
        } else {
            self.state.cache.flush_all_pending();
            self.emit_cache_flush();
        }

        for secondary in secondaries {
            assert_eq!(secondary.level, CommandBufferLevel::Secondary);
            assert_eq!(
                secondary.status,
                RecordingState::Executable,
                "secondary command buffer is not executable"
            );

            if secondary.usage.contains(UsageFlags::RENDER_PASS_CONTINUE) {
                assert!(self.state.in_pass(), "render pass continuation outside a render pass");
                debug_assert!(secondary.cs.is_empty());
                self.draw_cs.append_stream(&secondary.draw_cs);
                self.draw_epilogue_cs
                    .append_stream(&secondary.draw_epilogue_cs);
                self.state.has_tess |= secondary.state.has_tess;
                self.state.disable_gmem |= secondary.state.disable_gmem;
            } else {
                assert!(!self.state.in_pass(), "secondary executed inside a render pass");
                self.cs.append_stream(&secondary.cs);
                if secondary.state.ccu_state != CcuState::Unknown {
                    self.state.ccu_state = secondary.state.ccu_state;
                }
            }
            self.state.index.ty = secondary.state.index.ty;
        }
        self.state.dirty = Dirty::all();

        // The secondaries may have flushed anything; assume every cache is stale again.
        if self.state.in_pass() {
            self.state.renderpass_cache = CacheState::new();
        } else {
            self.state.cache = CacheState::new();
        }
        debug!(count = secondaries.len(), "secondary command buffers executed");
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("level", &self.level)
            .field("status", &self.status)
            .field("usage", &self.usage)
            .field("ccu_state", &self.state.ccu_state)
            .field("in_pass", &self.state.in_pass())
            .field("record_result", &self.record_result)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use pretty_assertions::assert_eq;
    use tbdr_cs::packets;

    fn primary(config: DeviceConfig) -> CommandBuffer {
        CommandBuffer::new(Arc::new(Device::new(config)), CommandBufferLevel::Primary)
    }

    #[test]
    fn init_hw_switches_ccu_to_sysmem() {
        let mut cmd = primary(DeviceConfig::default());
        cmd.begin(UsageFlags::ONE_TIME_SUBMIT, None);
        assert_eq!(cmd.ccu_state(), CcuState::Sysmem);
        assert!(cmd.vsc.is_some());

        let words = cmd.cs.words();
        let decoded = packets(&words).unwrap();
        let ccu = decoded
            .iter()
            .find_map(|p| p.reg_value(RB_CCU_CNTL))
            .unwrap();
        assert_eq!(ccu, ccu_cntl(DeviceInfo::default().ccu_offset_bypass, false));
        assert!(!cmd
            .state
            .cache
            .pending_flush_bits
            .contains(FlushBits::CACHE_INVALIDATE));
    }

    #[test]
    fn ccu_switch_flushes_once() {
        let mut cmd = primary(DeviceConfig::default());
        cmd.begin(UsageFlags::empty(), None);
        let before = cmd.cs.len_words();

        cmd.flush_ccu(CcuState::Gmem);
        let after_switch = cmd.cs.len_words();
        assert!(after_switch > before);
        assert_eq!(cmd.ccu_state(), CcuState::Gmem);

        cmd.flush_ccu(CcuState::Gmem);
        assert_eq!(cmd.cs.len_words(), after_switch);
    }

    #[test]
    fn first_failure_wins() {
        let mut cmd = primary(DeviceConfig::default());
        cmd.begin(UsageFlags::empty(), None);
        cmd.record(Err(RecordError::OutOfHostMemory("first")));
        cmd.record(Err(RecordError::OutOfHostMemory("second")));
        assert_eq!(cmd.end(), Err(RecordError::OutOfHostMemory("first")));
        assert_eq!(cmd.device.stats().snapshot().record_errors, 2);

        cmd.begin(UsageFlags::empty(), None);
        assert_eq!(cmd.end(), Ok(()));
    }

    #[test]
    fn exhausted_arena_poisons_recording() {
        let mut cmd = primary(DeviceConfig {
            sub_stream_capacity_words: 4,
            ..DeviceConfig::default()
        });
        cmd.begin(UsageFlags::empty(), None);
        let buffers = [VertexBuffer { iova: 0x1000, size: 64 }; 2];
        cmd.bind_vertex_buffers(0, &buffers, None);
        assert!(matches!(cmd.end(), Err(RecordError::Stream(_))));
    }

    #[test]
    fn pipeline_bind_keeps_static_registers_clean() {
        let mut cmd = primary(DeviceConfig::default());
        cmd.begin(UsageFlags::empty(), None);

        let mut pipeline = GraphicsPipeline::default();
        pipeline.gras_su_cntl = crate::pipeline::MaskedReg::full(GRAS_SU_CNTL_CULL_BACK);
        cmd.bind_graphics_pipeline(Arc::new(pipeline.clone()));
        assert!(!cmd.dirty().contains(Dirty::GRAS_SU_CNTL));
        assert_eq!(cmd.state.gras_su_cntl, GRAS_SU_CNTL_CULL_BACK);

        pipeline.dynamic = DynamicStates::GRAS_SU_CNTL;
        pipeline.gras_su_cntl = crate::pipeline::MaskedReg {
            value: 0,
            mask: GRAS_SU_CNTL_CULL_BACK,
        };
        cmd.bind_graphics_pipeline(Arc::new(pipeline));
        assert!(cmd.dirty().contains(Dirty::GRAS_SU_CNTL));
        assert_eq!(cmd.state.gras_su_cntl, 0);
    }

    #[test]
    fn index_restart_only_reprogrammed_on_type_change() {
        let mut cmd = primary(DeviceConfig::default());
        cmd.begin(UsageFlags::empty(), None);
        cmd.bind_index_buffer(0x1000, 256, 16, IndexType::U16);
        let len = cmd.draw_cs.len_words();
        assert_eq!(len, 2);
        assert_eq!(cmd.state.index.max_count, 120);
        assert_eq!(cmd.state.index.iova, 0x1010);

        cmd.bind_index_buffer(0x2000, 256, 0, IndexType::U16);
        assert_eq!(cmd.draw_cs.len_words(), len);
        cmd.bind_index_buffer(0x2000, 256, 0, IndexType::U32);
        assert_eq!(cmd.draw_cs.len_words(), len + 2);
    }
}
