//! Pipeline objects as the recorder sees them.
//!
//! Shader compilation and state packing happen elsewhere; a pipeline arrives here as a set of
//! prebuilt draw states plus the few register values and shader facts the recorder needs to
//! merge with dynamic state at draw time:
//! - which dynamic-state slots it leaves to the command buffer ([`DynamicStates`]),
//! - the register bits it owns in registers shared with dynamic state ([`MaskedReg`]),
//! - constant-file layout per stage ([`StageConsts`]),
//! - tessellation and LRZ properties.

use bitflags::bitflags;
use tbdr_cs::{DrawState, Opcode};

use crate::descriptor::UboBinding;
use crate::regs::{
    SB6_CS_SHADER, SB6_DS_SHADER, SB6_FS_SHADER, SB6_GS_SHADER, SB6_HS_SHADER, SB6_VS_SHADER,
};

/// Draw-state group ids used with `CP_SET_DRAW_STATE`.
///
/// Dynamic-state slots follow [`DrawStateGroup::Dynamic`], one group per [`DynamicSlot`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawStateGroup {
    ProgramConfig = 0,
    Program,
    ProgramBinning,
    Tess,
    Vb,
    Vi,
    ViBinning,
    Rast,
    Blend,
    ShaderGeomConst,
    FsConst,
    DescSets,
    DescSetsLoad,
    VsParams,
    InputAttachmentsGmem,
    InputAttachmentsSysmem,
    Lrz,
    DepthPlane,
    Dynamic,
}

/// Dynamic-state slots, each backed by its own draw-state group.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DynamicSlot {
    Viewport = 0,
    Scissor,
    /// Shared by line width, cull mode, front face and depth bias enable.
    GrasSuCntl,
    DepthBias,
    BlendConstants,
    DepthBounds,
    StencilCompareMask,
    StencilWriteMask,
    StencilReference,
    SampleLocations,
    RbDepthCntl,
    RbStencilCntl,
    VbStride,
    RasterizerDiscard,
}

pub const DYNAMIC_SLOT_COUNT: usize = 14;

/// Total number of draw-state groups.
pub const DRAW_STATE_COUNT: u32 = DrawStateGroup::Dynamic as u32 + DYNAMIC_SLOT_COUNT as u32;

impl DynamicSlot {
    pub const ALL: [DynamicSlot; DYNAMIC_SLOT_COUNT] = [
        DynamicSlot::Viewport,
        DynamicSlot::Scissor,
        DynamicSlot::GrasSuCntl,
        DynamicSlot::DepthBias,
        DynamicSlot::BlendConstants,
        DynamicSlot::DepthBounds,
        DynamicSlot::StencilCompareMask,
        DynamicSlot::StencilWriteMask,
        DynamicSlot::StencilReference,
        DynamicSlot::SampleLocations,
        DynamicSlot::RbDepthCntl,
        DynamicSlot::RbStencilCntl,
        DynamicSlot::VbStride,
        DynamicSlot::RasterizerDiscard,
    ];

    pub fn group(self) -> u32 {
        DrawStateGroup::Dynamic as u32 + self as u32
    }

    pub fn flag(self) -> DynamicStates {
        DynamicStates::from_bits_retain(1 << self as u32)
    }
}

bitflags! {
    /// State a pipeline leaves to the command buffer's dynamic setters.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct DynamicStates: u32 {
        const VIEWPORT = 1 << 0;
        const SCISSOR = 1 << 1;
        const GRAS_SU_CNTL = 1 << 2;
        const DEPTH_BIAS = 1 << 3;
        const BLEND_CONSTANTS = 1 << 4;
        const DEPTH_BOUNDS = 1 << 5;
        const STENCIL_COMPARE_MASK = 1 << 6;
        const STENCIL_WRITE_MASK = 1 << 7;
        const STENCIL_REFERENCE = 1 << 8;
        const SAMPLE_LOCATIONS = 1 << 9;
        const RB_DEPTH_CNTL = 1 << 10;
        const RB_STENCIL_CNTL = 1 << 11;
        const VB_STRIDE = 1 << 12;
        const RASTERIZER_DISCARD = 1 << 13;
        // No draw state of their own.
        const PRIMITIVE_TOPOLOGY = 1 << 14;
        const PRIMITIVE_RESTART_ENABLE = 1 << 15;

        const SLOTS = 0x3fff;
    }
}

/// Register value where only `mask` bits come from the pipeline; the rest are dynamic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaskedReg {
    pub value: u32,
    pub mask: u32,
}

impl MaskedReg {
    pub const fn full(value: u32) -> Self {
        Self {
            value,
            mask: u32::MAX,
        }
    }

    /// Replace the pipeline-owned bits of `current`. Returns whether anything changed.
    pub(crate) fn apply(&self, current: &mut u32) -> bool {
        let bits = self.value & self.mask;
        if *current & self.mask == bits {
            return false;
        }
        *current = (*current & !self.mask) | bits;
        true
    }
}

/// Hardware primitive types.
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList = 1,
    LineList = 2,
    LineStrip = 3,
    #[default]
    TriangleList = 4,
    TriangleFan = 5,
    TriangleStrip = 6,
    LineListAdjacency = 10,
    LineStripAdjacency = 11,
    TriangleListAdjacency = 12,
    TriangleStripAdjacency = 13,
    /// Control-point count is added when the draw is encoded.
    PatchList = 31,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never = 0,
    Less = 1,
    Equal = 2,
    LessOrEqual = 3,
    Greater = 4,
    NotEqual = 5,
    GreaterOrEqual = 6,
    #[default]
    Always = 7,
}

impl CompareOp {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x7 {
            0 => Self::Never,
            1 => Self::Less,
            2 => Self::Equal,
            3 => Self::LessOrEqual,
            4 => Self::Greater,
            5 => Self::NotEqual,
            6 => Self::GreaterOrEqual,
            _ => Self::Always,
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StencilOp {
    #[default]
    Keep = 0,
    Zero = 1,
    Replace = 2,
    IncrementAndClamp = 3,
    DecrementAndClamp = 4,
    Invert = 5,
    IncrementAndWrap = 6,
    DecrementAndWrap = 7,
}

bitflags! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct StencilFaces: u32 {
        const FRONT = 1 << 0;
        const BACK = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct CullMode: u32 {
        const FRONT = 1 << 0;
        const BACK = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    TessCtrl,
    TessEval,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub const GRAPHICS: [ShaderStage; 5] = [
        ShaderStage::Vertex,
        ShaderStage::TessCtrl,
        ShaderStage::TessEval,
        ShaderStage::Geometry,
        ShaderStage::Fragment,
    ];

    /// Stages whose constants share the geometry constant group.
    pub const GEOMETRY: [ShaderStage; 4] = [
        ShaderStage::Vertex,
        ShaderStage::TessCtrl,
        ShaderStage::TessEval,
        ShaderStage::Geometry,
    ];

    pub(crate) fn load_opcode(self) -> Opcode {
        match self {
            ShaderStage::Fragment | ShaderStage::Compute => Opcode::LoadState6Frag,
            _ => Opcode::LoadState6Geom,
        }
    }

    pub(crate) fn state_block(self) -> u32 {
        match self {
            ShaderStage::Vertex => SB6_VS_SHADER,
            ShaderStage::TessCtrl => SB6_HS_SHADER,
            ShaderStage::TessEval => SB6_DS_SHADER,
            ShaderStage::Geometry => SB6_GS_SHADER,
            ShaderStage::Fragment => SB6_FS_SHADER,
            ShaderStage::Compute => SB6_CS_SHADER,
        }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const TESS_CTRL = 1 << 1;
        const TESS_EVAL = 1 << 2;
        const GEOMETRY = 1 << 3;
        const FRAGMENT = 1 << 4;
        const COMPUTE = 1 << 5;
    }
}

/// Push constants a stage reads, in vec4 units of the push constant block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushConstRange {
    pub lo: u32,
    pub count: u32,
}

/// A uniform buffer range the compiler promoted into the constant file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UboRange {
    /// Byte range read from the buffer.
    pub start: u32,
    pub end: u32,
    /// Byte offset of the range in the constant file.
    pub offset: u32,
    /// Descriptor holding the buffer address; `None` for ranges not loaded through a descriptor.
    pub binding: Option<UboBinding>,
}

/// Constant-file layout of one shader stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageConsts {
    /// Constant file length in vec4 units.
    pub constlen: u32,
    pub push_consts: PushConstRange,
    pub ubo_ranges: Vec<UboRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchType {
    Quads = 0,
    Triangles = 1,
    Isolines = 2,
}

impl PatchType {
    /// Bytes of tessellation factors written per patch.
    pub fn factor_stride(self) -> u64 {
        match self {
            PatchType::Isolines => 12,
            PatchType::Triangles => 20,
            PatchType::Quads => 28,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TessState {
    pub patch_type: Option<PatchType>,
    pub patch_control_points: u32,
    /// Bytes of per-patch parameters.
    pub param_stride: u32,
    pub upper_left_domain_origin: bool,
    /// Constant register receiving the factor/param buffer addresses, if the stage reads them.
    pub hs_bo_regid: Option<u32>,
    pub ds_bo_regid: Option<u32>,
}

bitflags! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct LrzForceDisable: u32 {
        /// Invalidate the LRZ buffer for the rest of the pass.
        const LRZ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LrzPipelineState {
    pub force_disable: LrzForceDisable,
    pub fs_has_kill: bool,
    pub force_late_z: bool,
    pub early_fragment_tests: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramState {
    pub config: DrawState,
    pub state: DrawState,
    pub binning: DrawState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphicsPipeline {
    pub program: ProgramState,
    pub vi: DrawState,
    pub vi_binning: DrawState,
    pub rast: DrawState,
    pub blend: DrawState,
    /// Descriptor prefetch for the pipeline layout.
    pub load_state: DrawState,

    pub dynamic: DynamicStates,
    /// Pipeline-baked contents of the slots not in `dynamic`.
    pub static_states: [DrawState; DYNAMIC_SLOT_COUNT],

    pub gras_su_cntl: MaskedReg,
    pub rb_depth_cntl: MaskedReg,
    pub rb_stencil_cntl: MaskedReg,
    pub pc_raster_cntl: MaskedReg,
    pub vpc_unknown_9107: MaskedReg,
    /// Depth writes are impossible with this pipeline; RB_DEPTH_CNTL is forced to zero.
    pub rb_depth_cntl_disable: bool,
    pub stencil_wrmask: u32,

    pub topology: PrimitiveTopology,
    pub primitive_restart: bool,
    pub provoking_vertex_last: bool,
    pub num_vbs: u32,

    pub stages: ShaderStages,
    /// Indexed like [`ShaderStage::GRAPHICS`].
    pub consts: [StageConsts; 5],
    /// Constant offset (vec4) of the vertex shader's draw parameters, if it reads them.
    pub vs_driver_params: Option<u32>,
    pub tess: TessState,
    pub lrz: LrzPipelineState,
}

impl GraphicsPipeline {
    pub fn stage_consts(&self, stage: ShaderStage) -> &StageConsts {
        let index = ShaderStage::GRAPHICS
            .iter()
            .position(|s| *s == stage)
            .unwrap_or(0);
        &self.consts[index]
    }

    pub fn has_tess(&self) -> bool {
        self.stages.contains(ShaderStages::TESS_CTRL)
    }

    /// Static contents of a dynamic slot, or the command buffer's when the slot is dynamic.
    pub(crate) fn slot_state(&self, slot: DynamicSlot, dynamic: &[DrawState; DYNAMIC_SLOT_COUNT]) -> DrawState {
        if self.dynamic.contains(slot.flag()) {
            dynamic[slot as usize]
        } else {
            self.static_states[slot as usize]
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputePipeline {
    pub program: DrawState,
    pub load_state: DrawState,
    pub consts: StageConsts,
    pub local_size: [u32; 3],
    pub subgroup_size: u32,
    /// Constant offset (vec4) of the work group count and base, if the shader reads them.
    pub driver_params: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_groups_fit_the_group_field() {
        assert_eq!(DRAW_STATE_COUNT, 32);
        assert_eq!(DynamicSlot::RasterizerDiscard.group(), 31);
        for slot in DynamicSlot::ALL {
            assert!(DynamicStates::SLOTS.contains(slot.flag()));
        }
        assert!(!DynamicStates::SLOTS.intersects(DynamicStates::PRIMITIVE_TOPOLOGY));
    }

    #[test]
    fn masked_reg_only_touches_owned_bits() {
        let reg = MaskedReg {
            value: 0b1010,
            mask: 0b1110,
        };
        let mut current = 0b0001;
        assert!(reg.apply(&mut current));
        assert_eq!(current, 0b1011);
        assert!(!reg.apply(&mut current));
    }

    #[test]
    fn slot_state_prefers_dynamic_when_requested() {
        let mut pipeline = GraphicsPipeline::default();
        pipeline.static_states[DynamicSlot::Scissor as usize] = DrawState { iova: 0x10, size: 3 };
        let mut dynamic = [DrawState::EMPTY; DYNAMIC_SLOT_COUNT];
        dynamic[DynamicSlot::Scissor as usize] = DrawState { iova: 0x20, size: 3 };

        assert_eq!(pipeline.slot_state(DynamicSlot::Scissor, &dynamic).iova, 0x10);
        pipeline.dynamic |= DynamicStates::SCISSOR;
        assert_eq!(pipeline.slot_state(DynamicSlot::Scissor, &dynamic).iova, 0x20);
    }
}
