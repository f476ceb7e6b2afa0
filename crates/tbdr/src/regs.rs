//! Register offsets and field packing for the a6xx-class state the recorder touches.
//!
//! Only the fields this crate writes are described. Packing helpers are `const fn` so tests can
//! build expected values the same way.

#![allow(dead_code)]

// Render backend.
pub const RB_CCU_CNTL: u32 = 0x8e07;
pub const RB_RENDER_CNTL: u32 = 0x8801;
pub const RB_RAS_MSAA_CNTL: u32 = 0x8802;
pub const RB_DEST_MSAA_CNTL: u32 = 0x8803;
pub const RB_BIN_CONTROL: u32 = 0x8800;
pub const RB_MRT_BUF_INFO0: u32 = 0x8822;
pub const RB_MRT_STRIDE: u32 = 8;
pub const RB_BLEND_RED_F32: u32 = 0x8860;
pub const RB_SRGB_CNTL: u32 = 0x8865;
pub const RB_MSAA_CNTL: u32 = 0x8866;
pub const RB_DEPTH_PLANE_CNTL: u32 = 0x8870;
pub const RB_DEPTH_CNTL: u32 = 0x8871;
pub const RB_DEPTH_BUFFER_INFO: u32 = 0x8872;
pub const RB_DEPTH_FLAG_BUFFER_BASE: u32 = 0x8878;
pub const RB_STENCIL_CONTROL: u32 = 0x8880;
pub const RB_STENCIL_INFO: u32 = 0x8881;
pub const RB_STENCILREF: u32 = 0x8887;
pub const RB_STENCILMASK: u32 = 0x8888;
pub const RB_STENCILWRMASK: u32 = 0x8889;
pub const RB_WINDOW_OFFSET: u32 = 0x8890;
pub const RB_LRZ_CNTL: u32 = 0x8898;
pub const RB_Z_BOUNDS_MIN: u32 = 0x8899;
pub const RB_Z_BOUNDS_MAX: u32 = 0x889a;
pub const RB_Z_CLAMP_MIN: u32 = 0x88c0;
pub const RB_BLIT_SCISSOR_TL: u32 = 0x88d1;
pub const RB_BLIT_SCISSOR_BR: u32 = 0x88d2;
pub const RB_BIN_CONTROL2: u32 = 0x88d3;
pub const RB_WINDOW_OFFSET2: u32 = 0x88d4;
pub const RB_BLIT_BASE_GMEM: u32 = 0x88d6;
pub const RB_BLIT_DST_INFO: u32 = 0x88d7;
pub const RB_BLIT_CLEAR_COLOR_DW0: u32 = 0x88df;
pub const RB_BLIT_INFO: u32 = 0x88e3;
pub const RB_BLIT_FLAG_DST: u32 = 0x88dc;
pub const RB_MRT_FLAG_BUFFER_ADDR0: u32 = 0x8903;
pub const RB_2D_DST_INFO: u32 = 0x8c17;
pub const RB_2D_DST_FLAGS: u32 = 0x8c20;
pub const RB_2D_BLIT_CNTL: u32 = 0x8c00;
pub const RB_2D_SRC_SOLID_C0: u32 = 0x8c2c;

// Rasterizer.
pub const GRAS_CL_GUARDBAND_CLIP_ADJ: u32 = 0x8006;
pub const GRAS_CL_Z_CLAMP0: u32 = 0x8070;
pub const GRAS_SU_CNTL: u32 = 0x8091;
pub const GRAS_SU_DEPTH_BUFFER_INFO: u32 = 0x8094;
pub const GRAS_SU_POLY_OFFSET_SCALE: u32 = 0x8095;
pub const GRAS_RAS_MSAA_CNTL: u32 = 0x809a;
pub const GRAS_DEST_MSAA_CNTL: u32 = 0x809b;
pub const GRAS_MAX_LAYER_INDEX: u32 = 0x809d;
pub const GRAS_SC_CNTL: u32 = 0x80a0;
pub const GRAS_BIN_CONTROL: u32 = 0x80a1;
pub const GRAS_SC_SCREEN_SCISSOR_TL0: u32 = 0x80b0;
pub const GRAS_SC_VIEWPORT_SCISSOR_TL0: u32 = 0x80d0;
pub const GRAS_SC_WINDOW_SCISSOR_TL: u32 = 0x80f0;
pub const GRAS_SC_WINDOW_SCISSOR_BR: u32 = 0x80f1;
pub const GRAS_LRZ_CNTL: u32 = 0x8100;
pub const GRAS_LRZ_BUFFER_BASE: u32 = 0x8103;
pub const GRAS_SU_DEPTH_PLANE_CNTL: u32 = 0x8114;
pub const GRAS_CL_VPORT_XOFFSET0: u32 = 0x8210;
pub const GRAS_2D_DST_TL: u32 = 0x8405;
pub const GRAS_2D_DST_BR: u32 = 0x8406;
pub const GRAS_2D_BLIT_CNTL: u32 = 0x8400;
pub const GRAS_2D_SRC_TL_X: u32 = 0x8401;
pub const GRAS_2D_RESOLVE_CNTL_1: u32 = 0x8409;
pub const GRAS_2D_RESOLVE_CNTL_2: u32 = 0x840a;

// Primitive controller, vertex fetch, visibility stream.
pub const VSC_BIN_SIZE: u32 = 0x0c02;
pub const VSC_BIN_COUNT: u32 = 0x0c06;
pub const VSC_PIPE_CONFIG_REG0: u32 = 0x0c10;
pub const VSC_PRIM_STRM_ADDRESS: u32 = 0x0c30;
pub const VSC_PRIM_STRM_PITCH: u32 = 0x0c32;
pub const VSC_PRIM_STRM_LIMIT: u32 = 0x0c33;
pub const VSC_DRAW_STRM_SIZE_ADDRESS: u32 = 0x0c34;
pub const VSC_DRAW_STRM_ADDRESS: u32 = 0x0c37;
pub const VSC_DRAW_STRM_PITCH: u32 = 0x0c39;
pub const VSC_DRAW_STRM_LIMIT: u32 = 0x0c3a;
pub const VSC_PRIM_STRM_SIZE_REG0: u32 = 0x0c58;
pub const VSC_DRAW_STRM_SIZE_REG0: u32 = 0x0c78;
pub const VPC_UNKNOWN_9107: u32 = 0x9107;
pub const VPC_SO_DISABLE: u32 = 0x9306;
/// Per-buffer stream-out block: base (2), size, offset, flush base (2).
pub const VPC_SO_BUFFER_BASE0: u32 = 0x930e;
pub const VPC_SO_BUFFER_STRIDE: u32 = 7;
pub const VPC_SO_BUFFER_SIZE_OFFSET: u32 = 2;
pub const VPC_SO_BUFFER_OFFSET_OFFSET: u32 = 3;
pub const VPC_SO_FLUSH_BASE_OFFSET: u32 = 4;
pub const MAX_SO_BUFFERS: u32 = 4;
pub const CP_SCRATCH_REG0: u32 = 0x0883;
pub const PC_RESTART_INDEX: u32 = 0x9803;
pub const PC_POWER_CNTL: u32 = 0x9805;
pub const PC_TESSFACTOR_ADDR: u32 = 0x9810;
pub const PC_RASTER_CNTL: u32 = 0x9980;
pub const PC_PRIMITIVE_CNTL_0: u32 = 0x9b00;
pub const VFD_INDEX_OFFSET: u32 = 0xa00e;
pub const VFD_FETCH_BASE0: u32 = 0xa010;
pub const VFD_FETCH_STRIDE_REGS: u32 = 4;
pub const VFD_POWER_CNTL: u32 = 0xa0f8;
pub const VFD_MODE_CNTL: u32 = 0xa601;

// Shader processor and HLSQ.
pub const SP_SRGB_CNTL: u32 = 0xa80f;
pub const SP_FS_MRT_REG0: u32 = 0xa996;
pub const SP_FS_TEX_CONST: u32 = 0xa9e2;
pub const SP_FS_TEX_COUNT: u32 = 0xab05;
pub const SP_TP_BORDER_COLOR_BASE_ADDR: u32 = 0xb302;
pub const SP_TP_WINDOW_OFFSET: u32 = 0xb307;
pub const SP_TP_RAS_MSAA_CNTL: u32 = 0xb309;
pub const SP_TP_DEST_MSAA_CNTL: u32 = 0xb30a;
pub const SP_PS_2D_SRC: u32 = 0xb4c2;
pub const SP_PS_2D_SRC_INFO: u32 = 0xb4c0;
pub const SP_BINDLESS_BASE0: u32 = 0xb4e0;
pub const SP_CS_BINDLESS_BASE0: u32 = 0xa9e8;
pub const HLSQ_CS_BINDLESS_BASE0: u32 = 0xb9c0;
pub const HLSQ_BINDLESS_BASE0: u32 = 0xbb20;
pub const SP_WINDOW_OFFSET: u32 = 0xb4d1;
pub const HLSQ_CS_NDRANGE_0: u32 = 0xb990;
pub const HLSQ_CS_KERNEL_GROUP_X: u32 = 0xb997;
pub const HLSQ_INVALIDATE_CMD: u32 = 0xbb08;

// HLSQ_INVALIDATE_CMD.
pub const HLSQ_INVALIDATE_STATE: u32 = 0x3fff;
pub const HLSQ_INVALIDATE_CS_BINDLESS: u32 = 0x1f << 14;
pub const HLSQ_INVALIDATE_GFX_BINDLESS: u32 = 0x1f << 19;

/// Largest coordinate the window scissor accepts.
pub const MAX_VIEWPORT_SIZE: u32 = 1 << 14;

/// Dwords per texture descriptor.
pub const TEX_CONST_DWORDS: usize = 16;

pub const fn ccu_cntl(color_offset: u32, gmem: bool) -> u32 {
    ((color_offset >> 12) & 0x1ff) << 23 | (gmem as u32) << 22 | 0x10
}

/// Low and high words of a 64-bit address, in register order.
pub const fn lo_hi(value: u64) -> [u32; 2] {
    [value as u32, (value >> 32) as u32]
}

pub const fn xy(x: u32, y: u32) -> u32 {
    (x & 0x7fff) | (y & 0x7fff) << 16
}

// RB_BIN_CONTROL / GRAS_BIN_CONTROL.
pub const BIN_CONTROL_BINNING_PASS: u32 = 1 << 18;
pub const BIN_CONTROL_FORCE_LRZ_WRITE_DIS: u32 = 1 << 21;
pub const BIN_CONTROL_BUFFERS_IN_SYSMEM: u32 = 3 << 22;
pub const BIN_CONTROL_MAGIC: u32 = 0x600_0000;

pub const fn bin_control(width: u32, height: u32, flags: u32) -> u32 {
    ((width >> 5) & 0x3f) | ((height >> 4) & 0x1ff) << 8 | flags
}

// RB_RENDER_CNTL.
pub const RENDER_CNTL_CCUSINGLECACHELINESIZE_2: u32 = 2 << 3;
pub const RENDER_CNTL_BINNING: u32 = 1 << 7;
pub const RENDER_CNTL_FLAG_DEPTH: u32 = 1 << 14;

pub const fn render_cntl_flag_mrts(mask: u32) -> u32 {
    (mask & 0xff) << 16
}

/// `CP_REG_WRITE` tracker selecting RB_RENDER_CNTL.
pub const TRACK_RENDER_CNTL: u32 = 1 << 0;

pub const GRAS_SC_CNTL_CCUSINGLECACHELINESIZE_2: u32 = 2 << 3;
pub const GRAS_SC_CNTL_FLUSH_PER_OVERLAP_AND_OVERWRITE: u32 = 3;
pub const GRAS_SC_CNTL_FLUSH_PER_OVERLAP: u32 = 1;

// CP_SET_MARKER render modes.
pub const RM6_BYPASS: u32 = 1;
pub const RM6_BINNING: u32 = 2;
pub const RM6_GMEM: u32 = 4;
pub const RM6_ENDVIS: u32 = 5;
pub const RM6_RESOLVE: u32 = 6;
pub const RM6_COMPUTE: u32 = 8;

pub const fn vsc_pipe_config(x: u32, y: u32, w: u32, h: u32) -> u32 {
    (x & 0x3ff) | (y & 0x3ff) << 10 | (w & 0x3f) << 20 | (h & 0x3f) << 26
}

pub const fn bin_data5_vsc_size(tiles: u32) -> u32 {
    (tiles & 0x3f) << 10
}

pub const fn bin_data5_vsc_n(slot: u32) -> u32 {
    (slot & 0x1f) << 22
}

pub const fn vsc_bin_count(nx: u32, ny: u32) -> u32 {
    (nx & 0x3ff) << 1 | (ny & 0x3ff) << 11
}

pub const VFD_MODE_CNTL_BINNING_PASS: u32 = 1;
pub const SET_MODE_BINNING: u32 = 1;
pub const RB_STENCIL_INFO_SEPARATE_STENCIL: u32 = 1;

/// `CP_MEM_TO_REG` flags: 32-bit transfer of one register.
pub const MEM_TO_REG_UNK31: u32 = 1 << 31;
pub const MEM_TO_REG_SHIFT_BY_2: u32 = 1 << 18;

pub const fn reg_cnt(reg: u32, cnt: u32) -> u32 {
    (reg & 0x3ffff) | (cnt & 0x3ff) << 19
}

// CP_COND_WRITE5 / CP_WAIT_REG_MEM.
pub const COND_FUNCTION_WRITE_EQ: u32 = 3;
pub const COND_FUNCTION_WRITE_GE: u32 = 6;
pub const COND_WRITE5_WRITE_MEMORY: u32 = 1 << 8;
pub const WAIT_REG_MEM_POLL_MEMORY: u32 = 1 << 4;

/// `CP_REG_RMW`: add the third word to the masked register.
pub const REG_RMW_SRC1_ADD: u32 = 1 << 31;
pub const fn reg_to_mem_0(reg: u32, cnt: u32) -> u32 {
    (reg & 0x3ffff) | (cnt & 0xfff) << 18
}

// CP_SET_DRAW_STATE.
pub const DRAW_STATE_DIRTY: u32 = 1 << 16;
pub const DRAW_STATE_DISABLE: u32 = 1 << 17;
pub const DRAW_STATE_DISABLE_ALL_GROUPS: u32 = 1 << 18;
pub const DRAW_STATE_BINNING: u32 = 1 << 20;
pub const DRAW_STATE_GMEM: u32 = 1 << 21;
pub const DRAW_STATE_SYSMEM: u32 = 1 << 22;

pub const fn draw_state_group(id: u32) -> u32 {
    (id & 0x1f) << 24
}

// Draw initiator.
pub const DI_SRC_SEL_DMA: u32 = 0;
pub const DI_SRC_SEL_AUTO_INDEX: u32 = 2;
pub const DI_SRC_SEL_AUTO_XFB: u32 = 3;
pub const DI_USE_VISIBILITY: u32 = 2 << 8;
pub const DI_GS_ENABLE: u32 = 1 << 16;
pub const DI_TESS_ENABLE: u32 = 1 << 17;

pub const fn draw_initiator(prim_type: u32, source: u32, index_size: u32, patch_type: u32) -> u32 {
    (prim_type & 0x3f) | (source & 0x3) << 6 | DI_USE_VISIBILITY | (index_size & 0x3) << 10
        | (patch_type & 0x3) << 12
}

// CP_DRAW_INDIRECT_MULTI opcodes.
pub const INDIRECT_OP_NORMAL: u32 = 2;
pub const INDIRECT_OP_INDEXED: u32 = 4;
pub const INDIRECT_OP_INDIRECT_COUNT: u32 = 6;
pub const INDIRECT_OP_INDIRECT_COUNT_INDEXED: u32 = 7;

pub const fn indirect_multi_1(opcode: u32, dst_off: u32) -> u32 {
    (opcode & 0xf) | (dst_off & 0x3fff) << 8
}

/// Local size field shared by HLSQ_CS_NDRANGE_0 and CP_EXEC_CS_INDIRECT_3.
pub const fn cs_local_size(size: [u32; 3]) -> u32 {
    (size[0].saturating_sub(1) & 0x3ff) << 2
        | (size[1].saturating_sub(1) & 0x3ff) << 12
        | (size[2].saturating_sub(1) & 0x3ff) << 22
}

pub const HLSQ_CS_NDRANGE_0_KERNELDIM_3: u32 = 3;

// CP_LOAD_STATE6.
pub const ST6_SHADER: u32 = 0;
pub const ST6_CONSTANTS: u32 = 1;
pub const SS6_DIRECT: u32 = 0;
pub const SS6_INDIRECT: u32 = 2;
pub const SB6_VS_SHADER: u32 = 8;
pub const SB6_HS_SHADER: u32 = 9;
pub const SB6_DS_SHADER: u32 = 10;
pub const SB6_GS_SHADER: u32 = 11;
pub const SB6_FS_SHADER: u32 = 12;
pub const SB6_CS_SHADER: u32 = 13;
pub const SB6_FS_TEX: u32 = 2;

pub const fn load_state6_0(dst_off: u32, state_type: u32, src: u32, block: u32, units: u32) -> u32 {
    (dst_off & 0x3fff) | (state_type & 0x3) << 14 | (src & 0x3) << 16 | (block & 0xf) << 18
        | (units & 0x3ff) << 22
}

// RB_BLIT_INFO.
pub const BLIT_INFO_UNK0: u32 = 1 << 0;
pub const BLIT_INFO_GMEM: u32 = 1 << 1;
pub const BLIT_INFO_SAMPLE_0: u32 = 1 << 2;

pub const fn blit_info_clear_mask(mask: u32) -> u32 {
    (mask & 0xf) << 4
}

/// `CP_BLIT` operation used for 2D clears and resolves.
pub const BLIT_OP_SCALE: u32 = 3;

// RB_2D_BLIT_CNTL / GRAS_2D_BLIT_CNTL.
pub const BLIT_CNTL_SOLID_COLOR: u32 = 1 << 7;

pub const fn blit_cntl(color_code: u32, clear_mask: u32, solid: bool) -> u32 {
    let solid = if solid { BLIT_CNTL_SOLID_COLOR } else { 0 };
    solid | (color_code & 0xff) << 8 | (clear_mask & 0xf) << 20
}

/// RB_2D_DST_INFO: format, tile mode, swap and UBWC flag.
pub const fn dst_2d_info(color_code: u32, tile_mode: u32, ubwc: bool) -> u32 {
    (color_code & 0xff) | (tile_mode & 0x3) << 8 | ((color_code >> 8) & 0x3) << 10
        | (ubwc as u32) << 12
}

/// SP_PS_2D_SRC_INFO for a 2D blit source.
pub const fn src_2d_info(color_code: u32, tile_mode: u32, samples: u32) -> u32 {
    (color_code & 0xff) | (tile_mode & 0x3) << 8 | ((color_code >> 8) & 0x3) << 10
        | (msaa_samples(samples) & 0x3) << 16
}

pub const fn src_2d_size(width: u32, height: u32) -> u32 {
    (width & 0x7fff) | (height & 0x7fff) << 15
}

pub const fn blit_dst_info(color_code: u32, tile_mode: u32, samples: u32) -> u32 {
    (tile_mode & 0x3) | (msaa_samples(samples) & 0x3) << 3 | (color_code & 0xff) << 7
        | ((color_code >> 8) & 0x3) << 15
}

// SP_PS_2D_SRC_INFO.
pub const PS_2D_SRC_SAMPLES_AVERAGE: u32 = 1 << 18;
pub const PS_2D_SRC_UNK20_UNK22: u32 = 1 << 20 | 1 << 22;

pub const TILE6_LINEAR: u32 = 0;
pub const TILE6_2: u32 = 2;
pub const TILE6_3: u32 = 3;

// Texture descriptor fields patched for input attachments.
pub const TEX_CONST_0_TILE_MODE_MASK: u32 = 0x3;
pub const TEX_CONST_0_FMT_SHIFT: u32 = 22;
pub const TEX_CONST_0_FMT_MASK: u32 = 0xff << 22;
pub const TEX_CONST_0_SWAP_MASK: u32 = 0x3 << 30;
pub const TEX_CONST_2_PITCH_SHIFT: u32 = 7;
pub const TEX_CONST_2_PITCH_MASK: u32 = 0x3f_ffff << 7;
pub const TEX_CONST_2_PITCHALIGN_MASK: u32 = 0xf;
pub const TEX_CONST_2_TYPE_2D: u32 = 1 << 29;
pub const TEX_CONST_5_DEPTH_1: u32 = 1 << 17;
pub const FMT6_8_UINT: u32 = 0x05;

// Depth/stencil control bits.
pub const RB_DEPTH_CNTL_Z_TEST_ENABLE: u32 = 1 << 0;
pub const RB_DEPTH_CNTL_Z_WRITE_ENABLE: u32 = 1 << 1;
pub const RB_DEPTH_CNTL_ZFUNC_SHIFT: u32 = 2;
pub const RB_DEPTH_CNTL_ZFUNC_MASK: u32 = 0x7 << 2;
pub const RB_DEPTH_CNTL_Z_READ_ENABLE: u32 = 1 << 6;
pub const RB_DEPTH_CNTL_Z_BOUNDS_ENABLE: u32 = 1 << 7;

pub const RB_STENCIL_CNTL_STENCIL_ENABLE: u32 = 1 << 0;
pub const RB_STENCIL_CNTL_STENCIL_ENABLE_BF: u32 = 1 << 1;
pub const RB_STENCIL_CNTL_STENCIL_READ: u32 = 1 << 2;
pub const RB_STENCIL_CNTL_FUNC_SHIFT: u32 = 8;
pub const RB_STENCIL_CNTL_FAIL_SHIFT: u32 = 11;
pub const RB_STENCIL_CNTL_ZPASS_SHIFT: u32 = 14;
pub const RB_STENCIL_CNTL_ZFAIL_SHIFT: u32 = 17;
pub const RB_STENCIL_CNTL_FUNC_BF_SHIFT: u32 = 20;
pub const RB_STENCIL_CNTL_FAIL_BF_SHIFT: u32 = 23;
pub const RB_STENCIL_CNTL_ZPASS_BF_SHIFT: u32 = 26;
pub const RB_STENCIL_CNTL_ZFAIL_BF_SHIFT: u32 = 29;

pub const GRAS_SU_CNTL_CULL_FRONT: u32 = 1 << 0;
pub const GRAS_SU_CNTL_CULL_BACK: u32 = 1 << 1;
pub const GRAS_SU_CNTL_FRONT_CW: u32 = 1 << 2;
pub const GRAS_SU_CNTL_LINEHALFWIDTH_SHIFT: u32 = 3;
pub const GRAS_SU_CNTL_LINEHALFWIDTH_MASK: u32 = 0xff << 3;
pub const GRAS_SU_CNTL_POLY_OFFSET: u32 = 1 << 11;

pub const PC_RASTER_CNTL_DISCARD: u32 = 1 << 2;
pub const VPC_UNKNOWN_9107_RASTER_DISCARD: u32 = 1 << 0;

pub const PC_PRIMITIVE_CNTL_0_RESTART: u32 = 1 << 0;
pub const PC_PRIMITIVE_CNTL_0_PROVOKING_VTX_LAST: u32 = 1 << 1;
pub const PC_PRIMITIVE_CNTL_0_TESS_UPPER_LEFT_DOMAIN_ORIGIN: u32 = 1 << 2;

// GRAS_LRZ_CNTL / RB_LRZ_CNTL.
pub const GRAS_LRZ_CNTL_ENABLE: u32 = 1 << 0;
pub const GRAS_LRZ_CNTL_LRZ_WRITE: u32 = 1 << 1;
pub const GRAS_LRZ_CNTL_GREATER: u32 = 1 << 2;
pub const GRAS_LRZ_CNTL_Z_TEST_ENABLE: u32 = 1 << 3;
pub const GRAS_LRZ_CNTL_Z_BOUNDS_ENABLE: u32 = 1 << 4;
pub const RB_LRZ_CNTL_ENABLE: u32 = 1 << 0;

/// GRAS_LRZ_BUFFER_PITCH: pitch in LRZ blocks, array pitch unused.
pub const fn lrz_buffer_pitch(pitch: u32) -> u32 {
    pitch & 0x7ff
}

/// Z test placement relative to the fragment shader.
pub const Z_MODE_EARLY: u32 = 0;
pub const Z_MODE_LATE: u32 = 1;
pub const Z_MODE_EARLY_LRZ_LATE: u32 = 2;

pub const fn msaa_samples(samples: u32) -> u32 {
    match samples {
        0 | 1 => 0,
        2 => 1,
        4 => 2,
        _ => 3,
    }
}

pub const MSAA_DISABLE: u32 = 1 << 2;

pub const fn rb_msaa_cntl(samples: u32) -> u32 {
    msaa_samples(samples) << 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_control_drops_alignment_bits() {
        assert_eq!(bin_control(64, 32, 0), 2 | 2 << 8);
        assert_eq!(
            bin_control(32, 16, BIN_CONTROL_BINNING_PASS),
            1 | 1 << 8 | BIN_CONTROL_BINNING_PASS
        );
    }

    #[test]
    fn pipe_config_packs_fields() {
        let v = vsc_pipe_config(3, 2, 4, 1);
        assert_eq!(v & 0x3ff, 3);
        assert_eq!((v >> 10) & 0x3ff, 2);
        assert_eq!((v >> 20) & 0x3f, 4);
        assert_eq!(v >> 26, 1);
    }
}
