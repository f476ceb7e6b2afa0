//! Command recording for a tile-based deferred renderer.
//!
//! A [`CommandBuffer`] records draws, dispatches, barriers and render passes into command
//! streams the GPU's command processor executes. Render passes are recorded once and replayed
//! per tile: the pass's draw stream is called from every tile's window, with loads, clears and
//! stores in render-mode conditional regions so the same stream also serves direct rendering to
//! system memory.
//!
//! Currently this crate provides:
//! - Cache-coherency tracking between producer and consumer access domains (see [`cache`]).
//! - Tile layout and GMEM partitioning (see [`tiling`], [`RenderPass`]).
//! - Render pass begin/next/end with GMEM or sysmem rendering and optional hardware binning.
//! - Draw assembly with draw-state groups, dynamic state and LRZ.
//! - Compute dispatch, transform feedback and pipeline barriers.

mod barrier;
mod blit;
mod cmd_buffer;
mod descriptor;
mod device;
mod draw;
mod dynamic;
mod error;
mod image;
mod lrz;
mod pass;
mod pipeline;
mod render_pass;
mod tile;
mod xfb;

pub mod cache;
pub mod config;
pub mod regs;
pub mod stats;
pub mod tiling;

pub use barrier::{Barrier, Event, ImageBarrier, ImageLayout, MemoryBarrier};
pub use cache::{AccessFlags, CacheState, FlushBits, PipelineStages};
pub use cmd_buffer::{
    CcuState, CommandBuffer, CommandBufferLevel, Dirty, IndexType, InheritanceInfo,
    PipelineBindPoint, RecordingState, UsageFlags, VertexBuffer, MAX_PUSH_CONSTANTS, MAX_VBS,
};
pub use config::{DebugFlags, DeviceConfig, DeviceInfo};
pub use descriptor::{DescriptorSet, DescriptorState, UboBinding, UboDescriptor, UboSource, MAX_SETS};
pub use device::{
    Device, ScratchBo, VscSetup, GLOBAL_CS_INDIRECT_XYZ, GLOBAL_FLUSH_BASE, GLOBAL_IOVA,
    GLOBAL_VSC_DRAW_OVERFLOW, GLOBAL_VSC_PRIM_OVERFLOW,
};
pub use draw::{IndirectArgs, IndirectCount};
pub use dynamic::{Viewport, MAX_SCISSORS, MAX_VIEWPORTS};
pub use error::{RecordError, Result};
pub use image::{Aspects, ClearValue, Format, ImageView, LrzBuffer, Plane};
pub use lrz::{LrzDirection, LrzState};
pub use pass::{
    AttachmentDescription, LoadOp, RenderPass, RenderPassDescription, StoreOp, Subpass,
    SubpassDependency, SubpassDescription, SubpassRef,
};
pub use pipeline::{
    CompareOp, ComputePipeline, CullMode, DrawStateGroup, DynamicSlot, DynamicStates,
    GraphicsPipeline, LrzForceDisable, LrzPipelineState, MaskedReg, PatchType, PrimitiveTopology,
    ProgramState, PushConstRange, ShaderStage, ShaderStages, StageConsts, StencilFaces, StencilOp,
    TessState, UboRange,
};
pub use stats::{RecordStats, RecordStatsSnapshot};
pub use tiling::{Extent, Framebuffer, Rect2D, TilingConfig};
pub use xfb::XfbBuffer;

pub use tbdr_cs::{CommandStream, DrawState, SubStreamPool};
