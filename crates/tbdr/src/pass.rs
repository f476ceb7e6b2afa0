//! Render pass description and the per-pass decisions made once at creation time: which
//! attachments live in GMEM and where, how many pixels a tile may hold, and which barriers run
//! at subpass boundaries.

use tracing::debug;

use crate::cache::{AccessFlags, PipelineStages};
use crate::config::DeviceInfo;
use crate::image::{Aspects, Format};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadOp {
    Load,
    Clear,
    #[default]
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreOp {
    Store,
    #[default]
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDescription {
    pub format: Format,
    pub samples: u32,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
}

impl AttachmentDescription {
    pub fn new(format: Format) -> Self {
        Self {
            format,
            samples: 1,
            load_op: LoadOp::DontCare,
            store_op: StoreOp::Store,
            stencil_load_op: LoadOp::DontCare,
            stencil_store_op: StoreOp::DontCare,
        }
    }

    pub fn with_ops(mut self, load_op: LoadOp, store_op: StoreOp) -> Self {
        self.load_op = load_op;
        self.store_op = store_op;
        self
    }

    pub fn with_stencil_ops(mut self, load_op: LoadOp, store_op: StoreOp) -> Self {
        self.stencil_load_op = load_op;
        self.stencil_store_op = store_op;
        self
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }
}

/// Attachment slots of one subpass. `None` marks an unused slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubpassDescription {
    pub input_attachments: Vec<Option<u32>>,
    pub color_attachments: Vec<Option<u32>>,
    /// Either empty or one entry per color attachment.
    pub resolve_attachments: Vec<Option<u32>>,
    pub depth_stencil_attachment: Option<u32>,
    pub view_mask: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpassRef {
    External,
    Index(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubpassDependency {
    pub src_subpass: SubpassRef,
    pub dst_subpass: SubpassRef,
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub by_region: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderPassDescription {
    pub attachments: Vec<AttachmentDescription>,
    pub subpasses: Vec<SubpassDescription>,
    pub dependencies: Vec<SubpassDependency>,
}

/// Synchronization applied at a subpass boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubpassBarrier {
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    /// Earlier sysmem clears wrote through the CCU incoherently.
    pub incoherent_ccu_color: bool,
    pub incoherent_ccu_depth: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassAttachment {
    pub format: Format,
    pub samples: u32,
    /// Bytes per pixel of the main plane in GMEM, samples included.
    pub cpp: u32,
    /// GMEM byte offset; `None` when the attachment is never rendered to in GMEM.
    pub gmem_offset: Option<u32>,
    pub gmem_offset_stencil: Option<u32>,
    pub clear_mask: Aspects,
    pub load: bool,
    pub store: bool,
    pub load_stencil: bool,
    pub store_stencil: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputAttachment {
    pub attachment: Option<u32>,
    /// The attachment is rendered in GMEM, so GMEM-mode reads must be redirected there.
    pub patch_input_gmem: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subpass {
    pub input_attachments: Vec<InputAttachment>,
    pub color_attachments: Vec<Option<u32>>,
    pub resolve_attachments: Vec<Option<u32>>,
    pub depth_stencil_attachment: Option<u32>,
    pub samples: u32,
    /// One bit per sRGB color attachment slot.
    pub srgb_cntl: u32,
    pub multiview_mask: u32,
    pub start_barrier: SubpassBarrier,
    /// A color attachment is also read as an input attachment.
    pub feedback_loop_color: bool,
    /// The depth/stencil attachment is also read as an input attachment.
    pub feedback_loop_ds: bool,
    /// An input attachment was written by rendering earlier in the pass, so UCHE may hold
    /// stale lines of it.
    pub feedback_invalidate: bool,
}

impl Subpass {
    pub fn has_feedback_loop(&self) -> bool {
        self.feedback_loop_color || self.feedback_loop_ds
    }

    /// Color attachment that resolve slot `i` reads from.
    pub fn attachment_to_resolve(&self, i: usize) -> Option<u32> {
        self.color_attachments.get(i).copied().flatten()
    }
}

/// An immutable render pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPass {
    pub attachments: Vec<PassAttachment>,
    pub subpasses: Vec<Subpass>,
    pub end_barrier: SubpassBarrier,
    /// Maximum pixels per tile; zero means the pass cannot be rendered in GMEM at all.
    pub gmem_pixels: u32,
    pub tile_align_w: u32,
}

impl RenderPass {
    pub fn new(info: &DeviceInfo, desc: &RenderPassDescription) -> Self {
        assert!(!desc.subpasses.is_empty(), "render pass needs at least one subpass");

        let mut attachments: Vec<PassAttachment> =
            desc.attachments.iter().map(new_attachment).collect();

        let mut subpasses = Vec::with_capacity(desc.subpasses.len());
        let mut written = vec![false; attachments.len()];
        let mut multiview = false;

        for sp in &desc.subpasses {
            let mut samples = 0;
            let mut srgb_cntl = 0;

            for (i, a) in sp.color_attachments.iter().enumerate() {
                let Some(a) = *a else { continue };
                let att = &mut attachments[a as usize];
                att.gmem_offset = Some(0);
                samples = samples.max(att.samples);
                if att.format.is_srgb() {
                    srgb_cntl |= 1 << i;
                }
            }
            if let Some(a) = sp.depth_stencil_attachment {
                let att = &mut attachments[a as usize];
                att.gmem_offset = Some(0);
                samples = samples.max(att.samples);
            }

            let is_color = |a: u32| sp.color_attachments.contains(&Some(a));
            let is_ds = |a: u32| sp.depth_stencil_attachment == Some(a);

            let mut feedback_loop_color = false;
            let mut feedback_loop_ds = false;
            let mut feedback_invalidate = false;
            for a in sp.input_attachments.iter().flatten().copied() {
                feedback_loop_color |= is_color(a);
                feedback_loop_ds |= is_ds(a);
                feedback_invalidate |= written[a as usize] || is_color(a) || is_ds(a);
            }

            for a in sp
                .color_attachments
                .iter()
                .chain(std::iter::once(&sp.depth_stencil_attachment))
                .flatten()
            {
                written[*a as usize] = true;
            }

            multiview |= sp.view_mask != 0;

            subpasses.push(Subpass {
                input_attachments: Vec::new(),
                color_attachments: sp.color_attachments.clone(),
                resolve_attachments: sp.resolve_attachments.clone(),
                depth_stencil_attachment: sp.depth_stencil_attachment,
                samples: samples.max(1),
                srgb_cntl,
                multiview_mask: sp.view_mask,
                start_barrier: SubpassBarrier::default(),
                feedback_loop_color,
                feedback_loop_ds,
                feedback_invalidate,
            });
        }

        // Attachments never rendered to are not loaded or cleared through GMEM.
        for att in attachments.iter_mut().filter(|a| a.gmem_offset.is_none()) {
            att.clear_mask = Aspects::empty();
            att.load = false;
            att.load_stencil = false;
        }

        for (sp, desc_sp) in subpasses.iter_mut().zip(&desc.subpasses) {
            sp.input_attachments = desc_sp
                .input_attachments
                .iter()
                .map(|a| InputAttachment {
                    attachment: *a,
                    patch_input_gmem: a.is_some_and(|a| attachments[a as usize].gmem_offset.is_some()),
                })
                .collect();
        }

        let mut pass = RenderPass {
            attachments,
            subpasses,
            end_barrier: SubpassBarrier::default(),
            gmem_pixels: 0,
            tile_align_w: info.tile_align_w,
        };
        pass.gmem_config(info);

        if multiview {
            debug!("multiview render pass, GMEM disabled");
            pass.gmem_pixels = 0;
        }

        for dep in &desc.dependencies {
            pass.add_dependency(dep);
        }
        pass.add_implicit_dependencies(desc);

        // Sysmem clears of the first subpass go through the CCU without coherency.
        let clears = pass
            .attachments
            .iter()
            .fold(Aspects::empty(), |acc, a| acc | a.clear_mask);
        let first = &mut pass.subpasses[0].start_barrier;
        first.incoherent_ccu_color |= clears.contains(Aspects::COLOR);
        first.incoherent_ccu_depth |= clears.intersects(Aspects::DEPTH | Aspects::STENCIL);

        debug!(
            attachments = pass.attachments.len(),
            subpasses = pass.subpasses.len(),
            gmem_pixels = pass.gmem_pixels,
            "render pass created"
        );
        pass
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    pub fn subpass_count(&self) -> usize {
        self.subpasses.len()
    }

    pub fn gmem_capable(&self) -> bool {
        self.gmem_pixels != 0
    }

    /// Split the GMEM budget between the attachments rendered in GMEM, in declaration order,
    /// proportionally to their bytes per pixel.
    ///
    /// If an attachment cannot be placed the pass is left without a GMEM configuration.
    fn gmem_config(&mut self, info: &DeviceInfo) {
        let mut block_align_shift = 3u32;
        let mut tile_align_w = info.tile_align_w;

        let mut cpp_total = 0;
        for att in self.attachments.iter().filter(|a| a.gmem_offset.is_some()) {
            let mut cpp1 = att.cpp == 1;
            cpp_total += att.cpp;
            if att.format == Format::D32SfloatS8Uint {
                cpp1 = att.samples == 1;
                cpp_total += att.samples;
            }
            // Single-byte attachments are sampled as input attachments with a 64-aligned pitch.
            if cpp1 && tile_align_w % 64 != 0 {
                tile_align_w *= 2;
                block_align_shift = block_align_shift.saturating_sub(1);
            }
        }
        self.tile_align_w = tile_align_w;

        if cpp_total == 0 {
            // Anything non-zero works; there is nothing to store.
            self.gmem_pixels = 1024 * 1024;
            return;
        }

        let gmem_align = (1 << block_align_shift) * tile_align_w * info.tile_align_h;
        let mut gmem_blocks = info.ccu_offset_gmem / gmem_align;
        let mut offset = 0;
        let mut pixels = u32::MAX;

        for att in self.attachments.iter_mut() {
            if att.gmem_offset.is_none() {
                continue;
            }
            att.gmem_offset = Some(offset);

            let align = (att.cpp >> block_align_shift).max(1);
            let nblocks = ((gmem_blocks * att.cpp / cpp_total) & !(align - 1)).max(align);
            if nblocks > gmem_blocks {
                debug!(gmem_blocks, nblocks, "attachment does not fit in GMEM");
                return;
            }
            gmem_blocks -= nblocks;
            cpp_total -= att.cpp;
            offset += nblocks * gmem_align;
            pixels = pixels.min(nblocks * gmem_align / att.cpp);

            if att.format == Format::D32SfloatS8Uint {
                att.gmem_offset_stencil = Some(offset);
                let nblocks = gmem_blocks * att.samples / cpp_total;
                if nblocks > gmem_blocks {
                    return;
                }
                gmem_blocks -= nblocks;
                cpp_total -= att.samples;
                offset += nblocks * gmem_align;
                pixels = pixels.min(nblocks * gmem_align / att.samples);
            }
        }

        self.gmem_pixels = pixels;
    }

    fn add_dependency(&mut self, dep: &SubpassDependency) {
        if dependency_breaks_gmem(dep) {
            debug!(?dep, "dependency is not framebuffer-local, GMEM disabled");
            self.gmem_pixels = 0;
        }

        // Self-dependencies only allow barriers inside the subpass; they are handled when the
        // barrier is recorded.
        if dep.src_subpass == dep.dst_subpass {
            return;
        }

        let last = self.subpasses.len() as u32 - 1;
        let dst_stages_bottom = dep.dst_stages == PipelineStages::BOTTOM_OF_PIPE;

        let src_barrier = match dep.src_subpass {
            SubpassRef::External => &mut self.subpasses[0].start_barrier,
            SubpassRef::Index(i) if i >= last => &mut self.end_barrier,
            SubpassRef::Index(i) => &mut self.subpasses[i as usize + 1].start_barrier,
        };
        if !dst_stages_bottom {
            src_barrier.src_stages |= dep.src_stages;
        }
        src_barrier.src_access |= dep.src_access;

        let dst_barrier = match dep.dst_subpass {
            SubpassRef::External => &mut self.end_barrier,
            SubpassRef::Index(i) => &mut self.subpasses[i as usize].start_barrier,
        };
        dst_barrier.dst_access |= dep.dst_access;
        dst_barrier.dst_stages |= dep.dst_stages;
    }

    /// Without explicit external dependencies, attachment accesses still have to be ordered
    /// against whatever ran before and after the pass.
    fn add_implicit_dependencies(&mut self, desc: &RenderPassDescription) {
        if desc.attachments.is_empty() {
            return;
        }
        let has_src_external = desc
            .dependencies
            .iter()
            .any(|d| d.src_subpass == SubpassRef::External);
        let has_dst_external = desc
            .dependencies
            .iter()
            .any(|d| d.dst_subpass == SubpassRef::External);

        let attachment_access = AccessFlags::INPUT_ATTACHMENT_READ
            | AccessFlags::COLOR_ATTACHMENT_READ
            | AccessFlags::COLOR_ATTACHMENT_WRITE
            | AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
            | AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;

        if !has_src_external {
            self.add_dependency(&SubpassDependency {
                src_subpass: SubpassRef::External,
                dst_subpass: SubpassRef::Index(0),
                src_stages: PipelineStages::TOP_OF_PIPE,
                dst_stages: PipelineStages::ALL_COMMANDS,
                src_access: AccessFlags::empty(),
                dst_access: attachment_access,
                by_region: false,
            });
        }
        if !has_dst_external {
            self.add_dependency(&SubpassDependency {
                src_subpass: SubpassRef::Index(self.subpasses.len() as u32 - 1),
                dst_subpass: SubpassRef::External,
                src_stages: PipelineStages::ALL_COMMANDS,
                dst_stages: PipelineStages::BOTTOM_OF_PIPE,
                src_access: AccessFlags::COLOR_ATTACHMENT_WRITE
                    | AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access: AccessFlags::empty(),
                by_region: false,
            });
        }
    }
}

fn new_attachment(desc: &AttachmentDescription) -> PassAttachment {
    let format = desc.format;
    let samples = desc.samples.max(1);
    let cpp = if format == Format::D32SfloatS8Uint {
        4 * samples
    } else {
        format.block_size() * samples
    };

    // Stencil-only formats use the stencil ops for the main plane.
    let (load_op, store_op) = if format == Format::S8Uint {
        (desc.stencil_load_op, desc.stencil_store_op)
    } else {
        (desc.load_op, desc.store_op)
    };

    let mut clear_mask = Aspects::empty();
    if load_op == LoadOp::Clear {
        clear_mask = format.aspects() & (Aspects::COLOR | Aspects::DEPTH);
        if format == Format::S8Uint {
            clear_mask = Aspects::STENCIL;
        }
    }

    let mut att = PassAttachment {
        format,
        samples,
        cpp,
        gmem_offset: None,
        gmem_offset_stencil: None,
        clear_mask,
        load: load_op == LoadOp::Load,
        store: store_op == StoreOp::Store,
        load_stencil: false,
        store_stencil: false,
    };

    if format.has_stencil() && format != Format::S8Uint {
        if desc.stencil_load_op == LoadOp::Clear {
            att.clear_mask |= Aspects::STENCIL;
        }
        att.load_stencil = desc.stencil_load_op == LoadOp::Load;
        att.store_stencil = desc.stencil_store_op == StoreOp::Store;
    }
    att
}

/// A dependency between two subpasses can only be honored per tile when both sides are
/// framebuffer-local and the dependency is by-region.
fn dependency_breaks_gmem(dep: &SubpassDependency) -> bool {
    if dep.src_subpass == SubpassRef::External || dep.dst_subpass == SubpassRef::External {
        return false;
    }
    !(dep.src_stages - PipelineStages::FRAMEBUFFER_SPACE).is_empty()
        || !(dep.dst_stages - PipelineStages::FRAMEBUFFER_SPACE).is_empty()
        || !dep.by_region
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn color_pass(formats: &[Format]) -> RenderPassDescription {
        RenderPassDescription {
            attachments: formats.iter().map(|f| AttachmentDescription::new(*f)).collect(),
            subpasses: vec![SubpassDescription {
                color_attachments: (0..formats.len() as u32).map(Some).collect(),
                ..Default::default()
            }],
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn single_rgba8_attachment_gets_whole_budget() {
        let info = DeviceInfo::default();
        let pass = RenderPass::new(&info, &color_pass(&[Format::R8G8B8A8Unorm]));
        assert_eq!(pass.attachments[0].gmem_offset, Some(0));
        assert_eq!(pass.gmem_pixels, 131_072);
        assert_eq!(pass.tile_align_w, 32);
    }

    #[test]
    fn partitions_are_disjoint_and_in_declaration_order() {
        let info = DeviceInfo::default();
        let pass = RenderPass::new(
            &info,
            &color_pass(&[Format::R8Unorm, Format::R8G8B8A8Unorm, Format::R16G16B16A16Sfloat]),
        );
        // One single-byte attachment widens the tile alignment.
        assert_eq!(pass.tile_align_w, 64);

        let mut end = 0;
        for att in &pass.attachments {
            let offset = att.gmem_offset.unwrap();
            assert!(offset >= end);
            end = offset + pass.gmem_pixels * att.cpp;
        }
        assert!(end <= info.ccu_offset_gmem);
    }

    #[test]
    fn narrow_tile_alignment_widens_without_underflow() {
        let info = DeviceInfo {
            tile_align_w: 4,
            ..DeviceInfo::default()
        };
        let pass = RenderPass::new(&info, &color_pass(&[Format::R8Unorm; 4]));
        assert_eq!(pass.tile_align_w, 64);
        assert!(pass.gmem_capable());
    }

    #[test]
    fn separate_stencil_gets_its_own_partition() {
        let info = DeviceInfo::default();
        let desc = RenderPassDescription {
            attachments: vec![AttachmentDescription::new(Format::D32SfloatS8Uint)],
            subpasses: vec![SubpassDescription {
                depth_stencil_attachment: Some(0),
                ..Default::default()
            }],
            dependencies: Vec::new(),
        };
        let pass = RenderPass::new(&info, &desc);
        let att = &pass.attachments[0];
        let depth = att.gmem_offset.unwrap();
        let stencil = att.gmem_offset_stencil.unwrap();
        assert!(stencil > depth);
        assert!(stencil - depth >= pass.gmem_pixels * att.cpp);
        assert!(stencil + pass.gmem_pixels * att.samples <= info.ccu_offset_gmem);
    }

    #[test]
    fn no_attachments_still_tiles() {
        let info = DeviceInfo::default();
        let desc = RenderPassDescription {
            attachments: Vec::new(),
            subpasses: vec![SubpassDescription::default()],
            dependencies: Vec::new(),
        };
        assert_eq!(RenderPass::new(&info, &desc).gmem_pixels, 1024 * 1024);
    }

    #[test]
    fn non_local_dependency_disables_gmem() {
        let info = DeviceInfo::default();
        let mut desc = color_pass(&[Format::R8G8B8A8Unorm]);
        desc.subpasses.push(desc.subpasses[0].clone());
        desc.dependencies.push(SubpassDependency {
            src_subpass: SubpassRef::Index(0),
            dst_subpass: SubpassRef::Index(1),
            src_stages: PipelineStages::FRAGMENT_SHADER,
            dst_stages: PipelineStages::VERTEX_SHADER,
            src_access: AccessFlags::SHADER_WRITE,
            dst_access: AccessFlags::SHADER_READ,
            by_region: false,
        });
        let pass = RenderPass::new(&info, &desc);
        assert!(!pass.gmem_capable());
        assert_eq!(pass.subpasses[1].start_barrier.src_stages, PipelineStages::FRAGMENT_SHADER);
        assert_eq!(pass.subpasses[1].start_barrier.dst_access, AccessFlags::SHADER_READ);
    }

    #[test]
    fn by_region_framebuffer_dependency_keeps_gmem() {
        let info = DeviceInfo::default();
        let mut desc = color_pass(&[Format::R8G8B8A8Unorm]);
        desc.subpasses.push(desc.subpasses[0].clone());
        desc.dependencies.push(SubpassDependency {
            src_subpass: SubpassRef::Index(0),
            dst_subpass: SubpassRef::Index(1),
            src_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            dst_stages: PipelineStages::FRAGMENT_SHADER,
            src_access: AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access: AccessFlags::INPUT_ATTACHMENT_READ,
            by_region: true,
        });
        assert!(RenderPass::new(&info, &desc).gmem_capable());
    }

    #[test]
    fn input_attachment_feedback_is_detected() {
        let info = DeviceInfo::default();
        let desc = RenderPassDescription {
            attachments: vec![
                AttachmentDescription::new(Format::R8G8B8A8Unorm),
                AttachmentDescription::new(Format::R8G8B8A8Unorm),
            ],
            subpasses: vec![
                SubpassDescription {
                    color_attachments: vec![Some(0)],
                    ..Default::default()
                },
                SubpassDescription {
                    input_attachments: vec![Some(0)],
                    color_attachments: vec![Some(1)],
                    ..Default::default()
                },
            ],
            dependencies: Vec::new(),
        };
        let pass = RenderPass::new(&info, &desc);
        assert!(!pass.subpasses[0].feedback_invalidate);
        assert!(pass.subpasses[1].feedback_invalidate);
        assert!(!pass.subpasses[1].has_feedback_loop());
        assert!(pass.subpasses[1].input_attachments[0].patch_input_gmem);
    }

    #[test]
    fn unused_attachments_are_not_loaded() {
        let info = DeviceInfo::default();
        let desc = RenderPassDescription {
            attachments: vec![
                AttachmentDescription::new(Format::R8G8B8A8Unorm).with_ops(LoadOp::Clear, StoreOp::Store),
                AttachmentDescription::new(Format::R8G8B8A8Unorm).with_ops(LoadOp::Load, StoreOp::Store),
            ],
            subpasses: vec![SubpassDescription {
                color_attachments: vec![Some(0)],
                resolve_attachments: vec![Some(1)],
                ..Default::default()
            }],
            dependencies: Vec::new(),
        };
        let pass = RenderPass::new(&info, &desc);
        assert_eq!(pass.attachments[0].clear_mask, Aspects::COLOR);
        assert_eq!(pass.attachments[1].gmem_offset, None);
        assert!(!pass.attachments[1].load);
        assert!(pass.subpasses[0].start_barrier.incoherent_ccu_color);
    }
}
