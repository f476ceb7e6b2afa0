//! Tile and visibility-pipe layout for a framebuffer.

use std::sync::Arc;

use tracing::debug;

use crate::config::{DebugFlags, DeviceInfo, MAX_VSC_PIPES};
use crate::image::ImageView;
use crate::pass::RenderPass;
use crate::regs::{bin_data5_vsc_size, vsc_pipe_config};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u32 {
        self.width * self.height
    }
}

/// A pixel rectangle, used for render areas and scissors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect2D {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect2D {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn from_extent(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Tiling of a framebuffer for one render pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingConfig {
    /// Size of every tile except possibly the last row and column.
    pub tile0: Extent,
    pub tile_count: Extent,
    /// Tiles per pipe, except possibly the last row and column of pipes.
    pub pipe0: Extent,
    pub pipe_count: Extent,
    pub pipe_config: [u32; MAX_VSC_PIPES as usize],
    pub pipe_sizes: [u32; MAX_VSC_PIPES as usize],
}

impl TilingConfig {
    pub fn new(info: &DeviceInfo, debug: DebugFlags, pass: &RenderPass, width: u32, height: u32) -> Self {
        let (tile0, tile_count) = tile_layout(info, debug, pass, width, height);
        let (pipe0, pipe_count) = pipe_layout(tile_count);

        let mut config = TilingConfig {
            tile0,
            tile_count,
            pipe0,
            pipe_count,
            pipe_config: [0; MAX_VSC_PIPES as usize],
            pipe_sizes: [0; MAX_VSC_PIPES as usize],
        };
        config.fill_pipes();
        debug!(
            ?tile0,
            ?tile_count,
            ?pipe0,
            ?pipe_count,
            "tiling configured"
        );
        config
    }

    pub fn used_pipe_count(&self) -> u32 {
        self.pipe_count.area()
    }

    fn fill_pipes(&mut self) {
        let last_pipe = Extent::new(
            (self.tile_count.width - 1) % self.pipe0.width + 1,
            (self.tile_count.height - 1) % self.pipe0.height + 1,
        );

        for y in 0..self.pipe_count.height {
            for x in 0..self.pipe_count.width {
                let pipe_x = self.pipe0.width * x;
                let pipe_y = self.pipe0.height * y;
                let pipe_w = if x == self.pipe_count.width - 1 {
                    last_pipe.width
                } else {
                    self.pipe0.width
                };
                let pipe_h = if y == self.pipe_count.height - 1 {
                    last_pipe.height
                } else {
                    self.pipe0.height
                };
                let n = (self.pipe_count.width * y + x) as usize;
                self.pipe_config[n] = vsc_pipe_config(pipe_x, pipe_y, pipe_w, pipe_h);
                self.pipe_sizes[n] = bin_data5_vsc_size(pipe_w * pipe_h);
            }
        }
    }
}

fn align(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

fn tile_layout(
    info: &DeviceInfo,
    debug: DebugFlags,
    pass: &RenderPass,
    width: u32,
    height: u32,
) -> (Extent, Extent) {
    let align_w = pass.tile_align_w;
    let align_h = info.tile_align_h;

    let mut count = Extent::new(1, 1);
    let mut tile0 = Extent::new(align(width, align_w), align(height, align_h));

    // Rendered directly to memory; no point in a real layout.
    if pass.gmem_pixels == 0 {
        return (tile0, count);
    }

    if debug.contains(DebugFlags::FORCEBIN) {
        count = Extent::new(2, 2);
        tile0 = Extent::new(
            align(width.div_ceil(2), align_w),
            align(height.div_ceil(2), align_h),
        );
    }

    while tile0.width > info.tile_max_w {
        count.width += 1;
        tile0.width = align(width.div_ceil(count.width), align_w);
    }
    while tile0.height > info.tile_max_h {
        count.height += 1;
        tile0.height = align(height.div_ceil(count.height), align_h);
    }

    // Split along the longer side until a tile fits in GMEM.
    while tile0.area() > pass.gmem_pixels {
        if tile0.width > align_w.max(tile0.height) {
            count.width += 1;
            tile0.width = align(width.div_ceil(count.width), align_w);
        } else if tile0.height > align_h {
            count.height += 1;
            tile0.height = align(height.div_ceil(count.height), align_h);
        } else if tile0.width > align_w {
            count.width += 1;
            tile0.width = align(width.div_ceil(count.width), align_w);
        } else {
            // Minimum-size tiles still do not fit; render passes using this framebuffer fall
            // back to sysmem.
            break;
        }
    }

    (tile0, count)
}

fn pipe_layout(tile_count: Extent) -> (Extent, Extent) {
    let mut pipe0 = Extent::new(1, 1);
    let mut count = tile_count;

    while count.area() > MAX_VSC_PIPES {
        if pipe0.width < pipe0.height {
            pipe0.width += 1;
            count.width = tile_count.width.div_ceil(pipe0.width);
        } else {
            pipe0.height += 1;
            count.height = tile_count.height.div_ceil(pipe0.height);
        }
    }
    (pipe0, count)
}

/// A framebuffer bound to a render pass, with its tiling precomputed.
#[derive(Debug, Clone)]
pub struct Framebuffer {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub attachments: Vec<Arc<ImageView>>,
    pub tiling: TilingConfig,
}

impl Framebuffer {
    pub fn new(
        info: &DeviceInfo,
        debug: DebugFlags,
        pass: &RenderPass,
        attachments: Vec<Arc<ImageView>>,
        width: u32,
        height: u32,
        layers: u32,
    ) -> Self {
        assert_eq!(
            attachments.len(),
            pass.attachment_count(),
            "framebuffer attachment count does not match the render pass"
        );
        Self {
            width,
            height,
            layers: layers.max(1),
            attachments,
            tiling: TilingConfig::new(info, debug, pass, width, height),
        }
    }

    /// Whether a tile of this framebuffer fits the pass's GMEM budget.
    pub fn fits_gmem(&self, pass: &RenderPass) -> bool {
        self.tiling.tile0.area() <= pass.gmem_pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Format;
    use crate::pass::{AttachmentDescription, RenderPassDescription, SubpassDescription};
    use pretty_assertions::assert_eq;

    fn rgba_pass(info: &DeviceInfo, count: u32) -> RenderPass {
        let desc = RenderPassDescription {
            attachments: (0..count)
                .map(|_| AttachmentDescription::new(Format::R32G32B32A32Sfloat))
                .collect(),
            subpasses: vec![SubpassDescription {
                color_attachments: (0..count).map(Some).collect(),
                ..Default::default()
            }],
            dependencies: Vec::new(),
        };
        RenderPass::new(info, &desc)
    }

    #[test]
    fn small_framebuffer_is_one_tile() {
        let info = DeviceInfo::default();
        let desc = RenderPassDescription {
            attachments: vec![AttachmentDescription::new(Format::R8G8B8A8Unorm)],
            subpasses: vec![SubpassDescription {
                color_attachments: vec![Some(0)],
                ..Default::default()
            }],
            dependencies: Vec::new(),
        };
        let pass = RenderPass::new(&info, &desc);
        let tiling = TilingConfig::new(&info, DebugFlags::empty(), &pass, 256, 256);
        assert_eq!(tiling.tile0, Extent::new(256, 256));
        assert_eq!(tiling.tile_count, Extent::new(1, 1));
        assert_eq!(tiling.pipe0, Extent::new(1, 1));
        assert_eq!(tiling.pipe_count, Extent::new(1, 1));
        assert_eq!(tiling.pipe_config[0], vsc_pipe_config(0, 0, 1, 1));
        assert_eq!(tiling.pipe_config[1], 0);
    }

    #[test]
    fn large_framebuffer_respects_every_limit() {
        let info = DeviceInfo::default();
        let pass = rgba_pass(&info, 4);
        for (w, h) in [(1920, 1080), (4096, 4096), (333, 17), (16384, 64)] {
            let t = TilingConfig::new(&info, DebugFlags::empty(), &pass, w, h);
            assert!(t.tile0.width * t.tile_count.width >= w, "{w}x{h}");
            assert!(t.tile0.height * t.tile_count.height >= h, "{w}x{h}");
            assert!(t.tile0.area() <= pass.gmem_pixels, "{w}x{h}");
            assert!(t.tile0.width <= info.tile_max_w);
            assert!(t.tile0.height <= info.tile_max_h);
            assert_eq!(t.tile0.width % pass.tile_align_w, 0);
            assert_eq!(t.tile0.height % info.tile_align_h, 0);
            assert!(t.used_pipe_count() <= MAX_VSC_PIPES);
            assert!(t.pipe0.width * t.pipe_count.width >= t.tile_count.width);
            assert!(t.pipe0.height * t.pipe_count.height >= t.tile_count.height);
        }
    }

    #[test]
    fn forcebin_starts_from_quadrants() {
        let info = DeviceInfo::default();
        let pass = rgba_pass(&info, 1);
        let t = TilingConfig::new(&info, DebugFlags::FORCEBIN, &pass, 64, 64);
        assert_eq!(t.tile_count, Extent::new(2, 2));
        assert_eq!(t.tile0, Extent::new(32, 32));
    }

    #[test]
    fn last_pipe_covers_remaining_tiles() {
        let (pipe0, count) = pipe_layout(Extent::new(7, 6));
        assert_eq!(count.area(), 21);
        assert_eq!(pipe0, Extent::new(1, 2));
        assert_eq!(count, Extent::new(7, 3));

        let (pipe0, count) = pipe_layout(Extent::new(9, 9));
        assert!(count.area() <= MAX_VSC_PIPES);
        assert!(pipe0.width * count.width >= 9);
    }
}
