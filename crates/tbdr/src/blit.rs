//! Attachment clears, loads, stores and resolves.
//!
//! Two engines move attachment data:
//! - the event blitter (`BLIT` event) copies between GMEM and memory and clears GMEM. It works
//!   on the aligned blit scissor and can only resolve a few formats on the way out.
//! - the 2D engine (`CP_BLIT`) clears and copies memory, and reads GMEM directly when the event
//!   blitter cannot store an unaligned render area.

use tbdr_cs::{Emit, Opcode, VgtEvent};
use tracing::debug;

use crate::cache::{emit_event, FlushContext};
use crate::config::DeviceInfo;
use crate::image::{Aspects, ClearValue, Format, ImageView, Plane};
use crate::pass::PassAttachment;
use crate::regs::*;
use crate::tiling::{Rect2D, TilingConfig};

fn view_tile_mode(view: &ImageView) -> u32 {
    if view.ubwc_enabled() {
        TILE6_3
    } else {
        TILE6_LINEAR
    }
}

/// Components written when clearing `aspects` of `format`.
pub(crate) fn component_mask(format: Format, aspects: Aspects) -> u32 {
    if format != Format::D24UnormS8Uint {
        return 0xf;
    }
    let mut mask = 0;
    if aspects.contains(Aspects::DEPTH) {
        mask |= 0x7;
    }
    if aspects.contains(Aspects::STENCIL) {
        mask |= 0x8;
    }
    mask
}

/// The solid color the 2D engine writes for `value`. Depth is given per component, not packed.
pub(crate) fn solid_clear_value(format: Format, value: ClearValue) -> [u32; 4] {
    match value {
        ClearValue::Color(words) => words,
        ClearValue::DepthStencil { depth, stencil } => match format {
            Format::X8D24Unorm | Format::D24UnormS8Uint => {
                let z24 = (depth.clamp(0.0, 1.0) * 16_777_215.0).round() as u32;
                [z24 & 0xff, (z24 >> 8) & 0xff, z24 >> 16, stencil & 0xff]
            }
            Format::S8Uint => [stencil & 0xff, 0, 0, 0],
            _ => [depth.clamp(0.0, 1.0).to_bits(), 0, 0, 0],
        },
    }
}

fn r2d_setup(cs: &mut impl Emit, format: Format, aspects: Aspects, solid: bool) {
    let cntl = blit_cntl(format.color_code(), component_mask(format, aspects), solid);
    cs.emit_write_reg(RB_2D_BLIT_CNTL, cntl);
    cs.emit_write_reg(GRAS_2D_BLIT_CNTL, cntl);
}

/// Destination rectangle, and the matching source origin for copies.
fn r2d_coords(cs: &mut impl Emit, dst: Rect2D, src: Option<(u32, u32)>) {
    let w = dst.width.saturating_sub(1);
    let h = dst.height.saturating_sub(1);
    cs.emit_regs(GRAS_2D_DST_TL, &[xy(dst.x, dst.y), xy(dst.x + w, dst.y + h)]);
    if let Some((x, y)) = src {
        cs.emit_regs(GRAS_2D_SRC_TL_X, &[x, x + w, y, y + h]);
    }
}

fn r2d_dst(cs: &mut impl Emit, format: Format, plane: &Plane, flags: [u32; 3], tile_mode: u32) {
    let ubwc = tile_mode == TILE6_3;
    let [lo, hi] = lo_hi(plane.iova);
    cs.emit_regs(
        RB_2D_DST_INFO,
        &[dst_2d_info(format.color_code(), tile_mode, ubwc), lo, hi, plane.pitch],
    );
    cs.emit_regs(RB_2D_DST_FLAGS, &flags);
}

struct Source2D {
    format: Format,
    samples: u32,
    tile_mode: u32,
    iova: u64,
    pitch: u32,
    width: u32,
    height: u32,
}

fn r2d_src(cs: &mut impl Emit, src: &Source2D) {
    let mut info =
        src_2d_info(src.format.color_code(), src.tile_mode, src.samples) | PS_2D_SRC_UNK20_UNK22;
    if src.samples > 1 && !src.format.is_depth_or_stencil() {
        info |= PS_2D_SRC_SAMPLES_AVERAGE;
    }
    let [lo, hi] = lo_hi(src.iova);
    cs.emit_regs(
        SP_PS_2D_SRC_INFO,
        &[info, src_2d_size(src.width, src.height), lo, hi, src.pitch],
    );
}

fn r2d_run(cs: &mut impl Emit) {
    cs.emit_pkt7(Opcode::Blit, 1);
    cs.emit(BLIT_OP_SCALE);
}

/// Fill a linear `width` x `height` surface with a solid value.
#[allow(clippy::too_many_arguments)]
pub(crate) fn emit_solid_clear_2d(
    cs: &mut impl Emit,
    format: Format,
    aspects: Aspects,
    solid: [u32; 4],
    iova: u64,
    pitch: u32,
    width: u32,
    height: u32,
) {
    r2d_setup(cs, format, aspects, true);
    r2d_coords(cs, Rect2D::from_extent(width, height), None);
    cs.emit_regs(RB_2D_SRC_SOLID_C0, &solid);
    let plane = Plane {
        iova,
        pitch,
        layer_size: pitch * height,
    };
    r2d_dst(cs, format, &plane, [0; 3], TILE6_LINEAR);
    r2d_run(cs);
}

#[allow(clippy::too_many_arguments)]
fn clear_plane_2d(
    cs: &mut impl Emit,
    format: Format,
    aspects: Aspects,
    plane: &Plane,
    flags: [u32; 3],
    tile_mode: u32,
    value: ClearValue,
    area: Rect2D,
    layers: u32,
) {
    r2d_setup(cs, format, aspects, true);
    r2d_coords(cs, area, None);
    cs.emit_regs(RB_2D_SRC_SOLID_C0, &solid_clear_value(format, value));
    for layer in 0..layers {
        let plane = Plane {
            iova: plane.iova + u64::from(plane.layer_size) * u64::from(layer),
            ..*plane
        };
        r2d_dst(cs, format, &plane, flags, tile_mode);
        r2d_run(cs);
    }
}

/// Clear an attachment directly in memory, for renders that bypass GMEM.
pub(crate) fn clear_sysmem_attachment(
    cs: &mut impl Emit,
    ctx: &FlushContext,
    att: &PassAttachment,
    view: &ImageView,
    value: ClearValue,
    area: Rect2D,
    layers: u32,
) {
    let mask = att.clear_mask;
    if mask.is_empty() || area.is_empty() {
        return;
    }

    if att.format == Format::D32SfloatS8Uint {
        if mask.contains(Aspects::DEPTH) {
            let tile_mode = view_tile_mode(view);
            clear_plane_2d(
                cs,
                Format::D32Sfloat,
                Aspects::DEPTH,
                &view.plane,
                view.flag_words(),
                tile_mode,
                value,
                area,
                layers,
            );
        }
        if let (true, Some(stencil)) = (mask.contains(Aspects::STENCIL), view.stencil.as_ref()) {
            clear_plane_2d(
                cs,
                Format::S8Uint,
                Aspects::STENCIL,
                stencil,
                [0; 3],
                TILE6_LINEAR,
                value,
                area,
                layers,
            );
        }
    } else {
        clear_plane_2d(
            cs,
            att.format,
            mask,
            &view.plane,
            view.flag_words(),
            view_tile_mode(view),
            value,
            area,
            layers,
        );
    }

    // The 2D engine writes through CCU color; depth reads afterwards go through the other half.
    emit_event(cs, ctx, VgtEvent::PcCcuFlushColorTs);
    if att.format.is_depth_or_stencil() {
        emit_event(cs, ctx, VgtEvent::PcCcuInvalidateDepth);
    } else {
        emit_event(cs, ctx, VgtEvent::PcCcuInvalidateColor);
    }
}

fn emit_gmem_clear(
    cs: &mut impl Emit,
    format: Format,
    samples: u32,
    gmem_offset: u32,
    mask: u32,
    packed: [u32; 4],
) {
    cs.emit_write_reg(RB_MSAA_CNTL, rb_msaa_cntl(samples));
    cs.emit_write_reg(RB_BLIT_DST_INFO, blit_dst_info(format.color_code(), TILE6_LINEAR, 1));
    cs.emit_write_reg(RB_BLIT_INFO, BLIT_INFO_GMEM | blit_info_clear_mask(mask));
    cs.emit_write_reg(RB_BLIT_BASE_GMEM, gmem_offset);
    cs.emit_regs(RB_BLIT_CLEAR_COLOR_DW0, &packed);
    cs.emit_event_write(VgtEvent::Blit);
}

/// Clear an attachment's GMEM copy.
pub(crate) fn clear_gmem_attachment(cs: &mut impl Emit, att: &PassAttachment, value: ClearValue) {
    let mask = att.clear_mask;
    if mask.is_empty() {
        return;
    }

    if att.format == Format::D32SfloatS8Uint {
        if let (true, Some(offset)) = (mask.contains(Aspects::DEPTH), att.gmem_offset) {
            let packed = Format::D32Sfloat.pack_clear(value, Aspects::DEPTH);
            emit_gmem_clear(cs, Format::D32Sfloat, att.samples, offset, 0xf, packed);
        }
        if let (true, Some(offset)) = (mask.contains(Aspects::STENCIL), att.gmem_offset_stencil) {
            let packed = Format::S8Uint.pack_clear(value, Aspects::STENCIL);
            emit_gmem_clear(cs, Format::S8Uint, att.samples, offset, 0xf, packed);
        }
        return;
    }

    if let Some(offset) = att.gmem_offset {
        emit_gmem_clear(
            cs,
            att.format,
            att.samples,
            offset,
            component_mask(att.format, mask),
            att.format.pack_clear(value, mask),
        );
    }
}

/// Event blit between `src`'s GMEM copy and `view`. `resolve` writes memory, otherwise GMEM is
/// loaded from memory.
fn emit_event_blit(
    cs: &mut impl Emit,
    view: &ImageView,
    src: &PassAttachment,
    resolve: bool,
    separate_stencil: bool,
) {
    let (format, plane, flags, gmem_offset) = if separate_stencil {
        (Format::S8Uint, view.stencil, [0; 3], src.gmem_offset_stencil)
    } else if src.format == Format::D32SfloatS8Uint {
        (Format::D32Sfloat, Some(view.plane), view.flag_words(), src.gmem_offset)
    } else {
        (src.format, Some(view.plane), view.flag_words(), src.gmem_offset)
    };
    let (Some(plane), Some(gmem_offset)) = (plane, gmem_offset) else {
        return;
    };

    let mut info = 0;
    if !resolve {
        info |= BLIT_INFO_UNK0 | BLIT_INFO_GMEM;
    }
    if format.is_depth_or_stencil() {
        info |= BLIT_INFO_SAMPLE_0;
    }
    let tile_mode = if separate_stencil {
        TILE6_LINEAR
    } else {
        view_tile_mode(view)
    };

    cs.emit_write_reg(RB_MSAA_CNTL, rb_msaa_cntl(src.samples));
    cs.emit_write_reg(RB_BLIT_INFO, info);
    let [lo, hi] = lo_hi(plane.iova);
    cs.emit_regs(
        RB_BLIT_DST_INFO,
        &[blit_dst_info(format.color_code(), tile_mode, view.samples), lo, hi, plane.pitch],
    );
    cs.emit_regs(RB_BLIT_FLAG_DST, &flags);
    cs.emit_write_reg(RB_BLIT_BASE_GMEM, gmem_offset);
    cs.emit_event_write(VgtEvent::Blit);
}

/// Load an attachment into GMEM. `force` loads regardless of the attachment's load ops.
pub(crate) fn load_gmem_attachment(
    cs: &mut impl Emit,
    att: &PassAttachment,
    view: &ImageView,
    force: bool,
) {
    if att.format == Format::D32SfloatS8Uint {
        if att.load || force {
            emit_event_blit(cs, view, att, false, false);
        }
        if att.load_stencil || force {
            emit_event_blit(cs, view, att, false, true);
        }
    } else if att.load || att.load_stencil || force {
        emit_event_blit(cs, view, att, false, false);
    }
}

/// Blit scissor for event blits. Aligned scissors cover whole GMEM blocks.
pub(crate) fn emit_blit_scissor(cs: &mut impl Emit, info: &DeviceInfo, area: Rect2D, align: bool) {
    let mut x1 = area.x;
    let mut y1 = area.y;
    let mut x2 = (area.x + area.width).saturating_sub(1);
    let mut y2 = (area.y + area.height).saturating_sub(1);

    if align {
        let (aw, ah) = (info.gmem_align_w, info.gmem_align_h);
        x1 = x1 / aw * aw;
        y1 = y1 / ah * ah;
        x2 = (x2 + 1).div_ceil(aw) * aw - 1;
        y2 = (y2 + 1).div_ceil(ah) * ah - 1;
    }
    cs.emit_regs(RB_BLIT_SCISSOR_TL, &[xy(x1, y1), xy(x2, y2)]);
}

/// Render-wide parameters of GMEM stores.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GmemStore<'a> {
    pub info: &'a DeviceInfo,
    pub tiling: &'a TilingConfig,
    pub fb_width: u32,
    pub fb_height: u32,
    pub render_area: Rect2D,
}

impl GmemStore<'_> {
    /// Whether the render area edges fall on GMEM blocks, or on the framebuffer edge.
    fn area_aligned(&self) -> bool {
        let a = self.render_area;
        let (aw, ah) = (self.info.gmem_align_w, self.info.gmem_align_h);
        let x2 = a.x + a.width;
        let y2 = a.y + a.height;
        a.x % aw == 0
            && a.y % ah == 0
            && (x2 % aw == 0 || x2 == self.fb_width)
            && (y2 % ah == 0 || y2 == self.fb_height)
    }

    /// Store `src`'s GMEM content into `view`, the image of `dst`. A resolve (`src` differs
    /// from `dst`) is always written.
    pub fn store(
        &self,
        cs: &mut impl Emit,
        ctx: &FlushContext,
        dst: &PassAttachment,
        view: &ImageView,
        src: &PassAttachment,
        resolve: bool,
    ) {
        let (store, store_stencil) = if resolve {
            (true, dst.format.has_separate_stencil())
        } else {
            (dst.store, dst.store_stencil)
        };
        if !store && !store_stencil {
            return;
        }
        let separate = dst.format == Format::D32SfloatS8Uint;

        let event_blit = self.area_aligned() && (!resolve || dst.format.blit_can_resolve());
        if event_blit || dst.samples > 1 {
            if !event_blit {
                debug!(format = ?dst.format, "unaligned multisampled store uses the event blitter");
            }
            if separate {
                if store {
                    emit_event_blit(cs, view, src, true, false);
                }
                if store_stencil {
                    emit_event_blit(cs, view, src, true, true);
                }
            } else {
                emit_event_blit(cs, view, src, true, false);
            }
            return;
        }

        if separate {
            if let (true, Some(offset)) = (store, src.gmem_offset) {
                self.store_2d(
                    cs,
                    ctx,
                    Format::D32Sfloat,
                    &view.plane,
                    view.flag_words(),
                    view_tile_mode(view),
                    offset,
                    4 * src.samples,
                    src.samples,
                );
            }
            if let (true, Some(offset), Some(plane)) =
                (store_stencil, src.gmem_offset_stencil, view.stencil.as_ref())
            {
                self.store_2d(
                    cs,
                    ctx,
                    Format::S8Uint,
                    plane,
                    [0; 3],
                    TILE6_LINEAR,
                    offset,
                    src.samples,
                    src.samples,
                );
            }
        } else if let Some(offset) = src.gmem_offset {
            self.store_2d(
                cs,
                ctx,
                dst.format,
                &view.plane,
                view.flag_words(),
                view_tile_mode(view),
                offset,
                src.cpp,
                src.samples,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn store_2d(
        &self,
        cs: &mut impl Emit,
        ctx: &FlushContext,
        format: Format,
        plane: &Plane,
        flags: [u32; 3],
        tile_mode: u32,
        gmem_offset: u32,
        cpp: u32,
        samples: u32,
    ) {
        let area = self.render_area;
        r2d_setup(cs, format, Aspects::COLOR, false);
        r2d_coords(cs, area, Some((area.x, area.y)));
        r2d_dst(cs, format, plane, flags, tile_mode);
        r2d_src(
            cs,
            &Source2D {
                format,
                samples,
                tile_mode: TILE6_2,
                iova: self.info.gmem_base + u64::from(gmem_offset),
                pitch: self.tiling.tile0.width * cpp,
                width: self.fb_width,
                height: self.fb_height,
            },
        );

        // GMEM was written by the render backend; UCHE may have stale lines of it.
        emit_event(cs, ctx, VgtEvent::CacheInvalidate);
        cs.emit_wfi();
        r2d_run(cs);
        emit_event(cs, ctx, VgtEvent::PcCcuFlushColorTs);
    }
}

/// Make rendered attachments visible to the 2D engine before sysmem resolves.
pub(crate) fn emit_sysmem_resolve_barrier(cs: &mut impl Emit, ctx: &FlushContext) {
    emit_event(cs, ctx, VgtEvent::PcCcuFlushColorTs);
    emit_event(cs, ctx, VgtEvent::PcCcuFlushDepthTs);
    emit_event(cs, ctx, VgtEvent::CacheInvalidate);
    cs.emit_wfi();
}

/// Resolve `src` into `dst` in memory over `area`.
pub(crate) fn resolve_sysmem(
    cs: &mut impl Emit,
    src: &ImageView,
    dst: &ImageView,
    area: Rect2D,
    layers: u32,
) {
    if area.is_empty() {
        return;
    }
    r2d_setup(cs, dst.format, Aspects::COLOR, false);
    r2d_coords(cs, area, Some((area.x, area.y)));
    for layer in 0..layers {
        let offset = |plane: &Plane| plane.iova + u64::from(plane.layer_size) * u64::from(layer);
        r2d_src(
            cs,
            &Source2D {
                format: src.format,
                samples: src.samples,
                tile_mode: view_tile_mode(src),
                iova: offset(&src.plane),
                pitch: src.plane.pitch,
                width: src.width,
                height: src.height,
            },
        );
        let plane = Plane {
            iova: offset(&dst.plane),
            ..dst.plane
        };
        r2d_dst(cs, dst.format, &plane, dst.flag_words(), view_tile_mode(dst));
        r2d_run(cs);
    }
}
