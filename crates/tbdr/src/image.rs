//! Attachment formats and the subset of image-view state the recorder programs.

use bitflags::bitflags;

use crate::regs::TEX_CONST_DWORDS;

bitflags! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct Aspects: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    B8G8R8A8Srgb,
    R16G16B16A16Sfloat,
    R32G32B32A32Sfloat,
    D16Unorm,
    X8D24Unorm,
    D24UnormS8Uint,
    D32Sfloat,
    /// Depth and stencil live in separate planes.
    D32SfloatS8Uint,
    S8Uint,
}

impl Format {
    /// Bytes per pixel of the main plane.
    pub fn block_size(self) -> u32 {
        match self {
            Format::R8Unorm | Format::S8Uint => 1,
            Format::R8G8Unorm | Format::D16Unorm => 2,
            Format::R8G8B8A8Unorm
            | Format::R8G8B8A8Srgb
            | Format::B8G8R8A8Unorm
            | Format::B8G8R8A8Srgb
            | Format::X8D24Unorm
            | Format::D24UnormS8Uint
            | Format::D32Sfloat
            | Format::D32SfloatS8Uint => 4,
            Format::R16G16B16A16Sfloat => 8,
            Format::R32G32B32A32Sfloat => 16,
        }
    }

    pub fn aspects(self) -> Aspects {
        match self {
            Format::D16Unorm | Format::X8D24Unorm | Format::D32Sfloat => Aspects::DEPTH,
            Format::D24UnormS8Uint | Format::D32SfloatS8Uint => Aspects::DEPTH | Aspects::STENCIL,
            Format::S8Uint => Aspects::STENCIL,
            _ => Aspects::COLOR,
        }
    }

    pub fn has_depth(self) -> bool {
        self.aspects().contains(Aspects::DEPTH)
    }

    pub fn has_stencil(self) -> bool {
        self.aspects().contains(Aspects::STENCIL)
    }

    pub fn is_depth_or_stencil(self) -> bool {
        self.aspects().intersects(Aspects::DEPTH | Aspects::STENCIL)
    }

    pub fn is_srgb(self) -> bool {
        matches!(self, Format::R8G8B8A8Srgb | Format::B8G8R8A8Srgb)
    }

    /// Stencil stored in its own plane with one byte per sample.
    pub fn has_separate_stencil(self) -> bool {
        matches!(self, Format::D32SfloatS8Uint | Format::S8Uint)
    }

    /// Hardware color format code.
    pub(crate) fn color_code(self) -> u32 {
        match self {
            Format::R8Unorm | Format::S8Uint => 0x03,
            Format::R8G8Unorm => 0x0f,
            Format::R8G8B8A8Unorm | Format::R8G8B8A8Srgb => 0x30,
            Format::B8G8R8A8Unorm | Format::B8G8R8A8Srgb => 0x30 | 0x100,
            Format::R16G16B16A16Sfloat => 0x62,
            Format::R32G32B32A32Sfloat => 0x82,
            Format::D16Unorm => 0x07,
            Format::X8D24Unorm | Format::D24UnormS8Uint => 0xa0,
            Format::D32Sfloat | Format::D32SfloatS8Uint => 0x4a,
        }
    }

    /// Hardware depth format code; zero for formats without depth.
    pub(crate) fn depth_code(self) -> u32 {
        match self {
            Format::D16Unorm => 1,
            Format::X8D24Unorm | Format::D24UnormS8Uint => 2,
            Format::D32Sfloat | Format::D32SfloatS8Uint => 4,
            _ => 0,
        }
    }

    /// Whether the event blitter can resolve this format while storing it.
    ///
    /// It only averages small unsigned channels or picks one sample.
    pub(crate) fn blit_can_resolve(self) -> bool {
        !matches!(
            self,
            Format::R8G8B8A8Srgb
                | Format::B8G8R8A8Srgb
                | Format::R16G16B16A16Sfloat
                | Format::R32G32B32A32Sfloat
                | Format::D16Unorm
                | Format::X8D24Unorm
                | Format::D32Sfloat
                | Format::D32SfloatS8Uint
                // These lay out differently when tiled.
                | Format::R8G8Unorm
                | Format::D24UnormS8Uint
        )
    }

    /// Pack a clear value into the four words the blitter consumes.
    pub fn pack_clear(self, value: ClearValue, aspects: Aspects) -> [u32; 4] {
        match value {
            ClearValue::Color(words) => words,
            ClearValue::DepthStencil { depth, stencil } => {
                let depth = depth.clamp(0.0, 1.0);
                let stencil = stencil & 0xff;
                let clear_depth = aspects.contains(Aspects::DEPTH);
                let clear_stencil = aspects.contains(Aspects::STENCIL);
                match self {
                    Format::D16Unorm => [(depth * 65535.0).round() as u32, 0, 0, 0],
                    Format::X8D24Unorm | Format::D24UnormS8Uint => {
                        let mut word = 0;
                        if clear_depth {
                            word |= (depth * 16_777_215.0).round() as u32;
                        }
                        if clear_stencil {
                            word |= stencil << 24;
                        }
                        [word, 0, 0, 0]
                    }
                    Format::S8Uint => [stencil, 0, 0, 0],
                    Format::D32SfloatS8Uint if !clear_depth => [stencil, 0, 0, 0],
                    _ => [depth.to_bits(), 0, 0, 0],
                }
            }
        }
    }
}

/// Clear value for one attachment. Color values are already packed for the attachment format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([u32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl Default for ClearValue {
    fn default() -> Self {
        ClearValue::Color([0; 4])
    }
}

/// Low-resolution depth buffer attached to a depth image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LrzBuffer {
    pub iova: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
}

/// A plane of an image: base address and row/layer pitches in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Plane {
    pub iova: u64,
    pub pitch: u32,
    pub layer_size: u32,
}

/// An attachment image view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageView {
    pub format: Format,
    pub samples: u32,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub plane: Plane,
    /// Separate stencil plane for formats that have one.
    pub stencil: Option<Plane>,
    /// Compression metadata; present when the image is UBWC compressed.
    pub flags: Option<Plane>,
    pub lrz: Option<LrzBuffer>,
}

impl ImageView {
    pub fn new(format: Format, width: u32, height: u32, iova: u64) -> Self {
        let pitch = width * format.block_size();
        let stencil = (format == Format::D32SfloatS8Uint).then(|| Plane {
            iova: iova + u64::from(pitch) * u64::from(height),
            pitch: width,
            layer_size: width * height,
        });
        Self {
            format,
            samples: 1,
            width,
            height,
            layers: 1,
            plane: Plane {
                iova,
                pitch,
                layer_size: pitch * height,
            },
            stencil,
            flags: None,
            lrz: None,
        }
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_lrz(mut self, lrz: LrzBuffer) -> Self {
        self.lrz = Some(lrz);
        self
    }

    pub fn with_ubwc(mut self, flags: Plane) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn ubwc_enabled(&self) -> bool {
        self.flags.is_some()
    }

    pub(crate) fn mrt_buf_info(&self) -> u32 {
        let tile_mode = if self.ubwc_enabled() { 3 } else { 0 };
        (self.format.color_code() & 0xff) | tile_mode << 8 | (self.format.color_code() >> 8) << 13
    }

    pub(crate) fn sp_fs_mrt_reg(&self) -> u32 {
        (self.format.color_code() & 0xff) | u32::from(self.format.is_srgb()) << 15
    }

    /// Pitch, layer pitch and base address of the main plane as written to buffer registers.
    pub(crate) fn plane_words(plane: &Plane) -> [u32; 4] {
        [
            plane.pitch,
            plane.layer_size,
            plane.iova as u32,
            (plane.iova >> 32) as u32,
        ]
    }

    pub(crate) fn flag_words(&self) -> [u32; 3] {
        match self.flags {
            Some(flags) => [flags.iova as u32, (flags.iova >> 32) as u32, flags.pitch],
            None => [0; 3],
        }
    }

    /// Texture descriptor for sampling the view from memory.
    pub(crate) fn descriptor(&self) -> [u32; TEX_CONST_DWORDS] {
        let mut d = [0; TEX_CONST_DWORDS];
        d[0] = self.format.color_code() << 22 | (self.samples.trailing_zeros() & 0x3) << 20;
        d[1] = (self.width & 0x7fff) | (self.height & 0x7fff) << 15;
        d[2] = 1 << 29 | (self.plane.pitch & 0x3f_ffff) << 7;
        d[3] = self.plane.layer_size >> 12;
        d[4] = self.plane.iova as u32;
        d[5] = (self.plane.iova >> 32) as u32 & 0x1ffff | (self.layers & 0x1fff) << 17;
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_clear_packing() {
        let v = ClearValue::DepthStencil {
            depth: 1.0,
            stencil: 0x1ff,
        };
        assert_eq!(
            Format::D24UnormS8Uint.pack_clear(v, Aspects::DEPTH | Aspects::STENCIL)[0],
            0xffff_ffff
        );
        assert_eq!(Format::D24UnormS8Uint.pack_clear(v, Aspects::STENCIL)[0], 0xff00_0000);
        assert_eq!(Format::D32Sfloat.pack_clear(v, Aspects::DEPTH)[0], 1.0f32.to_bits());
        assert_eq!(Format::D32SfloatS8Uint.pack_clear(v, Aspects::STENCIL)[0], 0xff);
    }

    #[test]
    fn separate_stencil_plane_follows_depth() {
        let view = ImageView::new(Format::D32SfloatS8Uint, 64, 32, 0x10_0000);
        let stencil = view.stencil.unwrap();
        assert_eq!(stencil.iova, 0x10_0000 + 64 * 4 * 32);
        assert_eq!(stencil.pitch, 64);
        assert!(ImageView::new(Format::D24UnormS8Uint, 64, 32, 0).stencil.is_none());
    }
}
