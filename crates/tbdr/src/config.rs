//! Device description and debug switches.

use bitflags::bitflags;
use tracing::warn;

/// Environment variable holding a comma-separated list of debug switches.
pub const DEBUG_ENV: &str = "TBDR_DEBUG";

/// Padding at the end of every visibility-stream slot; the limit register sits this far below
/// the pitch so overflow can be detected.
pub const VSC_PAD: u32 = 0x40;

/// Number of visibility-stream pipes.
pub const MAX_VSC_PIPES: u32 = 32;

bitflags! {
    /// Debug overrides for rendering-mode and synchronization decisions.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct DebugFlags: u32 {
        /// Never use the hardware binning pass.
        const NOBIN = 1 << 0;
        /// Always render render passes directly to system memory.
        const SYSMEM = 1 << 1;
        /// Start tiling from a 2x2 grid and always bin.
        const FORCEBIN = 1 << 2;
        /// Flush and invalidate every cache at every flush point.
        const FLUSHALL = 1 << 3;
        /// Wait for idle around every flush point.
        const SYNCDRAW = 1 << 4;
        /// Never enable the low-resolution depth buffer.
        const NOLRZ = 1 << 5;
    }
}

impl DebugFlags {
    /// Parse a comma-separated switch list. Unknown names are ignored.
    pub fn parse(raw: &str) -> Self {
        let mut flags = Self::empty();
        for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match name.to_ascii_lowercase().as_str() {
                "nobin" => flags |= Self::NOBIN,
                "sysmem" => flags |= Self::SYSMEM,
                "forcebin" => flags |= Self::FORCEBIN,
                "flushall" => flags |= Self::FLUSHALL,
                "syncdraw" => flags |= Self::SYNCDRAW,
                "nolrz" => flags |= Self::NOLRZ,
                other => warn!(switch = other, "ignoring unknown debug switch"),
            }
        }
        flags
    }

    /// Read [`DEBUG_ENV`]; an unset variable means no overrides.
    pub fn from_env() -> Self {
        let Ok(raw) = std::env::var(DEBUG_ENV) else {
            return Self::empty();
        };
        Self::parse(&raw)
    }
}

/// Fixed properties of the GPU the streams are recorded for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub tile_align_w: u32,
    pub tile_align_h: u32,
    pub tile_max_w: u32,
    pub tile_max_h: u32,
    /// Resolve rectangles are widened to this granularity.
    pub gmem_align_w: u32,
    pub gmem_align_h: u32,
    /// GMEM bytes available to attachments; the CCU uses the rest in GMEM mode.
    pub ccu_offset_gmem: u32,
    pub ccu_offset_bypass: u32,
    /// GPU address at which GMEM is visible to the texture unit.
    pub gmem_base: u64,
    /// CCU flushes are not complete until the pipeline is idle.
    pub has_ccu_flush_bug: bool,
    /// `CP_REG_WRITE` can track RB_RENDER_CNTL for the binning pass.
    pub has_cp_reg_write: bool,
    /// Indirect draws read their parameters before pending register writes land.
    pub indirect_draw_wfm_quirk: bool,
    /// Depth bounds testing only works with the depth test enabled.
    pub depth_bounds_require_depth_test_quirk: bool,
    pub pc_power_cntl: u32,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            tile_align_w: 32,
            tile_align_h: 16,
            tile_max_w: 1024,
            tile_max_h: 1008,
            gmem_align_w: 16,
            gmem_align_h: 4,
            ccu_offset_gmem: 512 * 1024,
            ccu_offset_bypass: 0x10000,
            gmem_base: 0x0010_0000,
            has_ccu_flush_bug: false,
            has_cp_reg_write: true,
            indirect_draw_wfm_quirk: true,
            depth_bounds_require_depth_test_quirk: true,
            pc_power_cntl: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub info: DeviceInfo,
    pub debug: DebugFlags,
    /// Initial per-pipe visibility-stream pitches; they grow when the GPU reports overflow.
    pub vsc_draw_strm_pitch: u32,
    pub vsc_prim_strm_pitch: u32,
    /// Capacity of each command buffer's sub-stream arena.
    pub sub_stream_capacity_words: u64,
    /// Chunk size for growable command streams.
    pub chunk_words: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            info: DeviceInfo::default(),
            debug: DebugFlags::empty(),
            vsc_draw_strm_pitch: 0x440 + VSC_PAD,
            vsc_prim_strm_pitch: 0x1040 + VSC_PAD,
            sub_stream_capacity_words: 1 << 20,
            chunk_words: 4096,
        }
    }
}

impl DeviceConfig {
    /// Default configuration with debug switches taken from the environment.
    pub fn from_env() -> Self {
        Self {
            debug: DebugFlags::from_env(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_mixed_case_and_whitespace() {
        assert_eq!(
            DebugFlags::parse(" sysmem, NoLrz ,,bogus"),
            DebugFlags::SYSMEM | DebugFlags::NOLRZ
        );
        assert_eq!(DebugFlags::parse(""), DebugFlags::empty());
    }

    #[test]
    fn default_pitches_leave_room_for_padding() {
        let config = DeviceConfig::default();
        assert!(config.vsc_draw_strm_pitch > VSC_PAD);
        assert!(config.vsc_prim_strm_pitch > VSC_PAD);
    }
}
