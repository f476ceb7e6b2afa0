use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`RecordStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordStatsSnapshot {
    pub command_buffers_recorded: u64,
    pub render_passes_gmem: u64,
    pub render_passes_sysmem: u64,
    pub binning_passes: u64,
    pub tiles_rendered: u64,
    pub draws: u64,
    pub dispatches: u64,
    pub vsc_pitch_grows: u64,
    pub scratch_allocations: u64,
    pub record_errors: u64,
}

/// Per-device recording counters.
///
/// Updated from any recording thread; reads are relaxed and only meant for profiling.
#[derive(Debug, Default)]
pub struct RecordStats {
    command_buffers_recorded: AtomicU64,
    render_passes_gmem: AtomicU64,
    render_passes_sysmem: AtomicU64,
    binning_passes: AtomicU64,
    tiles_rendered: AtomicU64,
    draws: AtomicU64,
    dispatches: AtomicU64,
    vsc_pitch_grows: AtomicU64,
    scratch_allocations: AtomicU64,
    record_errors: AtomicU64,
}

impl RecordStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_command_buffers_recorded(&self) {
        self.command_buffers_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_render_passes_gmem(&self) {
        self.render_passes_gmem.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_render_passes_sysmem(&self) {
        self.render_passes_sysmem.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_binning_passes(&self) {
        self.binning_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tiles_rendered(&self, tiles: u64) {
        self.tiles_rendered.fetch_add(tiles, Ordering::Relaxed);
    }

    pub fn inc_draws(&self) {
        self.draws.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dispatches(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_vsc_pitch_grows(&self) {
        self.vsc_pitch_grows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_scratch_allocations(&self) {
        self.scratch_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_record_errors(&self) {
        self.record_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RecordStatsSnapshot {
        RecordStatsSnapshot {
            command_buffers_recorded: self.command_buffers_recorded.load(Ordering::Relaxed),
            render_passes_gmem: self.render_passes_gmem.load(Ordering::Relaxed),
            render_passes_sysmem: self.render_passes_sysmem.load(Ordering::Relaxed),
            binning_passes: self.binning_passes.load(Ordering::Relaxed),
            tiles_rendered: self.tiles_rendered.load(Ordering::Relaxed),
            draws: self.draws.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            vsc_pitch_grows: self.vsc_pitch_grows.load(Ordering::Relaxed),
            scratch_allocations: self.scratch_allocations.load(Ordering::Relaxed),
            record_errors: self.record_errors.load(Ordering::Relaxed),
        }
    }
}
