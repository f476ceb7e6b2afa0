use std::sync::Arc;

use pretty_assertions::assert_eq;
use tbdr::cache::AccessMask;
use tbdr::config::VSC_PAD;
use tbdr::regs::*;
use tbdr::{
    AttachmentDescription, Barrier, CacheState, CcuState, CommandBuffer, CommandBufferLevel,
    DebugFlags, Device, DeviceConfig, FlushBits, Format, Framebuffer, ImageView, PipelineStages,
    Rect2D, RenderPass, RenderPassDescription, SubpassDescription, UsageFlags,
};
use tbdr_cs::{packets, Opcode, Packet};

fn device(debug: DebugFlags) -> Arc<Device> {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    Arc::new(Device::new(DeviceConfig {
        debug,
        ..DeviceConfig::default()
    }))
}

fn recording(device: &Arc<Device>) -> CommandBuffer {
    let mut cmd = CommandBuffer::new(Arc::clone(device), CommandBufferLevel::Primary);
    cmd.begin(UsageFlags::ONE_TIME_SUBMIT, None);
    cmd
}

fn color_pass(device: &Device, input_is_color: bool) -> Arc<RenderPass> {
    let input_attachments = if input_is_color { vec![Some(0)] } else { Vec::new() };
    Arc::new(RenderPass::new(
        device.info(),
        &RenderPassDescription {
            attachments: vec![AttachmentDescription::new(Format::R8G8B8A8Unorm)],
            subpasses: vec![SubpassDescription {
                color_attachments: vec![Some(0)],
                input_attachments,
                ..Default::default()
            }],
            dependencies: Vec::new(),
        },
    ))
}

fn framebuffer(device: &Device, pass: &RenderPass, size: u32, layers: u32) -> Arc<Framebuffer> {
    let view = ImageView::new(Format::R8G8B8A8Unorm, size, size, 0x100_0000);
    Arc::new(Framebuffer::new(
        device.info(),
        device.debug(),
        pass,
        vec![Arc::new(view)],
        size,
        size,
        layers,
    ))
}

/// Record one render pass, running `contents` inside it. Returns where it starts in `cs`.
fn render(
    cmd: &mut CommandBuffer,
    pass: Arc<RenderPass>,
    layers: u32,
    contents: impl FnOnce(&mut CommandBuffer),
) -> usize {
    let fb = framebuffer(cmd.device(), &pass, 256, layers);
    let start = cmd.cs().len_words();
    cmd.begin_render_pass(pass, fb, Rect2D::from_extent(256, 256), &[]);
    contents(cmd);
    cmd.end_render_pass();
    start
}

#[test]
fn single_layer_color_pass_renders_in_gmem() {
    let device = device(DebugFlags::empty());
    let mut cmd = recording(&device);
    let pass = color_pass(&device, false);
    assert!(pass.gmem_capable());
    assert_eq!(pass.attachments[0].cpp, 4);

    render(&mut cmd, pass, 1, |_| {});

    assert_eq!(cmd.ccu_state(), CcuState::Gmem);
    let stats = device.stats().snapshot();
    assert_eq!(stats.render_passes_gmem, 1);
    assert_eq!(stats.render_passes_sysmem, 0);
    assert!(cmd.end().is_ok());
}

#[test]
fn layered_framebuffer_falls_back_to_sysmem() {
    let device = device(DebugFlags::empty());
    let mut cmd = recording(&device);
    let pass = color_pass(&device, false);
    assert!(pass.gmem_capable());

    render(&mut cmd, pass, 2, |_| {});

    assert_eq!(cmd.ccu_state(), CcuState::Sysmem);
    let stats = device.stats().snapshot();
    assert_eq!(stats.render_passes_sysmem, 1);
    assert_eq!(stats.render_passes_gmem, 0);
}

#[test]
fn reading_the_color_attachment_renders_one_primitive_at_a_time() {
    let device = device(DebugFlags::empty());
    let mut cmd = recording(&device);
    let pass = color_pass(&device, true);
    assert!(pass.subpasses[0].feedback_loop_color);
    assert!(!pass.subpasses[0].feedback_loop_ds);

    let fb = framebuffer(&device, &pass, 64, 1);
    cmd.begin_render_pass(pass, fb, Rect2D::from_extent(64, 64), &[]);

    let words = cmd.draw_cs().words();
    let sc_cntl: Vec<u32> = packets(&words)
        .unwrap()
        .iter()
        .filter_map(|p| p.reg_value(GRAS_SC_CNTL))
        .collect();
    assert_eq!(
        sc_cntl,
        vec![GRAS_SC_CNTL_CCUSINGLECACHELINESIZE_2 | GRAS_SC_CNTL_FLUSH_PER_OVERLAP_AND_OVERWRITE]
    );
    cmd.end_render_pass();
}

#[test]
fn vertex_stage_barrier_inside_a_pass_forces_sysmem() {
    let device = device(DebugFlags::empty());
    let mut cmd = recording(&device);
    let pass = color_pass(&device, false);

    render(&mut cmd, Arc::clone(&pass), 1, |cmd| {
        cmd.pipeline_barrier(&Barrier::new(
            PipelineStages::FRAGMENT_SHADER,
            PipelineStages::VERTEX_SHADER,
        ));
    });
    assert_eq!(cmd.ccu_state(), CcuState::Sysmem);
    assert_eq!(device.stats().snapshot().render_passes_sysmem, 1);

    // Framebuffer-local dependencies keep the pass in GMEM.
    render(&mut cmd, Arc::clone(&pass), 1, |cmd| {
        cmd.pipeline_barrier(&Barrier::new(
            PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            PipelineStages::FRAGMENT_SHADER,
        ));
    });
    assert_eq!(cmd.ccu_state(), CcuState::Gmem);
    assert_eq!(device.stats().snapshot().render_passes_gmem, 1);
}

#[test]
fn uche_write_is_flushed_only_when_read() {
    let mut cache = CacheState::default();

    cache.record_access(AccessMask::UCHE_WRITE, AccessMask::empty());
    assert_eq!(cache.flush_bits, FlushBits::empty());
    assert!(cache.pending_flush_bits.contains(FlushBits::CACHE_FLUSH));
    let ccu_pending = cache.pending_flush_bits
        & (FlushBits::CCU_INVALIDATE_COLOR | FlushBits::CCU_INVALIDATE_DEPTH);

    cache.record_access(AccessMask::empty(), AccessMask::UCHE_READ);
    assert_eq!(
        cache.flush_bits,
        FlushBits::CACHE_FLUSH | FlushBits::CACHE_INVALIDATE
    );
    assert!(!cache
        .pending_flush_bits
        .intersects(FlushBits::CACHE_FLUSH | FlushBits::CACHE_INVALIDATE));
    // Other domains are untouched.
    assert_eq!(
        cache.pending_flush_bits
            & (FlushBits::CCU_INVALIDATE_COLOR | FlushBits::CCU_INVALIDATE_DEPTH),
        ccu_pending
    );
    assert!(!cache.pending_flush_bits.intersects(FlushBits::ALL_FLUSH));
}

#[test]
fn visibility_stream_overflow_grows_the_next_pitch() {
    let device = device(DebugFlags::FORCEBIN);
    let (draw_pitch, prim_pitch) = device.vsc_pitches();

    let mut cmd = recording(&device);
    let start = render(&mut cmd, color_pass(&device, false), 1, |_| {});
    let words = cmd.cs().words()[start..].to_vec();
    let decoded = packets(&words).unwrap();
    let tests: Vec<&Packet<'_>> = decoded.iter().filter(|p| p.is(Opcode::CondWrite5)).collect();

    // Two tests per pipe: draw stream then primitive stream.
    let pipe3_draw = tests[6];
    assert_eq!(pipe3_draw.payload[1], VSC_DRAW_STRM_SIZE_REG0 + 3);
    let overflow_iova = u64::from(pipe3_draw.payload[5]) | u64::from(pipe3_draw.payload[6]) << 32;
    let reported = pipe3_draw.payload[7];
    assert_eq!(reported, draw_pitch);
    assert!(cmd.end().is_ok());

    // What the GPU does when pipe 3's draw stream fills up.
    assert!(device.write_global_u32(overflow_iova, reported));
    assert_eq!(device.vsc_pitches(), (draw_pitch, prim_pitch));

    let next = recording(&device);
    assert_eq!(
        device.vsc_pitches(),
        ((draw_pitch - VSC_PAD) * 2 + VSC_PAD, prim_pitch)
    );
    assert_eq!(device.stats().snapshot().vsc_pitch_grows, 1);
    assert!(next.record_result().is_none());
}

#[test]
fn binned_tiles_reenable_stream_out_before_reading_visibility() {
    let device = device(DebugFlags::FORCEBIN);
    let mut cmd = recording(&device);
    let start = render(&mut cmd, color_pass(&device, false), 1, |_| {});
    let words = cmd.cs().words()[start..].to_vec();

    let mut so_disable = None;
    let mut selects = Vec::new();
    for packet in packets(&words).unwrap() {
        if packet.is(Opcode::SetMarker) && packet.payload[0] == RM6_GMEM {
            so_disable = None;
        }
        if let Some(value) = packet.reg_value(VPC_SO_DISABLE) {
            so_disable = Some(value);
        }
        if packet.is(Opcode::SetBinData5Offset) {
            selects.push(so_disable);
        }
    }
    assert_eq!(selects, vec![Some(0); 4]);
}

#[test]
fn only_overflow_words_are_gpu_writable() {
    let device = device(DebugFlags::empty());
    assert!(!device.write_global_u32(0x1234, 1));
    assert!(!device.write_global_u32(Device::global_iova(tbdr::GLOBAL_FLUSH_BASE), 1));
    assert!(device.write_global_u32(Device::global_iova(tbdr::GLOBAL_VSC_PRIM_OVERFLOW), 7));
    assert_eq!(
        device.read_global_u32(Device::global_iova(tbdr::GLOBAL_VSC_PRIM_OVERFLOW)),
        Some(7)
    );
}
