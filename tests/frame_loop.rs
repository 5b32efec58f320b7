// Frame loop scenarios on the headless backend.

use std::time::Duration;

use frame_ring::backend::headless::{
    BufferOrder, Headless, HeadlessAdapter, HeadlessConfig, HeadlessDevice, HeadlessInstance,
    HeadlessSurface, PRESENT_HISTORY,
};
use frame_ring::engine::{provision, Engine, EngineSettings, FrameState, ProvisionOptions};
use frame_ring::gpu::{AdapterInfo, CommandList, DescriptorHeap, GpuFence, PresentRequest};

fn settings(buffer_count: usize) -> EngineSettings {
    EngineSettings {
        width: 640,
        height: 480,
        buffer_count,
        ..EngineSettings::default()
    }
}

fn engine_with(config: HeadlessConfig, surface: HeadlessSurface, buffer_count: usize) -> Engine<Headless> {
    Engine::new(HeadlessDevice::new(config), surface, &settings(buffer_count)).unwrap()
}

fn engine(buffer_count: usize) -> Engine<Headless> {
    engine_with(HeadlessConfig::default(), HeadlessSurface::default(), buffer_count)
}

#[test]
fn steady_state_waits_for_the_frame_n_back() {
    let mut engine = engine_with(
        HeadlessConfig {
            gpu_latency: Duration::from_millis(1),
            ..HeadlessConfig::default()
        },
        HeadlessSurface::default(),
        3,
    );

    let reports: Vec<_> = (0..9).map(|_| engine.render().unwrap()).collect();

    for (k, report) in reports.iter().enumerate() {
        assert_eq!(report.index, k % 3);
        assert_eq!(report.fence_value, k as u64 + 1);
        let expected_wait = if k < 3 { 0 } else { reports[k - 3].fence_value };
        assert_eq!(report.waited_for, expected_wait, "frame {}", k);
    }
    assert_eq!(engine.state(), FrameState::Idle);
    assert_eq!(engine.frames_rendered(), 9);

    // Each wait covers at most the one frame submitted N frames earlier
    assert!(
        engine.fence_stats().max_stall < Duration::from_millis(250),
        "max stall {:?}",
        engine.fence_stats().max_stall
    );

    let stats = engine.shutdown().unwrap();
    assert_eq!(stats.signals, 10, "nine frames plus the shutdown flush");
    assert_eq!(stats.flushes, 1);
}

#[test]
fn slots_follow_the_presentation_layer_order() {
    let surface = HeadlessSurface {
        order: BufferOrder::Scripted(vec![2, 0, 1]),
    };
    let mut engine = engine_with(HeadlessConfig::default(), surface, 3);
    assert_eq!(engine.current_index(), 2);

    let indices: Vec<_> = (0..6).map(|_| engine.render().unwrap()).collect();
    assert_eq!(
        indices.iter().map(|r| r.index).collect::<Vec<_>>(),
        vec![2, 0, 1, 2, 0, 1]
    );

    // Slot 2 was last used by the first frame, not by frame_count % 3
    assert_eq!(indices[3].waited_for, indices[0].fence_value);
    assert_eq!(engine.ring().acquire(2).unwrap().fence_checkpoint(), indices[3].fence_value);

    engine.shutdown().unwrap();
}

#[test]
fn bounded_render_gives_up_without_touching_the_slot() {
    let mut engine = engine(2);
    engine.context().queue.pause();

    // Every slot starts at checkpoint 0, so the first pass never waits
    engine.render().unwrap();
    engine.render().unwrap();

    let resets_before = engine.ring().acquire(0).unwrap().allocator().reset_count();
    let outcome = engine.try_render(Duration::from_millis(20)).unwrap();

    assert!(outcome.is_none());
    assert_eq!(engine.state(), FrameState::Idle);
    assert_eq!(engine.frames_rendered(), 2);
    assert_eq!(engine.ring().acquire(0).unwrap().allocator().reset_count(), resets_before);
    assert_eq!(engine.fence_stats().timeouts, 1);

    engine.context().queue.resume();
    let report = engine
        .try_render(Duration::from_secs(5))
        .unwrap()
        .expect("slot frees up once the GPU runs");
    assert_eq!(report.index, 0);
    assert_eq!(report.waited_for, 1);

    engine.shutdown().unwrap();
}

#[test]
fn resize_between_frames_rebuilds_buffers() {
    let mut engine = engine_with(
        HeadlessConfig {
            gpu_latency: Duration::from_millis(1),
            ..HeadlessConfig::default()
        },
        HeadlessSurface::default(),
        3,
    );
    for _ in 0..4 {
        engine.render().unwrap();
    }
    let before = engine.fence_stats().signals;

    assert!(engine.resize(800, 600).unwrap());
    assert_eq!(engine.swap_chain().extent(), (800, 600));
    assert_eq!(engine.swap_chain().rtv_heap().descriptor_count(), 3);
    assert_eq!(engine.swap_chain().swap_chain().generation(), 2);
    assert_eq!(engine.fence_stats().flushes, 1);
    assert_eq!(engine.fence_stats().signals, before + 1);
    assert_eq!(engine.current_index(), 0);

    // Every slot inherited the flushed checkpoint, so none blocks
    let checkpoint = engine.ring().acquire(0).unwrap().fence_checkpoint();
    for index in 0..3 {
        assert_eq!(engine.ring().acquire(index).unwrap().fence_checkpoint(), checkpoint);
    }

    for _ in 0..4 {
        engine.render().unwrap();
    }
    assert!(!engine.resize(800, 600).unwrap(), "same size is a no-op");
    assert_eq!(engine.fence_stats().flushes, 1);

    engine.shutdown().unwrap();
}

#[test]
fn minimized_window_is_clamped_to_one_pixel() {
    let mut engine = engine(2);
    assert!(engine.resize(0, 0).unwrap());
    assert_eq!(engine.swap_chain().extent(), (1, 1));
    engine.render().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn vsync_toggle_changes_the_present_request() {
    let mut engine = engine(3);
    engine.render().unwrap();
    assert!(!engine.toggle_vsync());
    engine.render().unwrap();
    engine.set_vsync(true);
    engine.render().unwrap();

    let presents: Vec<_> = engine.swap_chain().swap_chain().presents().collect();
    assert_eq!(
        presents,
        vec![
            PresentRequest { sync_interval: 1, allow_tearing: false },
            PresentRequest { sync_interval: 0, allow_tearing: true },
            PresentRequest { sync_interval: 1, allow_tearing: false },
        ]
    );
    engine.shutdown().unwrap();
}

#[test]
fn no_tearing_flag_without_support() {
    let mut engine = engine_with(
        HeadlessConfig {
            tearing_supported: false,
            ..HeadlessConfig::default()
        },
        HeadlessSurface::default(),
        2,
    );
    engine.set_vsync(false);
    engine.render().unwrap();

    let last = engine.swap_chain().swap_chain().last_present().unwrap();
    assert_eq!(last, PresentRequest { sync_interval: 0, allow_tearing: false });
    engine.shutdown().unwrap();
}

#[test]
fn custom_recording_targets_the_current_back_buffer() {
    let mut engine = engine(3);
    let expected_rtv = engine.swap_chain().rtv_handle(engine.current_index());

    let mut seen = None;
    let report = engine
        .render_with(None, |target| {
            target.list.clear_render_target(target.rtv_heap, target.rtv, [1.0, 0.0, 0.0, 1.0]);
            seen = Some((target.index, target.rtv));
        })
        .unwrap()
        .unwrap();

    assert_eq!(seen, Some((report.index, expected_rtv)));
    engine.shutdown().unwrap();
}

#[test]
fn provisioned_device_drives_the_engine() {
    let adapter = |name: &str, memory: u64, is_software: bool| HeadlessAdapter {
        info: AdapterInfo {
            name: name.into(),
            dedicated_video_memory: memory,
            is_software,
        },
        probe_succeeds: true,
    };
    let instance = HeadlessInstance::with_adapters(
        HeadlessConfig::default(),
        vec![
            adapter("small", 256 << 20, false),
            adapter("large", 8 << 30, false),
            adapter("software", 0, true),
        ],
    );

    let device = provision::<Headless, _>(
        instance,
        &ProvisionOptions {
            enable_debug_layer: true,
            ..ProvisionOptions::default()
        },
    )
    .unwrap();
    assert_eq!(device.adapter().name, "large");
    assert!(device.debug_layer_enabled());

    let mut engine = Engine::<Headless>::new(device, HeadlessSurface::default(), &settings(2)).unwrap();
    engine.render().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn dropping_without_shutdown_still_drains_the_gpu() {
    let mut engine = engine_with(
        HeadlessConfig {
            gpu_latency: Duration::from_millis(2),
            ..HeadlessConfig::default()
        },
        HeadlessSurface::default(),
        3,
    );
    for _ in 0..3 {
        engine.render().unwrap();
    }
    let fence = engine.context().fence.fence().clone();
    drop(engine);

    // Three frames plus the flush issued on drop. Without the flush the
    // timeline only drains to the last frame's value.
    assert_eq!(fence.completed_value().unwrap(), 4);
}

#[test]
fn present_history_is_bounded() {
    let mut engine = engine(2);
    let frames = PRESENT_HISTORY + 10;
    for _ in 0..frames {
        engine.render().unwrap();
    }

    let swap_chain = engine.swap_chain().swap_chain();
    assert_eq!(swap_chain.presents().count(), PRESENT_HISTORY);
    assert_eq!(swap_chain.present_count(), frames as u64);
    engine.shutdown().unwrap();
}
