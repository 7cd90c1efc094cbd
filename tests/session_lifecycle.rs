use frameshare::backend::recording::{FailPoint, ObjectKind, RecordingBackend};
use frameshare::engine::{ColorPrimaries, ColorSpace, Orientation, TransferFunction};
use frameshare::{
    BridgeConfig, BridgeError, CallbackSlot, OutputCallbacks, RenderConfig, RenderLoop, RenderSession, RenderState,
    ReportSizeFn, ReportToken, SurfaceMode, VideoBridge,
};
use parking_lot::Mutex;
use std::sync::Arc;

fn quiet_config() -> BridgeConfig {
    BridgeConfig {
        abort_on_leak: false,
        ..BridgeConfig::default()
    }
}

fn attached_bridge(
    backend: &RecordingBackend,
    width: u32,
    height: u32,
) -> (Arc<VideoBridge<RecordingBackend>>, Arc<dyn OutputCallbacks>) {
    let bridge = VideoBridge::new(backend.clone(), SurfaceMode::CompositionTarget, quiet_config());
    let engine = Arc::new(CallbackSlot::new());
    bridge.notify_surface_loaded(width, height).unwrap();
    assert!(bridge.attach_producer(engine.clone()).unwrap());
    let callbacks = engine.callbacks().unwrap();
    (bridge, callbacks)
}

#[test]
fn composition_session_end_to_end() {
    let backend = RecordingBackend::new();
    let (bridge, callbacks) = attached_bridge(&backend, 1920, 1080);

    let context = callbacks.setup().unwrap();
    assert!(!context.is_null());

    let desc = callbacks.update_output(RenderConfig { width: 1920, height: 1080 }).unwrap();
    assert_eq!(desc.orientation, Orientation::TopLeft);
    assert_eq!(desc.color_space, ColorSpace::Bt709);
    assert_eq!(desc.color_primaries, ColorPrimaries::Bt709);
    assert_eq!(desc.transfer_function, TransferFunction::Srgb);
    assert!(desc.full_range);

    assert!(callbacks.select_plane(0));
    assert!(callbacks.start_rendering(true));
    assert!(callbacks.start_rendering(false));
    callbacks.swap().unwrap();
    assert_eq!(bridge.state(), Some(RenderState::Paused));

    callbacks.cleanup();
    bridge.teardown_session().unwrap();

    for kind in [ObjectKind::SwapChain, ObjectKind::Device, ObjectKind::Context] {
        assert_eq!(backend.live(kind), 0, "{:?} outlived teardown", kind);
    }
    assert_eq!(backend.live_total(), 0);
}

#[test]
fn back_to_back_resizes_leave_only_the_last_generation() {
    let backend = RecordingBackend::new();
    let (bridge, callbacks) = attached_bridge(&backend, 640, 480);
    let handles_before = backend.created(ObjectKind::SharedHandle);

    callbacks.update_output(RenderConfig { width: 100, height: 100 }).unwrap();
    callbacks.update_output(RenderConfig { width: 200, height: 200 }).unwrap();

    assert_eq!(backend.live_extents(ObjectKind::SharedTexture), vec![(200, 200)]);
    assert_eq!(backend.live_extents(ObjectKind::OpenedTexture), vec![(200, 200)]);
    assert_eq!(backend.live(ObjectKind::SharedHandle), 1);
    assert_eq!(backend.created(ObjectKind::SharedHandle), handles_before + 2);
    assert_eq!(backend.peak(ObjectKind::SharedHandle), 1);

    // Every handle but the live one has been closed
    assert_eq!(backend.call_count("close_shared_handle"), handles_before + 1);

    bridge.teardown_session().unwrap();
}

#[test]
fn any_plane_but_zero_is_refused() {
    let backend = RecordingBackend::new();
    let (bridge, callbacks) = attached_bridge(&backend, 320, 240);

    assert!(callbacks.select_plane(0));
    for plane in [1, 2, 3, usize::MAX] {
        assert!(!callbacks.select_plane(plane));
    }

    bridge.teardown_session().unwrap();
}

#[test]
fn rebuild_then_teardown_releases_everything() {
    for (width, height) in [(1, 1), (3, 7), (640, 480), (1920, 1080), (4096, 2160)] {
        let backend = RecordingBackend::new();
        let mut session =
            RenderSession::create(backend.clone(), SurfaceMode::CompositionTarget, 64, 64, &quiet_config()).unwrap();

        session.resize(width, height).unwrap();
        session.teardown().unwrap();

        assert_eq!(backend.live_total(), 0, "leak after {}x{}", width, height);
    }
}

#[test]
fn zero_sized_output_is_rejected_without_native_calls() {
    let backend = RecordingBackend::new();
    let session =
        RenderSession::create(backend.clone(), SurfaceMode::CompositionTarget, 64, 64, &quiet_config()).unwrap();
    let mut render = RenderLoop::new(session);
    let calls_before = backend.calls().len();

    for (width, height) in [(0, 480), (640, 0), (0, 0)] {
        assert_eq!(
            render.notify_resize(width, height).unwrap_err(),
            BridgeError::InvalidDimensions { width, height }
        );
    }

    assert_eq!(backend.calls().len(), calls_before);
    render.teardown().unwrap();
}

#[test]
fn failed_handle_open_leaves_session_without_frame_until_next_resize() {
    let backend = RecordingBackend::new();
    let (bridge, callbacks) = attached_bridge(&backend, 640, 480);

    backend.fail_next(FailPoint::OpenHandle);
    let err = callbacks.update_output(RenderConfig { width: 800, height: 600 }).unwrap_err();
    assert!(matches!(err, BridgeError::SharedHandle { stage: "open", .. }));
    assert!(err.is_recoverable());
    assert_eq!(backend.live(ObjectKind::SharedHandle), 0);
    assert!(!callbacks.start_rendering(true));

    callbacks.update_output(RenderConfig { width: 800, height: 600 }).unwrap();
    assert!(callbacks.start_rendering(true));

    bridge.teardown_session().unwrap();
    assert_eq!(backend.live_total(), 0);
}

#[test]
fn ui_resizes_reach_the_decoder_from_another_thread() {
    let backend = RecordingBackend::new();
    let (bridge, callbacks) = attached_bridge(&backend, 640, 480);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let report: ReportSizeFn = Arc::new(move |token, w, h| sink.lock().push((token, w, h)));
    callbacks.set_resize(Some(report), ReportToken(42));

    let ui_bridge = Arc::clone(&bridge);
    std::thread::spawn(move || ui_bridge.notify_surface_resize(800, 600))
        .join()
        .unwrap();

    assert_eq!(
        *seen.lock(),
        vec![(ReportToken(42), 640, 480), (ReportToken(42), 800, 600)]
    );

    bridge.teardown_session().unwrap();
}

#[test]
fn calls_after_teardown_report_a_closed_session() {
    let backend = RecordingBackend::new();
    let (bridge, callbacks) = attached_bridge(&backend, 640, 480);

    bridge.teardown_session().unwrap();

    assert_eq!(callbacks.swap(), Err(BridgeError::SessionClosed));
    assert_eq!(
        callbacks.update_output(RenderConfig { width: 10, height: 10 }),
        Err(BridgeError::SessionClosed)
    );
    assert!(!callbacks.start_rendering(true));
    assert!(!callbacks.select_plane(0));
    assert_eq!(backend.live_total(), 0);
}

#[test]
fn host_dropping_bridge_and_engine_releases_everything() {
    let backend = RecordingBackend::new();
    let bridge = VideoBridge::new(backend.clone(), SurfaceMode::CompositionTarget, quiet_config());
    let engine = Arc::new(CallbackSlot::new());
    bridge.notify_surface_loaded(640, 480).unwrap();
    assert!(bridge.attach_producer(engine.clone()).unwrap());
    assert_eq!(Arc::strong_count(&bridge), 1);
    assert_eq!(backend.live(ObjectKind::SharedHandle), 1);

    drop(bridge);
    drop(engine);

    assert_eq!(backend.live(ObjectKind::SharedHandle), 0);
    assert_eq!(backend.live_total(), 0);
}
