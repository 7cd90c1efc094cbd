//! Facade for the hosting surface.
//!
//! The host reports its size from the UI thread and wires a decoder engine to
//! the bridge; the decoder then calls back from its own threads. The pending
//! size and the decoder's resize report live behind one lock, the render loop
//! behind another. The two are never held together, and a resize report runs
//! with neither held, so it may call back into the bridge.
//!
//! The engine only ever sees a [`BridgeCallbacks`] adapter holding a weak
//! reference. Dropping the last host handle drops the bridge, which detaches
//! the engine and releases the session.

use crate::backend::{GpuBackend, RawHandle, SurfaceMode};
use crate::config::BridgeConfig;
use crate::controller::{RenderLoop, RenderState};
use crate::engine::{OutputCallbacks, OutputDescriptor, RenderConfig, ReportSizeFn, ReportToken, VideoEngine};
use crate::error::{BridgeError, Result};
use crate::session::RenderSession;
use crate::{log_error, log_info, log_warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

#[derive(Default)]
struct PendingSize {
    width: u32,
    height: u32,
    report: Option<(ReportSizeFn, ReportToken)>,
}

impl PendingSize {
    fn is_known(&self) -> bool {
        self.width != 0 && self.height != 0
    }

    /// The registered report and its arguments, to be invoked once the lock
    /// is released.
    fn pending_report(&self) -> Option<PendingReport> {
        self.report.as_ref().map(|(report, token)| PendingReport {
            report: Arc::clone(report),
            token: *token,
            width: self.width,
            height: self.height,
        })
    }
}

struct PendingReport {
    report: ReportSizeFn,
    token: ReportToken,
    width: u32,
    height: u32,
}

impl PendingReport {
    fn fire(self) {
        (self.report)(self.token, self.width, self.height);
    }
}

pub struct VideoBridge<B: GpuBackend + Clone> {
    backend: B,
    mode: SurfaceMode,
    config: BridgeConfig,
    size: Mutex<PendingSize>,
    render: Mutex<Option<RenderLoop<B>>>,
    engine: Mutex<Option<Arc<dyn VideoEngine>>>,
}

impl<B: GpuBackend + Clone> VideoBridge<B> {
    pub fn new(backend: B, mode: SurfaceMode, config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            backend,
            mode,
            config,
            size: Mutex::new(PendingSize::default()),
            render: Mutex::new(None),
            engine: Mutex::new(None),
        })
    }

    /// The surface has been laid out. If an engine was attached while the
    /// size was still unknown, the attach completes now.
    pub fn notify_surface_loaded(self: &Arc<Self>, width: u32, height: u32) -> Result<()> {
        {
            let mut size = self.size.lock();
            size.width = width;
            size.height = height;
        }

        let engine = self.engine.lock().clone();
        match engine {
            Some(engine) => self.attach_producer(engine).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Records the new surface size and forwards it to the decoder's resize
    /// report, if one is registered.
    pub fn notify_surface_resize(&self, width: u32, height: u32) {
        let pending = {
            let mut size = self.size.lock();
            size.width = width;
            size.height = height;
            size.pending_report()
        };
        if let Some(pending) = pending {
            pending.fire();
        }
    }

    pub fn pending_size(&self) -> (u32, u32) {
        let size = self.size.lock();
        (size.width, size.height)
    }

    /// Creates the render session at the pending size. Does nothing if one
    /// already exists.
    pub fn create_session(&self) -> Result<()> {
        let (width, height) = self.pending_size();
        let mut render = self.render.lock();
        if let Some(lp) = render.as_ref() {
            if lp.session().is_closed() {
                return Err(BridgeError::SessionClosed);
            }
            return Ok(());
        }

        let session = RenderSession::create(self.backend.clone(), self.mode, width, height, &self.config)?;
        *render = Some(RenderLoop::new(session));
        Ok(())
    }

    /// Wires `engine` to this bridge. Returns `false` when the surface has
    /// no size yet; the attach is then finished by
    /// [`notify_surface_loaded`](Self::notify_surface_loaded).
    pub fn attach_producer(self: &Arc<Self>, engine: Arc<dyn VideoEngine>) -> Result<bool> {
        *self.engine.lock() = Some(Arc::clone(&engine));

        let (width, height) = self.pending_size();
        if width == 0 || height == 0 {
            log_info!("Producer attach deferred until the surface has a size");
            return Ok(false);
        }

        self.create_session()?;
        self.with_loop(|lp| lp.notify_resize(width, height).map(|_| ()))?;

        let callbacks: Arc<dyn OutputCallbacks> = Arc::new(BridgeCallbacks {
            bridge: Arc::downgrade(self),
        });
        engine.set_output_callbacks(Some(callbacks));
        log_info!("Producer attached at {}x{}", width, height);
        Ok(true)
    }

    /// Disables the engine's callbacks. The session stays alive.
    pub fn detach_producer(&self) {
        if let Some(engine) = self.engine.lock().take() {
            engine.set_output_callbacks(None);
            log_info!("Producer detached");
        }
    }

    /// Detaches any engine and releases the session. Later calls are no-ops;
    /// later render calls fail with [`BridgeError::SessionClosed`].
    pub fn teardown_session(&self) -> Result<()> {
        self.detach_producer();
        match self.render.lock().as_mut() {
            Some(lp) => lp.teardown(),
            None => Ok(()),
        }
    }

    pub fn swap_chain_ptr(&self) -> Result<RawHandle> {
        self.with_loop(|lp| lp.session().swap_chain_ptr())
    }

    pub fn state(&self) -> Option<RenderState> {
        self.render.lock().as_ref().map(|lp| lp.state())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn with_loop<T>(&self, f: impl FnOnce(&mut RenderLoop<B>) -> Result<T>) -> Result<T> {
        let mut render = self.render.lock();
        let lp = render.as_mut().ok_or(BridgeError::NoSession)?;
        f(lp)
    }
}

impl<B: GpuBackend + Clone> Drop for VideoBridge<B> {
    fn drop(&mut self) {
        // The session itself is released when the render loop drops
        self.detach_producer();
    }
}

/// What the engine holds: a weak handle that forwards each call to the
/// bridge while the host still owns it.
pub struct BridgeCallbacks<B: GpuBackend + Clone> {
    bridge: Weak<VideoBridge<B>>,
}

impl<B: GpuBackend + Clone> BridgeCallbacks<B> {
    fn bridge(&self) -> Result<Arc<VideoBridge<B>>> {
        self.bridge.upgrade().ok_or(BridgeError::SessionClosed)
    }
}

impl<B: GpuBackend + Clone> OutputCallbacks for BridgeCallbacks<B> {
    fn setup(&self) -> Result<RawHandle> {
        self.bridge()?.setup()
    }

    fn cleanup(&self) {
        match self.bridge() {
            Ok(bridge) => bridge.cleanup(),
            Err(e) => log_warn!("Producer cleanup ignored: {}", e),
        }
    }

    fn set_resize(&self, report: Option<ReportSizeFn>, token: ReportToken) {
        if let Ok(bridge) = self.bridge() {
            bridge.set_resize(report, token);
        }
    }

    fn update_output(&self, config: RenderConfig) -> Result<OutputDescriptor> {
        self.bridge()?.update_output(config)
    }

    fn swap(&self) -> Result<()> {
        self.bridge()?.swap()
    }

    fn start_rendering(&self, entering: bool) -> bool {
        self.bridge().map(|bridge| bridge.start_rendering(entering)).unwrap_or(false)
    }

    fn select_plane(&self, plane: usize) -> bool {
        self.bridge().map(|bridge| bridge.select_plane(plane)).unwrap_or(false)
    }
}

impl<B: GpuBackend + Clone> OutputCallbacks for VideoBridge<B> {
    fn setup(&self) -> Result<RawHandle> {
        self.with_loop(|lp| lp.acquire_producer_device())
    }

    fn cleanup(&self) {
        // Nothing to give back: acquire took no reference
        let result = self.with_loop(|lp| {
            lp.release_producer_device();
            Ok(())
        });
        if let Err(e) = result {
            log_warn!("Producer cleanup ignored: {}", e);
        }
    }

    fn set_resize(&self, report: Option<ReportSizeFn>, token: ReportToken) {
        let pending = {
            let mut size = self.size.lock();
            match report {
                Some(report) => {
                    size.report = Some((report, token));
                    if size.is_known() {
                        size.pending_report()
                    } else {
                        None
                    }
                }
                None => {
                    size.report = None;
                    None
                }
            }
        };
        if let Some(pending) = pending {
            pending.fire();
        }
    }

    fn update_output(&self, config: RenderConfig) -> Result<OutputDescriptor> {
        self.with_loop(|lp| lp.notify_resize(config.width, config.height))
            .inspect_err(|e| log_error!("Output update to {}x{} failed: {}", config.width, config.height, e))
    }

    fn swap(&self) -> Result<()> {
        self.with_loop(|lp| lp.notify_swap())
    }

    fn start_rendering(&self, entering: bool) -> bool {
        let result = self.with_loop(|lp| {
            if entering {
                lp.enter_rendering()
            } else {
                lp.exit_rendering()
            }
        });
        match result {
            Ok(()) => true,
            Err(e) => {
                log_warn!("Frame {} failed: {}", if entering { "start" } else { "finish" }, e);
                false
            }
        }
    }

    fn select_plane(&self, plane: usize) -> bool {
        self.with_loop(|lp| Ok(lp.select_plane(plane))).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{ObjectKind, RecordingBackend};
    use crate::engine::CallbackSlot;

    fn bridge(backend: &RecordingBackend) -> Arc<VideoBridge<RecordingBackend>> {
        let config = BridgeConfig {
            abort_on_leak: false,
            ..BridgeConfig::default()
        };
        VideoBridge::new(backend.clone(), SurfaceMode::CompositionTarget, config)
    }

    fn recorder() -> (ReportSizeFn, Arc<Mutex<Vec<(ReportToken, u32, u32)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let report: ReportSizeFn = Arc::new(move |token, w, h| sink.lock().push((token, w, h)));
        (report, seen)
    }

    #[test]
    fn registering_a_report_fires_once_with_known_size() {
        let backend = RecordingBackend::new();
        let bridge = bridge(&backend);
        bridge.notify_surface_resize(1024, 768);

        let (report, seen) = recorder();
        bridge.set_resize(Some(report), ReportToken(9));

        assert_eq!(*seen.lock(), vec![(ReportToken(9), 1024, 768)]);
    }

    #[test]
    fn surface_resize_fires_report_exactly_once() {
        let backend = RecordingBackend::new();
        let bridge = bridge(&backend);
        bridge.notify_surface_resize(640, 480);
        let (report, seen) = recorder();
        bridge.set_resize(Some(report), ReportToken(1));
        seen.lock().clear();

        bridge.notify_surface_resize(800, 600);

        assert_eq!(*seen.lock(), vec![(ReportToken(1), 800, 600)]);
    }

    #[test]
    fn unknown_size_does_not_fire_and_none_unregisters() {
        let backend = RecordingBackend::new();
        let bridge = bridge(&backend);
        let (report, seen) = recorder();

        bridge.set_resize(Some(report), ReportToken(3));
        assert!(seen.lock().is_empty());

        bridge.set_resize(None, ReportToken(3));
        bridge.notify_surface_resize(100, 100);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn reports_are_per_bridge() {
        let backend = RecordingBackend::new();
        let first = bridge(&backend);
        let second = bridge(&backend);
        let (report_a, seen_a) = recorder();
        let (report_b, seen_b) = recorder();
        first.set_resize(Some(report_a), ReportToken(1));
        second.set_resize(Some(report_b), ReportToken(2));

        first.notify_surface_resize(300, 200);

        assert_eq!(*seen_a.lock(), vec![(ReportToken(1), 300, 200)]);
        assert!(seen_b.lock().is_empty());
    }

    #[test]
    fn attach_waits_for_a_size() {
        let backend = RecordingBackend::new();
        let bridge = bridge(&backend);
        let engine = Arc::new(CallbackSlot::new());

        assert!(!bridge.attach_producer(engine.clone()).unwrap());
        assert!(!engine.is_enabled());
        assert_eq!(backend.created_total(), 0);

        bridge.notify_surface_loaded(640, 360).unwrap();

        assert!(engine.is_enabled());
        assert_eq!(backend.live_extents(ObjectKind::SharedTexture), vec![(640, 360)]);
        assert_eq!(bridge.state(), Some(RenderState::Idle));
    }

    #[test]
    fn detach_disables_callbacks_and_keeps_session() {
        let backend = RecordingBackend::new();
        let bridge = bridge(&backend);
        let engine = Arc::new(CallbackSlot::new());
        bridge.notify_surface_resize(320, 240);
        bridge.attach_producer(engine.clone()).unwrap();

        bridge.detach_producer();

        assert!(!engine.is_enabled());
        assert!(bridge.swap_chain_ptr().is_ok());
    }

    #[test]
    fn callbacks_without_session() {
        let backend = RecordingBackend::new();
        let bridge = bridge(&backend);
        assert_eq!(bridge.setup(), Err(BridgeError::NoSession));
        assert!(!bridge.start_rendering(true));
        assert!(!bridge.select_plane(0));
    }

    #[test]
    fn report_may_call_back_into_the_bridge() {
        let backend = RecordingBackend::new();
        let bridge = bridge(&backend);
        bridge.notify_surface_resize(640, 480);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let weak = Arc::downgrade(&bridge);
        let report: ReportSizeFn = Arc::new(move |token, w, h| {
            sink.lock().push((w, h));
            if let Some(bridge) = weak.upgrade() {
                assert_eq!(bridge.pending_size(), (w, h));
                bridge.set_resize(None, token);
            }
        });

        bridge.set_resize(Some(report), ReportToken(5));
        bridge.notify_surface_resize(800, 600);

        assert_eq!(*calls.lock(), vec![(640, 480)]);
    }

    #[test]
    fn dropping_the_host_handles_releases_the_session() {
        let backend = RecordingBackend::new();
        let bridge = bridge(&backend);
        let engine = Arc::new(CallbackSlot::new());
        bridge.notify_surface_loaded(640, 480).unwrap();
        assert!(bridge.attach_producer(engine.clone()).unwrap());
        let callbacks = engine.callbacks().unwrap();
        assert!(backend.live_total() > 0);

        drop(bridge);

        assert_eq!(backend.live_total(), 0);
        assert!(!engine.is_enabled());
        assert!(!callbacks.select_plane(0));
        assert_eq!(callbacks.swap(), Err(BridgeError::SessionClosed));
    }

    #[test]
    fn cleanup_without_session_is_harmless() {
        let backend = RecordingBackend::new();
        let bridge = bridge(&backend);
        bridge.cleanup();
        assert_eq!(bridge.state(), None);
    }

    #[test]
    fn teardown_twice_then_closed() {
        let backend = RecordingBackend::new();
        let bridge = bridge(&backend);
        bridge.notify_surface_resize(320, 240);
        bridge.create_session().unwrap();

        bridge.teardown_session().unwrap();
        bridge.teardown_session().unwrap();

        assert_eq!(backend.live_total(), 0);
        assert_eq!(bridge.swap(), Err(BridgeError::SessionClosed));
        assert_eq!(bridge.create_session(), Err(BridgeError::SessionClosed));
        assert!(!bridge.select_plane(0));
    }
}
