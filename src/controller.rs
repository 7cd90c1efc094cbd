//! Render loop driven by the decoder's lifecycle callbacks.

use crate::backend::{GpuBackend, RawHandle};
use crate::engine::OutputDescriptor;
use crate::error::Result;
use crate::log_info;
use crate::session::RenderSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    /// Session exists, no decoder has taken the producer device.
    Idle,
    Attached,
    Rendering,
    Paused,
    Detached,
}

pub struct RenderLoop<B: GpuBackend> {
    session: RenderSession<B>,
    state: RenderState,
}

impl<B: GpuBackend> RenderLoop<B> {
    pub fn new(session: RenderSession<B>) -> Self {
        Self {
            session,
            state: RenderState::Idle,
        }
    }

    /// Hands out the producer context. No reference is taken, so repeated
    /// acquires need no matching release.
    pub fn acquire_producer_device(&mut self) -> Result<RawHandle> {
        let context = self.session.producer_context_ptr()?;
        if matches!(self.state, RenderState::Idle | RenderState::Detached) {
            self.state = RenderState::Attached;
        }
        log_info!("Producer device acquired");
        Ok(context)
    }

    /// Counterpart of [`acquire_producer_device`](Self::acquire_producer_device).
    /// Releases nothing.
    pub fn release_producer_device(&mut self) {
        self.state = RenderState::Detached;
        log_info!("Producer device released");
    }

    /// Builds a new frame texture for `width` x `height` and returns the
    /// format the decoder has to write.
    pub fn notify_resize(&mut self, width: u32, height: u32) -> Result<OutputDescriptor> {
        self.session.resize(width, height)?;
        Ok(OutputDescriptor::for_format(self.session.render_format()?))
    }

    /// Presents immediately, without waiting for vertical sync.
    pub fn notify_swap(&self) -> Result<()> {
        self.session.present()
    }

    pub fn enter_rendering(&mut self) -> Result<()> {
        self.session.begin_frame()?;
        self.state = RenderState::Rendering;
        Ok(())
    }

    pub fn exit_rendering(&mut self) -> Result<()> {
        self.session.finish_frame()?;
        self.state = RenderState::Paused;
        Ok(())
    }

    /// Only the single RGBA plane is supported, and only while the session
    /// is open.
    pub fn select_plane(&self, plane: usize) -> bool {
        !self.session.is_closed() && plane == 0
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    pub fn session(&self) -> &RenderSession<B> {
        &self.session
    }

    pub fn teardown(&mut self) -> Result<()> {
        self.state = RenderState::Detached;
        self.session.teardown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordingBackend;
    use crate::backend::SurfaceMode;
    use crate::config::BridgeConfig;
    use crate::engine::Orientation;
    use crate::error::BridgeError;

    fn render_loop(backend: &RecordingBackend) -> RenderLoop<RecordingBackend> {
        let config = BridgeConfig {
            abort_on_leak: false,
            ..BridgeConfig::default()
        };
        let session = RenderSession::create(backend.clone(), SurfaceMode::CompositionTarget, 640, 480, &config).unwrap();
        RenderLoop::new(session)
    }

    #[test]
    fn lifecycle_walks_the_states() {
        let backend = RecordingBackend::new();
        let mut lp = render_loop(&backend);
        assert_eq!(lp.state(), RenderState::Idle);

        let context = lp.acquire_producer_device().unwrap();
        assert!(!context.is_null());
        assert_eq!(lp.state(), RenderState::Attached);

        lp.notify_resize(640, 480).unwrap();
        lp.enter_rendering().unwrap();
        assert_eq!(lp.state(), RenderState::Rendering);
        lp.exit_rendering().unwrap();
        assert_eq!(lp.state(), RenderState::Paused);
        lp.enter_rendering().unwrap();
        assert_eq!(lp.state(), RenderState::Rendering);

        lp.release_producer_device();
        assert_eq!(lp.state(), RenderState::Detached);
        lp.acquire_producer_device().unwrap();
        assert_eq!(lp.state(), RenderState::Attached);
    }

    #[test]
    fn repeated_acquire_hands_out_the_same_context() {
        let backend = RecordingBackend::new();
        let mut lp = render_loop(&backend);
        let first = lp.acquire_producer_device().unwrap();
        let second = lp.acquire_producer_device().unwrap();
        assert_eq!(first, second);
        assert_eq!(lp.state(), RenderState::Attached);
    }

    #[test]
    fn enter_clears_producer_then_rebinds_surface() {
        let backend = RecordingBackend::new();
        let mut lp = render_loop(&backend);
        lp.notify_resize(640, 480).unwrap();

        lp.enter_rendering().unwrap();

        let clear = backend.last_call("clear Context#6 FrameTargetView").unwrap();
        let bind = backend.last_call("bind_render_target Context#2 BackBufferView").unwrap();
        assert!(clear < bind);
        assert!(backend.calls()[clear].ends_with("[0.5, 0.5, 0.0, 1.0]"));
    }

    #[test]
    fn exit_clears_surface_then_draws_once() {
        let backend = RecordingBackend::new();
        let mut lp = render_loop(&backend);
        lp.notify_resize(640, 480).unwrap();

        lp.exit_rendering().unwrap();

        let clear = backend.last_call("clear Context#2 BackBufferView").unwrap();
        let draw = backend.last_call("draw_indexed").unwrap();
        assert!(clear < draw);
        assert!(backend.calls()[clear].ends_with("[1.0, 0.5, 0.0, 1.0]"));
        assert_eq!(backend.call_count("draw_indexed Context#2 6"), 1);
    }

    #[test]
    fn only_plane_zero_is_accepted() {
        let backend = RecordingBackend::new();
        let lp = render_loop(&backend);
        assert!(lp.select_plane(0));
        for plane in 1..4 {
            assert!(!lp.select_plane(plane));
        }
    }

    #[test]
    fn closed_session_refuses_plane_zero() {
        let backend = RecordingBackend::new();
        let mut lp = render_loop(&backend);
        lp.teardown().unwrap();
        assert!(!lp.select_plane(0));
    }

    #[test]
    fn resize_reports_top_left_descriptor() {
        let backend = RecordingBackend::new();
        let mut lp = render_loop(&backend);
        let desc = lp.notify_resize(1280, 720).unwrap();
        assert_eq!(desc.orientation, Orientation::TopLeft);
        assert_eq!(desc.dxgi_format, 87);
    }

    #[test]
    fn rendering_without_texture_fails() {
        let backend = RecordingBackend::new();
        let mut lp = render_loop(&backend);
        lp.acquire_producer_device().unwrap();
        assert_eq!(lp.enter_rendering(), Err(BridgeError::NoSharedTexture));
        assert_eq!(lp.state(), RenderState::Attached);
    }

    #[test]
    fn swap_presents() {
        let backend = RecordingBackend::new();
        let lp = render_loop(&backend);
        lp.notify_swap().unwrap();
        assert_eq!(backend.call_count("present"), 1);
    }
}
