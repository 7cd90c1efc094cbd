//! One rendering session: the device pair, the shared texture generation and
//! the blit pipeline, torn down in a fixed order.

use crate::backend::{ClearColor, GpuBackend, RawHandle, RenderFormat, SurfaceMode};
use crate::config::BridgeConfig;
use crate::devices::{validate_dimensions, DevicePair};
use crate::error::{BridgeError, Result};
use crate::release::LeakCheck;
use crate::shader::ShaderPipeline;
use crate::shared_texture::SharedTextureBridge;
use crate::{log_error, log_info};

struct SessionParts<B: GpuBackend> {
    devices: DevicePair<B>,
    bridge: SharedTextureBridge<B>,
    pipeline: ShaderPipeline<B>,
}

pub struct RenderSession<B: GpuBackend> {
    backend: B,
    parts: Option<SessionParts<B>>,
    producer_clear: ClearColor,
    consumer_clear: ClearColor,
    abort_on_leak: bool,
}

impl<B: GpuBackend> RenderSession<B> {
    /// Builds the device pair and the blit pipeline. Nothing survives a
    /// failed construction.
    pub fn create(backend: B, mode: SurfaceMode, width: u32, height: u32, config: &BridgeConfig) -> Result<Self> {
        let devices = DevicePair::create(&backend, mode, width, height, config.render_format, config.debug_layer)?;

        let consumer = devices.consumer();
        let pipeline = match ShaderPipeline::initialize(&backend, &consumer.device, &consumer.context) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                log_error!("Shader pipeline failed: {}", e);
                let mut check = LeakCheck::new(config.abort_on_leak);
                devices.teardown(&backend, &mut check);
                check.finish()?;
                return Err(e);
            }
        };

        log_info!("Render session created ({}x{})", width, height);

        Ok(Self {
            backend,
            parts: Some(SessionParts {
                devices,
                bridge: SharedTextureBridge::new(config.render_format, config.abort_on_leak),
                pipeline,
            }),
            producer_clear: config.producer_clear_color,
            consumer_clear: config.consumer_clear_color,
            abort_on_leak: config.abort_on_leak,
        })
    }

    fn parts(&self) -> Result<&SessionParts<B>> {
        self.parts.as_ref().ok_or(BridgeError::SessionClosed)
    }

    /// Replaces the output with one of `width` x `height`: drops the live
    /// generation, resizes the swap surface, then builds the next generation.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        validate_dimensions(width, height)?;
        let abort_on_leak = self.abort_on_leak;
        let backend = &self.backend;
        let parts = self.parts.as_mut().ok_or(BridgeError::SessionClosed)?;

        let SessionParts { devices, bridge, .. } = parts;
        bridge.release(backend, devices.consumer(), devices.producer())?;
        devices.resize_surface(backend, width, height, abort_on_leak)?;
        bridge.rebuild(backend, devices.consumer(), devices.producer(), width, height)?;

        log_info!("Output resized to {}x{}", width, height);
        Ok(())
    }

    /// Clears the producer view and rebinds the swap chain's view before the
    /// decoder draws.
    pub fn begin_frame(&self) -> Result<()> {
        let parts = self.parts()?;
        parts
            .bridge
            .clear_producer_target(&self.backend, parts.devices.producer(), self.producer_clear)?;
        parts.devices.bind_surface_target(&self.backend)
    }

    /// Clears the swap chain's view and blits the shared frame onto it.
    pub fn finish_frame(&self) -> Result<()> {
        let parts = self.parts()?;
        if !parts.bridge.is_live() {
            return Err(BridgeError::NoSharedTexture);
        }
        parts.devices.clear_surface(&self.backend, self.consumer_clear)?;
        parts
            .pipeline
            .draw_indexed(&self.backend, &parts.devices.consumer().context);
        Ok(())
    }

    pub fn present(&self) -> Result<()> {
        self.parts()?.devices.present(&self.backend)
    }

    pub fn producer_context_ptr(&self) -> Result<RawHandle> {
        Ok(self.parts()?.devices.producer_context_ptr(&self.backend))
    }

    /// Native swap chain, for hosts that attach it to their own visual. The
    /// host must detach it before the session is torn down.
    pub fn swap_chain_ptr(&self) -> Result<RawHandle> {
        Ok(self.parts()?.devices.swap_chain_ptr(&self.backend))
    }

    pub fn render_format(&self) -> Result<RenderFormat> {
        Ok(self.parts()?.bridge.format())
    }

    pub fn surface_size(&self) -> Result<(u32, u32)> {
        Ok(self.parts()?.devices.surface_size())
    }

    pub fn generation(&self) -> Result<Option<u64>> {
        Ok(self.parts()?.bridge.generation())
    }

    pub fn has_frame_texture(&self) -> bool {
        self.parts.as_ref().map(|p| p.bridge.is_live()).unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.parts.is_none()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Releases the shared generation, the pipeline and the device pair.
    /// A second call does nothing.
    pub fn teardown(&mut self) -> Result<()> {
        let Some(parts) = self.parts.take() else {
            return Ok(());
        };
        let SessionParts {
            devices,
            mut bridge,
            pipeline,
        } = parts;

        let mut check = LeakCheck::new(self.abort_on_leak);

        if let Err(e) = bridge.release(&self.backend, devices.consumer(), devices.producer()) {
            check.record_error(e);
        }
        // The pipeline stays bound to the consumer context until cleared
        devices.clear_bindings(&self.backend);
        for (name, remaining) in pipeline.release() {
            check.record(name, remaining);
        }
        devices.teardown(&self.backend, &mut check);

        let result = check.finish();
        match &result {
            Ok(()) => log_info!("Render session torn down"),
            Err(e) => log_error!("Render session torn down with errors: {}", e),
        }
        result
    }
}

impl<B: GpuBackend> Drop for RenderSession<B> {
    fn drop(&mut self) {
        if self.parts.is_some() {
            // Never panic out of drop
            self.abort_on_leak = false;
            let _ = self.teardown();
        }
    }
}
