//! The two devices of a session and the consumer's swap surface.
//!
//! The consumer device owns the swap chain and is multithread protected,
//! because the bridge and pipeline are driven from the decoder's thread
//! while presents may come from the UI thread. The producer device is
//! created with video decode support and handed to the decoder.

use crate::backend::{ClearColor, DeviceRole, GpuBackend, RawHandle, RenderFormat, SurfaceMode};
use crate::error::{BridgeError, Result};
use crate::log_info;
use crate::release::LeakCheck;

/// A device and its immediate context.
pub struct DeviceHandle<B: GpuBackend> {
    pub device: B::Device,
    pub context: B::Context,
}

struct SwapSurface<B: GpuBackend> {
    mode: SurfaceMode,
    swap_chain: B::SwapChain,
    target: Option<B::TargetView>,
    width: u32,
    height: u32,
}

pub struct DevicePair<B: GpuBackend> {
    consumer: DeviceHandle<B>,
    producer: DeviceHandle<B>,
    surface: SwapSurface<B>,
    format: RenderFormat,
}

pub(crate) fn validate_dimensions(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(BridgeError::InvalidDimensions { width, height });
    }
    Ok(())
}

impl<B: GpuBackend> DevicePair<B> {
    /// Creates both devices and the swap surface. On failure every object
    /// created so far is dropped before the error is returned.
    pub fn create(
        backend: &B,
        mode: SurfaceMode,
        width: u32,
        height: u32,
        format: RenderFormat,
        debug_layer: bool,
    ) -> Result<Self> {
        validate_dimensions(width, height)?;

        let (device, context) = backend.create_device(DeviceRole::Consumer, debug_layer)?;
        backend.protect_multithreaded(&device)?;

        let swap_chain = backend.create_swap_chain(&device, &mode, width, height, format)?;
        backend.set_viewport(&context, width, height);
        let target = backend.create_back_buffer_view(&device, &swap_chain)?;
        backend.bind_render_target(&context, &target);

        let (producer_device, producer_context) = backend.create_device(DeviceRole::Producer, debug_layer)?;

        log_info!(
            "Device pair created ({:?}, {}x{}, {:?}, debug layer: {})",
            mode.kind(),
            width,
            height,
            format,
            debug_layer
        );

        Ok(Self {
            consumer: DeviceHandle { device, context },
            producer: DeviceHandle {
                device: producer_device,
                context: producer_context,
            },
            surface: SwapSurface {
                mode,
                swap_chain,
                target: Some(target),
                width,
                height,
            },
            format,
        })
    }

    /// Unbinds and drops the back-buffer view. A composition swap chain
    /// cannot resize while any reference to its buffers is alive.
    pub fn release_surface_target(&mut self, backend: &B, check: &mut LeakCheck) {
        backend.unbind_render_target(&self.consumer.context);
        check.release_opt("swap chain render target view", self.surface.target.take());
    }

    /// Drops every binding on both contexts.
    pub fn clear_bindings(&self, backend: &B) {
        backend.clear_state(&self.consumer.context);
        backend.clear_state(&self.producer.context);
    }

    /// Resizes the swap surface in place and rebuilds its render-target view.
    ///
    /// Window-bound swap chains are not resized explicitly: the window
    /// changes size on its own and only the viewport and view are rebuilt.
    pub fn resize_surface(&mut self, backend: &B, width: u32, height: u32, abort_on_leak: bool) -> Result<()> {
        validate_dimensions(width, height)?;

        let mut check = LeakCheck::new(abort_on_leak);
        self.release_surface_target(backend, &mut check);
        check.finish()?;

        if self.surface.mode.is_composition() {
            backend.resize_swap_chain(&self.surface.swap_chain, width, height)?;
        }

        backend.set_viewport(&self.consumer.context, width, height);
        let target = backend.create_back_buffer_view(&self.consumer.device, &self.surface.swap_chain)?;
        backend.bind_render_target(&self.consumer.context, &target);

        self.surface.target = Some(target);
        self.surface.width = width;
        self.surface.height = height;
        Ok(())
    }

    /// Rebinds the back-buffer view; composition swap chains can lose the
    /// binding between frames.
    pub fn bind_surface_target(&self, backend: &B) -> Result<()> {
        let target = self.surface.target.as_ref().ok_or(BridgeError::NoSharedTexture)?;
        backend.bind_render_target(&self.consumer.context, target);
        Ok(())
    }

    pub fn clear_surface(&self, backend: &B, color: ClearColor) -> Result<()> {
        let target = self.surface.target.as_ref().ok_or(BridgeError::NoSharedTexture)?;
        backend.clear_render_target(&self.consumer.context, target, color);
        Ok(())
    }

    pub fn present(&self, backend: &B) -> Result<()> {
        backend.present(&self.surface.swap_chain)
    }

    pub fn consumer(&self) -> &DeviceHandle<B> {
        &self.consumer
    }

    pub fn producer(&self) -> &DeviceHandle<B> {
        &self.producer
    }

    pub fn producer_context_ptr(&self, backend: &B) -> RawHandle {
        backend.context_ptr(&self.producer.context)
    }

    pub fn swap_chain_ptr(&self, backend: &B) -> RawHandle {
        backend.swap_chain_ptr(&self.surface.swap_chain)
    }

    pub fn mode(&self) -> SurfaceMode {
        self.surface.mode
    }

    pub fn format(&self) -> RenderFormat {
        self.format
    }

    pub fn surface_size(&self) -> (u32, u32) {
        (self.surface.width, self.surface.height)
    }

    /// Releases, in order: render-target view, swap chain, both contexts,
    /// both devices. Bindings are cleared first so no context still holds
    /// a view.
    pub fn teardown(self, backend: &B, check: &mut LeakCheck) {
        self.clear_bindings(backend);

        let DevicePair {
            consumer,
            producer,
            surface,
            ..
        } = self;

        check.release_opt("swap chain render target view", surface.target);
        check.release("swap chain", surface.swap_chain);
        check.release("consumer context", consumer.context);
        check.release("producer context", producer.context);
        check.release("consumer device", consumer.device);
        check.release("producer device", producer.device);

        log_info!("Device pair released");
    }
}
