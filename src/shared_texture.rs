//! Cross-device frame texture.
//!
//! The texture is allocated on the consumer device with NT-handle sharing,
//! exported, and re-opened on the producer device. The decoder renders into
//! the producer-side view; the consumer samples the same memory through its
//! shader view.
//!
//! Each resize builds a new generation. The previous generation is always
//! released in full before the next allocation starts, so two generations
//! are never live together, and the shared handle is closed only after both
//! views onto it are gone.

use crate::backend::{ClearColor, GpuBackend, RenderFormat};
use crate::devices::{validate_dimensions, DeviceHandle};
use crate::error::{BridgeError, Result};
use crate::release::LeakCheck;
use crate::{log_error, log_info};

/// Objects of one generation. Fields stay `None` until the matching step of
/// a rebuild succeeds, so a half-built generation releases the same way as
/// a complete one.
struct Generation<B: GpuBackend> {
    number: u64,
    width: u32,
    height: u32,
    texture: Option<B::Texture>,
    handle: Option<B::SharedHandle>,
    producer_texture: Option<B::Texture>,
    shader_view: Option<B::ShaderView>,
    target_view: Option<B::TargetView>,
}

impl<B: GpuBackend> Generation<B> {
    fn empty(number: u64, width: u32, height: u32) -> Self {
        Self {
            number,
            width,
            height,
            texture: None,
            handle: None,
            producer_texture: None,
            shader_view: None,
            target_view: None,
        }
    }
}

pub struct SharedTextureBridge<B: GpuBackend> {
    format: RenderFormat,
    current: Option<Generation<B>>,
    built: u64,
    abort_on_leak: bool,
}

impl<B: GpuBackend> SharedTextureBridge<B> {
    pub fn new(format: RenderFormat, abort_on_leak: bool) -> Self {
        Self {
            format,
            current: None,
            built: 0,
            abort_on_leak,
        }
    }

    /// Replaces the live generation with a new one of `width` x `height`.
    ///
    /// Zero dimensions are rejected before any native call. If a step fails,
    /// whatever this call created is released before the error is returned
    /// and no generation is live afterwards.
    pub fn rebuild(
        &mut self,
        backend: &B,
        consumer: &DeviceHandle<B>,
        producer: &DeviceHandle<B>,
        width: u32,
        height: u32,
    ) -> Result<()> {
        validate_dimensions(width, height)?;

        self.release(backend, consumer, producer)?;

        self.built += 1;
        let mut staging = Generation::empty(self.built, width, height);

        if let Err(e) = self.build(backend, consumer, producer, &mut staging) {
            log_error!("Shared texture generation {} failed at {}x{}: {}", staging.number, width, height, e);
            let mut check = LeakCheck::new(self.abort_on_leak);
            Self::release_generation(backend, consumer, producer, staging, &mut check);
            check.finish()?;
            return Err(e);
        }

        log_info!("Shared texture generation {} built ({}x{})", staging.number, width, height);
        self.current = Some(staging);
        Ok(())
    }

    fn build(
        &self,
        backend: &B,
        consumer: &DeviceHandle<B>,
        producer: &DeviceHandle<B>,
        staging: &mut Generation<B>,
    ) -> Result<()> {
        let texture = staging.texture.insert(backend.create_shared_texture(
            &consumer.device,
            staging.width,
            staging.height,
            self.format,
        )?);

        let handle = staging.handle.insert(backend.export_shared_handle(texture)?);

        let producer_texture = staging
            .producer_texture
            .insert(backend.open_shared_texture(&producer.device, handle)?);

        let shader_view = staging
            .shader_view
            .insert(backend.create_shader_view(&consumer.device, texture, self.format)?);
        backend.bind_shader_view(&consumer.context, 0, shader_view);

        let target_view = staging
            .target_view
            .insert(backend.create_target_view(&producer.device, producer_texture, self.format)?);
        backend.bind_render_target(&producer.context, target_view);

        Ok(())
    }

    /// Releases the live generation, if any. Safe to call when nothing is live.
    pub fn release(&mut self, backend: &B, consumer: &DeviceHandle<B>, producer: &DeviceHandle<B>) -> Result<()> {
        let Some(generation) = self.current.take() else {
            return Ok(());
        };

        let number = generation.number;
        let mut check = LeakCheck::new(self.abort_on_leak);
        Self::release_generation(backend, consumer, producer, generation, &mut check);
        check.finish()?;
        log_info!("Shared texture generation {} released", number);
        Ok(())
    }

    fn release_generation(
        backend: &B,
        consumer: &DeviceHandle<B>,
        producer: &DeviceHandle<B>,
        generation: Generation<B>,
        check: &mut LeakCheck,
    ) {
        // The contexts hold the views while they are bound
        if generation.target_view.is_some() {
            backend.unbind_render_target(&producer.context);
        }
        if generation.shader_view.is_some() {
            backend.unbind_shader_view(&consumer.context, 0);
        }

        let Generation {
            target_view,
            shader_view,
            producer_texture,
            texture,
            handle,
            ..
        } = generation;

        check.release_opt("producer render target view", target_view);
        check.release_opt("consumer shader view", shader_view);
        check.release_opt("producer texture", producer_texture);
        check.release_opt("consumer texture", texture);

        if let Some(handle) = handle {
            if let Err(e) = backend.close_shared_handle(handle) {
                check.record_error(e);
            }
        }
    }

    /// Clears the producer-side view so regions the decoder never paints
    /// stand out.
    pub fn clear_producer_target(&self, backend: &B, producer: &DeviceHandle<B>, color: ClearColor) -> Result<()> {
        let target = self
            .current
            .as_ref()
            .and_then(|g| g.target_view.as_ref())
            .ok_or(BridgeError::NoSharedTexture)?;
        backend.clear_render_target(&producer.context, target, color);
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.current.is_some()
    }

    /// Size of the live generation.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.current.as_ref().map(|g| (g.width, g.height))
    }

    /// Number of the live generation; generations count up from 1.
    pub fn generation(&self) -> Option<u64> {
        self.current.as_ref().map(|g| g.number)
    }

    pub fn format(&self) -> RenderFormat {
        self.format
    }
}
