//! Native graphics seam.
//!
//! Everything above this module talks to the GPU through [`GpuBackend`]. The
//! Direct3D 11 implementation lives in [`d3d11`] (Windows only); the
//! [`recording`] backend tracks object lifetimes without a GPU.

#[cfg(windows)]
pub mod d3d11;
pub mod recording;

use crate::error::Result;
use crate::shader::PipelineDesc;
use serde::{Deserialize, Serialize};
use std::ffi::c_void;

/// RGBA clear colour, each channel in `0.0..=1.0`.
pub type ClearColor = [f32; 4];

/// A GPU object whose release reports the reference count left behind.
pub trait GpuObject {
    /// Drops this reference. Returns the count the object reports afterwards;
    /// anything other than zero means someone else still holds it.
    fn release(self) -> u32;
}

/// A bundle of GPU objects released together, each reported by name.
pub trait GpuObjectGroup {
    fn release_each(self) -> Vec<(&'static str, u32)>;
}

/// 8-bit-per-channel format shared by the swap chain and the frame texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderFormat {
    #[default]
    Bgra8,
    Rgba8,
}

impl RenderFormat {
    /// DXGI_FORMAT value handed to the decoder.
    pub fn dxgi_code(self) -> u32 {
        match self {
            RenderFormat::Bgra8 => 87, // DXGI_FORMAT_B8G8R8A8_UNORM
            RenderFormat::Rgba8 => 28, // DXGI_FORMAT_R8G8B8A8_UNORM
        }
    }
}

/// Native window reference (an `HWND` on Windows).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeWindow(pub isize);

/// How the consumer swap chain reaches the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceMode {
    /// Classic swap chain bound to a window.
    WindowBound(NativeWindow),
    /// Swap chain for composition; the host attaches it to its own visual.
    CompositionTarget,
}

impl SurfaceMode {
    pub fn kind(&self) -> SurfaceKind {
        match self {
            SurfaceMode::WindowBound(_) => SurfaceKind::Window,
            SurfaceMode::CompositionTarget => SurfaceKind::Composition,
        }
    }

    pub fn is_composition(&self) -> bool {
        matches!(self, SurfaceMode::CompositionTarget)
    }
}

/// [`SurfaceMode`] without the window payload, as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceKind {
    #[default]
    Composition,
    Window,
}

/// An untyped native pointer handed across the decoder boundary. No reference
/// is taken when one is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(usize);

impl RawHandle {
    pub fn from_ptr(ptr: *mut c_void) -> Self {
        RawHandle(ptr as usize)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Which side of the bridge a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    /// Owns the swap chain and samples the shared texture.
    Consumer,
    /// Handed to the decoder; created with video decode support.
    Producer,
}

/// The native calls the bridge is built from.
///
/// Devices and contexts are passed explicitly; a backend never remembers
/// which device an object came from. Objects may move between the UI and
/// decoder threads, so all of them are `Send`.
pub trait GpuBackend: Send + Sync + 'static {
    type Device: GpuObject + Send;
    type Context: GpuObject + Send;
    type SwapChain: GpuObject + Send;
    type Texture: GpuObject + Send;
    type ShaderView: GpuObject + Send;
    type TargetView: GpuObject + Send;
    type SharedHandle: Send;
    type Pipeline: GpuObjectGroup + Send;

    fn create_device(&self, role: DeviceRole, debug_layer: bool) -> Result<(Self::Device, Self::Context)>;

    /// Serialises access to the device from several threads.
    fn protect_multithreaded(&self, device: &Self::Device) -> Result<()>;

    fn create_swap_chain(
        &self,
        device: &Self::Device,
        mode: &SurfaceMode,
        width: u32,
        height: u32,
        format: RenderFormat,
    ) -> Result<Self::SwapChain>;

    /// Resizes the buffers in place. Every view onto a back buffer must have
    /// been released first.
    fn resize_swap_chain(&self, swap_chain: &Self::SwapChain, width: u32, height: u32) -> Result<()>;

    fn create_back_buffer_view(&self, device: &Self::Device, swap_chain: &Self::SwapChain) -> Result<Self::TargetView>;

    fn present(&self, swap_chain: &Self::SwapChain) -> Result<()>;

    fn swap_chain_ptr(&self, swap_chain: &Self::SwapChain) -> RawHandle;

    fn context_ptr(&self, context: &Self::Context) -> RawHandle;

    fn set_viewport(&self, context: &Self::Context, width: u32, height: u32);

    fn bind_render_target(&self, context: &Self::Context, view: &Self::TargetView);

    fn clear_render_target(&self, context: &Self::Context, view: &Self::TargetView, color: ClearColor);

    /// Unbinds the output-merger target. A bound view holds a reference the
    /// context owns, so this comes before releasing it.
    fn unbind_render_target(&self, context: &Self::Context);

    /// Drops every binding on `context` and flushes it.
    fn clear_state(&self, context: &Self::Context);

    /// Allocates a render-target + shader-resource texture flagged for NT-handle sharing.
    fn create_shared_texture(
        &self,
        device: &Self::Device,
        width: u32,
        height: u32,
        format: RenderFormat,
    ) -> Result<Self::Texture>;

    fn export_shared_handle(&self, texture: &Self::Texture) -> Result<Self::SharedHandle>;

    fn open_shared_texture(&self, device: &Self::Device, handle: &Self::SharedHandle) -> Result<Self::Texture>;

    fn close_shared_handle(&self, handle: Self::SharedHandle) -> Result<()>;

    fn create_shader_view(
        &self,
        device: &Self::Device,
        texture: &Self::Texture,
        format: RenderFormat,
    ) -> Result<Self::ShaderView>;

    fn bind_shader_view(&self, context: &Self::Context, slot: u32, view: &Self::ShaderView);

    fn unbind_shader_view(&self, context: &Self::Context, slot: u32);

    fn create_target_view(
        &self,
        device: &Self::Device,
        texture: &Self::Texture,
        format: RenderFormat,
    ) -> Result<Self::TargetView>;

    /// Compiles and uploads everything in `desc`, then binds it to `context`.
    fn create_pipeline(&self, device: &Self::Device, context: &Self::Context, desc: &PipelineDesc) -> Result<Self::Pipeline>;

    fn draw_indexed(&self, context: &Self::Context, pipeline: &Self::Pipeline, index_count: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_codes_match_dxgi() {
        assert_eq!(RenderFormat::Bgra8.dxgi_code(), 87);
        assert_eq!(RenderFormat::Rgba8.dxgi_code(), 28);
    }

    #[test]
    fn raw_handle_round_trips_pointer() {
        let value = 0x1000usize as *mut c_void;
        let handle = RawHandle::from_ptr(value);
        assert_eq!(handle.as_ptr(), value);
        assert!(!handle.is_null());
        assert!(RawHandle::from_ptr(std::ptr::null_mut()).is_null());
    }

    #[test]
    fn surface_kind_parses_lowercase() {
        let kind: SurfaceKind = serde_json::from_str("\"window\"").unwrap();
        assert_eq!(kind, SurfaceKind::Window);
        assert_eq!(SurfaceMode::CompositionTarget.kind(), SurfaceKind::Composition);
    }
}
