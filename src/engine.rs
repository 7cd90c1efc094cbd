//! Contract with the decoding engine.
//!
//! The engine is a black box that drives output through a fixed set of
//! callbacks, invoked from its own threads. [`OutputCallbacks`] is what the
//! bridge implements; [`VideoEngine`] is the one call the bridge needs from
//! the engine to install or remove them.

use crate::backend::{RawHandle, RenderFormat};
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// Output size requested by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Bt709,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorPrimaries {
    Bt709,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFunction {
    Srgb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    TopLeft,
}

/// How the decoder must write into the shared texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputDescriptor {
    /// Native DXGI format code of the shared texture.
    pub dxgi_format: u32,
    pub full_range: bool,
    pub color_space: ColorSpace,
    pub color_primaries: ColorPrimaries,
    pub transfer_function: TransferFunction,
    pub orientation: Orientation,
}

impl OutputDescriptor {
    pub fn for_format(format: RenderFormat) -> Self {
        Self {
            dxgi_format: format.dxgi_code(),
            full_range: true,
            color_space: ColorSpace::Bt709,
            color_primaries: ColorPrimaries::Bt709,
            transfer_function: TransferFunction::Srgb,
            orientation: Orientation::TopLeft,
        }
    }
}

/// Opaque value the decoder passes with its resize-report callback and
/// expects back on every report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReportToken(pub usize);

/// Resize report installed by the decoder: `(token, width, height)`.
pub type ReportSizeFn = Arc<dyn Fn(ReportToken, u32, u32) + Send + Sync>;

/// Callbacks the decoder invokes to render through the bridge.
pub trait OutputCallbacks: Send + Sync {
    /// Hands the producer device context to the decoder.
    fn setup(&self) -> Result<RawHandle>;

    /// The decoder no longer uses the producer device.
    fn cleanup(&self);

    /// Registers (or with `None`, removes) the resize report. A registered
    /// report fires at once if the surface size is already known.
    fn set_resize(&self, report: Option<ReportSizeFn>, token: ReportToken);

    fn update_output(&self, config: RenderConfig) -> Result<OutputDescriptor>;

    fn swap(&self) -> Result<()>;

    /// `true` before the decoder draws a frame, `false` after.
    fn start_rendering(&self, entering: bool) -> bool;

    fn select_plane(&self, plane: usize) -> bool;
}

/// The engine side: accepts a callback set, or `None` to stop using one.
pub trait VideoEngine: Send + Sync {
    fn set_output_callbacks(&self, callbacks: Option<Arc<dyn OutputCallbacks>>);
}

/// Minimal engine that just holds whatever callbacks were installed, for
/// hosts that drive the callbacks themselves.
#[derive(Default)]
pub struct CallbackSlot {
    callbacks: Mutex<Option<Arc<dyn OutputCallbacks>>>,
}

impl CallbackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(&self) -> Option<Arc<dyn OutputCallbacks>> {
        self.callbacks.lock().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.callbacks.lock().is_some()
    }
}

impl VideoEngine for CallbackSlot {
    fn set_output_callbacks(&self, callbacks: Option<Arc<dyn OutputCallbacks>>) {
        *self.callbacks.lock() = callbacks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_is_full_range_bt709_top_left() {
        let desc = OutputDescriptor::for_format(RenderFormat::Bgra8);
        assert_eq!(desc.dxgi_format, 87);
        assert!(desc.full_range);
        assert_eq!(desc.color_space, ColorSpace::Bt709);
        assert_eq!(desc.color_primaries, ColorPrimaries::Bt709);
        assert_eq!(desc.transfer_function, TransferFunction::Srgb);
        assert_eq!(desc.orientation, Orientation::TopLeft);
    }

    #[test]
    fn descriptor_follows_render_format() {
        assert_eq!(OutputDescriptor::for_format(RenderFormat::Rgba8).dxgi_format, 28);
    }

    #[test]
    fn empty_slot_is_disabled() {
        let slot = CallbackSlot::new();
        assert!(!slot.is_enabled());
        slot.set_output_callbacks(None);
        assert!(slot.callbacks().is_none());
    }
}
