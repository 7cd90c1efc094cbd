pub mod logger;
pub mod error;
pub mod config;
pub mod backend;
pub mod release;
pub mod shader;
pub mod devices;
pub mod shared_texture;
pub mod session;
pub mod controller;
pub mod engine;
pub mod view;
#[cfg(windows)]
pub mod host;

pub use logger::*;
pub use error::{BridgeError, Result};
pub use config::BridgeConfig;
pub use backend::{GpuBackend, NativeWindow, RawHandle, RenderFormat, SurfaceKind, SurfaceMode};
pub use backend::recording::RecordingBackend;
#[cfg(windows)]
pub use backend::d3d11::D3D11Backend;
pub use devices::{DeviceHandle, DevicePair};
pub use shared_texture::SharedTextureBridge;
pub use shader::ShaderPipeline;
pub use session::RenderSession;
pub use controller::{RenderLoop, RenderState};
pub use engine::{CallbackSlot, OutputCallbacks, OutputDescriptor, RenderConfig, ReportSizeFn, ReportToken, VideoEngine};
pub use view::{BridgeCallbacks, VideoBridge};
