//! Headless backend that records every native call and tracks each object's
//! reference count. Used where no GPU is available and by the test suite.

use super::{ClearColor, DeviceRole, GpuBackend, GpuObject, GpuObjectGroup, RawHandle, RenderFormat, SurfaceMode};
use crate::error::{BridgeError, Result};
use crate::shader::PipelineDesc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const E_FAIL: i32 = 0x8000_4005u32 as i32;

// Binding slots on a context. Shader views use their own slot number.
const SLOT_RENDER_TARGET: u32 = 0x100;
const SLOT_PIPELINE: u32 = 0x200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Device,
    Context,
    SwapChain,
    BackBufferView,
    SharedTexture,
    OpenedTexture,
    ShaderView,
    FrameTargetView,
    SharedHandle,
    PipelinePart,
}

/// Native calls that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    ConsumerDevice,
    ProducerDevice,
    Multithread,
    SwapChain,
    ResizeBuffers,
    BackBufferView,
    SharedTexture,
    ExportHandle,
    OpenHandle,
    ShaderView,
    TargetView,
    ShaderCompile,
    Present,
}

#[derive(Default)]
struct Ledger {
    next_id: u64,
    live: HashMap<u64, (ObjectKind, u32)>,
    extents: HashMap<u64, (u32, u32)>,
    created: HashMap<ObjectKind, usize>,
    peak: HashMap<ObjectKind, usize>,
    calls: Vec<String>,
    armed: Vec<FailPoint>,
    pinned: Vec<ObjectKind>,
    /// (context id, slot) -> bound object id. A binding holds a reference.
    bindings: HashMap<(u64, u32), u64>,
}

impl Ledger {
    fn live_of(&self, kind: ObjectKind) -> usize {
        self.live.values().filter(|(k, _)| *k == kind).count()
    }

    fn add_ref(&mut self, id: u64) {
        if let Some((_, refs)) = self.live.get_mut(&id) {
            *refs += 1;
        }
    }

    fn drop_ref(&mut self, id: u64) -> u32 {
        let remaining = match self.live.get_mut(&id) {
            Some((_, refs)) => {
                *refs = refs.saturating_sub(1);
                *refs
            }
            None => 0,
        };
        if remaining == 0 {
            self.live.remove(&id);
            self.extents.remove(&id);
        }
        remaining
    }

    fn bind(&mut self, context: u64, slot: u32, id: u64) {
        self.add_ref(id);
        if let Some(previous) = self.bindings.insert((context, slot), id) {
            self.drop_ref(previous);
        }
    }

    fn unbind(&mut self, context: u64, slot: u32) {
        if let Some(previous) = self.bindings.remove(&(context, slot)) {
            self.drop_ref(previous);
        }
    }

    fn clear_bindings(&mut self, context: u64) {
        let slots: Vec<(u64, u32)> = self.bindings.keys().filter(|(c, _)| *c == context).copied().collect();
        for key in slots {
            if let Some(id) = self.bindings.remove(&key) {
                self.drop_ref(id);
            }
        }
    }

    fn trip(&mut self, point: FailPoint) -> bool {
        match self.armed.iter().position(|p| *p == point) {
            Some(idx) => {
                self.armed.remove(idx);
                self.calls.push(format!("fail {:?}", point));
                true
            }
            None => false,
        }
    }
}

/// A recorded GPU object. Dropping it without [`GpuObject::release`] still
/// gives its reference back, like a COM smart pointer.
pub struct RecordedObject {
    id: u64,
    kind: ObjectKind,
    ledger: Arc<Mutex<Ledger>>,
    released: bool,
}

impl RecordedObject {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    fn label(&self) -> String {
        format!("{:?}#{}", self.kind, self.id)
    }

    fn give_back(&mut self) -> u32 {
        self.released = true;
        let mut ledger = self.ledger.lock();
        let remaining = ledger.drop_ref(self.id);
        // A destroyed context lets go of everything bound to it
        if remaining == 0 && self.kind == ObjectKind::Context {
            ledger.clear_bindings(self.id);
        }
        ledger.calls.push(format!("release {:?}#{} -> {}", self.kind, self.id, remaining));
        remaining
    }
}

impl GpuObject for RecordedObject {
    fn release(mut self) -> u32 {
        self.give_back()
    }
}

impl Drop for RecordedObject {
    fn drop(&mut self) {
        if !self.released {
            self.give_back();
        }
    }
}

pub struct RecordedPipeline {
    parts: Vec<(&'static str, RecordedObject)>,
}

impl GpuObjectGroup for RecordedPipeline {
    fn release_each(self) -> Vec<(&'static str, u32)> {
        self.parts
            .into_iter()
            .map(|(name, object)| (name, object.release()))
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct RecordingBackend {
    ledger: Arc<Mutex<Ledger>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call at `point` fail with a native error.
    pub fn fail_next(&self, point: FailPoint) {
        self.ledger.lock().armed.push(point);
    }

    /// Gives the next object of `kind` an extra reference nobody releases.
    pub fn pin_next(&self, kind: ObjectKind) {
        self.ledger.lock().pinned.push(kind);
    }

    pub fn live(&self, kind: ObjectKind) -> usize {
        self.ledger.lock().live_of(kind)
    }

    pub fn live_total(&self) -> usize {
        self.ledger.lock().live.len()
    }

    /// Highest number of simultaneously live objects of `kind`.
    pub fn peak(&self, kind: ObjectKind) -> usize {
        self.ledger.lock().peak.get(&kind).copied().unwrap_or(0)
    }

    pub fn created(&self, kind: ObjectKind) -> usize {
        self.ledger.lock().created.get(&kind).copied().unwrap_or(0)
    }

    pub fn created_total(&self) -> usize {
        self.ledger.lock().created.values().sum()
    }

    /// Sizes of the live textures of `kind`.
    pub fn live_extents(&self, kind: ObjectKind) -> Vec<(u32, u32)> {
        let ledger = self.ledger.lock();
        let mut extents: Vec<(u32, u32)> = ledger
            .live
            .iter()
            .filter(|(_, (k, _))| *k == kind)
            .filter_map(|(id, _)| ledger.extents.get(id).copied())
            .collect();
        extents.sort_unstable();
        extents
    }

    pub fn calls(&self) -> Vec<String> {
        self.ledger.lock().calls.clone()
    }

    /// Number of recorded calls whose text starts with `prefix`.
    pub fn call_count(&self, prefix: &str) -> usize {
        self.ledger.lock().calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Index of the first recorded call starting with `prefix`.
    pub fn first_call(&self, prefix: &str) -> Option<usize> {
        self.ledger.lock().calls.iter().position(|c| c.starts_with(prefix))
    }

    /// Index of the last recorded call starting with `prefix`.
    pub fn last_call(&self, prefix: &str) -> Option<usize> {
        self.ledger.lock().calls.iter().rposition(|c| c.starts_with(prefix))
    }

    fn record(&self, call: String) {
        self.ledger.lock().calls.push(call);
    }

    fn check(&self, point: FailPoint) -> bool {
        self.ledger.lock().trip(point)
    }

    fn spawn(&self, kind: ObjectKind, extent: Option<(u32, u32)>, call: &str) -> RecordedObject {
        let mut ledger = self.ledger.lock();
        ledger.next_id += 1;
        let id = ledger.next_id;

        let refs = match ledger.pinned.iter().position(|k| *k == kind) {
            Some(idx) => {
                ledger.pinned.remove(idx);
                2
            }
            None => 1,
        };
        ledger.live.insert(id, (kind, refs));
        if let Some(extent) = extent {
            ledger.extents.insert(id, extent);
        }
        *ledger.created.entry(kind).or_insert(0) += 1;
        let now = ledger.live_of(kind);
        let peak = ledger.peak.entry(kind).or_insert(0);
        *peak = (*peak).max(now);
        ledger.calls.push(format!("{} -> {:?}#{}", call, kind, id));

        RecordedObject {
            id,
            kind,
            ledger: Arc::clone(&self.ledger),
            released: false,
        }
    }

    fn fake_ptr(object: &RecordedObject) -> RawHandle {
        RawHandle::from_ptr((0x1000 + object.id as usize * 0x10) as *mut std::ffi::c_void)
    }
}

impl GpuBackend for RecordingBackend {
    type Device = RecordedObject;
    type Context = RecordedObject;
    type SwapChain = RecordedObject;
    type Texture = RecordedObject;
    type ShaderView = RecordedObject;
    type TargetView = RecordedObject;
    type SharedHandle = RecordedObject;
    type Pipeline = RecordedPipeline;

    fn create_device(&self, role: DeviceRole, debug_layer: bool) -> Result<(Self::Device, Self::Context)> {
        let point = match role {
            DeviceRole::Consumer => FailPoint::ConsumerDevice,
            DeviceRole::Producer => FailPoint::ProducerDevice,
        };
        if self.check(point) {
            return Err(BridgeError::device("device", E_FAIL));
        }
        let call = format!("create_device {:?} debug={}", role, debug_layer);
        let device = self.spawn(ObjectKind::Device, None, &call);
        let context = self.spawn(ObjectKind::Context, None, &format!("immediate_context {}", device.label()));
        Ok((device, context))
    }

    fn protect_multithreaded(&self, device: &Self::Device) -> Result<()> {
        if self.check(FailPoint::Multithread) {
            return Err(BridgeError::device("multithread protection", E_FAIL));
        }
        self.record(format!("protect_multithreaded {}", device.label()));
        Ok(())
    }

    fn create_swap_chain(
        &self,
        device: &Self::Device,
        mode: &SurfaceMode,
        width: u32,
        height: u32,
        format: RenderFormat,
    ) -> Result<Self::SwapChain> {
        if self.check(FailPoint::SwapChain) {
            return Err(BridgeError::device("swap chain", E_FAIL));
        }
        let call = format!(
            "create_swap_chain {:?} {} {}x{} {:?}",
            mode.kind(),
            device.label(),
            width,
            height,
            format
        );
        Ok(self.spawn(ObjectKind::SwapChain, Some((width, height)), &call))
    }

    fn resize_swap_chain(&self, swap_chain: &Self::SwapChain, width: u32, height: u32) -> Result<()> {
        if self.check(FailPoint::ResizeBuffers) {
            return Err(BridgeError::device("resize buffers", E_FAIL));
        }
        let mut ledger = self.ledger.lock();
        // Mirrors DXGI: resizing with a back-buffer view still alive is an error
        if ledger.live_of(ObjectKind::BackBufferView) > 0 {
            ledger.calls.push(format!("resize_swap_chain {} rejected", swap_chain.label()));
            return Err(BridgeError::device("resize buffers", 0x887A_0001u32 as i32));
        }
        ledger.extents.insert(swap_chain.id, (width, height));
        ledger
            .calls
            .push(format!("resize_swap_chain {} {}x{}", swap_chain.label(), width, height));
        Ok(())
    }

    fn create_back_buffer_view(&self, device: &Self::Device, swap_chain: &Self::SwapChain) -> Result<Self::TargetView> {
        if self.check(FailPoint::BackBufferView) {
            return Err(BridgeError::device("back buffer view", E_FAIL));
        }
        let call = format!("create_back_buffer_view {} {}", device.label(), swap_chain.label());
        Ok(self.spawn(ObjectKind::BackBufferView, None, &call))
    }

    fn present(&self, swap_chain: &Self::SwapChain) -> Result<()> {
        if self.check(FailPoint::Present) {
            return Err(BridgeError::device("present", E_FAIL));
        }
        self.record(format!("present {}", swap_chain.label()));
        Ok(())
    }

    fn swap_chain_ptr(&self, swap_chain: &Self::SwapChain) -> RawHandle {
        Self::fake_ptr(swap_chain)
    }

    fn context_ptr(&self, context: &Self::Context) -> RawHandle {
        Self::fake_ptr(context)
    }

    fn set_viewport(&self, context: &Self::Context, width: u32, height: u32) {
        self.record(format!("set_viewport {} {}x{}", context.label(), width, height));
    }

    fn bind_render_target(&self, context: &Self::Context, view: &Self::TargetView) {
        let mut ledger = self.ledger.lock();
        ledger.bind(context.id, SLOT_RENDER_TARGET, view.id);
        ledger
            .calls
            .push(format!("bind_render_target {} {}", context.label(), view.label()));
    }

    fn clear_render_target(&self, context: &Self::Context, view: &Self::TargetView, color: ClearColor) {
        self.record(format!("clear {} {} {:?}", context.label(), view.label(), color));
    }

    fn unbind_render_target(&self, context: &Self::Context) {
        let mut ledger = self.ledger.lock();
        ledger.unbind(context.id, SLOT_RENDER_TARGET);
        ledger.calls.push(format!("unbind_render_target {}", context.label()));
    }

    fn clear_state(&self, context: &Self::Context) {
        let mut ledger = self.ledger.lock();
        ledger.clear_bindings(context.id);
        ledger.calls.push(format!("clear_state {}", context.label()));
    }

    fn create_shared_texture(
        &self,
        device: &Self::Device,
        width: u32,
        height: u32,
        format: RenderFormat,
    ) -> Result<Self::Texture> {
        if self.check(FailPoint::SharedTexture) {
            return Err(BridgeError::device("shared texture", E_FAIL));
        }
        let call = format!("create_shared_texture {} {}x{} {:?}", device.label(), width, height, format);
        Ok(self.spawn(ObjectKind::SharedTexture, Some((width, height)), &call))
    }

    fn export_shared_handle(&self, texture: &Self::Texture) -> Result<Self::SharedHandle> {
        if self.check(FailPoint::ExportHandle) {
            return Err(BridgeError::handle("export", E_FAIL));
        }
        let extent = self.ledger.lock().extents.get(&texture.id).copied();
        let call = format!("export_shared_handle {}", texture.label());
        Ok(self.spawn(ObjectKind::SharedHandle, extent, &call))
    }

    fn open_shared_texture(&self, device: &Self::Device, handle: &Self::SharedHandle) -> Result<Self::Texture> {
        if self.check(FailPoint::OpenHandle) {
            return Err(BridgeError::handle("open", E_FAIL));
        }
        let extent = self.ledger.lock().extents.get(&handle.id).copied();
        let call = format!("open_shared_texture {} {}", device.label(), handle.label());
        Ok(self.spawn(ObjectKind::OpenedTexture, extent, &call))
    }

    fn close_shared_handle(&self, handle: Self::SharedHandle) -> Result<()> {
        self.record(format!("close_shared_handle {}", handle.label()));
        handle.release();
        Ok(())
    }

    fn create_shader_view(
        &self,
        device: &Self::Device,
        texture: &Self::Texture,
        format: RenderFormat,
    ) -> Result<Self::ShaderView> {
        if self.check(FailPoint::ShaderView) {
            return Err(BridgeError::device("shader view", E_FAIL));
        }
        let call = format!("create_shader_view {} {} {:?}", device.label(), texture.label(), format);
        Ok(self.spawn(ObjectKind::ShaderView, None, &call))
    }

    fn bind_shader_view(&self, context: &Self::Context, slot: u32, view: &Self::ShaderView) {
        let mut ledger = self.ledger.lock();
        ledger.bind(context.id, slot, view.id);
        ledger
            .calls
            .push(format!("bind_shader_view {} slot={} {}", context.label(), slot, view.label()));
    }

    fn unbind_shader_view(&self, context: &Self::Context, slot: u32) {
        let mut ledger = self.ledger.lock();
        ledger.unbind(context.id, slot);
        ledger
            .calls
            .push(format!("unbind_shader_view {} slot={}", context.label(), slot));
    }

    fn create_target_view(
        &self,
        device: &Self::Device,
        texture: &Self::Texture,
        format: RenderFormat,
    ) -> Result<Self::TargetView> {
        if self.check(FailPoint::TargetView) {
            return Err(BridgeError::device("target view", E_FAIL));
        }
        let call = format!("create_target_view {} {} {:?}", device.label(), texture.label(), format);
        Ok(self.spawn(ObjectKind::FrameTargetView, None, &call))
    }

    fn create_pipeline(&self, device: &Self::Device, context: &Self::Context, desc: &PipelineDesc) -> Result<Self::Pipeline> {
        if self.check(FailPoint::ShaderCompile) {
            return Err(BridgeError::ShaderCompile {
                stage: desc.vertex_entry,
                diagnostics: "error X3000: syntax error: unexpected token".to_string(),
            });
        }
        let names = ["vertex shader", "pixel shader", "input layout", "vertex buffer", "index buffer", "sampler"];
        let parts: Vec<(&'static str, RecordedObject)> = names
            .iter()
            .map(|name| {
                let call = format!("create_pipeline {} {}", device.label(), name);
                (*name, self.spawn(ObjectKind::PipelinePart, None, &call))
            })
            .collect();

        // Shaders, layout, buffers and sampler stay bound to the context
        let mut ledger = self.ledger.lock();
        for (slot, (_, part)) in parts.iter().enumerate() {
            ledger.bind(context.id, SLOT_PIPELINE + slot as u32, part.id);
        }
        ledger.calls.push(format!(
            "bind_pipeline {} vertices={} indices={}",
            context.label(),
            desc.vertices.len(),
            desc.indices.len()
        ));
        drop(ledger);

        Ok(RecordedPipeline { parts })
    }

    fn draw_indexed(&self, context: &Self::Context, _pipeline: &Self::Pipeline, index_count: u32) {
        self.record(format!("draw_indexed {} {}", context.label(), index_count));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_reports_pinned_references() {
        let backend = RecordingBackend::new();
        backend.pin_next(ObjectKind::Device);
        let (device, context) = backend.create_device(DeviceRole::Consumer, false).unwrap();
        assert_eq!(context.release(), 0);
        assert_eq!(device.release(), 1);
        assert_eq!(backend.live(ObjectKind::Device), 1);
    }

    #[test]
    fn dropping_an_object_gives_its_reference_back() {
        let backend = RecordingBackend::new();
        {
            let _pair = backend.create_device(DeviceRole::Producer, false).unwrap();
            assert_eq!(backend.live_total(), 2);
        }
        assert_eq!(backend.live_total(), 0);
    }

    #[test]
    fn armed_failure_fires_once() {
        let backend = RecordingBackend::new();
        backend.fail_next(FailPoint::ConsumerDevice);
        assert!(backend.create_device(DeviceRole::Consumer, false).is_err());
        assert!(backend.create_device(DeviceRole::Consumer, false).is_ok());
    }

    #[test]
    fn binding_holds_a_reference_until_unbound() {
        let backend = RecordingBackend::new();
        let (device, context) = backend.create_device(DeviceRole::Consumer, false).unwrap();
        let swap = backend
            .create_swap_chain(&device, &SurfaceMode::CompositionTarget, 64, 64, RenderFormat::Bgra8)
            .unwrap();
        let view = backend.create_back_buffer_view(&device, &swap).unwrap();
        backend.bind_render_target(&context, &view);

        assert_eq!(view.release(), 1);
        assert_eq!(backend.live(ObjectKind::BackBufferView), 1);

        backend.unbind_render_target(&context);
        assert_eq!(backend.live(ObjectKind::BackBufferView), 0);
    }

    #[test]
    fn destroying_a_context_drops_its_bindings() {
        let backend = RecordingBackend::new();
        let (device, context) = backend.create_device(DeviceRole::Consumer, false).unwrap();
        let swap = backend
            .create_swap_chain(&device, &SurfaceMode::CompositionTarget, 64, 64, RenderFormat::Bgra8)
            .unwrap();
        let view = backend.create_back_buffer_view(&device, &swap).unwrap();
        backend.bind_render_target(&context, &view);

        drop(view);
        drop(context);

        assert_eq!(backend.live(ObjectKind::BackBufferView), 0);
    }

    #[test]
    fn resize_is_rejected_while_back_buffer_view_lives() {
        let backend = RecordingBackend::new();
        let (device, _context) = backend.create_device(DeviceRole::Consumer, false).unwrap();
        let swap = backend
            .create_swap_chain(&device, &SurfaceMode::CompositionTarget, 64, 64, RenderFormat::Bgra8)
            .unwrap();
        let view = backend.create_back_buffer_view(&device, &swap).unwrap();
        assert!(backend.resize_swap_chain(&swap, 128, 128).is_err());
        view.release();
        assert!(backend.resize_swap_chain(&swap, 128, 128).is_ok());
    }
}
