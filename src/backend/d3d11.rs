// Direct3D 11 / DXGI implementation of the bridge's native calls

use super::{
    ClearColor, DeviceRole, GpuBackend, GpuObject, GpuObjectGroup, RawHandle, RenderFormat, SurfaceMode,
};
use crate::error::{BridgeError, Result};
use crate::shader::PipelineDesc;

use windows::{
    core::*,
    Win32::{
        Foundation::*,
        Graphics::{
            Direct3D::Fxc::*,
            Direct3D::*,
            Direct3D11::*,
            Dxgi::Common::*,
            Dxgi::*,
        },
    },
};

fn native(stage: &'static str) -> impl FnOnce(windows::core::Error) -> BridgeError {
    move |e| BridgeError::device(stage, e.code().0)
}

fn native_handle(stage: &'static str) -> impl FnOnce(windows::core::Error) -> BridgeError {
    move |e| BridgeError::handle(stage, e.code().0)
}

// Out-parameters that come back empty despite S_OK
const E_POINTER_CODE: i32 = 0x8000_4003u32 as i32;

fn filled<T>(value: Option<T>, stage: &'static str) -> Result<T> {
    value.ok_or(BridgeError::device(stage, E_POINTER_CODE))
}

fn dxgi_format(format: RenderFormat) -> DXGI_FORMAT {
    match format {
        RenderFormat::Bgra8 => DXGI_FORMAT_B8G8R8A8_UNORM,
        RenderFormat::Rgba8 => DXGI_FORMAT_R8G8B8A8_UNORM,
    }
}

/// Owned COM reference whose release reports the remaining count.
pub struct Com<T: Interface>(T);

impl<T: Interface> Com<T> {
    pub fn get(&self) -> &T {
        &self.0
    }
}

impl<T: Interface> GpuObject for Com<T> {
    fn release(self) -> u32 {
        let raw = self.0.into_raw();
        // SAFETY: `raw` is a live COM pointer whose reference we own; calling
        // IUnknown::Release hands that reference back exactly once.
        unsafe {
            let vtable = *(raw as *const *const IUnknown_Vtbl);
            ((*vtable).Release)(raw)
        }
    }
}

// SAFETY: the consumer device is multithread protected at creation and the
// producer device is only driven from the decoder's thread; the session that
// owns these objects is moved between threads, never shared unsynchronised.
unsafe impl<T: Interface> Send for Com<T> {}

/// NT handle exported from the consumer texture. Closed on drop if the
/// bridge did not close it explicitly.
pub struct SharedNtHandle(HANDLE);

// SAFETY: an NT handle is a process-wide kernel reference with no thread affinity.
unsafe impl Send for SharedNtHandle {}

impl SharedNtHandle {
    fn close(&mut self) -> Result<()> {
        let handle = std::mem::take(&mut self.0);
        if handle.is_invalid() {
            return Ok(());
        }
        unsafe { CloseHandle(handle) }.map_err(native_handle("close"))
    }
}

impl Drop for SharedNtHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            crate::log_error!("Failed to close shared handle: {}", e);
        }
    }
}

pub struct D3D11Pipeline {
    vertex_shader: Com<ID3D11VertexShader>,
    pixel_shader: Com<ID3D11PixelShader>,
    input_layout: Com<ID3D11InputLayout>,
    vertex_buffer: Com<ID3D11Buffer>,
    index_buffer: Com<ID3D11Buffer>,
    sampler: Com<ID3D11SamplerState>,
}

impl GpuObjectGroup for D3D11Pipeline {
    fn release_each(self) -> Vec<(&'static str, u32)> {
        vec![
            ("sampler", self.sampler.release()),
            ("index buffer", self.index_buffer.release()),
            ("vertex buffer", self.vertex_buffer.release()),
            ("input layout", self.input_layout.release()),
            ("pixel shader", self.pixel_shader.release()),
            ("vertex shader", self.vertex_shader.release()),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct D3D11Backend;

impl D3D11Backend {
    pub fn new() -> Self {
        D3D11Backend
    }

    unsafe fn compile_shader(source: &str, entry_point: &str, target: &str) -> Result<ID3DBlob> {
        let stage: &'static str = if target.starts_with("vs") { "vertex shader" } else { "pixel shader" };
        let to_compile_error = |diagnostics: String| BridgeError::ShaderCompile { stage, diagnostics };

        let entry = std::ffi::CString::new(entry_point).map_err(|e| to_compile_error(e.to_string()))?;
        let profile = std::ffi::CString::new(target).map_err(|e| to_compile_error(e.to_string()))?;

        let mut blob: Option<ID3DBlob> = None;
        let mut error_blob: Option<ID3DBlob> = None;

        let result = D3DCompile(
            source.as_ptr() as *const _,
            source.len(),
            None,
            None,
            None,
            PCSTR(entry.as_ptr() as *const u8),
            PCSTR(profile.as_ptr() as *const u8),
            0,
            0,
            &mut blob,
            Some(&mut error_blob),
        );

        if let Err(e) = result {
            let diagnostics = match error_blob {
                Some(error_blob) => {
                    let bytes = std::slice::from_raw_parts(
                        error_blob.GetBufferPointer() as *const u8,
                        error_blob.GetBufferSize(),
                    );
                    String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string()
                }
                None => format!("{} (code 0x{:08X})", e.message(), e.code().0),
            };
            return Err(to_compile_error(diagnostics));
        }

        blob.ok_or_else(|| to_compile_error("compiler returned no bytecode".to_string()))
    }

    unsafe fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
        std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
    }

    unsafe fn create_buffer<T>(device: &ID3D11Device, data: &[T], bind: D3D11_BIND_FLAG) -> Result<ID3D11Buffer> {
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: std::mem::size_of_val(data) as u32,
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: bind.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
            StructureByteStride: 0,
        };
        let init = D3D11_SUBRESOURCE_DATA {
            pSysMem: data.as_ptr() as *const _,
            SysMemPitch: 0,
            SysMemSlicePitch: 0,
        };
        let mut buffer: Option<ID3D11Buffer> = None;
        device
            .CreateBuffer(&desc, Some(&init), Some(&mut buffer))
            .map_err(native("quad buffer"))?;
        filled(buffer, "quad buffer")
    }
}

impl GpuBackend for D3D11Backend {
    type Device = Com<ID3D11Device>;
    type Context = Com<ID3D11DeviceContext>;
    type SwapChain = Com<IDXGISwapChain1>;
    type Texture = Com<ID3D11Texture2D>;
    type ShaderView = Com<ID3D11ShaderResourceView>;
    type TargetView = Com<ID3D11RenderTargetView>;
    type SharedHandle = SharedNtHandle;
    type Pipeline = D3D11Pipeline;

    fn create_device(&self, role: DeviceRole, debug_layer: bool) -> Result<(Self::Device, Self::Context)> {
        let stage = match role {
            DeviceRole::Consumer => "consumer device",
            DeviceRole::Producer => "producer device",
        };

        let mut flags = D3D11_CREATE_DEVICE_BGRA_SUPPORT;
        if debug_layer {
            flags |= D3D11_CREATE_DEVICE_DEBUG;
        }
        if role == DeviceRole::Producer {
            // Needed for hardware decoding
            flags |= D3D11_CREATE_DEVICE_VIDEO_SUPPORT;
        }

        let feature_levels = [
            D3D_FEATURE_LEVEL_11_1,
            D3D_FEATURE_LEVEL_11_0,
            D3D_FEATURE_LEVEL_10_1,
        ];

        let mut device: Option<ID3D11Device> = None;
        let mut context: Option<ID3D11DeviceContext> = None;

        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                HMODULE::default(),
                flags,
                Some(&feature_levels),
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
            .map_err(native(stage))?;
        }

        Ok((Com(filled(device, stage)?), Com(filled(context, stage)?)))
    }

    fn protect_multithreaded(&self, device: &Self::Device) -> Result<()> {
        let multithread: ID3D11Multithread = device.0.cast().map_err(native("multithread protection"))?;
        unsafe {
            let _ = multithread.SetMultithreadProtected(true);
        }
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
        unsafe {
            let dxgi_device = device.0.cast::<IDXGIDevice>().map_err(native("swap chain"))?;
            let dxgi_adapter = dxgi_device.GetAdapter().map_err(native("swap chain"))?;
            let dxgi_factory: IDXGIFactory2 = dxgi_adapter.GetParent().map_err(native("swap chain"))?;

            let swap_chain = match mode {
                SurfaceMode::CompositionTarget => {
                    let desc = DXGI_SWAP_CHAIN_DESC1 {
                        Width: width,
                        Height: height,
                        Format: dxgi_format(format),
                        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                        BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                        BufferCount: 2,
                        // Flip-sequential is mandatory for composition
                        SwapEffect: DXGI_SWAP_EFFECT_FLIP_SEQUENTIAL,
                        AlphaMode: DXGI_ALPHA_MODE_IGNORE,
                        Flags: 0,
                        ..Default::default()
                    };
                    dxgi_factory.CreateSwapChainForComposition(&device.0, &desc, None)
                }
                SurfaceMode::WindowBound(window) => {
                    let desc = DXGI_SWAP_CHAIN_DESC1 {
                        Width: width,
                        Height: height,
                        Format: dxgi_format(format),
                        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                        BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                        BufferCount: 1,
                        SwapEffect: DXGI_SWAP_EFFECT_DISCARD,
                        Flags: DXGI_SWAP_CHAIN_FLAG_ALLOW_MODE_SWITCH.0 as u32,
                        ..Default::default()
                    };
                    let hwnd = HWND(window.0 as *mut std::ffi::c_void);
                    dxgi_factory.CreateSwapChainForHwnd(&device.0, hwnd, &desc, None, None)
                }
            }
            .map_err(native("swap chain"))?;

            Ok(Com(swap_chain))
        }
    }

    fn resize_swap_chain(&self, swap_chain: &Self::SwapChain, width: u32, height: u32) -> Result<()> {
        unsafe {
            // Zero count and UNKNOWN format keep the existing values
            swap_chain
                .0
                .ResizeBuffers(0, width, height, DXGI_FORMAT_UNKNOWN, DXGI_SWAP_CHAIN_FLAG(0))
                .map_err(native("resize buffers"))
        }
    }

    fn create_back_buffer_view(&self, device: &Self::Device, swap_chain: &Self::SwapChain) -> Result<Self::TargetView> {
        unsafe {
            let back_buffer: ID3D11Texture2D = swap_chain.0.GetBuffer(0).map_err(native("back buffer"))?;
            let mut rtv: Option<ID3D11RenderTargetView> = None;
            device
                .0
                .CreateRenderTargetView(&back_buffer, None, Some(&mut rtv))
                .map_err(native("back buffer view"))?;
            Ok(Com(filled(rtv, "back buffer view")?))
        }
    }

    fn present(&self, swap_chain: &Self::SwapChain) -> Result<()> {
        // Immediate present, no vsync wait
        unsafe { swap_chain.0.Present(0, DXGI_PRESENT(0)).ok().map_err(native("present")) }
    }

    fn swap_chain_ptr(&self, swap_chain: &Self::SwapChain) -> RawHandle {
        RawHandle::from_ptr(swap_chain.0.as_raw())
    }

    fn context_ptr(&self, context: &Self::Context) -> RawHandle {
        RawHandle::from_ptr(context.0.as_raw())
    }

    fn set_viewport(&self, context: &Self::Context, width: u32, height: u32) {
        let viewport = D3D11_VIEWPORT {
            TopLeftX: 0.0,
            TopLeftY: 0.0,
            Width: width as f32,
            Height: height as f32,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };
        unsafe { context.0.RSSetViewports(Some(&[viewport])) };
    }

    fn bind_render_target(&self, context: &Self::Context, view: &Self::TargetView) {
        unsafe { context.0.OMSetRenderTargets(Some(&[Some(view.0.clone())]), None) };
    }

    fn clear_render_target(&self, context: &Self::Context, view: &Self::TargetView, color: ClearColor) {
        unsafe { context.0.ClearRenderTargetView(&view.0, &color) };
    }

    fn unbind_render_target(&self, context: &Self::Context) {
        unsafe { context.0.OMSetRenderTargets(None, None) };
    }

    fn clear_state(&self, context: &Self::Context) {
        unsafe {
            context.0.ClearState();
            context.0.Flush();
        }
    }

    fn create_shared_texture(
        &self,
        device: &Self::Device,
        width: u32,
        height: u32,
        format: RenderFormat,
    ) -> Result<Self::Texture> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: dxgi_format(format),
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
            CPUAccessFlags: 0,
            MiscFlags: (D3D11_RESOURCE_MISC_SHARED.0 | D3D11_RESOURCE_MISC_SHARED_NTHANDLE.0) as u32,
        };

        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe {
            device
                .0
                .CreateTexture2D(&desc, None, Some(&mut texture))
                .map_err(native("shared texture"))?;
        }
        Ok(Com(filled(texture, "shared texture")?))
    }

    fn export_shared_handle(&self, texture: &Self::Texture) -> Result<Self::SharedHandle> {
        let resource: IDXGIResource1 = texture.0.cast().map_err(native_handle("export"))?;
        let handle = unsafe {
            resource
                .CreateSharedHandle(None, DXGI_SHARED_RESOURCE_READ.0 | DXGI_SHARED_RESOURCE_WRITE.0, None)
                .map_err(native_handle("export"))?
        };
        if handle.is_invalid() {
            return Err(BridgeError::handle("export", E_HANDLE.0));
        }
        Ok(SharedNtHandle(handle))
    }

    fn open_shared_texture(&self, device: &Self::Device, handle: &Self::SharedHandle) -> Result<Self::Texture> {
        let device1: ID3D11Device1 = device.0.cast().map_err(native_handle("open"))?;
        let texture: ID3D11Texture2D =
            unsafe { device1.OpenSharedResource1(handle.0).map_err(native_handle("open"))? };
        Ok(Com(texture))
    }

    fn close_shared_handle(&self, mut handle: Self::SharedHandle) -> Result<()> {
        handle.close()
    }

    fn create_shader_view(
        &self,
        device: &Self::Device,
        texture: &Self::Texture,
        format: RenderFormat,
    ) -> Result<Self::ShaderView> {
        let desc = D3D11_SHADER_RESOURCE_VIEW_DESC {
            Format: dxgi_format(format),
            ViewDimension: D3D11_SRV_DIMENSION_TEXTURE2D,
            Anonymous: D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture2D: D3D11_TEX2D_SRV { MostDetailedMip: 0, MipLevels: 1 },
            },
        };
        let mut srv: Option<ID3D11ShaderResourceView> = None;
        unsafe {
            device
                .0
                .CreateShaderResourceView(&texture.0, Some(&desc), Some(&mut srv))
                .map_err(native("shader view"))?;
        }
        Ok(Com(filled(srv, "shader view")?))
    }

    fn bind_shader_view(&self, context: &Self::Context, slot: u32, view: &Self::ShaderView) {
        unsafe { context.0.PSSetShaderResources(slot, Some(&[Some(view.0.clone())])) };
    }

    fn unbind_shader_view(&self, context: &Self::Context, slot: u32) {
        unsafe { context.0.PSSetShaderResources(slot, Some(&[None])) };
    }

    fn create_target_view(
        &self,
        device: &Self::Device,
        texture: &Self::Texture,
        format: RenderFormat,
    ) -> Result<Self::TargetView> {
        let desc = D3D11_RENDER_TARGET_VIEW_DESC {
            Format: dxgi_format(format),
            ViewDimension: D3D11_RTV_DIMENSION_TEXTURE2D,
            Anonymous: D3D11_RENDER_TARGET_VIEW_DESC_0 {
                Texture2D: D3D11_TEX2D_RTV { MipSlice: 0 },
            },
        };
        let mut rtv: Option<ID3D11RenderTargetView> = None;
        unsafe {
            device
                .0
                .CreateRenderTargetView(&texture.0, Some(&desc), Some(&mut rtv))
                .map_err(native("target view"))?;
        }
        Ok(Com(filled(rtv, "target view")?))
    }

    fn create_pipeline(&self, device: &Self::Device, context: &Self::Context, desc: &PipelineDesc) -> Result<Self::Pipeline> {
        unsafe {
            let vs_blob = Self::compile_shader(desc.source, desc.vertex_entry, desc.vertex_profile)?;
            let ps_blob = Self::compile_shader(desc.source, desc.pixel_entry, desc.pixel_profile)?;

            let mut vertex_shader: Option<ID3D11VertexShader> = None;
            device
                .0
                .CreateVertexShader(Self::blob_bytes(&vs_blob), None, Some(&mut vertex_shader))
                .map_err(native("vertex shader"))?;
            let vertex_shader = filled(vertex_shader, "vertex shader")?;

            let mut pixel_shader: Option<ID3D11PixelShader> = None;
            device
                .0
                .CreatePixelShader(Self::blob_bytes(&ps_blob), None, Some(&mut pixel_shader))
                .map_err(native("pixel shader"))?;
            let pixel_shader = filled(pixel_shader, "pixel shader")?;

            let input_elements = [
                D3D11_INPUT_ELEMENT_DESC {
                    SemanticName: s!("POSITION"),
                    SemanticIndex: 0,
                    Format: DXGI_FORMAT_R32G32B32_FLOAT,
                    InputSlot: 0,
                    AlignedByteOffset: 0,
                    InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                    InstanceDataStepRate: 0,
                },
                D3D11_INPUT_ELEMENT_DESC {
                    SemanticName: s!("TEXCOORD"),
                    SemanticIndex: 0,
                    Format: DXGI_FORMAT_R32G32_FLOAT,
                    InputSlot: 0,
                    AlignedByteOffset: 12,
                    InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                    InstanceDataStepRate: 0,
                },
            ];

            let mut input_layout: Option<ID3D11InputLayout> = None;
            device
                .0
                .CreateInputLayout(&input_elements, Self::blob_bytes(&vs_blob), Some(&mut input_layout))
                .map_err(native("input layout"))?;
            let input_layout = filled(input_layout, "input layout")?;

            let vertex_buffer = Self::create_buffer(&device.0, desc.vertices, D3D11_BIND_VERTEX_BUFFER)?;
            let index_buffer = Self::create_buffer(&device.0, desc.indices, D3D11_BIND_INDEX_BUFFER)?;

            let sampler_desc = D3D11_SAMPLER_DESC {
                Filter: D3D11_FILTER_MIN_MAG_LINEAR_MIP_POINT,
                AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
                AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
                AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
                MipLODBias: 0.0,
                MaxAnisotropy: 1,
                ComparisonFunc: D3D11_COMPARISON_ALWAYS,
                BorderColor: [0.0, 0.0, 0.0, 0.0],
                MinLOD: 0.0,
                MaxLOD: f32::MAX,
            };
            let mut sampler: Option<ID3D11SamplerState> = None;
            device
                .0
                .CreateSamplerState(&sampler_desc, Some(&mut sampler))
                .map_err(native("sampler"))?;
            let sampler = filled(sampler, "sampler")?;

            // Fixed state: bound once, the quad never changes
            let stride = desc.vertex_stride();
            let offset = 0u32;
            context.0.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            context.0.IASetInputLayout(Some(&input_layout));
            context.0.IASetVertexBuffers(
                0,
                1,
                Some(&Some(vertex_buffer.clone())),
                Some(&stride),
                Some(&offset),
            );
            context.0.IASetIndexBuffer(Some(&index_buffer), DXGI_FORMAT_R16_UINT, 0);
            context.0.VSSetShader(Some(&vertex_shader), None);
            context.0.PSSetShader(Some(&pixel_shader), None);
            context.0.PSSetSamplers(0, Some(&[Some(sampler.clone())]));

            Ok(D3D11Pipeline {
                vertex_shader: Com(vertex_shader),
                pixel_shader: Com(pixel_shader),
                input_layout: Com(input_layout),
                vertex_buffer: Com(vertex_buffer),
                index_buffer: Com(index_buffer),
                sampler: Com(sampler),
            })
        }
    }

    fn draw_indexed(&self, context: &Self::Context, _pipeline: &Self::Pipeline, index_count: u32) {
        unsafe { context.0.DrawIndexed(index_count, 0, 0) };
    }
}
