// Textured-quad blit of the shared frame into the consumer's render target

use crate::backend::GpuBackend;
use crate::error::Result;

pub const SHADER_SOURCE: &str = r#"
Texture2D frameTexture : register(t0);
SamplerState frameSampler : register(s0);

struct VertexIn
{
    float4 position : POSITION;
    float4 uv       : TEXCOORD0;
};

struct PixelIn
{
    float4 position : SV_POSITION;
    float4 uv       : TEXCOORD0;
};

PixelIn VShader(VertexIn input)
{
    PixelIn output;
    output.position = input.position;
    output.uv = input.uv;
    return output;
}

float4 PShader(PixelIn input) : SV_TARGET
{
    return frameTexture.Sample(frameSampler, input.uv.xy);
}
"#;

/// One quad corner: clip-space position and texture coordinate.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
}

// Inset from the clip-space edges so the consumer clear colour stays visible
const BORDER_LEFT: f32 = -0.95;
const BORDER_RIGHT: f32 = 0.85;
const BORDER_TOP: f32 = 0.95;
const BORDER_BOTTOM: f32 = -0.90;

pub const QUAD_VERTICES: [QuadVertex; 4] = [
    QuadVertex { position: [BORDER_LEFT, BORDER_BOTTOM, 0.0], uv: [0.0, 1.0] },
    QuadVertex { position: [BORDER_RIGHT, BORDER_BOTTOM, 0.0], uv: [1.0, 1.0] },
    QuadVertex { position: [BORDER_RIGHT, BORDER_TOP, 0.0], uv: [1.0, 0.0] },
    QuadVertex { position: [BORDER_LEFT, BORDER_TOP, 0.0], uv: [0.0, 0.0] },
];

pub const QUAD_INDICES: [u16; 6] = [3, 1, 0, 2, 1, 3];

/// Everything a backend needs to build the blit pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineDesc {
    pub source: &'static str,
    pub vertex_entry: &'static str,
    pub vertex_profile: &'static str,
    pub pixel_entry: &'static str,
    pub pixel_profile: &'static str,
    pub vertices: &'static [QuadVertex],
    pub indices: &'static [u16],
}

impl PipelineDesc {
    pub const fn blit() -> Self {
        Self {
            source: SHADER_SOURCE,
            vertex_entry: "VShader",
            vertex_profile: "vs_4_0",
            pixel_entry: "PShader",
            pixel_profile: "ps_4_0",
            vertices: &QUAD_VERTICES,
            indices: &QUAD_INDICES,
        }
    }

    pub fn vertex_stride(&self) -> u32 {
        std::mem::size_of::<QuadVertex>() as u32
    }
}

/// Compiled shaders, quad buffers and sampler on the consumer device.
pub struct ShaderPipeline<B: GpuBackend> {
    pipeline: B::Pipeline,
    index_count: u32,
}

impl<B: GpuBackend> ShaderPipeline<B> {
    pub fn initialize(backend: &B, device: &B::Device, context: &B::Context) -> Result<Self> {
        let desc = PipelineDesc::blit();
        let pipeline = backend.create_pipeline(device, context, &desc)?;
        Ok(Self {
            pipeline,
            index_count: desc.indices.len() as u32,
        })
    }

    /// One indexed draw over the quad. Render target, shaders and the frame
    /// view must already be bound.
    pub fn draw_indexed(&self, backend: &B, context: &B::Context) {
        backend.draw_indexed(context, &self.pipeline, self.index_count);
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn release(self) -> Vec<(&'static str, u32)> {
        use crate::backend::GpuObjectGroup;
        self.pipeline.release_each()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_is_inset_inside_clip_space() {
        for v in QUAD_VERTICES.iter() {
            assert!(v.position[0] > -1.0 && v.position[0] < 1.0);
            assert!(v.position[1] > -1.0 && v.position[1] < 1.0);
        }
        let max_x = QUAD_VERTICES.iter().map(|v| v.position[0]).fold(f32::MIN, f32::max);
        assert!(max_x < 1.0, "quad must not cover the full viewport");
    }

    #[test]
    fn indices_form_two_triangles_over_four_corners() {
        assert_eq!(QUAD_INDICES.len(), 6);
        assert!(QUAD_INDICES.iter().all(|&i| (i as usize) < QUAD_VERTICES.len()));
        let mut used: Vec<u16> = QUAD_INDICES.to_vec();
        used.sort_unstable();
        used.dedup();
        assert_eq!(used, vec![0, 1, 2, 3]);
    }

    #[test]
    fn vertex_layout_is_position_then_uv() {
        let desc = PipelineDesc::blit();
        assert_eq!(desc.vertex_stride(), 20);
        assert!(desc.source.contains(desc.vertex_entry));
        assert!(desc.source.contains(desc.pixel_entry));
    }

    #[test]
    fn texture_corners_map_top_left_to_origin() {
        let top_left = QUAD_VERTICES
            .iter()
            .find(|v| v.position[0] == BORDER_LEFT && v.position[1] == BORDER_TOP)
            .unwrap();
        assert_eq!(top_left.uv, [0.0, 0.0]);
    }
}
