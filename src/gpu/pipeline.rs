//! Instance vertex layout, WGSL shader, and pipeline creation.

use super::instance::INSTANCE_STRIDE;

/// Uniform buffer size in bytes. Layout:
///   [0..8]   `target_size`:       vec2<f32> (pixels)
///   [8..16]  `cell_size`:         vec2<f32>
///   [16..24] `cell_count`:        vec2<f32>
///   [24..28] `underline_width`:   f32 (thin line width)
///   [28..32] `dashed_period`:     f32
///   [32..36] `curly_half_height`: f32
///   [36..48] padding
pub const UNIFORM_SIZE: u64 = 48;

/// Instance vertex attributes. The first attribute packs the shading
/// kind (low 16 bits) with the rendition scale (two bytes above it).
const INSTANCE_ATTRS: [wgpu::VertexAttribute; 5] = [
    wgpu::VertexAttribute {
        format: wgpu::VertexFormat::Uint32,
        offset: 0,
        shader_location: 0,
    },
    wgpu::VertexAttribute {
        format: wgpu::VertexFormat::Sint16x2,
        offset: 4,
        shader_location: 1,
    },
    wgpu::VertexAttribute {
        format: wgpu::VertexFormat::Uint16x2,
        offset: 8,
        shader_location: 2,
    },
    wgpu::VertexAttribute {
        format: wgpu::VertexFormat::Uint16x2,
        offset: 12,
        shader_location: 3,
    },
    wgpu::VertexAttribute {
        format: wgpu::VertexFormat::Uint32,
        offset: 16,
        shader_location: 4,
    },
];

pub fn instance_buffer_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: INSTANCE_STRIDE,
        step_mode: wgpu::VertexStepMode::Instance,
        attributes: &INSTANCE_ATTRS,
    }
}

// One pipeline for every quad kind; the fragment shader switches on the
// per-instance shading kind. Everything blends as premultiplied alpha
// over what's underneath, which is why the background bitmap stores
// premultiplied colors while glyph colors arrive straight and get
// premultiplied in the shader.
const SHADER_SRC: &str = "
struct Uniforms {
    target_size: vec2<f32>,
    cell_size: vec2<f32>,
    cell_count: vec2<f32>,
    underline_width: f32,
    dashed_period: f32,
    curly_half_height: f32,
    _pad: f32,
}

@group(0) @binding(0) var<uniform> uniforms: Uniforms;
@group(0) @binding(1) var background_bitmap: texture_2d<f32>;
@group(0) @binding(2) var glyph_atlas: texture_2d<f32>;

struct QuadInput {
    @location(0) shading_and_scale: u32,
    @location(1) position: vec2<i32>,
    @location(2) size: vec2<u32>,
    @location(3) texcoord: vec2<u32>,
    @location(4) color: u32,
}

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) local: vec2<f32>,
    @location(1) pixel: vec2<f32>,
    @location(2) @interpolate(flat) shading: u32,
    @location(3) @interpolate(flat) scale: vec2<f32>,
    @location(4) @interpolate(flat) texcoord: vec2<f32>,
    @location(5) @interpolate(flat) size: vec2<f32>,
    @location(6) @interpolate(flat) color: vec4<f32>,
}

fn unpack_color(c: u32) -> vec4<f32> {
    return vec4<f32>(
        f32(c & 0xffu),
        f32((c >> 8u) & 0xffu),
        f32((c >> 16u) & 0xffu),
        f32((c >> 24u) & 0xffu),
    ) / 255.0;
}

fn premultiply(c: vec4<f32>) -> vec4<f32> {
    return vec4<f32>(c.rgb * c.a, c.a);
}

@vertex
fn vs_main(@builtin(vertex_index) vi: u32, input: QuadInput) -> VertexOutput {
    let corner = vec2<f32>(f32(vi & 1u), f32((vi >> 1u) & 1u));
    let size = vec2<f32>(input.size);
    let pixel = vec2<f32>(input.position) + size * corner;

    var out: VertexOutput;
    let ndc = pixel / uniforms.target_size * 2.0 - 1.0;
    out.position = vec4<f32>(ndc.x, -ndc.y, 0.0, 1.0);
    out.local = size * corner;
    out.pixel = pixel;
    out.shading = input.shading_and_scale & 0xffffu;
    out.scale = vec2<f32>(
        f32((input.shading_and_scale >> 16u) & 0xffu),
        f32((input.shading_and_scale >> 24u) & 0xffu),
    );
    out.texcoord = vec2<f32>(input.texcoord);
    out.size = size;
    out.color = unpack_color(input.color);
    return out;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    switch input.shading {
        // Background: one full-target quad sampling the cell color bitmap.
        case 1u: {
            let cell = vec2<i32>(input.pixel / uniforms.cell_size);
            let max_cell = vec2<i32>(uniforms.cell_count) - vec2<i32>(1, 1);
            return textureLoad(background_bitmap, clamp(cell, vec2<i32>(0, 0), max_cell), 0);
        }
        // Grayscale, ClearType (blended as grayscale), and builtin text:
        // the atlas alpha masks the straight-alpha foreground color.
        case 2u, 3u, 5u: {
            let texel = textureLoad(glyph_atlas, vec2<i32>(input.texcoord + input.local), 0);
            return premultiply(input.color) * texel.a;
        }
        // Passthrough: the premultiplied color-emoji texel is final.
        case 4u: {
            return textureLoad(glyph_atlas, vec2<i32>(input.texcoord + input.local), 0);
        }
        // Dotted line: on/off periods of twice the underline width.
        case 6u: {
            let period = max(uniforms.underline_width, 1.0) * 2.0 * input.scale.x;
            if (floor(input.pixel.x / period) % 2.0 != 0.0) {
                discard;
            }
            return premultiply(input.color);
        }
        // Dashed line: on for the first half of each period.
        case 7u: {
            let period = max(uniforms.dashed_period, 1.0) * input.scale.x;
            if (fract(input.pixel.x / period) >= 0.5) {
                discard;
            }
            return premultiply(input.color);
        }
        // Curly line: a sine stroke of underline thickness inside the quad.
        case 8u: {
            let tau = 6.28318530718;
            let amplitude = max(uniforms.curly_half_height - uniforms.underline_width * 0.5, 1.0);
            let phase = input.pixel.x * tau / (uniforms.cell_size.x * 2.0 * input.scale.x);
            let center = input.size.y * 0.5 + sin(phase) * amplitude;
            let dist = abs(input.local.y - center);
            let half_width = uniforms.underline_width * 0.5;
            let coverage = 1.0 - smoothstep(half_width, half_width + 1.0, dist);
            if (coverage <= 0.0) {
                discard;
            }
            return premultiply(input.color) * coverage;
        }
        // Solid lines, cursor, selection: a straight-alpha solid color.
        default: {
            return premultiply(input.color);
        }
    }
}
";

/// Bind group layout: uniforms + background color bitmap + glyph atlas.
/// Both textures are read with `textureLoad`, no sampler.
pub fn create_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    let texture_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    };
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("quad_bind_group_layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: wgpu::BufferSize::new(UNIFORM_SIZE),
                },
                count: None,
            },
            texture_entry(1),
            texture_entry(2),
        ],
    })
}

/// The single quad pipeline: instanced triangle strips with
/// premultiplied-alpha blending.
pub fn create_quad_pipeline(
    device: &wgpu::Device,
    format: wgpu::TextureFormat,
    bind_group_layout: &wgpu::BindGroupLayout,
) -> wgpu::RenderPipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("quad_shader"),
        source: wgpu::ShaderSource::Wgsl(SHADER_SRC.into()),
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("quad_pipeline_layout"),
        bind_group_layouts: &[bind_group_layout],
        immediate_size: 0,
    });

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("quad_pipeline"),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            buffers: &[instance_buffer_layout()],
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: Some("fs_main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState {
                    // Premultiplied alpha: shader outputs (rgb * a, a).
                    color: wgpu::BlendComponent {
                        src_factor: wgpu::BlendFactor::One,
                        dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
                        operation: wgpu::BlendOperation::Add,
                    },
                    alpha: wgpu::BlendComponent {
                        src_factor: wgpu::BlendFactor::One,
                        dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
                        operation: wgpu::BlendOperation::Add,
                    },
                }),
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleStrip,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            unclipped_depth: false,
            polygon_mode: wgpu::PolygonMode::Fill,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    })
}
