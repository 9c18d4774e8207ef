/// WGSL compute kernels for the variance-of-Laplacian pipeline
///
/// Single-channel intermediates are `r32float` storage textures. Every
/// image-space kernel runs on 16x16 workgroups and clamps at the edges.
/// The reduction runs in two passes: `PARTIAL_REDUCE_SHADER` folds the
/// Laplacian response into per-workgroup (sum, sum of squares) pairs, and
/// `FINAL_REDUCE_SHADER` folds those into `[mean, population variance]`.

/// Workgroup edge length of the image-space kernels
pub const TILE_SIZE: u32 = 16;

/// BGRA8 canonical frame -> linear luma (Rec. 709 weights)
pub const LUMA_SHADER: &str = r#"
@group(0) @binding(0)
var src_tex: texture_2d<f32>;

@group(0) @binding(1)
var dst_tex: texture_storage_2d<r32float, write>;

// IEC 61966-2-1 transfer curve
fn srgb_to_linear(c: f32) -> f32 {
    if (c <= 0.04045) {
        return c / 12.92;
    }
    return pow((c + 0.055) / 1.055, 2.4);
}

@compute @workgroup_size(16, 16, 1)
fn luma_main(@builtin(global_invocation_id) id: vec3<u32>) {
    let dims = textureDimensions(src_tex);
    if (id.x >= dims.x || id.y >= dims.y) {
        return;
    }

    // bgra8unorm loads come back in rgba order; alpha is ignored
    let px = textureLoad(src_tex, vec2<i32>(id.xy), 0);
    let luma = 0.2126 * srgb_to_linear(px.r)
             + 0.7152 * srgb_to_linear(px.g)
             + 0.0722 * srgb_to_linear(px.b);

    textureStore(dst_tex, vec2<i32>(id.xy), vec4<f32>(luma, 0.0, 0.0, 0.0));
}
"#;

/// One axis of a separable Gaussian blur
pub const GAUSSIAN_SHADER: &str = r#"
struct BlurParams {
    radius: i32,
    horizontal: u32,
    padding0: u32,
    padding1: u32,
}

@group(0) @binding(0)
var src_tex: texture_2d<f32>;

@group(0) @binding(1)
var dst_tex: texture_storage_2d<r32float, write>;

@group(0) @binding(2)
var<storage, read> weights: array<f32>;

@group(0) @binding(3)
var<uniform> params: BlurParams;

@compute @workgroup_size(16, 16, 1)
fn gaussian_main(@builtin(global_invocation_id) id: vec3<u32>) {
    let dims = vec2<i32>(textureDimensions(src_tex));
    let p = vec2<i32>(id.xy);
    if (p.x >= dims.x || p.y >= dims.y) {
        return;
    }

    var acc: f32 = 0.0;
    for (var k: i32 = -params.radius; k <= params.radius; k = k + 1) {
        var q = p;
        if (params.horizontal == 1u) {
            q.x = clamp(p.x + k, 0, dims.x - 1);
        } else {
            q.y = clamp(p.y + k, 0, dims.y - 1);
        }
        acc = acc + weights[k + params.radius] * textureLoad(src_tex, q, 0).r;
    }

    textureStore(dst_tex, p, vec4<f32>(acc, 0.0, 0.0, 0.0));
}
"#;

/// 4-neighbour Laplacian: [0 1 0; 1 -4 1; 0 1 0]
pub const LAPLACIAN_SHADER: &str = r#"
@group(0) @binding(0)
var src_tex: texture_2d<f32>;

@group(0) @binding(1)
var dst_tex: texture_storage_2d<r32float, write>;

fn load_clamped(p: vec2<i32>, dims: vec2<i32>) -> f32 {
    let q = clamp(p, vec2<i32>(0, 0), dims - vec2<i32>(1, 1));
    return textureLoad(src_tex, q, 0).r;
}

@compute @workgroup_size(16, 16, 1)
fn laplacian_main(@builtin(global_invocation_id) id: vec3<u32>) {
    let dims = vec2<i32>(textureDimensions(src_tex));
    let p = vec2<i32>(id.xy);
    if (p.x >= dims.x || p.y >= dims.y) {
        return;
    }

    let response = load_clamped(p + vec2<i32>(-1, 0), dims)
                 + load_clamped(p + vec2<i32>(1, 0), dims)
                 + load_clamped(p + vec2<i32>(0, -1), dims)
                 + load_clamped(p + vec2<i32>(0, 1), dims)
                 - 4.0 * load_clamped(p, dims);

    textureStore(dst_tex, p, vec4<f32>(response, 0.0, 0.0, 0.0));
}
"#;

/// Grid-stride (sum, sum of squares) per workgroup
pub const PARTIAL_REDUCE_SHADER: &str = r#"
const WORKGROUP_SIZE: u32 = 256u;

@group(0) @binding(0)
var src_tex: texture_2d<f32>;

@group(0) @binding(1)
var<storage, read_write> partials: array<vec2<f32>>;

var<workgroup> scratch: array<vec2<f32>, 256>;

@compute @workgroup_size(256, 1, 1)
fn partial_main(
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let dims = textureDimensions(src_tex);
    let total = dims.x * dims.y;
    let stride = groups.x * WORKGROUP_SIZE;
    // Uniform trip count keeps the barriers below in uniform control flow
    let rounds = (total + stride - 1u) / stride;

    var acc = vec2<f32>(0.0, 0.0);
    for (var r: u32 = 0u; r < rounds; r = r + 1u) {
        let i = r * stride + wid.x * WORKGROUP_SIZE + lid.x;
        if (i < total) {
            let v = textureLoad(src_tex, vec2<i32>(i32(i % dims.x), i32(i / dims.x)), 0).r;
            acc = acc + vec2<f32>(v, v * v);
        }
    }

    scratch[lid.x] = acc;
    workgroupBarrier();

    for (var s: u32 = WORKGROUP_SIZE / 2u; s > 0u; s = s / 2u) {
        if (lid.x < s) {
            scratch[lid.x] = scratch[lid.x] + scratch[lid.x + s];
        }
        workgroupBarrier();
    }

    if (lid.x == 0u) {
        partials[wid.x] = scratch[0];
    }
}
"#;

/// Partials -> [mean, population variance]
pub const FINAL_REDUCE_SHADER: &str = r#"
const WORKGROUP_SIZE: u32 = 256u;

struct ReduceParams {
    pixel_count: u32,
    partial_count: u32,
    padding0: u32,
    padding1: u32,
}

@group(0) @binding(0)
var<storage, read> partials: array<vec2<f32>>;

@group(0) @binding(1)
var<storage, read_write> stats: array<f32>;

@group(0) @binding(2)
var<uniform> params: ReduceParams;

var<workgroup> scratch: array<vec2<f32>, 256>;

@compute @workgroup_size(256, 1, 1)
fn final_main(@builtin(local_invocation_id) lid: vec3<u32>) {
    let rounds = (params.partial_count + WORKGROUP_SIZE - 1u) / WORKGROUP_SIZE;

    var acc = vec2<f32>(0.0, 0.0);
    for (var r: u32 = 0u; r < rounds; r = r + 1u) {
        let i = r * WORKGROUP_SIZE + lid.x;
        if (i < params.partial_count) {
            acc = acc + partials[i];
        }
    }

    scratch[lid.x] = acc;
    workgroupBarrier();

    for (var s: u32 = WORKGROUP_SIZE / 2u; s > 0u; s = s / 2u) {
        if (lid.x < s) {
            scratch[lid.x] = scratch[lid.x] + scratch[lid.x + s];
        }
        workgroupBarrier();
    }

    if (lid.x == 0u) {
        let n = f32(params.pixel_count);
        let mean = scratch[0].x / n;
        stats[0] = mean;
        stats[1] = max(scratch[0].y / n - mean * mean, 0.0);
    }
}
"#;
