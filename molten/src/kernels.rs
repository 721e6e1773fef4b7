//! GPU compute kernels (WGSL).
//!
//! The kernel source is a fixed, versioned constant bundled with the
//! engine and compiled once at engine construction. Entry points come
//! in three families: elementwise kernels dispatched one thread per
//! element, their in-place/accumulating variants, and the
//! linear-algebra set (matmul, matvecmul, softmax) driven by matrix
//! and vector descriptors.

/// WGSL source for every kernel the engine can dispatch.
pub const KERNELS_WGSL: &str = r#"
// molten compute kernels, v1

// --- elementwise binary ops: one thread per element ---
@group(0) @binding(0) var<storage, read> bin_a: array<f32>;
@group(0) @binding(1) var<storage, read> bin_b: array<f32>;
@group(0) @binding(2) var<storage, read_write> bin_out: array<f32>;

@compute @workgroup_size(64)
fn add(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= arrayLength(&bin_out)) { return; }
    bin_out[i] = bin_a[i] + bin_b[i];
}

// accumulating variant: out += a + b
@compute @workgroup_size(64)
fn add_incr(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= arrayLength(&bin_out)) { return; }
    bin_out[i] = bin_out[i] + bin_a[i] + bin_b[i];
}

// --- in-place binary ops: the accumulator aliases the left input ---
@group(0) @binding(0) var<storage, read_write> acc: array<f32>;
@group(0) @binding(1) var<storage, read> acc_b: array<f32>;

@compute @workgroup_size(64)
fn add_assign(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= arrayLength(&acc)) { return; }
    acc[i] = acc[i] + acc_b[i];
}

// identical operands: one buffer cannot be bound read and read_write
// in the same dispatch, so x + x gets its own doubling entry point
@compute @workgroup_size(64)
fn add_self(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= arrayLength(&acc)) { return; }
    acc[i] = acc[i] + acc[i];
}

// --- scalar ops ---
@group(0) @binding(0) var<storage, read> sc_in: array<f32>;
@group(0) @binding(1) var<storage, read_write> sc_out: array<f32>;
@group(0) @binding(2) var<uniform> sc_val: f32;

@compute @workgroup_size(64)
fn add_scalar(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= arrayLength(&sc_out)) { return; }
    sc_out[i] = sc_in[i] + sc_val;
}

@compute @workgroup_size(64)
fn add_scalar_incr(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= arrayLength(&sc_out)) { return; }
    sc_out[i] = sc_out[i] + sc_in[i] + sc_val;
}

@group(0) @binding(0) var<storage, read_write> sca: array<f32>;
@group(0) @binding(1) var<uniform> sca_val: f32;

@compute @workgroup_size(64)
fn add_scalar_assign(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= arrayLength(&sca)) { return; }
    sca[i] = sca[i] + sca_val;
}

// --- fill (memset) ---
@group(0) @binding(0) var<storage, read_write> fill_out: array<f32>;
@group(0) @binding(1) var<uniform> fill_val: f32;

@compute @workgroup_size(64)
fn fill(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= arrayLength(&fill_out)) { return; }
    fill_out[i] = fill_val;
}

// --- tiled matrix multiply: C = op(A) * op(B) ---
// mm_dims: m, k, n, transpose flags (bit 0 = A, bit 1 = B)
@group(0) @binding(0) var<storage, read> mm_a: array<f32>;
@group(0) @binding(1) var<storage, read> mm_b: array<f32>;
@group(0) @binding(2) var<storage, read_write> mm_out: array<f32>;
@group(0) @binding(3) var<uniform> mm_dims: vec4<u32>;

var<workgroup> tile_a: array<array<f32, 16>, 16>;
var<workgroup> tile_b: array<array<f32, 16>, 16>;

@compute @workgroup_size(16, 16, 1)
fn matmul(@builtin(global_invocation_id) global_id: vec3<u32>,
          @builtin(local_invocation_id) local_id: vec3<u32>) {
    let row = global_id.y;
    let col = global_id.x;
    let m = mm_dims.x;
    let k = mm_dims.y;
    let n = mm_dims.z;
    let trans_a = (mm_dims.w & 1u) != 0u;
    let trans_b = (mm_dims.w & 2u) != 0u;

    var acc_v = 0.0;
    let num_tiles = (k + 15u) / 16u;

    for (var t = 0u; t < num_tiles; t = t + 1u) {
        let ac = t * 16u + local_id.x;
        var a_val = 0.0;
        if (row < m && ac < k) {
            if (trans_a) {
                a_val = mm_a[ac * m + row];
            } else {
                a_val = mm_a[row * k + ac];
            }
        }
        tile_a[local_id.y][local_id.x] = a_val;

        let br = t * 16u + local_id.y;
        var b_val = 0.0;
        if (br < k && col < n) {
            if (trans_b) {
                b_val = mm_b[col * k + br];
            } else {
                b_val = mm_b[br * n + col];
            }
        }
        tile_b[local_id.y][local_id.x] = b_val;

        workgroupBarrier();
        for (var i = 0u; i < 16u; i = i + 1u) {
            acc_v = acc_v + tile_a[local_id.y][i] * tile_b[i][local_id.x];
        }
        workgroupBarrier();
    }

    if (row < m && col < n) {
        mm_out[row * n + col] = acc_v;
    }
}

// --- matrix-vector multiply: one thread per output element ---
// mv_dims: rows, cols, transpose flag, unused
@group(0) @binding(0) var<storage, read> mv_m: array<f32>;
@group(0) @binding(1) var<storage, read> mv_v: array<f32>;
@group(0) @binding(2) var<storage, read_write> mv_out: array<f32>;
@group(0) @binding(3) var<uniform> mv_dims: vec4<u32>;

@compute @workgroup_size(64)
fn matvecmul(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let rows = mv_dims.x;
    let cols = mv_dims.y;
    let trans = mv_dims.z != 0u;
    let i = global_id.x;

    if (trans) {
        if (i >= cols) { return; }
        var s = 0.0;
        for (var j = 0u; j < rows; j = j + 1u) {
            s = s + mv_m[j * cols + i] * mv_v[j];
        }
        mv_out[i] = s;
    } else {
        if (i >= rows) { return; }
        var s = 0.0;
        for (var j = 0u; j < cols; j = j + 1u) {
            s = s + mv_m[i * cols + j] * mv_v[j];
        }
        mv_out[i] = s;
    }
}

// --- softmax over rows (axis 1) or columns (axis 0) of a matrix ---
// one thread per slice; max-shifted for numerical stability
// sm_dims: rows, cols, axis, unused
@group(0) @binding(0) var<storage, read> sm_in: array<f32>;
@group(0) @binding(1) var<storage, read_write> sm_out: array<f32>;
@group(0) @binding(2) var<uniform> sm_dims: vec4<u32>;

@compute @workgroup_size(64)
fn softmax(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let rows = sm_dims.x;
    let cols = sm_dims.y;
    let axis = sm_dims.z;
    let s = global_id.x;

    var len = cols;
    var base = s * cols;
    var stride = 1u;
    if (axis == 0u) {
        if (s >= cols) { return; }
        len = rows;
        base = s;
        stride = cols;
    } else {
        if (s >= rows) { return; }
    }

    var max_val = sm_in[base];
    for (var i = 1u; i < len; i = i + 1u) {
        max_val = max(max_val, sm_in[base + i * stride]);
    }
    var sum_exp = 0.0;
    for (var i = 0u; i < len; i = i + 1u) {
        let v = exp(sm_in[base + i * stride] - max_val);
        sm_out[base + i * stride] = v;
        sum_exp = sum_exp + v;
    }
    for (var i = 0u; i < len; i = i + 1u) {
        sm_out[base + i * stride] = sm_out[base + i * stride] / sum_exp;
    }
}

@group(0) @binding(0) var<storage, read_write> smi_data: array<f32>;
@group(0) @binding(1) var<uniform> smi_dims: vec4<u32>;

@compute @workgroup_size(64)
fn softmax_inplace(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let rows = smi_dims.x;
    let cols = smi_dims.y;
    let axis = smi_dims.z;
    let s = global_id.x;

    var len = cols;
    var base = s * cols;
    var stride = 1u;
    if (axis == 0u) {
        if (s >= cols) { return; }
        len = rows;
        base = s;
        stride = cols;
    } else {
        if (s >= rows) { return; }
    }

    var max_val = smi_data[base];
    for (var i = 1u; i < len; i = i + 1u) {
        max_val = max(max_val, smi_data[base + i * stride]);
    }
    var sum_exp = 0.0;
    for (var i = 0u; i < len; i = i + 1u) {
        let v = exp(smi_data[base + i * stride] - max_val);
        smi_data[base + i * stride] = v;
        sum_exp = sum_exp + v;
    }
    for (var i = 0u; i < len; i = i + 1u) {
        smi_data[base + i * stride] = smi_data[base + i * stride] / sum_exp;
    }
}
"#;
