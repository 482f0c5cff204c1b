//! wgpu compute backend.
//!
//! All tensors are ranges of one storage buffer (the arena) so every kernel
//! binds exactly two resources: the arena and a small uniform describing the
//! dispatch. The uniform carries tensor offsets in the order of
//! [`Dispatch::reads`] followed by [`Dispatch::writes`], field geometry and
//! scalars. Kernels implement [`SpikingRule`](crate::rule::SpikingRule).
//!
//! Enable with the `gpu` feature flag.

use std::borrow::Cow;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, trace};
use wgpu::util::DeviceExt;

use crate::backend::{ComputeBackend, Dispatch, KernelEntry, KernelHandle, KernelTable};
use crate::error::BackendError;
use crate::field::ReceptiveField;
use crate::tensor::{Extent, Shape, Tensor};

const WORKGROUP: u32 = 8;

/// Per-dispatch uniform. Arrays are read as `vec4` lanes in WGSL.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Default)]
struct GpuParams {
    offsets: [u32; 16],
    ints: [u32; 16],
    scalars: [f32; 8],
}

impl GpuParams {
    fn new(extent: Extent) -> Self {
        let mut params = Self::default();
        params.ints[0] = extent.width;
        params.ints[1] = extent.height;
        params
    }

    fn field(&mut self, slot: usize, field: &ReceptiveField) {
        self.ints[slot] = field.source.width;
        self.ints[slot + 1] = field.source.height;
        self.ints[slot + 2] = field.radius;
    }

    fn scalars(&mut self, values: &[f32]) {
        self.scalars[..values.len()].copy_from_slice(values);
    }
}

#[derive(Debug, Clone, Copy)]
struct GpuTensor {
    offset: u32,
    shape: Shape,
}

pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    arena: wgpu::Buffer,
    capacity: usize,
    used: usize,
    tensors: Vec<GpuTensor>,
    bind_group_layout: wgpu::BindGroupLayout,
    pipelines: Vec<wgpu::ComputePipeline>,
    copy_pipeline: wgpu::ComputePipeline,
    kernels: KernelTable,
    name: String,
}

impl GpuBackend {
    /// Opens the first high-performance adapter and reserves an arena of
    /// `capacity` floats. Blocks until the device is ready.
    pub fn new(capacity: usize) -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| BackendError::Unavailable("no compatible adapter".into()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("heinet GPU"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let bytes = (capacity * 4) as u64;
        let limits = device.limits();
        if capacity == 0
            || bytes > limits.max_storage_buffer_binding_size as u64
            || bytes > limits.max_buffer_size
        {
            return Err(BackendError::Unavailable(format!(
                "arena of {capacity} floats exceeds device limits"
            )));
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let arena = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Tensor Arena"),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Layer Kernels"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(KERNELS_SHADER)),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Kernel Bind Group Layout"),
            entries: &[
                // Arena (read-write)
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Dispatch params uniform
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Kernel Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let compile = |entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };

        let mut kernels = KernelTable::default();
        let mut pipelines = Vec::with_capacity(KernelEntry::ALL.len());
        for (n, entry) in KernelEntry::ALL.iter().enumerate() {
            pipelines.push(compile(entry.name()));
            kernels.insert(*entry, KernelHandle(n as u32));
        }
        let copy_pipeline = compile("copy_range");

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(BackendError::Unavailable(format!("kernel compilation failed: {err}")));
        }

        let name = format!("gpu ({})", adapter.get_info().name);
        debug!(adapter = %name, capacity, "GPU backend ready");

        Ok(Self {
            device,
            queue,
            arena,
            capacity,
            used: 0,
            tensors: Vec::new(),
            bind_group_layout,
            pipelines,
            copy_pipeline,
            kernels,
            name,
        })
    }

    /// Floats still free in the arena.
    pub fn available(&self) -> usize {
        self.capacity - self.used
    }

    fn tensor(&self, t: Tensor) -> Result<GpuTensor, BackendError> {
        let stored = *self
            .tensors
            .get(t.id() as usize)
            .ok_or(BackendError::UnknownTensor(t.id()))?;
        if stored.shape != t.shape() {
            return Err(BackendError::ShapeMismatch {
                expected: stored.shape,
                actual: t.shape(),
            });
        }
        Ok(stored)
    }

    fn params_for(&self, call: &Dispatch) -> Result<GpuParams, BackendError> {
        let mut params = GpuParams::new(call.extent());
        let bound: Vec<Tensor> = call.reads().into_iter().chain(call.writes()).collect();
        for (slot, t) in bound.iter().enumerate() {
            params.offsets[slot] = self.tensor(*t)?.offset;
        }

        match call {
            Dispatch::RandomFill(a) => {
                params.ints[2] = a.tensor.shape().depth;
                params.ints[3] = a.seed[0];
                params.ints[4] = a.seed[1];
                params.ints[5] = a.stream;
                params.scalars(&[a.min, a.max]);
            }
            Dispatch::EActivate(a) => {
                params.field(2, &a.ff_field);
                params.field(5, &a.fb_field);
                let p = &a.params;
                params.scalars(&[p.eta, p.short_average_rate_inv, p.long_average_decay]);
            }
            Dispatch::IActivate(a) => {
                params.field(2, &a.ff_field);
                params.field(5, &a.lateral_field);
                params.field(8, &a.fb_field);
                let p = &a.params;
                params.scalars(&[p.eta, p.short_average_rate_inv, p.long_average_decay]);
            }
            Dispatch::ELearn(a) => {
                params.field(2, &a.ff_field);
                params.field(5, &a.fb_field);
                params.scalars(&[a.alpha, a.beta, a.delta, a.sparsity]);
            }
            Dispatch::ILearn(a) => {
                params.field(2, &a.ff_field);
                params.field(5, &a.lateral_field);
                params.field(8, &a.fb_field);
                params.scalars(&[a.alpha, a.beta, a.gamma, a.delta, a.sparsity]);
            }
            Dispatch::Predict(a) => {
                params.field(2, &a.e_field);
                params.field(5, &a.i_field);
            }
            Dispatch::PredictionLearn(a) => {
                params.field(2, &a.e_field);
                params.field(5, &a.i_field);
                params.scalars(&[a.alpha]);
            }
            Dispatch::SumActivity(a) => params.scalars(&[a.scale]),
            Dispatch::EncodeInput(a) => params.scalars(&[a.history_rate]),
        }
        Ok(params)
    }

    fn run(&self, pipeline: &wgpu::ComputePipeline, params: &GpuParams, extent: Extent) {
        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Dispatch Params"),
                contents: bytemuck::bytes_of(params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Kernel Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.arena.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Kernel Encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Kernel Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                extent.width.div_ceil(WORKGROUP),
                extent.height.div_ceil(WORKGROUP),
                1,
            );
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }
}

impl ComputeBackend for GpuBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kernels(&self) -> &KernelTable {
        &self.kernels
    }

    fn allocate(&mut self, shape: Shape) -> Result<Tensor, BackendError> {
        let len = shape.len();
        if len > self.available() {
            return Err(BackendError::OutOfMemory {
                requested: len,
                available: self.available(),
            });
        }
        let id = self.tensors.len() as u32;
        self.tensors.push(GpuTensor {
            offset: self.used as u32,
            shape,
        });
        self.used += len;
        Ok(Tensor::new(id, shape))
    }

    fn fill(&mut self, tensor: Tensor, value: f32) -> Result<(), BackendError> {
        let stored = self.tensor(tensor)?;
        let data = vec![value; stored.shape.len()];
        self.queue.write_buffer(
            &self.arena,
            stored.offset as u64 * 4,
            bytemuck::cast_slice(&data),
        );
        Ok(())
    }

    fn copy(&mut self, src: Tensor, dst: Tensor) -> Result<(), BackendError> {
        let from = self.tensor(src)?;
        let to = self.tensor(dst)?;
        if from.shape != to.shape {
            return Err(BackendError::ShapeMismatch {
                expected: from.shape,
                actual: to.shape,
            });
        }
        // Same-buffer copies are not allowed on the queue; use a kernel.
        let len = from.shape.len() as u32;
        let width = len.clamp(1, 4096);
        let extent = Extent::new(width, len.div_ceil(width));
        let mut params = GpuParams::new(extent);
        params.ints[2] = len;
        params.offsets[0] = from.offset;
        params.offsets[1] = to.offset;
        self.run(&self.copy_pipeline, &params, extent);
        Ok(())
    }

    fn upload(&mut self, data: &[f32], tensor: Tensor) -> Result<(), BackendError> {
        let stored = self.tensor(tensor)?;
        if stored.shape.len() != data.len() {
            return Err(BackendError::SizeMismatch {
                expected: stored.shape.len(),
                actual: data.len(),
            });
        }
        self.queue
            .write_buffer(&self.arena, stored.offset as u64 * 4, bytemuck::cast_slice(data));
        Ok(())
    }

    fn readback(&mut self, tensor: Tensor) -> Result<Vec<f32>, BackendError> {
        let stored = self.tensor(tensor)?;
        let size = stored.shape.len() as u64 * 4;
        if size == 0 {
            return Ok(Vec::new());
        }

        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(&self.arena, stored.offset as u64 * 4, &staging_buffer, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|_| BackendError::Map("readback channel closed".into()))?
            .map_err(|e| BackendError::Map(e.to_string()))?;

        let values = {
            let data = buffer_slice.get_mapped_range();
            bytemuck::cast_slice::<u8, f32>(&data).to_vec()
        };
        staging_buffer.unmap();
        Ok(values)
    }

    fn dispatch(&mut self, call: &Dispatch) -> Result<(), BackendError> {
        let KernelHandle(handle) = self.kernels.get(call.entry())?;
        call.check_isolation()?;
        let params = self.params_for(call)?;
        trace!(
            kernel = call.entry().name(),
            units = call.extent().area(),
            "gpu dispatch"
        );
        self.run(&self.pipelines[handle as usize], &params, call.extent());
        Ok(())
    }
}

/// WGSL kernels. One invocation per unit of the dispatch extent.
const KERNELS_SHADER: &str = r#"
struct Params {
    offsets: array<vec4<u32>, 4>,
    ints: array<vec4<u32>, 4>,
    scalars: array<vec4<f32>, 2>,
}

@group(0) @binding(0) var<storage, read_write> arena: array<f32>;
@group(0) @binding(1) var<uniform> params: Params;

fn off(i: u32) -> u32 {
    return params.offsets[i / 4u][i % 4u];
}

fn iv(i: u32) -> u32 {
    return params.ints[i / 4u][i % 4u];
}

fn sv(i: u32) -> f32 {
    return params.scalars[i / 4u][i % 4u];
}

struct Field {
    src_w: i32,
    src_h: i32,
    radius: i32,
    ratio: vec2<f32>,
}

// Geometry stored at ints[slot..slot+3]; the target is the dispatch extent.
fn receptive(slot: u32) -> Field {
    let w = i32(iv(slot));
    let h = i32(iv(slot + 1u));
    let ratio = vec2<f32>(
        (f32(w) + 1.0) / (f32(iv(0u)) + 1.0),
        (f32(h) + 1.0) / (f32(iv(1u)) + 1.0),
    );
    return Field(w, h, i32(iv(slot + 2u)), ratio);
}

fn center(f: Field, x: u32, y: u32) -> vec2<i32> {
    // floor(v + 0.5) rounds halves away from zero for v >= 0.
    return vec2<i32>(
        i32(floor(f32(x) * f.ratio.x + 0.5)),
        i32(floor(f32(y) * f.ratio.y + 0.5)),
    );
}

fn diameter(f: Field) -> i32 {
    return 2 * f.radius + 1;
}

fn window_dot(f: Field, x: u32, y: u32, unit: u32, w_off: u32, src_off: u32, skip_center: bool) -> f32 {
    let c = center(f, x, y);
    let d = diameter(f);
    let base = w_off + unit * u32(d * d);
    var sum = 0.0;
    for (var dy = -f.radius; dy <= f.radius; dy = dy + 1) {
        let sy = c.y + dy;
        if (sy < 0 || sy >= f.src_h) {
            continue;
        }
        for (var dx = -f.radius; dx <= f.radius; dx = dx + 1) {
            let sx = c.x + dx;
            if (sx < 0 || sx >= f.src_w) {
                continue;
            }
            if (skip_center && dx == 0 && dy == 0) {
                continue;
            }
            let k = u32((dx + f.radius) + (dy + f.radius) * d);
            sum = sum + arena[base + k] * arena[src_off + u32(sx + sy * f.src_w)];
        }
    }
    return sum;
}

const RULE_OJA: u32 = 0u;
const RULE_INHIBITORY: u32 = 1u;
const RULE_FEED_BACK: u32 = 2u;
const RULE_DELTA: u32 = 3u;

// Copies the unit's row from prev_off to out_off, then updates in-bounds taps.
fn learn_window(
    f: Field, x: u32, y: u32, unit: u32,
    prev_off: u32, out_off: u32, pre_off: u32, pre2_off: u32,
    post: f32, rate: f32, goal: f32, kind: u32, skip_center: bool,
) {
    let c = center(f, x, y);
    let d = diameter(f);
    let taps = u32(d * d);
    let base = unit * taps;
    for (var k = 0u; k < taps; k = k + 1u) {
        arena[out_off + base + k] = arena[prev_off + base + k];
    }
    for (var dy = -f.radius; dy <= f.radius; dy = dy + 1) {
        let sy = c.y + dy;
        if (sy < 0 || sy >= f.src_h) {
            continue;
        }
        for (var dx = -f.radius; dx <= f.radius; dx = dx + 1) {
            let sx = c.x + dx;
            if (sx < 0 || sx >= f.src_w) {
                continue;
            }
            if (skip_center && dx == 0 && dy == 0) {
                continue;
            }
            let k = u32((dx + f.radius) + (dy + f.radius) * d);
            let s = u32(sx + sy * f.src_w);
            let w = arena[prev_off + base + k];
            let pre = arena[pre_off + s];
            var next = w;
            if (kind == RULE_OJA) {
                next = w + rate * post * (pre - post * w);
            } else if (kind == RULE_INHIBITORY) {
                next = max(0.0, w + rate * pre * (post - goal));
            } else if (kind == RULE_FEED_BACK) {
                next = w + rate * post * (pre - arena[pre2_off + s]);
            } else {
                next = w + rate * pre;
            }
            arena[out_off + base + k] = next;
        }
    }
}

// Population block at offsets[base..base+9]:
// activation, state, short, long, threshold (previous), then activation,
// state, short, long (current).
fn settle(unit: u32, drive: f32, base: u32) {
    let eta = sv(0u);
    let rate_inv = sv(1u);
    let decay = sv(2u);
    let a = (1.0 - eta) * arena[off(base) + unit] + eta * drive;
    var state = 0.0;
    var activation = a;
    if (a > arena[off(base + 4u) + unit]) {
        state = 1.0;
        activation = 0.0;
    }
    arena[off(base + 5u) + unit] = activation;
    arena[off(base + 6u) + unit] = state;
    arena[off(base + 7u) + unit] = arena[off(base + 2u) + unit] + rate_inv * state;
    arena[off(base + 8u) + unit] = (1.0 - decay) * arena[off(base + 3u) + unit] + decay * state;
}

fn pcg_hash(v: u32) -> u32 {
    let state = v * 747796405u + 2891336453u;
    let word = ((state >> ((state >> 28u) + 4u)) ^ state) * 277803737u;
    return (word >> 22u) ^ word;
}

fn random_unit(seed0: u32, seed1: u32, stream: u32, index: u32) -> f32 {
    let key = pcg_hash(seed0 + pcg_hash(seed1 ^ pcg_hash(stream)));
    let h = pcg_hash(index ^ key);
    return f32(h >> 8u) / 16777216.0;
}

@compute @workgroup_size(8, 8)
fn random_fill(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= iv(0u) || gid.y >= iv(1u)) {
        return;
    }
    let unit = gid.x + gid.y * iv(0u);
    let depth = iv(2u);
    let lo = sv(0u);
    let span = sv(1u) - lo;
    for (var k = 0u; k < depth; k = k + 1u) {
        let index = unit * depth + k;
        arena[off(0u) + index] = lo + span * random_unit(iv(3u), iv(4u), iv(5u), index);
    }
}

@compute @workgroup_size(8, 8)
fn e_activate(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= iv(0u) || gid.y >= iv(1u)) {
        return;
    }
    let unit = gid.x + gid.y * iv(0u);
    let ff = window_dot(receptive(2u), gid.x, gid.y, unit, off(2u), off(0u), false);
    let fb = window_dot(receptive(5u), gid.x, gid.y, unit, off(3u), off(1u), false);
    settle(unit, ff - fb, 4u);
}

@compute @workgroup_size(8, 8)
fn i_activate(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= iv(0u) || gid.y >= iv(1u)) {
        return;
    }
    let unit = gid.x + gid.y * iv(0u);
    let ff = window_dot(receptive(2u), gid.x, gid.y, unit, off(2u), off(0u), false);
    let lateral = window_dot(receptive(5u), gid.x, gid.y, unit, off(3u), off(6u), true);
    let fb = window_dot(receptive(8u), gid.x, gid.y, unit, off(4u), off(1u), false);
    settle(unit, ff + fb - lateral, 5u);
}

@compute @workgroup_size(8, 8)
fn e_learn(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= iv(0u) || gid.y >= iv(1u)) {
        return;
    }
    let unit = gid.x + gid.y * iv(0u);
    let post = arena[off(1u) + unit];
    let sparsity = sv(3u);
    learn_window(receptive(2u), gid.x, gid.y, unit, off(4u), off(7u), off(0u), 0u,
        post, sv(0u), 0.0, RULE_OJA, false);
    learn_window(receptive(5u), gid.x, gid.y, unit, off(5u), off(8u), off(3u), 0u,
        post, sv(1u), sparsity, RULE_INHIBITORY, false);
    arena[off(9u) + unit] = arena[off(6u) + unit] + sv(2u) * (arena[off(2u) + unit] - sparsity);
}

@compute @workgroup_size(8, 8)
fn i_learn(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= iv(0u) || gid.y >= iv(1u)) {
        return;
    }
    let unit = gid.x + gid.y * iv(0u);
    let post = arena[off(3u) + unit];
    let sparsity = sv(4u);
    learn_window(receptive(2u), gid.x, gid.y, unit, off(5u), off(9u), off(2u), 0u,
        post, sv(0u), 0.0, RULE_OJA, false);
    learn_window(receptive(5u), gid.x, gid.y, unit, off(6u), off(10u), off(3u), 0u,
        post, sv(1u), sparsity, RULE_INHIBITORY, true);
    learn_window(receptive(8u), gid.x, gid.y, unit, off(7u), off(11u), off(0u), off(1u),
        post, sv(2u), 0.0, RULE_FEED_BACK, false);
    arena[off(12u) + unit] = arena[off(8u) + unit] + sv(3u) * (arena[off(4u) + unit] - sparsity);
}

@compute @workgroup_size(8, 8)
fn predict(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= iv(0u) || gid.y >= iv(1u)) {
        return;
    }
    let unit = gid.x + gid.y * iv(0u);
    let from_e = window_dot(receptive(2u), gid.x, gid.y, unit, off(2u), off(0u), false);
    let from_i = window_dot(receptive(5u), gid.x, gid.y, unit, off(3u), off(1u), false);
    arena[off(4u) + unit] = from_e + from_i;
}

@compute @workgroup_size(8, 8)
fn prediction_learn(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= iv(0u) || gid.y >= iv(1u)) {
        return;
    }
    let unit = gid.x + gid.y * iv(0u);
    let scaled_error = sv(0u) * (arena[off(2u) + unit] - arena[off(3u) + unit]);
    learn_window(receptive(2u), gid.x, gid.y, unit, off(4u), off(6u), off(0u), 0u,
        0.0, scaled_error, 0.0, RULE_DELTA, false);
    learn_window(receptive(5u), gid.x, gid.y, unit, off(5u), off(7u), off(1u), 0u,
        0.0, scaled_error, 0.0, RULE_DELTA, false);
}

@compute @workgroup_size(8, 8)
fn sum_activity(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= iv(0u) || gid.y >= iv(1u)) {
        return;
    }
    let unit = gid.x + gid.y * iv(0u);
    arena[off(2u) + unit] = arena[off(1u) + unit] + sv(0u) * arena[off(0u) + unit];
}

@compute @workgroup_size(8, 8)
fn encode_input(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= iv(0u) || gid.y >= iv(1u)) {
        return;
    }
    let unit = gid.x + gid.y * iv(0u);
    var timer = arena[off(1u) + unit] + arena[off(0u) + unit];
    var spike = 0.0;
    if (timer >= 1.0) {
        timer = timer - 1.0;
        spike = 1.0;
    } else if (timer <= -1.0) {
        timer = timer + 1.0;
        spike = -1.0;
    }
    let rate = sv(0u);
    arena[off(3u) + unit] = timer;
    arena[off(4u) + unit] = spike;
    arena[off(5u) + unit] = (1.0 - rate) * arena[off(2u) + unit] + rate * abs(spike);
}

@compute @workgroup_size(8, 8)
fn copy_range(@builtin(global_invocation_id) gid: vec3<u32>) {
    let index = gid.x + gid.y * iv(0u);
    if (gid.x >= iv(0u) || index >= iv(2u)) {
        return;
    }
    arena[off(1u) + index] = arena[off(0u) + index];
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExecutionTier, RandomFillArgs, SumActivityArgs};
    use crate::host::HostBackend;

    #[test]
    fn gpu_backend_creation() {
        // This test may fail to find an adapter on machines without a GPU.
        match GpuBackend::new(1 << 16) {
            Ok(gpu) => println!("GPU backend created: {}", gpu.name()),
            Err(e) => println!("No GPU available ({e})"),
        }
    }

    #[test]
    fn gpu_kernels_match_host() {
        let Ok(mut gpu) = GpuBackend::new(1 << 16) else {
            return;
        };
        let mut host = HostBackend::new(ExecutionTier::Scalar);
        let shape = Shape::new(Extent::new(5, 3), 9);
        let field = Extent::new(5, 3).field();

        let mut outputs = Vec::new();
        for backend in [&mut gpu as &mut dyn ComputeBackend, &mut host] {
            let weights = backend.allocate(shape).unwrap();
            backend
                .dispatch(&Dispatch::RandomFill(RandomFillArgs {
                    tensor: weights,
                    min: -1.0,
                    max: 1.0,
                    seed: [21, 22],
                    stream: 1,
                }))
                .unwrap();
            let states = backend.allocate_with(field, &[1.0; 15]).unwrap();
            let sums_prev = backend.allocate(field).unwrap();
            backend.fill(sums_prev, 0.5).unwrap();
            let sums = backend.allocate(field).unwrap();
            backend
                .dispatch(&Dispatch::SumActivity(SumActivityArgs {
                    states,
                    sums_prev,
                    sums,
                    scale: 0.25,
                }))
                .unwrap();
            let copy = backend.allocate(shape).unwrap();
            backend.copy(weights, copy).unwrap();
            outputs.push((backend.readback(copy).unwrap(), backend.readback(sums).unwrap()));
        }
        assert_eq!(outputs[0].1, vec![0.75; 15]);
        for (g, h) in outputs[0].0.iter().zip(&outputs[1].0) {
            assert!((g - h).abs() < 1e-6);
        }
    }

    #[test]
    fn arena_exhaustion_is_reported() {
        let Ok(mut gpu) = GpuBackend::new(64) else {
            return;
        };
        assert!(gpu.allocate(Extent::new(8, 8).field()).is_ok());
        assert!(matches!(
            gpu.allocate(Extent::UNIT.field()),
            Err(BackendError::OutOfMemory { .. })
        ));
    }
}
