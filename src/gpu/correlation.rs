// gpu/correlation.rs -- wgpu implementation of KernelProgram.
//
// One compiled pipeline per KernelKey (facet size, degree, interpolation).
// Facet area, coefficient count, interpolation and workgroup size are baked
// into the shader source by string substitution, so the per-pixel loops and
// the workgroup reduction arrays have compile-time sizes.
//
// BUFFERS (bindings of shaders/correlation.wgsl):
//
//   0 image_a        f32 per pixel       cached across loads
//   1 image_b        f32 per pixel       cached across loads
//   2 facet_data     (x, y) i32 pairs    per load
//   3 facet_centers  (x, y) f32          per load
//   4 limits         36 f32 per slot     per load
//   5 facet_meta     16 u32 per slot     per load
//   6 results        f32 per score       per load
//   7 params         uniform             rewritten before every dispatch
//
// The image pair is kept while consecutive loads reference the same
// `Arc<Image>` instances (all sub-tasks of one solve) and dropped in
// `finish`.
//
// MEMORY:
// A load whose score buffer or image buffers exceed the device's largest
// storage binding is refused up front as OutOfMemory. Allocation failures
// the driver reports later are caught with an OutOfMemory error scope
// around buffer creation, image pair upload included. A failed load drops
// the cached pair.
//
// TIMING:
// `dispatch` submits one compute pass and blocks on `device.poll(Wait)`.
// The wall time of submit plus wait is the measured latency fed to the
// work-size manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use wgpu::util::DeviceExt;

use crate::gpu::device::GpuDevice;
use crate::image::Image;
use crate::kernel::{BackendError, KernelKey, KernelProgram, TaskData};

/// Invocations a deformation batch covers at least; the base unit is this
/// divided by the variant's workgroup size, so small facets batch more
/// deformations per dispatch.
const BATCH_INVOCATIONS: u64 = 8192;

const META_STRIDE: usize = 16;
const LIMITS_STRIDE: usize = 36;
const MAX_COEFFS: usize = 12;

/// Uniform parameters of one dispatch (must match Params in correlation.wgsl).
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    image_width:       u32,
    image_height:      u32,
    slot:              u32,
    deformation_base:  u32,
    deformation_count: u32,
    _pad:              [u32; 3],
}

struct Variant {
    pipeline: wgpu::ComputePipeline,
    wg_size:  u32,
}

struct ImagePair {
    a:     Arc<Image<f32>>,
    b:     Arc<Image<f32>>,
    buf_a: wgpu::Buffer,
    buf_b: wgpu::Buffer,
}

struct Loaded {
    bind_group:  wgpu::BindGroup,
    params_buf:  wgpu::Buffer,
    results_buf: wgpu::Buffer,
    result_len:  usize,
    /// Deformation count per slot, for dispatch bounds checks.
    slot_lens:   Vec<u64>,
}

/// GPU correlation backend.
pub struct GpuKernelProgram {
    gpu:       Arc<GpuDevice>,
    bgl:       wgpu::BindGroupLayout,
    layout:    wgpu::PipelineLayout,
    variants:  HashMap<KernelKey, Variant>,
    current:   Option<KernelKey>,
    images:    Option<ImagePair>,
    loaded:    Option<Loaded>,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Storage buffer initialised from `bytes`; empty inputs get a minimal
/// buffer since zero-sized bindings are invalid.
fn storage_init(gpu: &GpuDevice, label: &str, bytes: &[u8]) -> wgpu::Buffer {
    const EMPTY: [u8; 16] = [0; 16];
    gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label:    Some(label),
        contents: if bytes.is_empty() { &EMPTY } else { bytes },
        usage:    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
    })
}

/// Deformations per batch unit for a workgroup of `wg_size` invocations.
fn base_unit_for(wg_size: u32) -> u64 {
    (BATCH_INVOCATIONS / wg_size.max(1) as u64).max(1)
}

/// Map a popped error scope onto the backend error classes.
fn scope_error(err: Option<wgpu::Error>, requested: u64, available: u64) -> Result<(), BackendError> {
    match err {
        None => Ok(()),
        Some(wgpu::Error::OutOfMemory { .. }) => Err(BackendError::OutOfMemory { requested, available }),
        Some(e) => Err(BackendError::Device(e.to_string())),
    }
}

impl GpuKernelProgram {
    pub fn new(gpu: Arc<GpuDevice>) -> Self {
        let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("correlation BGL"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, true),
                storage_entry(4, true),
                storage_entry(5, true),
                storage_entry(6, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 7,
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
        let layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("correlation pipeline layout"),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });
        GpuKernelProgram {
            gpu,
            bgl,
            layout,
            variants: HashMap::new(),
            current: None,
            images: None,
            loaded: None,
        }
    }

    pub fn device(&self) -> &Arc<GpuDevice> {
        &self.gpu
    }

    fn compile(&self, key: KernelKey) -> Result<Variant, BackendError> {
        let area = key.facet_size * key.facet_size;
        let wg_size = self.gpu.workgroup_for_area(area);
        let src = include_str!("../shaders/correlation.wgsl")
            .replace("{{AREA}}", &area.to_string())
            .replace("{{COEFFS}}", &key.degree.coeff_count().to_string())
            .replace("{{INTERP}}", &key.interpolation.shader_id().to_string())
            .replace("{{WG_SIZE}}", &wg_size.to_string())
            .replace("{{WG_POW2}}", &wg_size.next_power_of_two().to_string());

        self.gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label:  Some("correlation.wgsl"),
            source: wgpu::ShaderSource::Wgsl(src.into()),
        });
        let pipeline = self.gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label:               Some("correlation"),
            layout:              Some(&self.layout),
            module:              &module,
            entry_point:         "main",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache:               None,
        });
        if let Some(e) = pollster::block_on(self.gpu.device.pop_error_scope()) {
            return Err(BackendError::Device(format!("kernel {key:?} failed to compile: {e}")));
        }
        info!("compiled correlation kernel {key:?} with workgroup {wg_size}");
        Ok(Variant { pipeline, wg_size })
    }

    fn variant(&self) -> Result<&Variant, BackendError> {
        self.current
            .and_then(|k| self.variants.get(&k))
            .ok_or_else(|| BackendError::Device("no prepared kernel".into()))
    }

    /// Upload the image pair unless the cached one is the same.
    fn ensure_images(&mut self, a: &Arc<Image<f32>>, b: &Arc<Image<f32>>) {
        if let Some(p) = &self.images {
            if Arc::ptr_eq(&p.a, a) && Arc::ptr_eq(&p.b, b) {
                return;
            }
        }
        let buf_a = storage_init(&self.gpu, "image_a", bytemuck::cast_slice(a.as_slice()));
        let buf_b = storage_init(&self.gpu, "image_b", bytemuck::cast_slice(b.as_slice()));
        debug!("uploaded {}x{} image pair", a.width(), a.height());
        self.images = Some(ImagePair { a: a.clone(), b: b.clone(), buf_a, buf_b });
    }
}

impl KernelProgram for GpuKernelProgram {
    fn name(&self) -> &str {
        "gpu"
    }

    fn prepare(&mut self, key: KernelKey) -> Result<(), BackendError> {
        if !self.variants.contains_key(&key) {
            let v = self.compile(key)?;
            self.variants.insert(key, v);
        }
        self.current = Some(key);
        Ok(())
    }

    fn base_unit(&self) -> u64 {
        self.variant().map_or(1, |v| base_unit_for(v.wg_size))
    }

    fn max_batch(&self) -> u64 {
        self.gpu.limits().max_compute_workgroups_per_dimension as u64
    }

    fn memory_budget(&self) -> u64 {
        self.gpu.max_storage_binding()
    }

    fn load(&mut self, data: &TaskData<'_>) -> Result<(), BackendError> {
        let key = self
            .current
            .ok_or_else(|| BackendError::Device("load before prepare".into()))?;
        let task = data.task;
        let layout = data.layout;
        let available = self.gpu.max_storage_binding();

        let requested = layout.result_bytes();
        let image_bytes = (task.image_a.as_slice().len() * std::mem::size_of::<f32>()) as u64;
        if requested > available || image_bytes > available {
            return Err(BackendError::OutOfMemory { requested: requested.max(image_bytes), available });
        }
        if layout.total > u32::MAX as usize {
            return Err(BackendError::OutOfMemory { requested, available: u32::MAX as u64 * 4 });
        }

        let area = key.facet_size * key.facet_size;
        let n = layout.slots.len();
        let mut facet_data: Vec<i32> = Vec::with_capacity(n * area * 2);
        let mut centers: Vec<f32> = Vec::with_capacity(n * 2);
        let mut limits: Vec<f32> = vec![0.0; n * LIMITS_STRIDE];
        let mut meta: Vec<u32> = vec![0; n * META_STRIDE];

        for (k, slot) in layout.slots.iter().enumerate() {
            let facet = &task.facets[slot.global];
            if facet.size != key.facet_size {
                return Err(BackendError::Device(format!(
                    "facet {facet:?} does not match prepared size {}",
                    key.facet_size
                )));
            }
            facet_data.extend(facet.pixels().flat_map(|(x, y)| [x as i32, y as i32]));
            centers.extend_from_slice(&[facet.center.0 as f32, facet.center.1 as f32]);

            let l = &task.limits[slot.global];
            let m = &mut meta[k * META_STRIDE..(k + 1) * META_STRIDE];
            m[..MAX_COEFFS].fill(1);
            for (c, (r, &count)) in l.ranges().iter().zip(l.step_counts()).enumerate() {
                let base = k * LIMITS_STRIDE + c * 3;
                limits[base..base + 3].copy_from_slice(&[r.min as f32, r.max as f32, r.step as f32]);
                m[c] = count as u32;
            }
            m[12] = slot.result_offset as u32;
            m[13] = slot.deformations.start as u32;
            m[14] = slot.len() as u32;
        }

        self.gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.ensure_images(&task.image_a, &task.image_b);
        let facet_buf = storage_init(&self.gpu, "facet_data", bytemuck::cast_slice(&facet_data));
        let centers_buf = storage_init(&self.gpu, "facet_centers", bytemuck::cast_slice(&centers));
        let limits_buf = storage_init(&self.gpu, "limits", bytemuck::cast_slice(&limits));
        let meta_buf = storage_init(&self.gpu, "facet_meta", bytemuck::cast_slice(&meta));
        let results_buf = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label:              Some("results"),
            size:               requested.max(16),
            usage:              wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let params_buf = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label:              Some("params"),
            size:               std::mem::size_of::<Params>() as u64,
            usage:              wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Err(e) = scope_error(pollster::block_on(self.gpu.device.pop_error_scope()), requested, available) {
            // The image pair may be among the failed allocations.
            self.images = None;
            return Err(e);
        }

        let images = self
            .images
            .as_ref()
            .ok_or_else(|| BackendError::Device("image pair not uploaded".into()))?;
        let bind_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label:   Some("correlation BG"),
            layout:  &self.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: images.buf_a.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: images.buf_b.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: facet_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: centers_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: limits_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: meta_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 6, resource: results_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 7, resource: params_buf.as_entire_binding() },
            ],
        });

        self.loaded = Some(Loaded {
            bind_group,
            params_buf,
            results_buf,
            result_len: layout.total,
            slot_lens: layout.slots.iter().map(|s| s.len()).collect(),
        });
        Ok(())
    }

    fn dispatch(&mut self, slot: usize, base: u64, count: u64) -> Result<Duration, BackendError> {
        let variant = self.variant()?;
        let loaded = self
            .loaded
            .as_ref()
            .ok_or_else(|| BackendError::Device("dispatch without a loaded task".into()))?;
        let len = *loaded
            .slot_lens
            .get(slot)
            .ok_or_else(|| BackendError::Device(format!("no facet slot {slot}")))?;
        if base + count > len || count > self.max_batch() {
            return Err(BackendError::Device(format!("batch [{base}, +{count}) out of range")));
        }
        if count == 0 {
            return Ok(Duration::ZERO);
        }

        let images = self
            .images
            .as_ref()
            .ok_or_else(|| BackendError::Device("image pair not uploaded".into()))?;
        let params = Params {
            image_width:       images.a.width() as u32,
            image_height:      images.a.height() as u32,
            slot:              slot as u32,
            deformation_base:  base as u32,
            deformation_count: count as u32,
            _pad:              [0; 3],
        };

        let started = Instant::now();
        self.gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.gpu.queue.write_buffer(&loaded.params_buf, 0, bytemuck::bytes_of(&params));
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("correlation") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label:            Some("correlation"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&variant.pipeline);
            pass.set_bind_group(0, &loaded.bind_group, &[]);
            pass.dispatch_workgroups(count as u32, 1, 1);
        }
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        self.gpu.device.poll(wgpu::Maintain::Wait);
        let elapsed = started.elapsed();
        if let Some(e) = pollster::block_on(self.gpu.device.pop_error_scope()) {
            return Err(BackendError::Device(format!(
                "dispatch of {count} deformations (workgroup {}) failed: {e}",
                variant.wg_size
            )));
        }
        Ok(elapsed)
    }

    fn read_scores(&mut self) -> Result<Vec<f32>, BackendError> {
        let loaded = self
            .loaded
            .as_ref()
            .ok_or_else(|| BackendError::Device("no loaded task".into()))?;
        if loaded.result_len == 0 {
            return Ok(Vec::new());
        }
        let bytes = (loaded.result_len * std::mem::size_of::<f32>()) as u64;

        self.gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let rb_buf = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label:              Some("results readback"),
            size:               bytes,
            usage:              wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        scope_error(
            pollster::block_on(self.gpu.device.pop_error_scope()),
            bytes,
            self.gpu.max_storage_binding(),
        )?;

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(&loaded.results_buf, 0, &rb_buf, 0, bytes);
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = rb_buf.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| BackendError::Device(format!("readback channel closed: {e}")))?
            .map_err(|e| BackendError::Device(format!("readback map failed: {e}")))?;

        let scores = {
            let mapped = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, f32>(&mapped).to_vec()
        };
        rb_buf.unmap();
        Ok(scores)
    }

    fn release(&mut self) {
        self.loaded = None;
    }

    fn finish(&mut self) {
        self.loaded = None;
        self.images = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deformation::{DeformationDegree, DeformationLimits};
    use crate::facet::Facet;
    use crate::image::Interpolation;
    use crate::kernel::cpu::CpuKernelProgram;
    use crate::kernel::TaskLayout;
    use crate::task::{ComputationTask, FullTask};

    fn run_gpu_test(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
            .output()
            .unwrap_or_else(|e| panic!("subprocess failed: {e}"));
        let out = String::from_utf8_lossy(&output.stdout).into_owned()
            + &String::from_utf8_lossy(&output.stderr);
        print!("{out}");
        out
    }

    fn speckle(w: usize, h: usize) -> Image<f32> {
        Image::from_fn(w, h, |x, y| {
            let (x, y) = (x as f32, y as f32);
            100.0 + 40.0 * (0.7 * x).sin() * (0.5 * y).cos() + 25.0 * (0.31 * x + 0.43 * y).sin()
        })
    }

    /// Scores of every deformation of `task` through a backend, one batch per slot.
    fn scores_of<K: KernelProgram>(k: &mut K, key: KernelKey, task: &FullTask) -> Vec<f32> {
        let layout = TaskLayout::new(task, &ComputationTask::full(0..task.facet_count()));
        k.prepare(key).unwrap();
        k.load(&TaskData { task, layout: &layout }).unwrap();
        for (slot, s) in layout.slots.iter().enumerate() {
            let mut base = 0;
            while base < s.len() {
                let count = (s.len() - base).min(k.max_batch());
                k.dispatch(slot, base, count).unwrap();
                base += count;
            }
        }
        let out = k.read_scores().unwrap();
        k.release();
        out
    }

    fn check_matches_cpu(degree_limits: &[f64], interpolation: Interpolation) {
        let gpu = Arc::new(GpuDevice::new().expect("GPU required"));
        let a = Arc::new(speckle(64, 48));
        let b = Arc::new(Image::from_fn(64, 48, |x, y| {
            crate::image::sample(&a, x as f32 - 1.5, y as f32 + 0.5, Interpolation::Bicubic)
        }));
        let limits = Arc::new(DeformationLimits::new(degree_limits).unwrap());
        let facets = vec![Facet::new(20, 20, 9), Facet::new(40, 24, 9), Facet::new(30, 30, 9)];
        let task = FullTask::uniform(a, b, facets, 1, limits.clone()).unwrap();
        let key = KernelKey { facet_size: 9, degree: limits.degree(), interpolation };

        let cpu = scores_of(&mut CpuKernelProgram::new(), key, &task);
        let mut g = GpuKernelProgram::new(gpu);
        let gpu_scores = scores_of(&mut g, key, &task);
        g.finish();

        assert_eq!(cpu.len(), gpu_scores.len());
        for (i, (c, g)) in cpu.iter().zip(&gpu_scores).enumerate() {
            assert!((c - g).abs() < 1e-3, "score {i}: cpu {c}, gpu {g}");
        }
    }

    #[test]
    fn base_unit_shrinks_with_workgroup_size() {
        assert_eq!(base_unit_for(32), 256);
        assert_eq!(base_unit_for(128), 64);
        assert_eq!(base_unit_for(256), 32);
        assert!(base_unit_for(96) * 96 <= BATCH_INVOCATIONS);
        assert_eq!(base_unit_for(1 << 14), 1);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_base_unit_follows_facet_area() {
        let gpu = Arc::new(GpuDevice::new().expect("GPU required"));
        let mut k = GpuKernelProgram::new(gpu.clone());
        for size in [5, 11, 21] {
            let key = KernelKey { facet_size: size, degree: DeformationDegree::Zero, interpolation: Interpolation::Bilinear };
            k.prepare(key).unwrap();
            let wg = gpu.workgroup_for_area(size * size);
            assert_eq!(k.base_unit(), base_unit_for(wg), "facet size {size}");
        }
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_gpu_base_unit_follows_facet_area() {
        let out = run_gpu_test("gpu::correlation::tests::inner_gpu_base_unit_follows_facet_area");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:
{out}");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_matches_cpu_zero_order() {
        check_matches_cpu(&[-3.0, 3.0, 0.5, -2.0, 2.0, 0.5], Interpolation::Bicubic);
        check_matches_cpu(&[-3.0, 3.0, 0.5, -2.0, 2.0, 0.5], Interpolation::Bilinear);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_matches_cpu_first_order() {
        let mut flat = vec![-2.0, 0.0, 0.5, 0.0, 1.0, 0.5];
        flat.extend_from_slice(&[-0.05, 0.05, 0.05].repeat(4));
        check_matches_cpu(&flat, Interpolation::Bicubic);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_flat_window_scores_minus_one() {
        let gpu = Arc::new(GpuDevice::new().expect("GPU required"));
        let img = Arc::new(Image::from_vec(32, 32, vec![9.0f32; 1024]));
        let limits = Arc::new(DeformationLimits::new(&[0.0; 6]).unwrap());
        let task = FullTask::uniform(img.clone(), img, vec![Facet::new(16, 16, 7)], 1, limits).unwrap();
        let key = KernelKey { facet_size: 7, degree: DeformationDegree::Zero, interpolation: Interpolation::Bilinear };
        let scores = scores_of(&mut GpuKernelProgram::new(gpu), key, &task);
        assert_eq!(scores, vec![-1.0]);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_gpu_matches_cpu_zero_order() {
        let out = run_gpu_test("gpu::correlation::tests::inner_gpu_matches_cpu_zero_order");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_gpu_matches_cpu_first_order() {
        let out = run_gpu_test("gpu::correlation::tests::inner_gpu_matches_cpu_first_order");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_gpu_flat_window_scores_minus_one() {
        let out = run_gpu_test("gpu::correlation::tests::inner_gpu_flat_window_scores_minus_one");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
