use std::{collections::HashMap, sync::Arc};

use crate::{
    codec::{MipImage, full_mip_count},
    compute::{
        backend::{
            ComputeBackend, ComputeQueue, DispatchBindings, ExecutionLimits, FrameRGBA, GridSize,
            GroupSize, ResourceId, StatsReadback, TextureDesc, UniformParams,
        },
        kernel::KERNEL_WGSL,
        plan::group_size,
    },
    foundation::{
        config::WorkerConfig,
        error::{WorkerError, WorkerResult},
    },
};

const STATS_SIZE: u64 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuBackendOpts {
    pub execution_width: u32,
    pub max_texture_dimension: u32,
}

impl From<&WorkerConfig> for GpuBackendOpts {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            execution_width: cfg.execution_width,
            max_texture_dimension: cfg.max_texture_dimension,
        }
    }
}

struct GpuShared {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    /// Bound at the auxiliary slot when a job has no auxiliary input.
    stand_in: wgpu::TextureView,
    max_dimension: u32,
}

/// wgpu device shared by every slot. Each slot records into its own command encoder.
pub struct GpuBackend {
    shared: Arc<GpuShared>,
    limits: ExecutionLimits,
}

impl GpuBackend {
    pub fn new(opts: GpuBackendOpts) -> WorkerResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| match e {
            wgpu::RequestAdapterError::NotFound { .. } => {
                WorkerError::backend("no gpu adapter available")
            }
            other => WorkerError::backend(format!("wgpu request_adapter failed: {other:?}")),
        })?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("texture_worker_device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| WorkerError::backend(format!("wgpu request_device failed: {e:?}")))?;

        let dev_limits = device.limits();
        let limits = ExecutionLimits {
            preferred_width: opts.execution_width,
            max_threads_per_group: dev_limits.max_compute_invocations_per_workgroup,
            max_group_width: dev_limits.max_compute_workgroup_size_x,
            max_group_height: dev_limits.max_compute_workgroup_size_y,
        };
        let group = group_size(&limits);

        // naga cannot take override expressions in @workgroup_size
        let source = KERNEL_WGSL
            .replace("{{WG_X}}", &group.width.to_string())
            .replace("{{WG_Y}}", &group.height.to_string());
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("texture_worker_kernel"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let sampled = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: wgpu::TextureViewDimension::D2,
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
            },
            count: None,
        };
        let buffer = |binding, ty| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("texture_worker_bgl"),
            entries: &[
                sampled(0),
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: wgpu::TextureFormat::Rgba8Unorm,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
                buffer(2, wgpu::BufferBindingType::Uniform),
                buffer(3, wgpu::BufferBindingType::Storage { read_only: false }),
                sampled(4),
            ],
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("texture_worker_layout"),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("texture_worker_pipeline"),
            layout: Some(&layout),
            module: &module,
            entry_point: Some("compute"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        let stand_in = device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("texture_worker_aux_stand_in"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor::default());

        let info = adapter.get_info();
        tracing::info!(
            adapter = %info.name,
            backend = ?info.backend,
            group_w = group.width,
            group_h = group.height,
            "gpu backend ready"
        );

        Ok(Self {
            shared: Arc::new(GpuShared {
                max_dimension: opts
                    .max_texture_dimension
                    .min(dev_limits.max_texture_dimension_2d),
                device,
                queue,
                pipeline,
                bgl,
                stand_in,
            }),
            limits,
        })
    }
}

impl ComputeBackend for GpuBackend {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    fn create_queue(&self) -> WorkerResult<Box<dyn ComputeQueue>> {
        Ok(Box::new(GpuQueue {
            shared: Arc::clone(&self.shared),
            next_id: 1,
            resources: HashMap::new(),
            encoder: None,
            pending_flush: Vec::new(),
        }))
    }
}

enum GpuResource {
    Texture {
        texture: wgpu::Texture,
        desc: TextureDesc,
    },
    View(wgpu::TextureView),
    Uniform(wgpu::Buffer),
    Stats {
        storage: wgpu::Buffer,
        readback: wgpu::Buffer,
        flushed: bool,
    },
}

struct GpuQueue {
    shared: Arc<GpuShared>,
    next_id: u64,
    resources: HashMap<ResourceId, GpuResource>,
    encoder: Option<wgpu::CommandEncoder>,
    pending_flush: Vec<ResourceId>,
}

impl GpuQueue {
    fn insert(&mut self, res: GpuResource) -> ResourceId {
        let id = ResourceId(self.next_id);
        self.next_id += 1;
        self.resources.insert(id, res);
        id
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.shared.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("texture_worker_slot_encoder"),
            })
        })
    }

    fn texture(&self, id: ResourceId) -> WorkerResult<(&wgpu::Texture, TextureDesc)> {
        match self.resources.get(&id) {
            Some(GpuResource::Texture { texture, desc }) => Ok((texture, *desc)),
            _ => Err(WorkerError::backend(format!("{id:?} is not a live texture"))),
        }
    }

    fn view(&self, id: ResourceId) -> WorkerResult<&wgpu::TextureView> {
        match self.resources.get(&id) {
            Some(GpuResource::View(v)) => Ok(v),
            _ => Err(WorkerError::backend(format!("{id:?} is not a live view"))),
        }
    }

    fn buffer(&self, id: ResourceId) -> WorkerResult<&wgpu::Buffer> {
        match self.resources.get(&id) {
            Some(GpuResource::Uniform(b)) => Ok(b),
            Some(GpuResource::Stats { storage, .. }) => Ok(storage),
            _ => Err(WorkerError::backend(format!("{id:?} is not a live buffer"))),
        }
    }

    fn check_desc(&self, desc: &TextureDesc) -> WorkerResult<()> {
        let max = self.shared.max_dimension;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(WorkerError::allocation(format!(
                "texture {}x{} outside 1..={max}",
                desc.width, desc.height
            )));
        }
        if desc.mip_levels == 0 || desc.mip_levels > full_mip_count(desc.width, desc.height) {
            return Err(WorkerError::allocation(format!(
                "invalid mip count {} for {}x{}",
                desc.mip_levels, desc.width, desc.height
            )));
        }
        Ok(())
    }

    fn allocate_texture(
        &mut self,
        desc: &TextureDesc,
        usage: wgpu::TextureUsages,
    ) -> WorkerResult<wgpu::Texture> {
        self.check_desc(desc)?;
        let device = &self.shared.device;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("texture_worker_texture"),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.topology.faces(),
            },
            mip_level_count: desc.mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage,
            view_formats: &[],
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            texture.destroy();
            return Err(WorkerError::allocation(format!("texture allocation failed: {err}")));
        }
        Ok(texture)
    }

    fn wait(&self) -> WorkerResult<()> {
        self.shared
            .device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| WorkerError::backend(format!("wgpu poll failed: {e:?}")))?;
        Ok(())
    }

    fn map_read(&self, buffer: &wgpu::Buffer) -> WorkerResult<Vec<u8>> {
        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.wait()?;
        rx.recv()
            .map_err(|_| WorkerError::backend("readback channel closed"))?
            .map_err(|e| WorkerError::backend(format!("readback map failed: {e:?}")))?;
        let bytes = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(bytes)
    }
}

impl ComputeQueue for GpuQueue {
    fn upload_texture(&mut self, image: &MipImage) -> WorkerResult<ResourceId> {
        let desc = TextureDesc::for_image(image);
        let texture = self.allocate_texture(
            &desc,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        )?;
        for level in 0..desc.mip_levels {
            let (w, h) = desc.level_extent(level);
            for face in 0..desc.topology.faces() {
                self.shared.queue.write_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture: &texture,
                        mip_level: level,
                        origin: wgpu::Origin3d {
                            x: 0,
                            y: 0,
                            z: face,
                        },
                        aspect: wgpu::TextureAspect::All,
                    },
                    image.face_bytes(level, face),
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(w * 4),
                        rows_per_image: Some(h),
                    },
                    wgpu::Extent3d {
                        width: w,
                        height: h,
                        depth_or_array_layers: 1,
                    },
                );
            }
        }
        Ok(self.insert(GpuResource::Texture { texture, desc }))
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> WorkerResult<ResourceId> {
        let texture = self.allocate_texture(
            desc,
            wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
        )?;
        Ok(self.insert(GpuResource::Texture {
            texture,
            desc: *desc,
        }))
    }

    fn texture_desc(&self, texture: ResourceId) -> WorkerResult<TextureDesc> {
        Ok(self.texture(texture)?.1)
    }

    fn create_view(
        &mut self,
        texture: ResourceId,
        level: u32,
        face: u32,
    ) -> WorkerResult<ResourceId> {
        let (tex, desc) = self.texture(texture)?;
        if level >= desc.mip_levels || face >= desc.topology.faces() {
            return Err(WorkerError::allocation(format!(
                "view level {level} face {face} outside {texture:?}"
            )));
        }
        let view = tex.create_view(&wgpu::TextureViewDescriptor {
            label: Some("texture_worker_view"),
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_mip_level: level,
            mip_level_count: Some(1),
            base_array_layer: face,
            array_layer_count: Some(1),
            ..Default::default()
        });
        Ok(self.insert(GpuResource::View(view)))
    }

    fn create_uniform_buffer(
        &mut self,
        params: &UniformParams,
        has_aux: bool,
    ) -> WorkerResult<ResourceId> {
        let buffer = self.shared.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texture_worker_uniform"),
            size: UniformParams::GPU_SIZE as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.shared
            .queue
            .write_buffer(&buffer, 0, &params.to_gpu_bytes(has_aux));
        Ok(self.insert(GpuResource::Uniform(buffer)))
    }

    fn create_stats_buffer(&mut self) -> WorkerResult<ResourceId> {
        let device = &self.shared.device;
        let storage = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texture_worker_stats"),
            size: STATS_SIZE,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texture_worker_stats_readback"),
            size: STATS_SIZE,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(self.insert(GpuResource::Stats {
            storage,
            readback,
            flushed: false,
        }))
    }

    fn dispatch(
        &mut self,
        bindings: &DispatchBindings,
        _group: GroupSize,
        grid: GridSize,
    ) -> WorkerResult<()> {
        let aux = match bindings.auxiliary {
            Some(id) => self.view(id)?,
            None => &self.shared.stand_in,
        };
        let bind_group = self
            .shared
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("texture_worker_bind_group"),
                layout: &self.shared.bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(self.view(bindings.source)?),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(self.view(bindings.target)?),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: self.buffer(bindings.uniform)?.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: self.buffer(bindings.stats)?.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: wgpu::BindingResource::TextureView(aux),
                    },
                ],
            });

        let shared = Arc::clone(&self.shared);
        let mut pass = self
            .encoder()
            .begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("texture_worker_pass"),
                timestamp_writes: None,
            });
        pass.set_pipeline(&shared.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(grid.width, grid.height, grid.depth);
        Ok(())
    }

    fn flush_stats(&mut self, stats: ResourceId) -> WorkerResult<()> {
        let (storage, readback) = match self.resources.get(&stats) {
            Some(GpuResource::Stats {
                storage, readback, ..
            }) => (storage.clone(), readback.clone()),
            _ => {
                return Err(WorkerError::backend(format!(
                    "{stats:?} is not a live stats buffer"
                )));
            }
        };
        self.encoder()
            .copy_buffer_to_buffer(&storage, 0, &readback, 0, STATS_SIZE);
        self.pending_flush.push(stats);
        Ok(())
    }

    fn commit_and_wait(&mut self) -> WorkerResult<()> {
        if let Some(encoder) = self.encoder.take() {
            self.shared.queue.submit(Some(encoder.finish()));
        }
        self.wait()?;
        for id in std::mem::take(&mut self.pending_flush) {
            if let Some(GpuResource::Stats { flushed, .. }) = self.resources.get_mut(&id) {
                *flushed = true;
            }
        }
        Ok(())
    }

    fn read_stats(&mut self, stats: ResourceId) -> WorkerResult<StatsReadback> {
        let readback = match self.resources.get(&stats) {
            Some(GpuResource::Stats {
                readback,
                flushed: true,
                ..
            }) => readback.clone(),
            Some(GpuResource::Stats { .. }) => {
                return Err(WorkerError::backend(format!(
                    "{stats:?} was not flushed by a committed batch"
                )));
            }
            _ => {
                return Err(WorkerError::backend(format!(
                    "{stats:?} is not a live stats buffer"
                )));
            }
        };
        let bytes = self.map_read(&readback)?;
        let word = |i: usize| i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Ok(StatsReadback {
            signal_level: word(0),
            match_count: word(4),
        })
    }

    fn read_texture(&mut self, texture: ResourceId, level: u32) -> WorkerResult<FrameRGBA> {
        let (tex, desc) = self.texture(texture)?;
        if level >= desc.mip_levels {
            return Err(WorkerError::backend(format!(
                "level {level} outside {texture:?}"
            )));
        }
        let (w, h) = desc.level_extent(level);
        let faces = desc.topology.faces();
        let row_bytes = w
            .checked_mul(4)
            .ok_or_else(|| WorkerError::backend("readback width overflow"))?;
        let padded_row = align_to(row_bytes, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let size = (padded_row as u64) * (h as u64) * (faces as u64);

        let device = &self.shared.device;
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texture_worker_readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("texture_worker_readback_encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: tex,
                mip_level: level,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(h),
                },
            },
            wgpu::Extent3d {
                width: w,
                height: h,
                depth_or_array_layers: faces,
            },
        );
        self.shared.queue.submit(Some(encoder.finish()));

        let mapped = self.map_read(&readback)?;
        readback.destroy();
        let row_bytes = row_bytes as usize;
        let mut data = Vec::with_capacity(row_bytes * (h * faces) as usize);
        for row in 0..(h * faces) as usize {
            let start = row * padded_row as usize;
            data.extend_from_slice(&mapped[start..start + row_bytes]);
        }
        Ok(FrameRGBA {
            width: w,
            height: h * faces,
            data,
        })
    }

    fn release(&mut self, id: ResourceId) {
        match self.resources.remove(&id) {
            Some(GpuResource::Texture { texture, .. }) => texture.destroy(),
            Some(GpuResource::Uniform(buffer)) => buffer.destroy(),
            Some(GpuResource::Stats {
                storage, readback, ..
            }) => {
                storage.destroy();
                readback.destroy();
            }
            Some(GpuResource::View(_)) | None => {}
        }
    }

    fn live_resources(&self) -> usize {
        self.resources.len()
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::Topology, compute::plan::dispatch, lifecycle::JobResources};

    fn backend() -> Option<GpuBackend> {
        match GpuBackend::new(GpuBackendOpts {
            execution_width: 32,
            max_texture_dimension: 4096,
        }) {
            Ok(b) => Some(b),
            Err(WorkerError::Backend(msg)) if msg.contains("no gpu adapter") => None,
            Err(e) => panic!("{e}"),
        }
    }

    #[test]
    fn align_rounds_up_to_copy_alignment() {
        assert_eq!(align_to(4, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
    }

    #[test]
    fn gpu_dispatch_matches_kernel_contract() {
        let Some(backend) = backend() else {
            return;
        };
        let mut queue = backend.create_queue().unwrap();
        let image = MipImage {
            width: 4,
            height: 4,
            topology: Topology::Planar,
            levels: vec![[255u8, 0, 0, 255].repeat(16)],
        };
        let params = UniformParams {
            brightness: 1.0,
            target_width: 4.0,
            target_height: 4.0,
            threshold: 187,
            srgb_flag: 0,
        };
        let mut res = JobResources::new();
        let out = dispatch(
            queue.as_mut(),
            &backend.limits(),
            &image,
            None,
            &params,
            &mut res,
        )
        .unwrap();
        assert_eq!(out.readback.signal_level, 255);
        assert_eq!(out.readback.match_count, 16);

        let frame = queue.read_texture(out.target, 0).unwrap();
        assert_eq!((frame.width, frame.height), (4, 4));
        assert!(frame.data.chunks(4).all(|px| px == [255, 0, 0, 255]));

        res.release_all(queue.as_mut());
        assert_eq!(queue.live_resources(), 0);
    }
}
