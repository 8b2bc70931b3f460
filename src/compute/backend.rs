use std::sync::Arc;

use crate::{
    codec::{MipImage, Topology, level_extent},
    foundation::{
        config::{BackendKind, WorkerConfig},
        error::{WorkerError, WorkerResult},
    },
};

/// RGBA8 pixels read back from a compute queue, tightly packed, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameRGBA {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Opaque handle to a queue-owned resource (texture, view, or buffer).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

/// Pixel layout of destination textures. One layout is used system-wide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    Rgba8Unorm,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8Unorm => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub topology: Topology,
    pub layout: PixelLayout,
}

impl TextureDesc {
    pub fn for_image(image: &MipImage) -> Self {
        Self {
            width: image.width,
            height: image.height,
            mip_levels: image.mip_count(),
            topology: image.topology,
            layout: PixelLayout::Rgba8Unorm,
        }
    }

    pub fn level_extent(&self, level: u32) -> (u32, u32) {
        level_extent(self.width, self.height, level)
    }
}

/// Per-job parameters consumed read-only by every dispatch unit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UniformParams {
    pub brightness: f32,
    pub target_width: f32,
    pub target_height: f32,
    pub threshold: i32,
    pub srgb_flag: i32,
}

impl UniformParams {
    /// Size of the packed uniform block as the kernel sees it.
    pub const GPU_SIZE: usize = 32;

    /// Pack into the kernel's uniform layout:
    /// `brightness, pad, target.xy, threshold, srgb, has_aux, pad`.
    pub fn to_gpu_bytes(&self, has_aux: bool) -> [u8; Self::GPU_SIZE] {
        let mut out = [0u8; Self::GPU_SIZE];
        out[0..4].copy_from_slice(&self.brightness.to_le_bytes());
        out[8..12].copy_from_slice(&self.target_width.to_le_bytes());
        out[12..16].copy_from_slice(&self.target_height.to_le_bytes());
        out[16..20].copy_from_slice(&self.threshold.to_le_bytes());
        out[20..24].copy_from_slice(&self.srgb_flag.to_le_bytes());
        out[24..28].copy_from_slice(&u32::from(has_aux).to_le_bytes());
        out
    }
}

/// Aggregate counters produced by one job's batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsReadback {
    pub signal_level: i32,
    pub match_count: i32,
}

/// Capabilities reported by a backend for sizing thread groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub preferred_width: u32,
    pub max_threads_per_group: u32,
    pub max_group_width: u32,
    pub max_group_height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridSize {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Everything one dispatch unit binds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchBindings {
    /// Source view restricted to one (level, face).
    pub source: ResourceId,
    /// Destination view restricted to the same (level, face).
    pub target: ResourceId,
    pub uniform: ResourceId,
    /// Shared read-write accumulator for the whole job.
    pub stats: ResourceId,
    /// Secondary read-only input. Backends bind a stand-in when absent.
    pub auxiliary: Option<ResourceId>,
}

/// Shared, thread-safe compute device. The compute program is built once at construction and
/// shared read-only by every queue.
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn limits(&self) -> ExecutionLimits;

    /// Create an independent execution queue; each worker slot owns one.
    fn create_queue(&self) -> WorkerResult<Box<dyn ComputeQueue>>;
}

/// A per-slot execution queue and the resources allocated through it.
pub trait ComputeQueue: Send {
    fn upload_texture(&mut self, image: &MipImage) -> WorkerResult<ResourceId>;

    fn create_texture(&mut self, desc: &TextureDesc) -> WorkerResult<ResourceId>;

    fn texture_desc(&self, texture: ResourceId) -> WorkerResult<TextureDesc>;

    /// View of a single mip `level` and cube `face` (0 for planar textures).
    fn create_view(&mut self, texture: ResourceId, level: u32, face: u32)
    -> WorkerResult<ResourceId>;

    fn create_uniform_buffer(
        &mut self,
        params: &UniformParams,
        has_aux: bool,
    ) -> WorkerResult<ResourceId>;

    /// Zero-initialized statistics accumulator.
    fn create_stats_buffer(&mut self) -> WorkerResult<ResourceId>;

    /// Record one dispatch. Execution may be deferred until [`ComputeQueue::commit_and_wait`].
    fn dispatch(
        &mut self,
        bindings: &DispatchBindings,
        group: GroupSize,
        grid: GridSize,
    ) -> WorkerResult<()>;

    /// Make the statistics accumulator host-visible once the batch completes.
    fn flush_stats(&mut self, stats: ResourceId) -> WorkerResult<()>;

    /// Submit everything recorded so far and block until the batch is complete.
    fn commit_and_wait(&mut self) -> WorkerResult<()>;

    fn read_stats(&mut self, stats: ResourceId) -> WorkerResult<StatsReadback>;

    /// Read one level back; cube faces are stacked top to bottom.
    fn read_texture(&mut self, texture: ResourceId, level: u32) -> WorkerResult<FrameRGBA>;

    /// Mark a resource reclaimable. Unknown ids are ignored.
    fn release(&mut self, id: ResourceId);

    fn live_resources(&self) -> usize;
}

/// Create the backend selected by the configuration.
pub fn create_backend(cfg: &WorkerConfig) -> WorkerResult<Arc<dyn ComputeBackend>> {
    match cfg.backend {
        BackendKind::Cpu => Ok(Arc::new(crate::compute::cpu::CpuBackend::new(
            crate::compute::cpu::CpuBackendOpts::from(cfg),
        ))),
        #[cfg(feature = "gpu")]
        BackendKind::Gpu => Ok(Arc::new(crate::compute::gpu::GpuBackend::new(
            crate::compute::gpu::GpuBackendOpts::from(cfg),
        )?)),
        #[allow(unreachable_patterns)]
        _ => Err(WorkerError::config(
            "requested backend is not available (built without the `gpu` feature)",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_packing_matches_kernel_layout() {
        let p = UniformParams {
            brightness: 2.0,
            target_width: 64.0,
            target_height: 32.0,
            threshold: 187,
            srgb_flag: 1,
        };
        let bytes = p.to_gpu_bytes(true);
        assert_eq!(&bytes[0..4], &2.0f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &[0; 4]);
        assert_eq!(&bytes[8..12], &64.0f32.to_le_bytes());
        assert_eq!(&bytes[12..16], &32.0f32.to_le_bytes());
        assert_eq!(&bytes[16..20], &187i32.to_le_bytes());
        assert_eq!(&bytes[20..24], &1i32.to_le_bytes());
        assert_eq!(&bytes[24..28], &1u32.to_le_bytes());
        assert_eq!(&p.to_gpu_bytes(false)[24..28], &0u32.to_le_bytes());
    }

    #[test]
    fn gpu_backend_requires_feature() {
        let cfg = WorkerConfig {
            backend: BackendKind::Gpu,
            ..WorkerConfig::default()
        };
        if cfg!(feature = "gpu") {
            return;
        }
        let err = create_backend(&cfg).err().unwrap();
        assert!(err.to_string().contains("gpu"));
    }
}
