use std::{
    collections::HashMap,
    sync::atomic::{AtomicI32, Ordering},
};

use rayon::prelude::*;

use crate::{
    codec::{MipImage, full_mip_count},
    compute::{
        backend::{
            ComputeBackend, ComputeQueue, DispatchBindings, ExecutionLimits, FrameRGBA, GridSize,
            GroupSize, ResourceId, StatsReadback, TextureDesc, UniformParams,
        },
        kernel::{aux_coord, shade_texel},
    },
    foundation::{
        config::WorkerConfig,
        error::{WorkerError, WorkerResult},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuBackendOpts {
    pub execution_width: u32,
    pub max_threads_per_group: u32,
    pub max_texture_dimension: u32,
}

impl Default for CpuBackendOpts {
    fn default() -> Self {
        Self {
            execution_width: 32,
            max_threads_per_group: 256,
            max_texture_dimension: 16384,
        }
    }
}

impl From<&WorkerConfig> for CpuBackendOpts {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            execution_width: cfg.execution_width,
            max_texture_dimension: cfg.max_texture_dimension,
            ..Self::default()
        }
    }
}

/// Reference backend executing the kernel contract on the host.
///
/// Dispatches are recorded and only run at [`ComputeQueue::commit_and_wait`], with rows of each
/// unit spread over the rayon pool. Texels outside `group * grid` are left untouched, exactly as
/// an accelerator would leave them.
#[derive(Clone, Debug, Default)]
pub struct CpuBackend {
    opts: CpuBackendOpts,
}

impl CpuBackend {
    pub fn new(opts: CpuBackendOpts) -> Self {
        Self { opts }
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            preferred_width: self.opts.execution_width,
            max_threads_per_group: self.opts.max_threads_per_group,
            max_group_width: 256,
            max_group_height: 256,
        }
    }

    fn create_queue(&self) -> WorkerResult<Box<dyn ComputeQueue>> {
        Ok(Box::new(CpuQueue::new(self.opts.max_texture_dimension)))
    }
}

struct CpuTexture {
    desc: TextureDesc,
    /// Faces concatenated per level.
    levels: Vec<Vec<u8>>,
}

#[derive(Clone, Copy)]
struct CpuView {
    texture: ResourceId,
    level: u32,
    face: u32,
}

#[derive(Default)]
struct CpuStats {
    level: AtomicI32,
    count: AtomicI32,
    host: Option<StatsReadback>,
}

enum CpuResource {
    Texture(CpuTexture),
    View(CpuView),
    Uniform { params: UniformParams, has_aux: bool },
    Stats(CpuStats),
}

struct PendingDispatch {
    bindings: DispatchBindings,
    group: GroupSize,
    grid: GridSize,
}

enum PendingOp {
    Dispatch(PendingDispatch),
    Flush(ResourceId),
}

pub struct CpuQueue {
    next_id: u64,
    max_dimension: u32,
    resources: HashMap<ResourceId, CpuResource>,
    pending: Vec<PendingOp>,
}

fn face_range(desc: &TextureDesc, level: u32, face: u32) -> std::ops::Range<usize> {
    let (w, h) = desc.level_extent(level);
    let len = (w as usize) * (h as usize) * desc.layout.bytes_per_pixel() as usize;
    let start = face as usize * len;
    start..start + len
}

impl CpuQueue {
    pub fn new(max_dimension: u32) -> Self {
        Self {
            next_id: 1,
            max_dimension,
            resources: HashMap::new(),
            pending: Vec::new(),
        }
    }

    fn insert(&mut self, res: CpuResource) -> ResourceId {
        let id = ResourceId(self.next_id);
        self.next_id += 1;
        self.resources.insert(id, res);
        id
    }

    fn check_desc(&self, desc: &TextureDesc) -> WorkerResult<()> {
        if desc.width == 0 || desc.height == 0 {
            return Err(WorkerError::allocation("texture extent must be non-zero"));
        }
        if desc.width > self.max_dimension || desc.height > self.max_dimension {
            return Err(WorkerError::allocation(format!(
                "texture {}x{} exceeds the {} texel limit",
                desc.width, desc.height, self.max_dimension
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

    fn texture(&self, id: ResourceId) -> WorkerResult<&CpuTexture> {
        match self.resources.get(&id) {
            Some(CpuResource::Texture(t)) => Ok(t),
            _ => Err(WorkerError::backend(format!("{id:?} is not a live texture"))),
        }
    }

    fn view(&self, id: ResourceId) -> WorkerResult<CpuView> {
        match self.resources.get(&id) {
            Some(CpuResource::View(v)) => Ok(*v),
            _ => Err(WorkerError::backend(format!("{id:?} is not a live view"))),
        }
    }

    fn uniform(&self, id: ResourceId) -> WorkerResult<(UniformParams, bool)> {
        match self.resources.get(&id) {
            Some(CpuResource::Uniform { params, has_aux }) => Ok((*params, *has_aux)),
            _ => Err(WorkerError::backend(format!("{id:?} is not a live uniform"))),
        }
    }

    fn stats(&self, id: ResourceId) -> WorkerResult<&CpuStats> {
        match self.resources.get(&id) {
            Some(CpuResource::Stats(s)) => Ok(s),
            _ => Err(WorkerError::backend(format!("{id:?} is not a live stats buffer"))),
        }
    }

    fn snapshot_stats(&mut self, id: ResourceId) -> WorkerResult<()> {
        match self.resources.get_mut(&id) {
            Some(CpuResource::Stats(s)) => {
                s.host = Some(StatsReadback {
                    signal_level: s.level.load(Ordering::Acquire),
                    match_count: s.count.load(Ordering::Acquire),
                });
                Ok(())
            }
            _ => Err(WorkerError::backend(format!("{id:?} is not a live stats buffer"))),
        }
    }

    fn execute(&mut self, d: &PendingDispatch) -> WorkerResult<()> {
        let dst_view = self.view(d.bindings.target)?;
        let src_view = self.view(d.bindings.source)?;
        if src_view.texture == dst_view.texture {
            return Err(WorkerError::backend("source and target views alias one texture"));
        }

        let mut target = match self.resources.remove(&dst_view.texture) {
            Some(CpuResource::Texture(t)) => t,
            Some(other) => {
                self.resources.insert(dst_view.texture, other);
                return Err(WorkerError::backend("target view does not refer to a texture"));
            }
            None => return Err(WorkerError::backend("target texture was released")),
        };
        let res = self.shade_unit(d, src_view, dst_view, &mut target);
        self.resources
            .insert(dst_view.texture, CpuResource::Texture(target));
        res
    }

    fn shade_unit(
        &self,
        d: &PendingDispatch,
        src_view: CpuView,
        dst_view: CpuView,
        target: &mut CpuTexture,
    ) -> WorkerResult<()> {
        let (params, has_aux) = self.uniform(d.bindings.uniform)?;
        let stats = self.stats(d.bindings.stats)?;

        let src = self.texture(src_view.texture)?;
        let (w, h) = target.desc.level_extent(dst_view.level);
        if src.desc.level_extent(src_view.level) != (w, h) {
            return Err(WorkerError::backend("source and target views differ in extent"));
        }
        let src_face = &src.levels[src_view.level as usize]
            [face_range(&src.desc, src_view.level, src_view.face)];

        let aux = match (has_aux, d.bindings.auxiliary) {
            (true, Some(id)) => {
                let v = self.view(id)?;
                let t = self.texture(v.texture)?;
                let data = &t.levels[v.level as usize][face_range(&t.desc, v.level, v.face)];
                Some((data, t.desc.level_extent(v.level)))
            }
            _ => None,
        };

        let cover_w = w.min(d.grid.width.saturating_mul(d.group.width)) as usize;
        let cover_h = h.min(d.grid.height.saturating_mul(d.group.height)) as usize;
        let row_bytes = w as usize * 4;
        let range = face_range(&target.desc, dst_view.level, dst_view.face);
        let dst_face = &mut target.levels[dst_view.level as usize][range];

        dst_face
            .par_chunks_mut(row_bytes)
            .take(cover_h)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..cover_w {
                    let at = (y * w as usize + x) * 4;
                    let texel = [
                        src_face[at],
                        src_face[at + 1],
                        src_face[at + 2],
                        src_face[at + 3],
                    ];
                    let mask = aux.map(|(data, (aw, ah))| {
                        let (ax, ay) = aux_coord(x as u32, y as u32, (w, h), (aw, ah));
                        data[(ay as usize * aw as usize + ax as usize) * 4]
                    });
                    let out = shade_texel(texel, &params, mask);
                    row[x * 4..x * 4 + 4].copy_from_slice(&out.rgba);
                    if let Some(level) = out.level {
                        stats.level.fetch_max(level, Ordering::Relaxed);
                    }
                    if out.matched {
                        stats.count.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        Ok(())
    }
}

impl ComputeQueue for CpuQueue {
    fn upload_texture(&mut self, image: &MipImage) -> WorkerResult<ResourceId> {
        let desc = TextureDesc::for_image(image);
        self.check_desc(&desc)?;
        Ok(self.insert(CpuResource::Texture(CpuTexture {
            desc,
            levels: image.levels.clone(),
        })))
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> WorkerResult<ResourceId> {
        self.check_desc(desc)?;
        let faces = desc.topology.faces() as usize;
        let levels = (0..desc.mip_levels)
            .map(|level| {
                let (w, h) = desc.level_extent(level);
                vec![0u8; (w as usize) * (h as usize) * 4 * faces]
            })
            .collect();
        Ok(self.insert(CpuResource::Texture(CpuTexture {
            desc: *desc,
            levels,
        })))
    }

    fn texture_desc(&self, texture: ResourceId) -> WorkerResult<TextureDesc> {
        Ok(self.texture(texture)?.desc)
    }

    fn create_view(
        &mut self,
        texture: ResourceId,
        level: u32,
        face: u32,
    ) -> WorkerResult<ResourceId> {
        let desc = self
            .texture(texture)
            .map_err(|e| WorkerError::allocation(format!("cannot create view: {e}")))?
            .desc;
        if level >= desc.mip_levels || face >= desc.topology.faces() {
            return Err(WorkerError::allocation(format!(
                "cannot create view of level {level} face {face} on a {}-level {:?} texture",
                desc.mip_levels, desc.topology
            )));
        }
        Ok(self.insert(CpuResource::View(CpuView {
            texture,
            level,
            face,
        })))
    }

    fn create_uniform_buffer(
        &mut self,
        params: &UniformParams,
        has_aux: bool,
    ) -> WorkerResult<ResourceId> {
        Ok(self.insert(CpuResource::Uniform {
            params: *params,
            has_aux,
        }))
    }

    fn create_stats_buffer(&mut self) -> WorkerResult<ResourceId> {
        Ok(self.insert(CpuResource::Stats(CpuStats::default())))
    }

    fn dispatch(
        &mut self,
        bindings: &DispatchBindings,
        group: GroupSize,
        grid: GridSize,
    ) -> WorkerResult<()> {
        self.pending.push(PendingOp::Dispatch(PendingDispatch {
            bindings: *bindings,
            group,
            grid,
        }));
        Ok(())
    }

    fn flush_stats(&mut self, stats: ResourceId) -> WorkerResult<()> {
        self.stats(stats)?;
        self.pending.push(PendingOp::Flush(stats));
        Ok(())
    }

    fn commit_and_wait(&mut self) -> WorkerResult<()> {
        let pending = std::mem::take(&mut self.pending);
        for op in &pending {
            match op {
                PendingOp::Dispatch(d) => self.execute(d)?,
                PendingOp::Flush(id) => self.snapshot_stats(*id)?,
            }
        }
        Ok(())
    }

    fn read_stats(&mut self, stats: ResourceId) -> WorkerResult<StatsReadback> {
        self.stats(stats)?
            .host
            .ok_or_else(|| WorkerError::backend("stats read before flush"))
    }

    fn read_texture(&mut self, texture: ResourceId, level: u32) -> WorkerResult<FrameRGBA> {
        let t = self.texture(texture)?;
        if level >= t.desc.mip_levels {
            return Err(WorkerError::backend(format!(
                "readback level {level} out of range"
            )));
        }
        let (w, h) = t.desc.level_extent(level);
        Ok(FrameRGBA {
            width: w,
            height: h * t.desc.topology.faces(),
            data: t.levels[level as usize].clone(),
        })
    }

    fn release(&mut self, id: ResourceId) {
        self.resources.remove(&id);
    }

    fn live_resources(&self) -> usize {
        self.resources.len()
    }
}
