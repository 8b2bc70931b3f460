use crate::{
    codec::MipImage,
    compute::backend::{
        ComputeQueue, DispatchBindings, ExecutionLimits, GridSize, GroupSize, PixelLayout,
        ResourceId, StatsReadback, TextureDesc, UniformParams,
    },
    foundation::error::WorkerResult,
    lifecycle::JobResources,
};

/// One (mip level, face) pair submitted to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchUnit {
    pub level: u32,
    pub face: u32,
}

/// Units in increasing level order, faces 0..n within each level.
pub fn plan_units(desc: &TextureDesc) -> Vec<DispatchUnit> {
    let faces = desc.topology.faces();
    let mut out = Vec::with_capacity((desc.mip_levels * faces) as usize);
    for level in 0..desc.mip_levels {
        for face in 0..faces {
            out.push(DispatchUnit { level, face });
        }
    }
    out
}

/// 2D group shape: preferred execution width across, `max_threads / width` down.
pub fn group_size(limits: &ExecutionLimits) -> GroupSize {
    let max_threads = limits.max_threads_per_group.max(1);
    let width = limits
        .preferred_width
        .clamp(1, max_threads)
        .min(limits.max_group_width.max(1));
    let height = (max_threads / width).clamp(1, limits.max_group_height.max(1));
    GroupSize { width, height }
}

/// Smallest grid of `group`-sized blocks covering a `width` x `height` level.
pub fn grid_for(width: u32, height: u32, group: GroupSize) -> GridSize {
    GridSize {
        width: width.div_ceil(group.width),
        height: height.div_ceil(group.height),
        depth: 1,
    }
}

/// Result of one job's compute phase. `target` and `stats` stay tracked in the job's
/// [`JobResources`] until the submission decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchOutput {
    pub target: ResourceId,
    pub target_desc: TextureDesc,
    pub stats: ResourceId,
    pub readback: StatsReadback,
}

/// Units recorded on a queue but not yet committed.
#[derive(Debug)]
pub struct RecordedBatch {
    target: ResourceId,
    target_desc: TextureDesc,
    stats: ResourceId,
    /// Released as soon as the batch completes.
    transient: Vec<ResourceId>,
}

/// Upload the job's images and record one dispatch per unit into a fresh destination.
pub fn record(
    queue: &mut dyn ComputeQueue,
    limits: &ExecutionLimits,
    primary: &MipImage,
    auxiliary: Option<&MipImage>,
    uniform: &UniformParams,
    resources: &mut JobResources,
) -> WorkerResult<RecordedBatch> {
    let source = resources.track(queue.upload_texture(primary)?);
    let mut transient = vec![source];
    let aux_texture = match auxiliary {
        Some(img) => {
            let tex = resources.track(queue.upload_texture(img)?);
            transient.push(tex);
            Some(tex)
        }
        None => None,
    };

    let target_desc = TextureDesc {
        layout: PixelLayout::Rgba8Unorm,
        ..queue.texture_desc(source)?
    };
    let target = resources.track(queue.create_texture(&target_desc)?);
    let stats = resources.track(queue.create_stats_buffer()?);
    let uniform_buf = resources.track(queue.create_uniform_buffer(uniform, aux_texture.is_some())?);
    transient.push(uniform_buf);

    let aux_view = match aux_texture {
        Some(tex) => {
            let view = resources.track(queue.create_view(tex, 0, 0)?);
            transient.push(view);
            Some(view)
        }
        None => None,
    };

    let group = group_size(limits);
    let units = plan_units(&target_desc);
    for unit in &units {
        let src_view = resources.track(queue.create_view(source, unit.level, unit.face)?);
        let dst_view = resources.track(queue.create_view(target, unit.level, unit.face)?);
        transient.extend([src_view, dst_view]);

        let (w, h) = target_desc.level_extent(unit.level);
        queue.dispatch(
            &DispatchBindings {
                source: src_view,
                target: dst_view,
                uniform: uniform_buf,
                stats,
                auxiliary: aux_view,
            },
            group,
            grid_for(w, h, group),
        )?;
    }
    tracing::debug!(
        units = units.len(),
        group_w = group.width,
        group_h = group.height,
        "dispatched"
    );
    queue.flush_stats(stats)?;

    Ok(RecordedBatch {
        target,
        target_desc,
        stats,
        transient,
    })
}

/// Block until the recorded batch completes, release everything but the destination and the
/// statistics, and read the statistics back.
pub fn complete(
    queue: &mut dyn ComputeQueue,
    batch: RecordedBatch,
    resources: &mut JobResources,
) -> WorkerResult<DispatchOutput> {
    queue.commit_and_wait()?;
    for id in batch.transient.into_iter().rev() {
        resources.release(queue, id);
    }
    let readback = queue.read_stats(batch.stats)?;
    Ok(DispatchOutput {
        target: batch.target,
        target_desc: batch.target_desc,
        stats: batch.stats,
        readback,
    })
}

/// [`record`] followed by [`complete`].
pub fn dispatch(
    queue: &mut dyn ComputeQueue,
    limits: &ExecutionLimits,
    primary: &MipImage,
    auxiliary: Option<&MipImage>,
    uniform: &UniformParams,
    resources: &mut JobResources,
) -> WorkerResult<DispatchOutput> {
    let batch = record(queue, limits, primary, auxiliary, uniform, resources)?;
    complete(queue, batch, resources)
}
