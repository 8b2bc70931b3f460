use std::sync::Arc;

use crate::{
    codec::CodecOpts,
    compute::{
        backend::{ComputeQueue, ExecutionLimits, UniformParams},
        plan,
    },
    container::{self, ResourceRecord},
    foundation::{config::WorkerConfig, error::WorkerResult},
    lifecycle::JobResources,
    pool::{SlotState, SlotTracker},
    protocol::JobPayload,
    session::Session,
    submit::{Submitter, should_submit},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Submitted,
    BelowThreshold,
}

/// Per-job uniform block derived from the primary record. Target extent is the level-0 size of
/// one face as imported.
pub fn uniform_for(primary: &ResourceRecord, threshold: i32) -> UniformParams {
    UniformParams {
        brightness: primary.meta.brightness,
        target_width: primary.image.width as f32,
        target_height: primary.image.height as f32,
        threshold,
        srgb_flag: i32::from(primary.meta.srgb_flag),
    }
}

/// Everything a slot needs to run one job end to end. Shared read-only across slots.
#[derive(Clone)]
pub struct JobRunner {
    codec: CodecOpts,
    threshold: i32,
    limits: ExecutionLimits,
    session: Arc<Session>,
    submitter: Submitter,
}

impl JobRunner {
    pub fn new(
        cfg: &WorkerConfig,
        limits: ExecutionLimits,
        session: Arc<Session>,
        submitter: Submitter,
    ) -> Self {
        Self {
            codec: CodecOpts::from(cfg),
            threshold: cfg.threshold,
            limits,
            session,
            submitter,
        }
    }

    /// Decode, dispatch, gate and (maybe) submit one job. Every queue resource the job allocated
    /// is released before this returns, on success and failure alike.
    #[tracing::instrument(skip_all, fields(slot = slot.index(), file = %job.file))]
    pub fn run(
        &self,
        queue: &mut dyn ComputeQueue,
        job: JobPayload,
        slot: &mut SlotTracker,
    ) -> WorkerResult<JobOutcome> {
        slot.enter(SlotState::Decoding);
        let mut records = container::decode(&job.bytes, self.codec)?;
        drop(job.bytes);
        records[0].source_path = Some(job.file);
        tracing::info!(
            records = records.len(),
            width = records[0].image.width,
            height = records[0].image.height,
            mips = records[0].image.mip_count(),
            "LOAD"
        );

        let mut resources = JobResources::new();
        let result = self.execute(queue, &records, &mut resources, slot);
        resources.release_all(queue);
        result
    }

    fn execute(
        &self,
        queue: &mut dyn ComputeQueue,
        records: &[ResourceRecord],
        resources: &mut JobResources,
        slot: &mut SlotTracker,
    ) -> WorkerResult<JobOutcome> {
        let primary = &records[0];
        let auxiliary = records.last().filter(|_| records.len() > 1);
        let uniform = uniform_for(primary, self.threshold);

        slot.enter(SlotState::Dispatching);
        let batch = plan::record(
            queue,
            &self.limits,
            &primary.image,
            auxiliary.map(|r| &r.image),
            &uniform,
            resources,
        )?;
        slot.enter(SlotState::Computing);
        let out = plan::complete(queue, batch, resources)?;

        slot.enter(SlotState::Evaluating);
        let path = primary.source_path.as_deref().unwrap_or_default();
        if should_submit(&out.readback, &uniform) {
            slot.enter(SlotState::Submitting);
        }
        let submitted = self.submitter.maybe_submit(
            queue,
            path,
            self.session.id(),
            &out.readback,
            out.target,
            &uniform,
        )?;
        Ok(if submitted {
            JobOutcome::Submitted
        } else {
            JobOutcome::BelowThreshold
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, sync::Mutex, time::Duration};

    use image::{ImageFormat, Rgba, RgbaImage};

    use super::*;
    use crate::{
        compute::cpu::CpuQueue,
        container::{ContainerWriter, RecordMeta},
        foundation::error::WorkerError,
        protocol::{Coordinator, PullResponse, PushRequest},
        submit::InFlight,
    };

    struct Recording {
        pushes: Mutex<Vec<PushRequest>>,
    }

    impl Coordinator for Recording {
        fn pull(&self, _session: Option<&str>) -> WorkerResult<PullResponse> {
            Ok(PullResponse::default())
        }

        fn push(&self, req: &PushRequest) -> WorkerResult<u16> {
            self.pushes.lock().unwrap().push(req.clone());
            Ok(200)
        }

        fn summary(&self, _session: Option<&str>) -> WorkerResult<u16> {
            Ok(200)
        }
    }

    fn png(w: u32, h: u32, px: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(w, h, Rgba(px));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn meta(w: i16, h: i16) -> RecordMeta {
        RecordMeta {
            width: w,
            height: h,
            srgb_flag: 0,
            format_code: 0,
            brightness: 1.0,
        }
    }

    fn limits() -> ExecutionLimits {
        ExecutionLimits {
            preferred_width: 32,
            max_threads_per_group: 256,
            max_group_width: 256,
            max_group_height: 256,
        }
    }

    fn runner() -> (Arc<Recording>, JobRunner) {
        let coord = Arc::new(Recording {
            pushes: Mutex::new(Vec::new()),
        });
        let session = Arc::new(Session::new());
        session.record("g-1");
        let submitter = Submitter::new(coord.clone(), Arc::new(InFlight::new()));
        let runner = JobRunner::new(&WorkerConfig::default(), limits(), session, submitter);
        (coord, runner)
    }

    #[test]
    fn bright_job_is_submitted_with_source_path() {
        let (coord, runner) = runner();
        let bytes = ContainerWriter::new()
            .record(meta(4, 4), &png(4, 4, [250, 20, 20, 255]))
            .finish();
        let mut queue = CpuQueue::new(64);
        let mut slot = SlotTracker::new(0);
        let outcome = runner
            .run(
                &mut queue,
                JobPayload {
                    file: "tex/a.PNG".to_string(),
                    bytes,
                },
                &mut slot,
            )
            .unwrap();
        assert_eq!(outcome, JobOutcome::Submitted);
        assert_eq!(queue.live_resources(), 0);

        assert!(runner.submitter.in_flight().wait_idle(Some(Duration::from_secs(5))));
        let pushes = coord.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].path, "tex/a.PNG");
        assert_eq!(pushes[0].session.as_deref(), Some("g-1"));
        assert_eq!(pushes[0].ratio.to_string(), "16/16");
    }

    #[test]
    fn dim_job_is_not_submitted() {
        let (coord, runner) = runner();
        let bytes = ContainerWriter::new()
            .record(meta(4, 4), &png(4, 4, [40, 40, 40, 255]))
            .finish();
        let mut queue = CpuQueue::new(64);
        let outcome = runner
            .run(
                &mut queue,
                JobPayload {
                    file: "a.PNG".to_string(),
                    bytes,
                },
                &mut SlotTracker::new(0),
            )
            .unwrap();
        assert_eq!(outcome, JobOutcome::BelowThreshold);
        assert_eq!(queue.live_resources(), 0);
        assert!(coord.pushes.lock().unwrap().is_empty());
    }

    #[test]
    fn trailing_record_masks_statistics() {
        let (coord, runner) = runner();
        // bright primary, fully masked out
        let bytes = ContainerWriter::new()
            .record(meta(4, 4), &png(4, 4, [255, 255, 255, 255]))
            .record(meta(2, 2), &png(2, 2, [0, 0, 0, 255]))
            .finish();
        let mut queue = CpuQueue::new(64);
        let outcome = runner
            .run(
                &mut queue,
                JobPayload {
                    file: "a.PNG".to_string(),
                    bytes,
                },
                &mut SlotTracker::new(0),
            )
            .unwrap();
        assert_eq!(outcome, JobOutcome::BelowThreshold);
        assert!(coord.pushes.lock().unwrap().is_empty());
    }

    #[test]
    fn allocation_failure_releases_everything() {
        let (_coord, runner) = runner();
        let bytes = ContainerWriter::new()
            .record(meta(32, 4), &png(32, 4, [255, 255, 255, 255]))
            .finish();
        let mut queue = CpuQueue::new(16);
        let err = runner
            .run(
                &mut queue,
                JobPayload {
                    file: "a.PNG".to_string(),
                    bytes,
                },
                &mut SlotTracker::new(0),
            )
            .unwrap_err();
        assert!(matches!(err, WorkerError::Allocation(_)));
        assert_eq!(queue.live_resources(), 0);
    }

    #[test]
    fn malformed_container_is_a_decode_error() {
        let (_coord, runner) = runner();
        let err = runner
            .run(
                &mut CpuQueue::new(64),
                JobPayload {
                    file: "a.PNG".to_string(),
                    bytes: vec![1, 2],
                },
                &mut SlotTracker::new(0),
            )
            .unwrap_err();
        assert!(matches!(err, WorkerError::Decode(_)));
    }
}
