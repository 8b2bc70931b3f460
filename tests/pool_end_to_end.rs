use std::{
    collections::VecDeque,
    io::Cursor,
    sync::{Arc, Mutex},
};

use image::{ImageFormat, Rgba, RgbaImage};
use texture_worker::{
    ContainerWriter, Coordinator, PullResponse, PushRequest, RecordMeta, WorkerConfig,
    WorkerError, WorkerPool, WorkerResult, create_backend,
};

/// Scripted coordinator: hands out the queued responses, then 410 forever.
#[derive(Default)]
struct FakeCoordinator {
    script: Mutex<VecDeque<PullResponse>>,
    pulls: Mutex<Vec<Option<String>>>,
    pushes: Mutex<Vec<PushRequest>>,
    /// Pulls already issued when each push arrived.
    pulls_at_push: Mutex<Vec<usize>>,
    summaries: Mutex<Vec<Option<String>>>,
}

impl FakeCoordinator {
    fn with_script(script: Vec<PullResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        })
    }
}

impl Coordinator for FakeCoordinator {
    fn pull(&self, session: Option<&str>) -> WorkerResult<PullResponse> {
        self.pulls.lock().unwrap().push(session.map(str::to_string));
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PullResponse {
                status: 410,
                ..PullResponse::default()
            }))
    }

    fn push(&self, req: &PushRequest) -> WorkerResult<u16> {
        let pulls = self.pulls.lock().unwrap().len();
        self.pulls_at_push.lock().unwrap().push(pulls);
        self.pushes.lock().unwrap().push(req.clone());
        Ok(200)
    }

    fn summary(&self, session: Option<&str>) -> WorkerResult<u16> {
        self.summaries.lock().unwrap().push(session.map(str::to_string));
        Ok(200)
    }
}

fn png(w: u32, h: u32, px: [u8; 4]) -> Vec<u8> {
    let img = RgbaImage::from_pixel(w, h, Rgba(px));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn container(px: [u8; 4]) -> Vec<u8> {
    container_sized(4, px)
}

fn container_sized(side: u32, px: [u8; 4]) -> Vec<u8> {
    ContainerWriter::new()
        .record(
            RecordMeta {
                width: side as i16,
                height: side as i16,
                srgb_flag: 0,
                format_code: 0,
                brightness: 1.0,
            },
            &png(side, side, px),
        )
        .finish()
}

fn job(group: Option<&str>, file: &str, body: Vec<u8>) -> PullResponse {
    PullResponse {
        status: 200,
        group: group.map(str::to_string),
        file: Some(file.to_string()),
        body,
    }
}

fn run(cfg: WorkerConfig, coord: Arc<FakeCoordinator>) -> texture_worker::PoolReport {
    let backend = create_backend(&cfg).unwrap();
    let pool = WorkerPool::new(cfg, backend, coord).unwrap();
    pool.run().unwrap()
}

#[test]
fn single_job_then_gone_stops_every_slot_and_summarizes_once() {
    let coord = FakeCoordinator::with_script(vec![job(
        Some("g-1"),
        "textures/albedo.PNG",
        container([255, 255, 255, 255]),
    )]);
    let cfg = WorkerConfig::default();
    let slots = cfg.concurrency as u64;
    let backend = create_backend(&cfg).unwrap();
    let pool = WorkerPool::new(cfg, backend, coord.clone()).unwrap();
    assert_eq!(pool.session().id(), None);
    let report = pool.run().unwrap();
    assert_eq!(pool.session().id().as_deref(), Some("g-1"));

    assert_eq!(report.completed, 1);
    assert_eq!(report.submitted, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.slots_stopped, slots);
    assert_eq!(report.summary_status, Some(200));

    let pushes = coord.pushes.lock().unwrap();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].path, "textures/albedo.PNG");
    assert_eq!(pushes[0].session.as_deref(), Some("g-1"));
    assert_eq!(pushes[0].ratio.to_string(), "16/16");
    let result = image::load_from_memory(&pushes[0].body).unwrap();
    assert_eq!((result.width(), result.height()), (4, 4));

    assert_eq!(*coord.summaries.lock().unwrap(), vec![Some("g-1".to_string())]);
}

#[test]
fn unsupported_file_is_void_and_worker_keeps_pulling() {
    let coord = FakeCoordinator::with_script(vec![job(None, "job.txt", b"hello".to_vec())]);
    let cfg = WorkerConfig {
        concurrency: 1,
        ..WorkerConfig::default()
    };
    let report = run(cfg, coord.clone());

    assert_eq!(report.void_jobs, 1);
    assert_eq!(report.completed, 0);
    assert_eq!(report.slots_stopped, 1);
    assert!(coord.pushes.lock().unwrap().is_empty());
    // the 410 after the void job
    assert_eq!(coord.pulls.lock().unwrap().len(), 2);
    assert_eq!(*coord.summaries.lock().unwrap(), vec![None]);
}

#[test]
fn mixed_jobs_across_slots_are_counted_and_gated() {
    let g = Some("g-2");
    let mut script = vec![job(g, "a.PNG", container([250, 0, 0, 255]))];
    script.push(job(g, "b.PNG", container([10, 10, 10, 255])));
    script.push(job(g, "c.PNG", vec![0xde, 0xad]));
    // suffix match is case-sensitive
    script.push(job(g, "d.png", container([0, 0, 255, 255])));
    script.push(PullResponse {
        status: 503,
        ..PullResponse::default()
    });
    let coord = FakeCoordinator::with_script(script);
    let cfg = WorkerConfig {
        concurrency: 2,
        ..WorkerConfig::default()
    };
    let report = run(cfg, coord.clone());

    assert_eq!(report.completed, 2);
    assert_eq!(report.submitted, 1);
    assert_eq!(report.below_threshold, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.void_jobs, 2);
    assert_eq!(report.slots_stopped, 2);

    let mut paths: Vec<_> = coord
        .pushes
        .lock()
        .unwrap()
        .iter()
        .map(|p| {
            assert_eq!(p.session.as_deref(), Some("g-2"));
            p.path.clone()
        })
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["a.PNG".to_string()]);
    assert_eq!(coord.summaries.lock().unwrap().len(), 1);
}

#[test]
fn next_pull_is_issued_while_the_slot_computes() {
    let coord = FakeCoordinator::with_script(vec![job(
        Some("g-3"),
        "big.PNG",
        container_sized(256, [255, 255, 255, 255]),
    )]);
    let cfg = WorkerConfig {
        concurrency: 1,
        generate_mips: true,
        ..WorkerConfig::default()
    };
    let report = run(cfg, coord.clone());

    assert_eq!(report.submitted, 1);
    // the job pull plus the 410 that was already out before the result was pushed
    assert_eq!(*coord.pulls_at_push.lock().unwrap(), vec![2]);
    assert_eq!(coord.pulls.lock().unwrap().len(), 2);
}

#[test]
fn invalid_config_is_rejected_before_running() {
    let cfg = WorkerConfig {
        concurrency: 0,
        ..WorkerConfig::default()
    };
    let backend = create_backend(&WorkerConfig::default()).unwrap();
    let err = WorkerPool::new(cfg, backend, FakeCoordinator::with_script(vec![]))
        .err()
        .unwrap();
    assert!(matches!(err, WorkerError::Config(_)));
}
