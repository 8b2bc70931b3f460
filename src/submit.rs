use std::{
    sync::{Arc, Condvar, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;

use crate::{
    codec::encode_png,
    compute::backend::{ComputeQueue, ResourceId, StatsReadback, UniformParams},
    foundation::error::WorkerResult,
    protocol::{Coordinator, PushRequest, Ratio},
};

/// Submit iff the signal statistic reaches the threshold.
pub fn should_submit(stats: &StatsReadback, uniform: &UniformParams) -> bool {
    stats.signal_level >= uniform.threshold
}

/// Ratio header value; the denominator is the level-0 pixel count of one face.
///
/// The numerator counts matches over every face and mip level, so cubes and mip chains can
/// report a ratio above 1 (a fully matching 2x2 cube gives `24/4`).
pub fn ratio_for(stats: &StatsReadback, uniform: &UniformParams) -> Ratio {
    Ratio {
        matches: i64::from(stats.match_count),
        total: (uniform.target_width as u64) * (uniform.target_height as u64),
    }
}

/// Counts pushes that were issued but have not completed yet.
#[derive(Debug, Default)]
pub struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `task` on a detached thread, counted until it returns or unwinds.
    pub fn spawn<F>(self: &Arc<Self>, name: &str, task: F) -> WorkerResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        let guard = InFlightGuard(Arc::clone(self));
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                task();
            })
            .context("spawn push thread")?;
        Ok(())
    }

    /// Block until nothing is in flight. Returns false if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            match deadline {
                None => {
                    count = self.idle.wait(count).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    count = self
                        .idle
                        .wait_timeout(count, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        true
    }
}

/// Issues result pushes without blocking the slot on their completion.
#[derive(Clone)]
pub struct Submitter {
    coordinator: Arc<dyn Coordinator>,
    in_flight: Arc<InFlight>,
}

impl Submitter {
    pub fn new(coordinator: Arc<dyn Coordinator>, in_flight: Arc<InFlight>) -> Self {
        Self {
            coordinator,
            in_flight,
        }
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    /// Gate on the statistics and, when they pass, read back level 0 of `target`, encode it and
    /// push it. Returns whether a push was issued.
    pub fn maybe_submit(
        &self,
        queue: &mut dyn ComputeQueue,
        path: &str,
        session: Option<String>,
        stats: &StatsReadback,
        target: ResourceId,
        uniform: &UniformParams,
    ) -> WorkerResult<bool> {
        if !should_submit(stats, uniform) {
            tracing::debug!(
                path,
                signal = stats.signal_level,
                threshold = uniform.threshold,
                "below threshold"
            );
            return Ok(false);
        }

        let frame = queue.read_texture(target, 0)?;
        let body = encode_png(&frame)?;
        drop(frame);

        let req = PushRequest {
            path: path.to_string(),
            session,
            ratio: ratio_for(stats, uniform),
            body,
        };
        let coordinator = Arc::clone(&self.coordinator);
        self.in_flight.spawn("push", move || match coordinator.push(&req) {
            Ok(status) => tracing::info!(path = %req.path, ratio = %req.ratio, status, "SEND"),
            Err(e) => tracing::warn!(path = %req.path, error = %e, "push failed"),
        })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::{
        codec::{MipImage, Topology},
        compute::cpu::CpuQueue,
        protocol::PullResponse,
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

    fn uniform(threshold: i32) -> UniformParams {
        UniformParams {
            brightness: 1.0,
            target_width: 4.0,
            target_height: 4.0,
            threshold,
            srgb_flag: 0,
        }
    }

    fn setup() -> (Arc<Recording>, Submitter, CpuQueue, ResourceId) {
        let coord = Arc::new(Recording {
            pushes: Mutex::new(Vec::new()),
        });
        let submitter = Submitter::new(coord.clone(), Arc::new(InFlight::new()));
        let mut queue = CpuQueue::new(64);
        let target = queue
            .upload_texture(&MipImage {
                width: 4,
                height: 4,
                topology: Topology::Planar,
                levels: vec![[9u8, 9, 9, 255].repeat(16)],
            })
            .unwrap();
        (coord, submitter, queue, target)
    }

    #[test]
    fn gate_is_inclusive_at_threshold() {
        let u = uniform(187);
        let at = |signal_level| StatsReadback {
            signal_level,
            match_count: 0,
        };
        assert!(!should_submit(&at(186), &u));
        assert!(should_submit(&at(187), &u));
        assert!(should_submit(&at(255), &u));
    }

    #[test]
    fn ratio_denominator_is_one_level_zero_face() {
        let mut u = uniform(187);
        u.target_width = 2.0;
        u.target_height = 2.0;
        let stats = StatsReadback {
            signal_level: 255,
            match_count: 24,
        };
        let r = ratio_for(&stats, &u);
        assert_eq!((r.matches, r.total), (24, 4));
        assert_eq!(r.to_string(), "24/4");
    }

    #[test]
    fn one_below_threshold_pushes_nothing() {
        let (coord, submitter, mut queue, target) = setup();
        let stats = StatsReadback {
            signal_level: 186,
            match_count: 3,
        };
        let pushed = submitter
            .maybe_submit(&mut queue, "a.PNG", None, &stats, target, &uniform(187))
            .unwrap();
        assert!(!pushed);
        assert!(submitter.in_flight().wait_idle(Some(Duration::from_secs(5))));
        assert!(coord.pushes.lock().unwrap().is_empty());
    }

    #[test]
    fn at_threshold_pushes_ratio_and_png() {
        let (coord, submitter, mut queue, target) = setup();
        let stats = StatsReadback {
            signal_level: 187,
            match_count: 5,
        };
        let pushed = submitter
            .maybe_submit(
                &mut queue,
                "dir/a.PNG",
                Some("g-7".to_string()),
                &stats,
                target,
                &uniform(187),
            )
            .unwrap();
        assert!(pushed);
        assert!(submitter.in_flight().wait_idle(Some(Duration::from_secs(5))));

        let pushes = coord.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].path, "dir/a.PNG");
        assert_eq!(pushes[0].session.as_deref(), Some("g-7"));
        assert_eq!(pushes[0].ratio.to_string(), "5/16");
        let decoded = image::load_from_memory(&pushes[0].body).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (4, 4));
    }

    #[test]
    fn wait_idle_times_out_while_a_task_is_blocked() {
        let in_flight = Arc::new(InFlight::new());
        let (tx, rx) = mpsc::channel::<()>();
        in_flight
            .spawn("blocked", move || {
                let _ = rx.recv();
            })
            .unwrap();
        assert_eq!(in_flight.pending(), 1);
        assert!(!in_flight.wait_idle(Some(Duration::from_millis(50))));
        drop(tx);
        assert!(in_flight.wait_idle(None));
        assert_eq!(in_flight.pending(), 0);
    }
}
