use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, SyncSender},
    },
    thread,
    time::Duration,
};

use anyhow::Context;

use crate::{
    compute::backend::{ComputeBackend, ComputeQueue},
    foundation::{config::WorkerConfig, error::WorkerResult},
    job::{JobOutcome, JobRunner},
    protocol::{Coordinator, FetchOutcome, JobClient},
    session::Session,
    submit::{InFlight, Submitter},
};

/// Where a slot currently is in its job loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotState {
    Idle,
    Fetching,
    Decoding,
    Dispatching,
    Computing,
    Evaluating,
    Submitting,
    Stopped,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Current state of one slot; every transition is traced.
#[derive(Debug)]
pub struct SlotTracker {
    index: usize,
    state: SlotState,
}

impl SlotTracker {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: SlotState::Idle,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn enter(&mut self, next: SlotState) {
        tracing::debug!(slot = self.index, from = %self.state, to = %next, "slot state");
        self.state = next;
    }
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    submitted: AtomicU64,
    below_threshold: AtomicU64,
    void_jobs: AtomicU64,
    failed: AtomicU64,
    slots_stopped: AtomicU64,
}

/// Totals for one pool run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolReport {
    /// Jobs that went through the whole pipeline, submitted or not.
    pub completed: u64,
    pub submitted: u64,
    pub below_threshold: u64,
    /// Pulls that yielded no usable job (unsupported, no content, transport failure).
    pub void_jobs: u64,
    /// Jobs that failed after a container was received.
    pub failed: u64,
    pub slots_stopped: u64,
    /// Summary response status, if it arrived within the grace period.
    pub summary_status: Option<u16>,
}

impl Counters {
    fn report(&self, summary_status: Option<u16>) -> PoolReport {
        PoolReport {
            completed: self.completed.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            below_threshold: self.below_threshold.load(Ordering::Relaxed),
            void_jobs: self.void_jobs.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            slots_stopped: self.slots_stopped.load(Ordering::Relaxed),
            summary_status,
        }
    }
}

/// Fixed set of worker slots pulling jobs from one coordinator.
pub struct WorkerPool {
    cfg: WorkerConfig,
    backend: Arc<dyn ComputeBackend>,
    coordinator: Arc<dyn Coordinator>,
    session: Arc<Session>,
}

impl WorkerPool {
    pub fn new(
        cfg: WorkerConfig,
        backend: Arc<dyn ComputeBackend>,
        coordinator: Arc<dyn Coordinator>,
    ) -> WorkerResult<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            backend,
            coordinator,
            session: Arc::new(Session::new()),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Run every slot until the coordinator is exhausted, drain pushes, then send the summary.
    pub fn run(&self) -> WorkerResult<PoolReport> {
        let queues = (0..self.cfg.concurrency)
            .map(|_| self.backend.create_queue())
            .collect::<WorkerResult<Vec<_>>>()?;

        let in_flight = Arc::new(InFlight::new());
        let runner = JobRunner::new(
            &self.cfg,
            self.backend.limits(),
            Arc::clone(&self.session),
            Submitter::new(Arc::clone(&self.coordinator), Arc::clone(&in_flight)),
        );
        let client = JobClient::new(
            Arc::clone(&self.coordinator),
            Arc::clone(&self.session),
            self.cfg.expected_extension.clone(),
        );
        let counters = Counters::default();
        let backoff = self.cfg.retry_backoff();

        tracing::info!(
            slots = queues.len(),
            backend = self.backend.name(),
            "worker pool started"
        );

        thread::scope(|s| {
            for (index, queue) in queues.into_iter().enumerate() {
                let (ready_tx, ready_rx) = mpsc::sync_channel(1);
                let (permit_tx, permit_rx) = mpsc::sync_channel(1);
                let client = &client;
                let runner = &runner;
                let counters = &counters;
                s.spawn(move || load_loop(index, client, ready_tx, permit_rx, backoff));
                s.spawn(move || compute_loop(index, queue, runner, ready_rx, permit_tx, counters));
            }
        });

        if !in_flight.wait_idle(self.cfg.push_drain_timeout()) {
            tracing::warn!(
                pending = in_flight.pending(),
                "shutting down with pushes still in flight"
            );
        }

        let summary_status = self.send_summary(self.cfg.summary_grace())?;
        let report = counters.report(summary_status);
        tracing::info!(
            completed = report.completed,
            submitted = report.submitted,
            below_threshold = report.below_threshold,
            void_jobs = report.void_jobs,
            failed = report.failed,
            "worker pool finished"
        );
        Ok(report)
    }

    /// Issue the summary request once and wait at most `grace` for its response.
    fn send_summary(&self, grace: Duration) -> WorkerResult<Option<u16>> {
        let (tx, rx) = mpsc::channel();
        let coordinator = Arc::clone(&self.coordinator);
        let session = self.session.id();
        thread::Builder::new()
            .name("summary".to_string())
            .spawn(move || {
                let _ = tx.send(coordinator.summary(session.as_deref()));
            })
            .context("spawn summary thread")?;

        match rx.recv_timeout(grace) {
            Ok(Ok(status)) => {
                tracing::info!(status, session = ?self.session.id(), "summary");
                Ok(Some(status))
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "summary request failed");
                Ok(None)
            }
            Err(_) => {
                tracing::warn!(grace_ms = grace.as_millis() as u64, "summary response not observed");
                Ok(None)
            }
        }
    }
}

/// Fetch side of a slot: pulls one job per permit and hands the outcome over.
fn load_loop(
    slot: usize,
    client: &JobClient,
    ready: SyncSender<WorkerResult<FetchOutcome>>,
    permit: Receiver<()>,
    backoff: Option<Duration>,
) {
    while permit.recv().is_ok() {
        let outcome = client.fetch();
        let exhausted = matches!(outcome, Ok(FetchOutcome::Exhausted));
        let void = !exhausted && !matches!(outcome, Ok(FetchOutcome::Job(_)));
        if ready.send(outcome).is_err() || exhausted {
            break;
        }
        if void && let Some(delay) = backoff {
            thread::sleep(delay);
        }
    }
    tracing::debug!(slot, "loader finished");
}

/// Compute side of a slot. The next fetch is released as soon as a job is accepted, so network
/// latency overlaps this slot's compute phase.
fn compute_loop(
    slot: usize,
    mut queue: Box<dyn ComputeQueue>,
    runner: &JobRunner,
    ready: Receiver<WorkerResult<FetchOutcome>>,
    permit: SyncSender<()>,
    counters: &Counters,
) {
    let mut tracker = SlotTracker::new(slot);
    let _ = permit.send(());
    tracker.enter(SlotState::Fetching);

    while let Ok(outcome) = ready.recv() {
        match outcome {
            Ok(FetchOutcome::Exhausted) => break,
            Ok(FetchOutcome::Job(job)) => {
                let _ = permit.send(());
                match runner.run(queue.as_mut(), job, &mut tracker) {
                    Ok(JobOutcome::Submitted) => {
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                        counters.submitted.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(JobOutcome::BelowThreshold) => {
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                        counters.below_threshold.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        if !e.is_per_job() {
                            tracing::error!(slot, error = %e, "job failed");
                        } else {
                            tracing::warn!(slot, error = %e, "job failed");
                        }
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Ok(FetchOutcome::Unsupported(name)) => {
                tracing::warn!(slot, file = %name, "unsupported content");
                counters.void_jobs.fetch_add(1, Ordering::Relaxed);
                let _ = permit.send(());
            }
            Ok(FetchOutcome::NoContent) => {
                tracing::debug!(slot, "no content");
                counters.void_jobs.fetch_add(1, Ordering::Relaxed);
                let _ = permit.send(());
            }
            Err(e) => {
                tracing::warn!(slot, error = %e, "pull failed");
                counters.void_jobs.fetch_add(1, Ordering::Relaxed);
                let _ = permit.send(());
            }
        }
        tracker.enter(SlotState::Idle);
        tracker.enter(SlotState::Fetching);
    }

    tracker.enter(SlotState::Stopped);
    counters.slots_stopped.fetch_add(1, Ordering::Relaxed);
}
