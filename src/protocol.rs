//! Pull/push protocol spoken with the coordinator.

pub mod http;

use std::{fmt, sync::Arc};

use crate::{foundation::error::WorkerResult, session::Session};

pub const GROUP_HEADER: &str = "Compute-Group";
pub const FILE_HEADER: &str = "Compute-File";
pub const RATIO_HEADER: &str = "Compute-Ratio";

pub const STATUS_OK: u16 = 200;
pub const STATUS_GONE: u16 = 410;

/// Raw pull response, as far as the worker cares about it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PullResponse {
    pub status: u16,
    pub group: Option<String>,
    pub file: Option<String>,
    pub body: Vec<u8>,
}

/// Container bytes handed out for one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobPayload {
    pub file: String,
    pub bytes: Vec<u8>,
}

/// What one pull attempt yielded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    Job(JobPayload),
    /// The coordinator has no more work for this worker.
    Exhausted,
    /// The coordinator handed out a file this worker cannot process.
    Unsupported(String),
    NoContent,
}

/// `matches/total` as carried in the ratio header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ratio {
    pub matches: i64,
    pub total: u64,
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.matches, self.total)
    }
}

/// Result upload for one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushRequest {
    pub path: String,
    pub session: Option<String>,
    pub ratio: Ratio,
    /// Encoded picture bytes.
    pub body: Vec<u8>,
}

/// Transport to the coordinating server.
///
/// Implementations block the calling thread for the whole round trip.
pub trait Coordinator: Send + Sync {
    fn pull(&self, session: Option<&str>) -> WorkerResult<PullResponse>;

    /// Upload a result. Returns the response status.
    fn push(&self, req: &PushRequest) -> WorkerResult<u16>;

    /// Final summary request, issued once at shutdown. Returns the response status.
    fn summary(&self, session: Option<&str>) -> WorkerResult<u16>;
}

/// Map a pull response to its outcome. Session capture happens separately.
pub fn interpret_pull(resp: PullResponse, extension: &str) -> FetchOutcome {
    match resp.status {
        STATUS_GONE => FetchOutcome::Exhausted,
        STATUS_OK => match resp.file {
            Some(name) if name.ends_with(extension) => FetchOutcome::Job(JobPayload {
                file: name,
                bytes: resp.body,
            }),
            Some(name) => FetchOutcome::Unsupported(name),
            None => FetchOutcome::NoContent,
        },
        _ => FetchOutcome::NoContent,
    }
}

/// Pulls jobs on behalf of one slot and records the session id the first time it is seen.
#[derive(Clone)]
pub struct JobClient {
    coordinator: Arc<dyn Coordinator>,
    session: Arc<Session>,
    extension: String,
}

impl JobClient {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        session: Arc<Session>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            session,
            extension: extension.into(),
        }
    }

    pub fn fetch(&self) -> WorkerResult<FetchOutcome> {
        let resp = self.coordinator.pull(self.session.id().as_deref())?;
        if let Some(group) = resp.group.as_deref()
            && self.session.record(group)
        {
            tracing::info!(session = group, "joined compute group");
        }
        Ok(interpret_pull(resp, &self.extension))
    }
}
