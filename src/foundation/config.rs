use std::{fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::foundation::error::{WorkerError, WorkerResult};

/// Which compute backend executes the kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Cpu,
    Gpu,
}

/// Worker settings, loadable from JSON and overridable from the command line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Coordinator address. A bare `host:port` is treated as plain HTTP.
    pub server: String,
    /// Number of worker slots.
    pub concurrency: usize,
    /// Signal level a job must reach before its result is pushed.
    pub threshold: i32,
    /// Suffix the `Compute-File` header must carry; compared case-sensitively.
    pub expected_extension: String,
    pub backend: BackendKind,
    /// Preferred execution width hint used to shape thread groups.
    pub execution_width: u32,
    /// Build a full mip chain for payloads that only carry level 0.
    pub generate_mips: bool,
    /// Import images exactly six times taller than wide as cube strips.
    pub cube_strips: bool,
    pub max_texture_dimension: u32,
    /// Per-request timeout. Absent means requests may block indefinitely.
    pub request_timeout_ms: Option<u64>,
    /// Delay before pulling again after a void job. Absent means retry immediately.
    pub retry_backoff_ms: Option<u64>,
    /// Bound on waiting for in-flight pushes at shutdown. Absent means wait for all of them.
    pub push_drain_timeout_ms: Option<u64>,
    pub summary_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:56789".to_string(),
            concurrency: 8,
            threshold: 187,
            expected_extension: ".PNG".to_string(),
            backend: BackendKind::Cpu,
            execution_width: 32,
            generate_mips: false,
            cube_strips: true,
            max_texture_dimension: 16384,
            request_timeout_ms: None,
            retry_backoff_ms: None,
            push_drain_timeout_ms: None,
            summary_grace_ms: 10_000,
        }
    }
}

impl WorkerConfig {
    pub fn from_json_file(path: &Path) -> WorkerResult<Self> {
        let f = File::open(path).with_context(|| format!("open config '{}'", path.display()))?;
        let cfg: Self = serde_json::from_reader(BufReader::new(f))
            .map_err(|e| WorkerError::config(format!("parse '{}': {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> WorkerResult<()> {
        if self.server.trim().is_empty() {
            return Err(WorkerError::config("server address must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(WorkerError::config("concurrency must be >= 1"));
        }
        if self.execution_width == 0 {
            return Err(WorkerError::config("execution_width must be >= 1"));
        }
        if self.expected_extension.is_empty() {
            return Err(WorkerError::config("expected_extension must not be empty"));
        }
        if self.max_texture_dimension == 0 {
            return Err(WorkerError::config("max_texture_dimension must be >= 1"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_backoff(&self) -> Option<Duration> {
        self.retry_backoff_ms.map(Duration::from_millis)
    }

    pub fn push_drain_timeout(&self) -> Option<Duration> {
        self.push_drain_timeout_ms.map(Duration::from_millis)
    }

    pub fn summary_grace(&self) -> Duration {
        Duration::from_millis(self.summary_grace_ms)
    }
}
