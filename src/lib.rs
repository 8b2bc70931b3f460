#![forbid(unsafe_code)]

pub mod codec;
pub mod compute;
pub mod container;
pub mod foundation;
pub mod job;
pub mod lifecycle;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod submit;

pub use compute::backend::{
    ComputeBackend, ComputeQueue, FrameRGBA, ResourceId, StatsReadback, TextureDesc,
    UniformParams, create_backend,
};
pub use container::{ContainerWriter, RecordMeta, ResourceRecord};
pub use foundation::config::{BackendKind, WorkerConfig};
pub use foundation::error::{WorkerError, WorkerResult};
pub use pool::{PoolReport, SlotState, WorkerPool};
pub use protocol::{Coordinator, FetchOutcome, PullResponse, PushRequest, http::HttpCoordinator};
pub use session::Session;
