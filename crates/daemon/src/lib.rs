//! hwtranscoder
//!
//! Hardware-aware ffmpeg transcoding: capability detection, preset resolution,
//! command construction, process supervision and a bounded job scheduler.

pub mod capabilities;
pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod formats;
pub mod jobs;
pub mod metrics;
pub mod preset;
pub mod probe;
pub mod scheduler;
pub mod server;
pub mod startup;
pub mod store;

pub use hwtranscoder_config as config;
pub use hwtranscoder_config::Config;
pub use capabilities::{detect, Capabilities, CapabilitiesError, HwAccel, SharedCapabilities};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError};
pub use encode::{
    build, build_with_program, EncodeCommand, ProcessState, ProcessSupervisor, ProgressEvent,
    ProgressStream, SupervisorError, SupervisorOptions,
};
pub use formats::{AudioCodec, Codec, Container, Scale};
pub use jobs::{Job, JobStatus};
pub use metrics::{collect_system_metrics, JobMetrics, MetricsSnapshot, SystemMetrics};
pub use preset::{EncodeOptions, EncodeSpec, PresetCollection, PresetError, Quality, SpecError};
pub use scheduler::{
    CancelOutcome, JobEvent, JobView, PresetRef, Scheduler, SchedulerError, SchedulerOptions,
    SubmitRequest,
};
pub use server::{create_router, run_server, AppState, ServerError};
pub use startup::{run_startup_checks, StartupError};
pub use store::{JobStore, JsonDirJobStore, MemoryJobStore, StoreError};
