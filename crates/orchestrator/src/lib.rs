//! Transcoding orchestrator
//!
//! Probes sources, schedules transcodes by priority, supervises the external
//! transcoder processes and validates what they produce.

pub mod command;
pub mod concurrency;
pub mod metrics;
pub mod probe;
pub mod process;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod startup;
pub mod task;
pub mod thumbnail;
pub mod validate;

pub use transcode_orchestrator_config as config;
pub use transcode_orchestrator_config::{Config, Quality};
pub use command::{build_transcode_args, calculate_output_resolution, CodecFamily, TranscodeParams};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use metrics::SchedulerStats;
pub use probe::{ProbeError, Prober, VideoMetadata};
pub use process::{
    OrchestratorConfig, ProcessError, ProcessInfo, ProcessObserver, ProcessOrchestrator,
    ProcessSpec,
};
pub use scheduler::{SchedulerError, SchedulerSettings, TaskScheduler};
pub use startup::{run_startup_checks, StartupError};
pub use task::{
    TaskEvent, TaskOptions, TaskStatus, TranscodingConfig, TranscodingProgress,
    TranscodingResult, TranscodingTask,
};
pub use thumbnail::{ThumbnailError, ThumbnailGenerator};
pub use validate::{compute_compression_ratio, compute_quality_score, validate_output, ValidationError};
