//! Task model for the transcoding pipeline.
//!
//! A [`TranscodingTask`] is created by the scheduler on submission and owned by
//! it until the task reaches a terminal status. Progress and result values are
//! plain data that flow out through [`TaskEvent`]s.

use crate::config::{DefaultsConfig, Quality};
use crate::probe::VideoMetadata;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Desired output of a transcode. Never mutated once a task is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodingConfig {
    /// Output container (mp4, webm, mkv, mov).
    pub format: String,
    /// Encoder name passed to `-c:v` (e.g. "libx264", "libvpx-vp9", "copy").
    pub video_codec: String,
    /// Encoder name passed to `-c:a`.
    pub audio_codec: String,
    pub quality: Quality,
    /// Upper bound on output width; aspect ratio is preserved.
    pub max_width: Option<u32>,
    /// Upper bound on output height; aspect ratio is preserved.
    pub max_height: Option<u32>,
    /// Video bitrate cap in kbit/s.
    pub video_bitrate_kbps: Option<u32>,
    /// Audio bitrate in kbit/s.
    pub audio_bitrate_kbps: Option<u32>,
    /// Frame rate cap; sources at or below it keep their rate.
    pub max_frame_rate: Option<f64>,
    pub hardware_acceleration: bool,
    /// Passed through to the transcoder verbatim, before the output flags.
    pub extra_args: Vec<String>,
}

impl TranscodingConfig {
    /// Build a config from the configured defaults with no caps.
    pub fn from_defaults(defaults: &DefaultsConfig) -> Self {
        Self {
            format: defaults.format.clone(),
            video_codec: defaults.video_codec.clone(),
            audio_codec: defaults.audio_codec.clone(),
            quality: defaults.quality,
            max_width: None,
            max_height: None,
            video_bitrate_kbps: None,
            audio_bitrate_kbps: None,
            max_frame_rate: None,
            hardware_acceleration: defaults.hardware_acceleration,
            extra_args: Vec::new(),
        }
    }
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self::from_defaults(&DefaultsConfig::default())
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue.
    Pending,
    /// Occupying a worker slot.
    Processing,
    /// Process suspended; still occupies its worker slot.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed and cancelled tasks never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Processing or paused: the task holds a worker slot.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Processing | TaskStatus::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single progress record parsed from the transcoder's diagnostic stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscodingProgress {
    /// Frames written so far.
    pub frame: u64,
    /// Instantaneous encoding rate.
    pub fps: f32,
    pub bitrate_kbps: Option<f32>,
    /// Media position reached, in seconds.
    pub time_secs: f64,
    /// Encoding speed as a multiple of real time.
    pub speed: Option<f32>,
    /// Percent complete in [0, 100].
    pub percent: f32,
    /// Estimated seconds until completion.
    pub eta_secs: Option<f64>,
}

/// Terminal outcome of a task. Created exactly once per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodingResult {
    pub success: bool,
    pub output_path: PathBuf,
    pub original_size: u64,
    pub output_size: u64,
    /// `(original - output) / original`, 0 when the original is empty.
    pub compression_ratio: f64,
    pub processing_time_secs: f64,
    /// Synthetic 0-100 score of preserved quality.
    pub quality_score: u8,
    pub error: Option<String>,
}

impl TranscodingResult {
    /// Result for a task that ended without producing a valid output.
    pub fn failure(output_path: PathBuf, original_size: u64, processing_time_secs: f64, error: String) -> Self {
        Self {
            success: false,
            output_path,
            original_size,
            output_size: 0,
            compression_ratio: 0.0,
            processing_time_secs,
            quality_score: 0,
            error: Some(error),
        }
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Higher runs sooner; defaults to the configured priority.
    pub priority: Option<i32>,
    /// Defaults to the configured retry budget.
    pub max_retries: Option<u32>,
    /// Transcode even when the source is already playable.
    pub force_transcode: bool,
    /// Overrides the configured per-process timeout.
    pub timeout: Option<Duration>,
}

/// The central mutable entity of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodingTask {
    /// Unique task identifier (UUID).
    pub id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub config: TranscodingConfig,
    pub status: TaskStatus,
    /// Percent complete of the current attempt.
    pub progress: f32,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Unix timestamps in milliseconds.
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    /// Last captured error message.
    pub error: Option<String>,
    /// Probe of the source, taken once at submission.
    pub input_metadata: Option<VideoMetadata>,
    /// Probe of the produced file, taken during validation.
    pub output_metadata: Option<VideoMetadata>,
    pub latest_progress: Option<TranscodingProgress>,
    pub result: Option<TranscodingResult>,
    /// Process session of the current attempt.
    pub session_id: Option<String>,
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl TranscodingTask {
    /// Create a pending task with a fresh UUID.
    pub fn new(
        input_path: PathBuf,
        output_path: PathBuf,
        config: TranscodingConfig,
        priority: i32,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            input_path,
            output_path,
            config,
            status: TaskStatus::Pending,
            progress: 0.0,
            priority,
            retry_count: 0,
            max_retries,
            created_at: current_timestamp_ms(),
            started_at: None,
            ended_at: None,
            error: None,
            input_metadata: None,
            output_metadata: None,
            latest_progress: None,
            result: None,
            session_id: None,
            timeout: None,
        }
    }

    /// Session id for the current attempt; unique across retries.
    pub fn attempt_session_id(&self) -> String {
        format!("{}-{}", self.id, self.retry_count)
    }

    /// Where the transcoder writes before the output is validated.
    pub fn partial_output_path(&self) -> PathBuf {
        let mut part = self.output_path.as_os_str().to_owned();
        part.push(".part");
        PathBuf::from(part)
    }

    /// Apply a progress update, keeping progress non-decreasing and in [0, 100].
    pub fn record_progress(&mut self, progress: TranscodingProgress) {
        let clamped = progress.percent.clamp(0.0, 100.0);
        if clamped > self.progress {
            self.progress = clamped;
        }
        self.latest_progress = Some(progress);
    }

    /// Seconds between the start of the current attempt and `now_ms`.
    pub fn elapsed_secs(&self, now_ms: i64) -> f64 {
        self.started_at
            .map(|start| (now_ms - start).max(0) as f64 / 1000.0)
            .unwrap_or(0.0)
    }

    /// Size of the source as probed at submission.
    pub fn original_size(&self) -> u64 {
        self.input_metadata
            .as_ref()
            .map(|m| m.file_size)
            .unwrap_or(0)
    }
}

/// Lifecycle and progress notifications emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskQueued { task_id: String },
    TaskStarted { task_id: String },
    Progress { task_id: String, progress: TranscodingProgress },
    TaskCompleted { task_id: String, result: TranscodingResult },
    TaskFailed { task_id: String, error: String },
    TaskRetry { task_id: String, attempt: u32 },
    TaskCancelled { task_id: String },
    Shutdown,
}

impl TaskEvent {
    /// Task the event belongs to, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            TaskEvent::TaskQueued { task_id }
            | TaskEvent::TaskStarted { task_id }
            | TaskEvent::Progress { task_id, .. }
            | TaskEvent::TaskCompleted { task_id, .. }
            | TaskEvent::TaskFailed { task_id, .. }
            | TaskEvent::TaskRetry { task_id, .. }
            | TaskEvent::TaskCancelled { task_id } => Some(task_id),
            TaskEvent::Shutdown => None,
        }
    }

    /// Completed, failed or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::TaskCompleted { .. }
                | TaskEvent::TaskFailed { .. }
                | TaskEvent::TaskCancelled { .. }
        )
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
