//! Task scheduler
//!
//! Accepts submissions, keeps pending tasks in a priority queue and admits
//! them up to the concurrency bound. Admitted tasks run through the
//! [`ProcessOrchestrator`]; its callbacks drive validation, retries and the
//! lifecycle events sent to the owner of the scheduler.
//!
//! All task state lives behind one mutex. Events are sent while it is held,
//! so the event stream observes transitions in the order they happened.

use crate::command::{build_transcode_args, TranscodeParams};
use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::metrics::SchedulerStats;
use crate::probe::{check_disk_space, ProbeError, Prober};
use crate::process::{
    OrchestratorConfig, ProcessError, ProcessInfo, ProcessObserver, ProcessOrchestrator,
    ProcessSpec,
};
use crate::queue::TaskQueue;
use crate::task::{
    current_timestamp_ms, TaskEvent, TaskOptions, TaskStatus, TranscodingConfig,
    TranscodingProgress, TranscodingResult, TranscodingTask,
};
use crate::validate::{
    compute_compression_ratio, compute_quality_score, validate_output, ValidationError,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Error type for scheduler operations
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The input could not be probed or the output has no room
    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// The operation does not apply to the task's current status
    #[error("Task {task_id} is {status}")]
    InvalidState { task_id: String, status: TaskStatus },

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

/// Scheduler limits and tool locations
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Maximum number of tasks processing (or paused) at once
    pub max_concurrent_tasks: usize,
    /// Default retry budget per task
    pub max_retries: u32,
    /// Default priority for submissions without one
    pub default_priority: i32,
    /// Transcoder executable
    pub ffmpeg_path: String,
    /// Encoder threads per task; omitted from the command when `None`
    pub threads_per_task: Option<u32>,
    /// Refuse submissions whose output directory lacks free space
    pub check_disk_space: bool,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &Config, plan: &ConcurrencyPlan) -> Self {
        Self {
            max_concurrent_tasks: plan.max_concurrent_tasks as usize,
            max_retries: cfg.scheduler.max_retries,
            default_priority: cfg.scheduler.default_priority,
            ffmpeg_path: cfg.process.ffmpeg_path.clone(),
            threads_per_task: Some(plan.threads_per_task),
            check_disk_space: true,
        }
    }
}

#[derive(Default)]
struct State {
    queue: TaskQueue,
    tasks: HashMap<String, TranscodingTask>,
    /// Tasks holding a worker slot, including those being validated.
    processing: usize,
    stats: SchedulerStats,
    shutting_down: bool,
    cancel_requested: HashSet<String>,
}

struct Inner {
    settings: SchedulerSettings,
    prober: Prober,
    orchestrator: Arc<ProcessOrchestrator>,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<TaskEvent>,
    terminal: Notify,
}

/// Priority scheduler for transcoding tasks. Cheap to clone.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    /// Create a scheduler and the receiving end of its event stream.
    pub fn new(
        settings: SchedulerSettings,
        prober: Prober,
        orchestrator: Arc<ProcessOrchestrator>,
    ) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            settings,
            prober,
            orchestrator,
            state: Mutex::new(State::default()),
            events,
            terminal: Notify::new(),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Build the whole pipeline from configuration.
    pub fn from_config(cfg: &Config) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let plan = crate::concurrency::derive_plan(cfg);
        let orchestrator = Arc::new(ProcessOrchestrator::new(OrchestratorConfig::from_config(
            cfg, &plan,
        )));
        Self::new(
            SchedulerSettings::from_config(cfg, &plan),
            Prober::new(cfg.process.ffprobe_path.clone()),
            orchestrator,
        )
    }

    pub fn orchestrator(&self) -> &Arc<ProcessOrchestrator> {
        &self.inner.orchestrator
    }

    pub fn prober(&self) -> &Prober {
        &self.inner.prober
    }

    /// Submit a transcode and return the new task id.
    ///
    /// The input is probed before anything is queued; probe and disk-space
    /// failures are returned here and no task is created. A source that is
    /// already playable is copied to the output and completes without
    /// entering the queue unless `force_transcode` is set.
    pub async fn submit(
        &self,
        input_path: PathBuf,
        output_path: PathBuf,
        config: TranscodingConfig,
        options: TaskOptions,
    ) -> Result<String, SchedulerError> {
        if self.inner.lock().shutting_down {
            return Err(SchedulerError::ShuttingDown);
        }

        let metadata = self.inner.prober.probe(&input_path).await?;
        if is_same_file(&input_path, &output_path).await {
            return Err(ProbeError::InvalidInput {
                path: output_path,
                reason: "output path is the input".to_string(),
            }
            .into());
        }
        let output_dir = output_dir_of(&output_path);
        if self.inner.settings.check_disk_space {
            check_disk_space(&output_dir, metadata.file_size)?;
        }
        tokio::fs::create_dir_all(&output_dir).await?;

        let settings = &self.inner.settings;
        let priority = options.priority.unwrap_or(settings.default_priority);
        let max_retries = options.max_retries.unwrap_or(settings.max_retries);

        let mut task = TranscodingTask::new(input_path, output_path, config, priority, max_retries);
        task.timeout = options.timeout;
        let needs_transcoding = metadata.needs_transcoding;
        task.input_metadata = Some(metadata);
        let task_id = task.id.clone();

        if !needs_transcoding && !options.force_transcode {
            self.complete_without_transcoding(task).await?;
            return Ok(task_id);
        }

        {
            let mut state = self.inner.lock();
            if state.shutting_down {
                return Err(SchedulerError::ShuttingDown);
            }
            state.stats.total_tasks += 1;
            state.queue.push(task_id.clone(), priority);
            state.tasks.insert(task_id.clone(), task);
            info!(task_id = %task_id, priority, "Task queued");
            self.inner.emit(TaskEvent::TaskQueued {
                task_id: task_id.clone(),
            });
        }

        Inner::pump(&self.inner);
        Ok(task_id)
    }

    async fn complete_without_transcoding(
        &self,
        mut task: TranscodingTask,
    ) -> Result<(), SchedulerError> {
        info!(
            task_id = %task.id,
            input = %task.input_path.display(),
            "Source is already playable, copying"
        );
        task.status = TaskStatus::Processing;
        task.started_at = Some(current_timestamp_ms());

        let copied = tokio::fs::copy(&task.input_path, &task.output_path).await?;

        let now = current_timestamp_ms();
        let original_size = task.original_size();
        let result = TranscodingResult {
            success: true,
            output_path: task.output_path.clone(),
            original_size,
            output_size: copied,
            compression_ratio: compute_compression_ratio(original_size, copied),
            processing_time_secs: task.elapsed_secs(now),
            quality_score: 100,
            error: None,
        };
        task.status = TaskStatus::Completed;
        task.progress = 100.0;
        task.ended_at = Some(now);
        task.output_metadata = task.input_metadata.clone();
        task.result = Some(result.clone());

        let mut state = self.inner.lock();
        state.stats.total_tasks += 1;
        state
            .stats
            .record_completion(result.processing_time_secs, result.compression_ratio);
        let task_id = task.id.clone();
        state.tasks.insert(task_id.clone(), task);
        self.inner
            .emit(TaskEvent::TaskCompleted { task_id, result });
        self.inner.terminal.notify_waiters();
        Ok(())
    }

    /// Cancel a task.
    ///
    /// A queued task is cancelled at once. A running task has its process
    /// killed and this call waits until the task has settled. Returns whether
    /// the task ended up cancelled; a task that was already terminal, or that
    /// finished before the kill landed, yields `false`.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, SchedulerError> {
        let session_id = {
            let mut state = self.inner.lock();
            let State {
                queue,
                tasks,
                stats,
                cancel_requested,
                ..
            } = &mut *state;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))?;

            match task.status {
                TaskStatus::Pending => {
                    queue.remove(task_id);
                    mark_cancelled(task, current_timestamp_ms());
                    stats.cancelled_tasks += 1;
                    info!(task_id, "Cancelled queued task");
                    self.inner.emit(TaskEvent::TaskCancelled {
                        task_id: task_id.to_string(),
                    });
                    self.inner.terminal.notify_waiters();
                    return Ok(true);
                }
                TaskStatus::Processing | TaskStatus::Paused => {
                    cancel_requested.insert(task_id.to_string());
                    task.session_id.clone()
                }
                _ => return Ok(false),
            }
        };

        if let Some(session_id) = session_id {
            info!(task_id, session_id = %session_id, "Cancelling running task");
            self.inner.orchestrator.kill(&session_id).await;
        }
        self.wait_for(task_id).await;

        Ok(self
            .get_task(task_id)
            .is_some_and(|task| task.status == TaskStatus::Cancelled))
    }

    /// Suspend a processing task. It keeps its worker slot.
    pub fn pause(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.set_paused(task_id, true)
    }

    /// Continue a paused task.
    pub fn resume(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.set_paused(task_id, false)
    }

    fn set_paused(&self, task_id: &str, pause: bool) -> Result<(), SchedulerError> {
        let mut state = self.inner.lock();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))?;

        let (from, to) = if pause {
            (TaskStatus::Processing, TaskStatus::Paused)
        } else {
            (TaskStatus::Paused, TaskStatus::Processing)
        };
        let invalid = || SchedulerError::InvalidState {
            task_id: task_id.to_string(),
            status: task.status,
        };
        if task.status != from {
            return Err(invalid());
        }
        let session_id = task.session_id.clone().ok_or_else(invalid)?;

        if pause {
            self.inner.orchestrator.suspend(&session_id)?;
        } else {
            self.inner.orchestrator.resume(&session_id)?;
        }
        task.status = to;
        info!(task_id, status = %to, "Task run state changed");
        Ok(())
    }

    /// Wait until a task is terminal and return its result.
    ///
    /// Returns `None` for an unknown task.
    pub async fn wait_for(&self, task_id: &str) -> Option<TranscodingResult> {
        loop {
            let notified = self.inner.terminal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.lock();
                let task = state.tasks.get(task_id)?;
                if task.status.is_terminal() {
                    return task.result.clone();
                }
            }

            notified.await;
        }
    }

    /// Discard the queue, kill every running process and reset the worker count.
    ///
    /// Queued and running tasks end as cancelled. Further submissions fail.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;

            let now = current_timestamp_ms();
            let State {
                queue,
                tasks,
                stats,
                ..
            } = &mut *state;
            for task_id in queue.drain() {
                if let Some(task) = tasks.get_mut(&task_id) {
                    mark_cancelled(task, now);
                    stats.cancelled_tasks += 1;
                    self.inner.emit(TaskEvent::TaskCancelled { task_id });
                }
            }
            self.inner.terminal.notify_waiters();
        }

        info!("Shutting down scheduler");
        self.inner.orchestrator.cleanup().await;

        self.inner.lock().processing = 0;
        self.inner.emit(TaskEvent::Shutdown);
    }

    pub fn get_task(&self, task_id: &str) -> Option<TranscodingTask> {
        self.inner.lock().tasks.get(task_id).cloned()
    }

    /// Every known task, oldest first.
    pub fn list_tasks(&self) -> Vec<TranscodingTask> {
        let mut tasks: Vec<TranscodingTask> = self.inner.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn processing_count(&self) -> usize {
        self.inner.lock().processing
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.lock().stats.clone()
    }

    pub fn active_processes(&self) -> Vec<ProcessInfo> {
        self.inner.orchestrator.active_processes()
    }
}

fn output_dir_of(output_path: &Path) -> PathBuf {
    match output_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// True when `output` names the same file as the existing `input`.
///
/// An output that does not exist yet is resolved through its parent directory.
async fn is_same_file(input: &Path, output: &Path) -> bool {
    let Ok(input) = tokio::fs::canonicalize(input).await else {
        return false;
    };
    if let Ok(output) = tokio::fs::canonicalize(output).await {
        return input == output;
    }
    match (
        tokio::fs::canonicalize(output_dir_of(output)).await,
        output.file_name(),
    ) {
        (Ok(dir), Some(name)) => input == dir.join(name),
        _ => false,
    }
}

fn mark_cancelled(task: &mut TranscodingTask, now: i64) {
    task.status = TaskStatus::Cancelled;
    task.ended_at = Some(now);
    task.result = Some(TranscodingResult::failure(
        task.output_path.clone(),
        task.original_size(),
        task.elapsed_secs(now),
        "cancelled".to_string(),
    ));
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.events.send(event);
    }

    /// Admit queued tasks while worker slots are free.
    fn pump(inner: &Arc<Inner>) {
        loop {
            let (task_id, session_id, spec) = {
                let mut state = inner.lock();
                if state.shutting_down || state.processing >= inner.settings.max_concurrent_tasks {
                    return;
                }
                let Some(task_id) = state.queue.pop() else {
                    return;
                };
                let Some(task) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                if task.status != TaskStatus::Pending {
                    continue;
                }

                let session_id = task.attempt_session_id();
                task.status = TaskStatus::Processing;
                task.started_at = Some(current_timestamp_ms());
                task.ended_at = None;
                task.session_id = Some(session_id.clone());
                task.progress = 0.0;
                task.latest_progress = None;

                let params = TranscodeParams::for_task(task, inner.settings.threads_per_task);
                let spec = ProcessSpec::new(
                    inner.settings.ffmpeg_path.clone(),
                    build_transcode_args(&params),
                )
                .with_duration(task.input_metadata.as_ref().map(|m| m.duration_secs))
                .with_timeout(task.timeout)
                .with_temp_file(task.partial_output_path());
                let attempt = task.retry_count + 1;

                state.processing += 1;
                info!(
                    task_id = %task_id,
                    session_id = %session_id,
                    attempt,
                    "Task started"
                );
                debug!(task_id = %task_id, args = ?spec.args, "Transcoder arguments");
                inner.emit(TaskEvent::TaskStarted {
                    task_id: task_id.clone(),
                });
                (task_id, session_id, spec)
            };

            let observer = Arc::new(TaskObserver {
                inner: Arc::clone(inner),
                task_id: task_id.clone(),
            });
            if let Err(e) = inner.orchestrator.execute(spec, &session_id, observer) {
                warn!(task_id = %task_id, error = %e, "Failed to start transcoder");
                Inner::record_failure(inner, &task_id, &session_id, e.to_string());
            }
        }
    }

    /// Settle a failed attempt: cancel, retry or fail the task.
    fn record_failure(inner: &Arc<Inner>, task_id: &str, session_id: &str, error: String) {
        let mut state = inner.lock();
        let State {
            queue,
            tasks,
            stats,
            processing,
            shutting_down,
            cancel_requested,
        } = &mut *state;

        let Some(task) = tasks.get_mut(task_id) else {
            return;
        };
        if task.session_id.as_deref() != Some(session_id) || !task.status.is_active() {
            debug!(task_id, session_id, "Ignoring failure of a stale session");
            return;
        }
        *processing = processing.saturating_sub(1);
        let cancelled = cancel_requested.remove(task_id);
        let now = current_timestamp_ms();

        if cancelled || *shutting_down {
            mark_cancelled(task, now);
            stats.cancelled_tasks += 1;
            info!(task_id, "Task cancelled");
            inner.emit(TaskEvent::TaskCancelled {
                task_id: task_id.to_string(),
            });
            inner.terminal.notify_waiters();
        } else if task.retry_count < task.max_retries {
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            task.started_at = None;
            task.ended_at = None;
            task.error = None;
            task.session_id = None;
            task.progress = 0.0;
            task.latest_progress = None;
            queue.push(task_id.to_string(), task.priority);
            stats.retried_attempts += 1;
            warn!(
                task_id,
                attempt = task.retry_count,
                max_retries = task.max_retries,
                error = %error,
                "Task failed, retrying"
            );
            inner.emit(TaskEvent::TaskRetry {
                task_id: task_id.to_string(),
                attempt: task.retry_count,
            });
        } else {
            task.status = TaskStatus::Failed;
            task.ended_at = Some(now);
            task.error = Some(error.clone());
            task.result = Some(TranscodingResult::failure(
                task.output_path.clone(),
                task.original_size(),
                task.elapsed_secs(now),
                error.clone(),
            ));
            stats.failed_tasks += 1;
            warn!(task_id, retries = task.retry_count, error = %error, "Task failed");
            inner.emit(TaskEvent::TaskFailed {
                task_id: task_id.to_string(),
                error,
            });
            inner.terminal.notify_waiters();
        }
    }

    /// Validate the output of a successful process and complete the task.
    async fn finalize_success(inner: &Arc<Inner>, task_id: &str, session_id: &str) {
        let task = {
            let state = inner.lock();
            match state.tasks.get(task_id) {
                Some(task)
                    if task.session_id.as_deref() == Some(session_id)
                        && task.status.is_active() =>
                {
                    task.clone()
                }
                _ => return,
            }
        };

        let partial = task.partial_output_path();
        let validated = match validate_output(&inner.prober, &partial, &task.config.video_codec).await
        {
            Ok(metadata) => tokio::fs::rename(&partial, &task.output_path)
                .await
                .map(|()| metadata)
                .map_err(ValidationError::Io),
            Err(e) => Err(e),
        };

        let output_metadata = match validated {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(task_id, error = %e, "Output validation failed");
                if let Err(e) = tokio::fs::remove_file(&partial).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(task_id, error = %e, "Failed to remove partial output");
                    }
                }
                Inner::record_failure(inner, task_id, session_id, e.to_string());
                return;
            }
        };

        let mut state = inner.lock();
        let State {
            tasks,
            stats,
            processing,
            cancel_requested,
            ..
        } = &mut *state;
        let Some(task) = tasks.get_mut(task_id) else {
            return;
        };
        if task.session_id.as_deref() != Some(session_id) || !task.status.is_active() {
            return;
        }
        *processing = processing.saturating_sub(1);
        // The process finished before a pending kill could land.
        cancel_requested.remove(task_id);

        let now = current_timestamp_ms();
        let original_size = task.original_size();
        let output_size = output_metadata.file_size;
        let quality_score = task
            .input_metadata
            .as_ref()
            .map_or(100, |input| compute_quality_score(input, &output_metadata));
        let result = TranscodingResult {
            success: true,
            output_path: task.output_path.clone(),
            original_size,
            output_size,
            compression_ratio: compute_compression_ratio(original_size, output_size),
            processing_time_secs: task.elapsed_secs(now),
            quality_score,
            error: None,
        };

        task.status = TaskStatus::Completed;
        task.progress = 100.0;
        task.ended_at = Some(now);
        task.output_metadata = Some(output_metadata);
        task.result = Some(result.clone());
        stats.record_completion(result.processing_time_secs, result.compression_ratio);

        info!(
            task_id,
            output_size,
            compression_ratio = result.compression_ratio,
            quality_score,
            "Task completed"
        );
        inner.emit(TaskEvent::TaskCompleted {
            task_id: task_id.to_string(),
            result,
        });
        inner.terminal.notify_waiters();
    }
}

/// Routes orchestrator callbacks for one task back into the scheduler.
struct TaskObserver {
    inner: Arc<Inner>,
    task_id: String,
}

impl ProcessObserver for TaskObserver {
    fn on_progress(&self, session_id: &str, progress: &TranscodingProgress) {
        let mut state = self.inner.lock();
        let Some(task) = state.tasks.get_mut(&self.task_id) else {
            return;
        };
        if task.session_id.as_deref() != Some(session_id) || !task.status.is_active() {
            return;
        }

        task.record_progress(progress.clone());
        let mut progress = progress.clone();
        progress.percent = task.progress;
        self.inner.emit(TaskEvent::Progress {
            task_id: self.task_id.clone(),
            progress,
        });
    }

    fn on_error(&self, session_id: &str, error: ProcessError) {
        Inner::record_failure(&self.inner, &self.task_id, session_id, error.to_string());
        Inner::pump(&self.inner);
    }

    fn on_complete(&self, session_id: &str) {
        let inner = Arc::clone(&self.inner);
        let task_id = self.task_id.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            Inner::finalize_success(&inner, &task_id, &session_id).await;
            Inner::pump(&inner);
        });
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    const FAKE_FFPROBE: &str = r#"#!/bin/sh
for last; do :; done
cat "$last.json"
"#;

    // Writes the output named by its last argument plus a probe sidecar
    // describing the requested codec and size. Fails the first FAILS runs.
    const FAKE_FFMPEG: &str = r#"#!/bin/sh
out=""; size="1920x1080"; vcodec="libx264"; prev=""
for arg; do
  case "$prev" in
    -s) size="$arg" ;;
    -c:v) vcodec="$arg" ;;
  esac
  prev="$arg"; out="$arg"
done
counter="$(dirname "$0")/attempts"
n=$(cat "$counter" 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > "$counter"
if [ "$n" -le FAILS ]; then
  echo "simulated encoder failure $n" >&2
  exit 1
fi
sleep DELAY
printf 'frame=   50 fps=25.0 time=00:00:05.00 bitrate=1000.0kbits/s speed=2.0x\r' >&2
w=${size%x*}; h=${size#*x}
case "$vcodec" in
  libx264|h264*) codec=h264 ;;
  libx265|hevc*) codec=hevc ;;
  *) codec="$vcodec" ;;
esac
printf 'transcoded' > "$out"
cat > "$out.json" <<EOF
{"streams":[{"index":0,"codec_type":"video","codec_name":"$codec","profile":"Main","width":$w,"height":$h,"r_frame_rate":"30/1","bit_rate":"1000000"}],"format":{"duration":"10.0","bit_rate":"1000000"}}
EOF
"#;

    struct Fixture {
        dir: TempDir,
        scheduler: TaskScheduler,
        events: mpsc::UnboundedReceiver<TaskEvent>,
    }

    fn write_script(path: &Path, body: &str) {
        std::fs::write(path, body).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn fixture(max_concurrent_tasks: usize, max_retries: u32, fails: u32, delay: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let tools = dir.path().join("tools");
        std::fs::create_dir_all(&tools).unwrap();

        let ffprobe = tools.join("ffprobe");
        let ffmpeg = tools.join("ffmpeg");
        write_script(&ffprobe, FAKE_FFPROBE);
        write_script(
            &ffmpeg,
            &FAKE_FFMPEG
                .replace("FAILS", &fails.to_string())
                .replace("DELAY", delay),
        );

        let orchestrator = Arc::new(ProcessOrchestrator::new(OrchestratorConfig {
            max_processes: max_concurrent_tasks + 1,
            timeout: Some(Duration::from_secs(30)),
            kill_grace: Duration::from_millis(500),
            memory_threshold_percent: 100.0,
        }));
        let settings = SchedulerSettings {
            max_concurrent_tasks,
            max_retries,
            default_priority: 0,
            ffmpeg_path: ffmpeg.to_string_lossy().to_string(),
            threads_per_task: None,
            check_disk_space: false,
        };
        let (scheduler, events) = TaskScheduler::new(
            settings,
            Prober::new(ffprobe.to_string_lossy().to_string()),
            orchestrator,
        );

        Fixture {
            dir,
            scheduler,
            events,
        }
    }

    fn source_json(codec: &str, profile: &str) -> String {
        format!(
            r#"{{"streams":[{{"index":0,"codec_type":"video","codec_name":"{codec}","profile":"{profile}","width":1920,"height":1080,"r_frame_rate":"30/1","bit_rate":"5000000"}},{{"index":1,"codec_type":"audio","codec_name":"aac","channels":2,"sample_rate":"48000"}}],"format":{{"duration":"10.0","bit_rate":"5000000"}}}}"#
        )
    }

    impl Fixture {
        fn source(&self, name: &str, codec: &str, profile: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, format!("source-{name}")).unwrap();
            std::fs::write(
                self.dir.path().join(format!("{name}.json")),
                source_json(codec, profile),
            )
            .unwrap();
            path
        }

        fn output(&self, name: &str) -> PathBuf {
            self.dir.path().join("out").join(name)
        }

        async fn submit_hevc(&self, name: &str, priority: i32) -> String {
            let input = self.source(&format!("{name}.mkv"), "hevc", "Main");
            self.scheduler
                .submit(
                    input,
                    self.output(&format!("{name}.mp4")),
                    TranscodingConfig::default(),
                    TaskOptions {
                        priority: Some(priority),
                        ..TaskOptions::default()
                    },
                )
                .await
                .expect("submit")
        }

        async fn next_event(&mut self) -> TaskEvent {
            tokio::time::timeout(Duration::from_secs(15), self.events.recv())
                .await
                .expect("event in time")
                .expect("event channel open")
        }

        fn drain_events(&mut self) -> Vec<TaskEvent> {
            std::iter::from_fn(|| self.events.try_recv().ok()).collect()
        }
    }

    fn events_for<'a>(events: &'a [TaskEvent], task_id: &str) -> Vec<&'a TaskEvent> {
        events
            .iter()
            .filter(|event| event.task_id() == Some(task_id))
            .collect()
    }

    #[tokio::test]
    async fn test_playable_source_is_copied() {
        let mut fx = fixture(2, 3, 0, "0");
        let input = fx.source("main.mp4", "h264", "Main");
        let output = fx.output("main.mp4");

        let task_id = fx
            .scheduler
            .submit(
                input.clone(),
                output.clone(),
                TranscodingConfig::default(),
                TaskOptions::default(),
            )
            .await
            .expect("submit");

        let task = fx.scheduler.get_task(&task_id).expect("task stored");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(std::fs::read(&output).unwrap(), std::fs::read(&input).unwrap());

        let result = fx.scheduler.wait_for(&task_id).await.expect("result");
        assert!(result.success);
        assert_eq!(result.output_path, output);
        assert_eq!(result.quality_score, 100);

        let events = fx.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TaskEvent::TaskCompleted { .. }));
        assert_eq!(fx.scheduler.queue_len(), 0);
        assert_eq!(fx.scheduler.stats().completed_tasks, 1);
    }

    #[tokio::test]
    async fn test_output_naming_the_input_is_rejected() {
        let mut fx = fixture(2, 3, 0, "0");
        let input = fx.source("main.mp4", "h264", "Main");
        let before = std::fs::read(&input).unwrap();

        for output in [input.clone(), fx.dir.path().join(".").join("main.mp4")] {
            let result = fx
                .scheduler
                .submit(
                    input.clone(),
                    output,
                    TranscodingConfig::default(),
                    TaskOptions::default(),
                )
                .await;
            assert!(matches!(
                result,
                Err(SchedulerError::Probe(ProbeError::InvalidInput { .. }))
            ));
        }

        assert_eq!(std::fs::read(&input).unwrap(), before);
        assert!(fx.scheduler.list_tasks().is_empty());
        assert!(fx.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_hevc_is_transcoded_within_bounds() {
        let mut fx = fixture(2, 0, 0, "0");
        let input = fx.source("clip.mkv", "hevc", "Main");
        let output = fx.output("clip.mp4");
        let config = TranscodingConfig {
            max_width: Some(1280),
            max_height: Some(720),
            ..TranscodingConfig::default()
        };

        let task_id = fx
            .scheduler
            .submit(input, output.clone(), config, TaskOptions::default())
            .await
            .expect("submit");
        let result = fx.scheduler.wait_for(&task_id).await.expect("result");
        assert!(result.success, "task failed: {:?}", result.error);
        assert!(output.exists());

        let task = fx.scheduler.get_task(&task_id).unwrap();
        let produced = task.output_metadata.expect("output probed");
        assert_eq!(produced.codec, "h264");
        assert!(produced.width <= 1280 && produced.height <= 720);
        assert_eq!(produced.width % 2, 0);
        assert_eq!(produced.height % 2, 0);
        assert_eq!(task.progress, 100.0);

        let events = fx.drain_events();
        let ours = events_for(&events, &task_id);
        assert!(matches!(ours.first(), Some(TaskEvent::TaskQueued { .. })));
        assert!(matches!(ours.last(), Some(TaskEvent::TaskCompleted { .. })));
        assert!(ours.iter().any(|e| matches!(
            e,
            TaskEvent::Progress { progress, .. } if (progress.percent - 50.0).abs() < 1e-3
        )));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let mut fx = fixture(1, 2, 2, "0");
        let task_id = fx.submit_hevc("flaky", 0).await;

        let result = fx.scheduler.wait_for(&task_id).await.expect("result");
        assert!(result.success);

        let events = fx.drain_events();
        let ours = events_for(&events, &task_id);
        let retries = ours
            .iter()
            .filter(|e| matches!(e, TaskEvent::TaskRetry { .. }))
            .count();
        let completions = ours.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(retries, 2);
        assert_eq!(completions, 1);
        assert!(matches!(ours.last(), Some(TaskEvent::TaskCompleted { .. })));

        let task = fx.scheduler.get_task(&task_id).unwrap();
        assert_eq!(task.retry_count, 2);
        assert_eq!(fx.scheduler.stats().retried_attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_fails_task() {
        let mut fx = fixture(1, 1, 100, "0");
        let task_id = fx.submit_hevc("broken", 0).await;

        let result = fx.scheduler.wait_for(&task_id).await.expect("result");
        assert!(!result.success);

        let events = fx.drain_events();
        let ours = events_for(&events, &task_id);
        let retries = ours
            .iter()
            .filter(|e| matches!(e, TaskEvent::TaskRetry { .. }))
            .count();
        assert_eq!(retries, 1);
        match ours.last() {
            Some(TaskEvent::TaskFailed { error, .. }) => {
                assert!(error.contains("simulated encoder failure"));
            }
            other => panic!("expected failure event, got {other:?}"),
        }

        let task = fx.scheduler.get_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert!(!task.partial_output_path().exists());
        assert_eq!(fx.scheduler.stats().failed_tasks, 1);
        assert_eq!(fx.scheduler.processing_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_retried_then_fails() {
        let mut fx = fixture(1, 3, 0, "5");
        let input = fx.source("slow.mkv", "hevc", "Main");
        let task_id = fx
            .scheduler
            .submit(
                input,
                fx.output("slow.mp4"),
                TranscodingConfig::default(),
                TaskOptions {
                    timeout: Some(Duration::from_millis(200)),
                    max_retries: Some(1),
                    ..TaskOptions::default()
                },
            )
            .await
            .expect("submit");

        let result = fx.scheduler.wait_for(&task_id).await.expect("result");
        assert!(!result.success);

        let events = fx.drain_events();
        let ours = events_for(&events, &task_id);
        let retries = ours
            .iter()
            .filter(|e| matches!(e, TaskEvent::TaskRetry { .. }))
            .count();
        assert_eq!(retries, 1);
        match ours.last() {
            Some(TaskEvent::TaskFailed { error, .. }) => assert!(error.contains("timed out"), "{error}"),
            other => panic!("expected failure event, got {other:?}"),
        }

        let task = fx.scheduler.get_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!task.partial_output_path().exists());
        assert_eq!(fx.scheduler.processing_count(), 0);
    }

    #[tokio::test]
    async fn test_codec_mismatch_is_retried_and_partial_output_removed() {
        let mut fx = fixture(1, 1, 0, "0");
        // The encoder reports HEVC no matter what was requested.
        write_script(
            &fx.dir.path().join("tools").join("ffmpeg"),
            &FAKE_FFMPEG
                .replace("libx264|h264*) codec=h264 ;;", "libx264|h264*) codec=hevc ;;")
                .replace("FAILS", "0")
                .replace("DELAY", "0"),
        );
        let task_id = fx.submit_hevc("mislabelled", 0).await;

        let result = fx.scheduler.wait_for(&task_id).await.expect("result");
        assert!(!result.success);

        let events = fx.drain_events();
        let ours = events_for(&events, &task_id);
        let retries = ours
            .iter()
            .filter(|e| matches!(e, TaskEvent::TaskRetry { .. }))
            .count();
        assert_eq!(retries, 1);
        match ours.last() {
            Some(TaskEvent::TaskFailed { error, .. }) => {
                assert!(error.contains("Codec mismatch"), "{error}")
            }
            other => panic!("expected failure event, got {other:?}"),
        }

        let task = fx.scheduler.get_task(&task_id).unwrap();
        assert!(!task.partial_output_path().exists());
        assert!(!task.output_path.exists());
        assert_eq!(fx.scheduler.stats().failed_tasks, 1);
    }

    #[tokio::test]
    async fn test_priority_order_of_admission() {
        let mut fx = fixture(1, 0, 0, "0.3");
        let blocker = fx.submit_hevc("blocker", 0).await;
        let p5a = fx.submit_hevc("p5a", 5).await;
        let p9 = fx.submit_hevc("p9", 9).await;
        let p5b = fx.submit_hevc("p5b", 5).await;
        let p1 = fx.submit_hevc("p1", 1).await;

        for id in [&blocker, &p5a, &p9, &p5b, &p1] {
            assert!(fx.scheduler.wait_for(id).await.expect("result").success);
        }

        let started: Vec<String> = fx
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                TaskEvent::TaskStarted { task_id } => Some(task_id),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![blocker, p9, p5a, p5b, p1]);
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_respected() {
        let mut fx = fixture(2, 0, 0, "0.2");
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(fx.submit_hevc(&format!("bulk{i}"), 0).await);
        }
        for id in &ids {
            assert!(fx.scheduler.wait_for(id).await.expect("result").success);
        }

        let mut running = 0i32;
        let mut peak = 0i32;
        for event in fx.drain_events() {
            match event {
                TaskEvent::TaskStarted { .. } => running += 1,
                TaskEvent::TaskCompleted { .. }
                | TaskEvent::TaskFailed { .. }
                | TaskEvent::TaskCancelled { .. }
                | TaskEvent::TaskRetry { .. } => running -= 1,
                _ => {}
            }
            peak = peak.max(running);
            assert!(running <= 2, "more than two tasks processing");
        }
        assert_eq!(peak, 2);
        assert_eq!(fx.scheduler.stats().completed_tasks, 6);
        assert_eq!(fx.scheduler.processing_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_running_and_queued_tasks() {
        let mut fx = fixture(1, 3, 0, "10");
        let running = fx.submit_hevc("running", 0).await;
        let queued = fx.submit_hevc("queued", 0).await;

        loop {
            if let TaskEvent::TaskStarted { task_id } = fx.next_event().await {
                assert_eq!(task_id, running);
                break;
            }
        }

        assert!(fx.scheduler.cancel(&queued).await.unwrap());
        assert_eq!(fx.scheduler.queue_len(), 0);

        assert!(fx.scheduler.cancel(&running).await.unwrap());
        let task = fx.scheduler.get_task(&running).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(!task.partial_output_path().exists());
        assert_eq!(task.retry_count, 0);

        assert!(!fx.scheduler.cancel(&running).await.unwrap());
        assert!(matches!(
            fx.scheduler.cancel("missing").await,
            Err(SchedulerError::UnknownTask(_))
        ));
        assert_eq!(fx.scheduler.processing_count(), 0);
        assert_eq!(fx.scheduler.stats().cancelled_tasks, 2);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let mut fx = fixture(1, 0, 0, "0.5");
        let task_id = fx.submit_hevc("pausable", 0).await;
        loop {
            if matches!(fx.next_event().await, TaskEvent::TaskStarted { .. }) {
                break;
            }
        }

        fx.scheduler.pause(&task_id).expect("pause");
        assert_eq!(fx.scheduler.get_task(&task_id).unwrap().status, TaskStatus::Paused);
        assert!(matches!(
            fx.scheduler.pause(&task_id),
            Err(SchedulerError::InvalidState { .. })
        ));
        assert_eq!(fx.scheduler.processing_count(), 1);

        fx.scheduler.resume(&task_id).expect("resume");
        assert_eq!(
            fx.scheduler.get_task(&task_id).unwrap().status,
            TaskStatus::Processing
        );

        let result = fx.scheduler.wait_for(&task_id).await.expect("result");
        assert!(result.success);
        assert!(matches!(
            fx.scheduler.resume(&task_id),
            Err(SchedulerError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let mut fx = fixture(1, 3, 0, "10");
        let running = fx.submit_hevc("running", 0).await;
        let queued = fx.submit_hevc("queued", 0).await;
        loop {
            if matches!(fx.next_event().await, TaskEvent::TaskStarted { .. }) {
                break;
            }
        }

        fx.scheduler.shutdown().await;

        for id in [&running, &queued] {
            let task = fx.scheduler.get_task(id).unwrap();
            assert_eq!(task.status, TaskStatus::Cancelled);
        }
        assert_eq!(fx.scheduler.processing_count(), 0);
        assert_eq!(fx.scheduler.queue_len(), 0);
        assert!(fx.scheduler.active_processes().is_empty());

        let events = fx.drain_events();
        assert!(matches!(events.last(), Some(TaskEvent::Shutdown)));

        let input = fx.source("late.mkv", "hevc", "Main");
        let late = fx
            .scheduler
            .submit(input, fx.output("late.mp4"), TranscodingConfig::default(), TaskOptions::default())
            .await;
        assert!(matches!(late, Err(SchedulerError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_synchronously() {
        let fx = fixture(1, 0, 0, "0");
        let missing = fx.dir.path().join("missing.mkv");
        let result = fx
            .scheduler
            .submit(missing, fx.output("x.mp4"), TranscodingConfig::default(), TaskOptions::default())
            .await;

        assert!(matches!(
            result,
            Err(SchedulerError::Probe(ProbeError::InvalidInput { .. }))
        ));
        assert!(fx.scheduler.list_tasks().is_empty());
        assert_eq!(fx.scheduler.stats().total_tasks, 0);
    }
}
