//! Process orchestrator
//!
//! Owns every external process the pipeline spawns. Processes are keyed by a
//! session id; each one gets a monitor task that scans its stderr for progress,
//! enforces the wall-clock timeout, honours kill requests and reports the
//! outcome through exactly one [`ProcessObserver`] callback.

use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::metrics::memory_usage_percent;
use crate::progress::{parse_progress_line, DiagnosticTail, LineScanner, ProgressTracker};
use crate::task::{current_timestamp_ms, TranscodingProgress};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Diagnostic lines kept per session for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// How long to keep reading stderr after the process has exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Error type for process execution
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The configured number of processes is already running
    #[error("Concurrency limit reached: {active} of {max} processes active")]
    ConcurrencyLimit { active: usize, max: usize },

    /// System memory use is above the configured threshold
    #[error("Memory pressure: {used_percent:.1}% used, threshold is {threshold_percent:.1}%")]
    MemoryPressure {
        used_percent: f32,
        threshold_percent: f32,
    },

    /// The executable could not be started
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited unsuccessfully; carries the last diagnostic lines
    #[error("Process {}: {stderr}", describe_exit(.code))]
    Exit { code: Option<i32>, stderr: String },

    /// The wall-clock timeout elapsed and the process was killed
    #[error("Process timed out after {0:?}")]
    Timeout(Duration),

    /// The process was killed on request
    #[error("Process was killed")]
    Killed,

    #[error("Session already active: {0}")]
    DuplicateSession(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Failed to signal process: {0}")]
    Signal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

/// Receives the events of one process session.
///
/// `on_progress` may fire many times; exactly one of `on_complete` or
/// `on_error` fires when the process ends, after its session has left the
/// registry.
pub trait ProcessObserver: Send + Sync + 'static {
    fn on_progress(&self, session_id: &str, progress: &TranscodingProgress);
    fn on_error(&self, session_id: &str, error: ProcessError);
    fn on_complete(&self, session_id: &str);
}

/// One external process invocation.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Media duration used to turn `time=` markers into a percentage.
    pub duration_secs: Option<f64>,
    /// Overrides the orchestrator's default timeout.
    pub timeout: Option<Duration>,
    /// Deleted when the process does not exit successfully.
    pub temp_files: Vec<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            duration_secs: None,
            timeout: None,
            temp_files: Vec::new(),
        }
    }

    pub fn with_duration(mut self, duration_secs: Option<f64>) -> Self {
        self.duration_secs = duration_secs;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_temp_file(mut self, path: PathBuf) -> Self {
        self.temp_files.push(path);
        self
    }
}

/// Limits and timings for the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Maximum number of live processes
    pub max_processes: usize,
    /// Default wall-clock timeout; `None` disables it
    pub timeout: Option<Duration>,
    /// Time between SIGTERM and SIGKILL
    pub kill_grace: Duration,
    /// Spawns are refused above this system memory use; 100 or more disables the check
    pub memory_threshold_percent: f32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_processes: 3,
            timeout: Some(Duration::from_secs(7200)),
            kill_grace: Duration::from_secs(5),
            memory_threshold_percent: 90.0,
        }
    }
}

impl OrchestratorConfig {
    /// One process per task slot plus one for thumbnails and previews.
    pub fn from_config(cfg: &Config, plan: &ConcurrencyPlan) -> Self {
        Self {
            max_processes: plan.max_concurrent_tasks as usize + 1,
            timeout: (cfg.process.timeout_secs > 0)
                .then(|| Duration::from_secs(cfg.process.timeout_secs)),
            kill_grace: Duration::from_millis(cfg.process.kill_grace_ms),
            memory_threshold_percent: cfg.process.memory_threshold_percent,
        }
    }
}

/// Snapshot of a live process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub session_id: String,
    pub pid: Option<u32>,
    /// Unix timestamp in milliseconds
    pub started_at: i64,
    pub progress: Option<TranscodingProgress>,
    pub paused: bool,
}

struct ActiveProcess {
    pid: Option<u32>,
    started_at: i64,
    progress: Option<TranscodingProgress>,
    paused: bool,
    temp_files: Vec<PathBuf>,
    terminate_tx: mpsc::UnboundedSender<()>,
    exited: watch::Receiver<bool>,
}

type SessionMap = Arc<Mutex<HashMap<String, ActiveProcess>>>;

fn lock_sessions(sessions: &SessionMap) -> MutexGuard<'_, HashMap<String, ActiveProcess>> {
    sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Spawns, tracks and terminates external processes.
pub struct ProcessOrchestrator {
    config: OrchestratorConfig,
    sessions: SessionMap,
}

impl ProcessOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start `spec` under `session_id` and return immediately.
    ///
    /// Fails without spawning when memory use is above the threshold, the
    /// process limit is reached, or the session id is already live. Must be
    /// called from within a tokio runtime.
    pub fn execute(
        &self,
        spec: ProcessSpec,
        session_id: &str,
        observer: Arc<dyn ProcessObserver>,
    ) -> Result<String, ProcessError> {
        self.check_memory()?;

        let mut sessions = lock_sessions(&self.sessions);
        if sessions.contains_key(session_id) {
            return Err(ProcessError::DuplicateSession(session_id.to_string()));
        }
        if sessions.len() >= self.config.max_processes {
            return Err(ProcessError::ConcurrencyLimit {
                active: sessions.len(),
                max: self.config.max_processes,
            });
        }

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let pid = child.id();
        let stderr = child.stderr.take();
        let (terminate_tx, terminate_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(false);

        sessions.insert(
            session_id.to_string(),
            ActiveProcess {
                pid,
                started_at: current_timestamp_ms(),
                progress: None,
                paused: false,
                temp_files: spec.temp_files.clone(),
                terminate_tx,
                exited: exit_rx,
            },
        );
        drop(sessions);

        info!(
            session_id,
            pid = pid.unwrap_or_default(),
            program = %spec.program,
            "Spawned process"
        );

        let monitor = Monitor {
            session_id: session_id.to_string(),
            sessions: Arc::clone(&self.sessions),
            observer,
            timeout: spec.timeout.or(self.config.timeout),
            kill_grace: self.config.kill_grace,
            stream: StreamState {
                scanner: LineScanner::new(),
                tail: DiagnosticTail::new(STDERR_TAIL_LINES),
                tracker: ProgressTracker::new(spec.duration_secs),
            },
        };
        tokio::spawn(monitor.run(child, stderr, terminate_rx, exit_tx));

        Ok(session_id.to_string())
    }

    /// Run `spec` to completion.
    pub async fn execute_and_wait(
        &self,
        spec: ProcessSpec,
        session_id: &str,
    ) -> Result<(), ProcessError> {
        let (tx, rx) = oneshot::channel();
        let observer = Arc::new(OneshotObserver {
            tx: Mutex::new(Some(tx)),
        });
        self.execute(spec, session_id, observer)?;
        rx.await.unwrap_or(Err(ProcessError::Killed))
    }

    /// Terminate a session: SIGTERM, then SIGKILL after the grace window.
    ///
    /// Resolves once the process has exited and its callback has fired.
    /// Returns false for an unknown session.
    pub async fn kill(&self, session_id: &str) -> bool {
        let (terminate_tx, mut exited) = {
            let sessions = lock_sessions(&self.sessions);
            match sessions.get(session_id) {
                Some(process) => (process.terminate_tx.clone(), process.exited.clone()),
                None => return false,
            }
        };

        info!(session_id, "Killing process");
        let _ = terminate_tx.send(());
        let _ = exited.wait_for(|done| *done).await;
        true
    }

    /// Stop a session's process in place (SIGSTOP).
    pub fn suspend(&self, session_id: &str) -> Result<(), ProcessError> {
        self.set_paused(session_id, true)
    }

    /// Continue a suspended session (SIGCONT).
    pub fn resume(&self, session_id: &str) -> Result<(), ProcessError> {
        self.set_paused(session_id, false)
    }

    fn set_paused(&self, session_id: &str, paused: bool) -> Result<(), ProcessError> {
        let mut sessions = lock_sessions(&self.sessions);
        let process = sessions
            .get_mut(session_id)
            .ok_or_else(|| ProcessError::UnknownSession(session_id.to_string()))?;
        let pid = process
            .pid
            .ok_or_else(|| ProcessError::UnknownSession(session_id.to_string()))?;

        send_job_control(pid, paused)?;
        process.paused = paused;
        debug!(session_id, paused, "Changed process run state");
        Ok(())
    }

    pub fn active_processes(&self) -> Vec<ProcessInfo> {
        let sessions = lock_sessions(&self.sessions);
        let mut infos: Vec<ProcessInfo> = sessions
            .iter()
            .map(|(session_id, process)| ProcessInfo {
                session_id: session_id.clone(),
                pid: process.pid,
                started_at: process.started_at,
                progress: process.progress.clone(),
                paused: process.paused,
            })
            .collect();
        infos.sort_by_key(|info| info.started_at);
        infos
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        lock_sessions(&self.sessions).len()
    }

    /// Kill every live process and wait for all of them to exit.
    ///
    /// Temp files of killed sessions are removed by their monitors.
    pub async fn cleanup(&self) {
        let pending: Vec<(String, watch::Receiver<bool>)> = {
            let sessions = lock_sessions(&self.sessions);
            sessions
                .iter()
                .map(|(session_id, process)| {
                    let _ = process.terminate_tx.send(());
                    (session_id.clone(), process.exited.clone())
                })
                .collect()
        };

        if !pending.is_empty() {
            info!(count = pending.len(), "Terminating active processes");
        }
        for (session_id, mut exited) in pending {
            let _ = exited.wait_for(|done| *done).await;
            debug!(session_id, "Process exited during cleanup");
        }
    }

    fn check_memory(&self) -> Result<(), ProcessError> {
        let threshold = self.config.memory_threshold_percent;
        if threshold >= 100.0 {
            return Ok(());
        }
        let used = memory_usage_percent();
        if used > threshold {
            warn!(used_percent = used, threshold_percent = threshold, "Refusing to spawn under memory pressure");
            return Err(ProcessError::MemoryPressure {
                used_percent: used,
                threshold_percent: threshold,
            });
        }
        Ok(())
    }
}

#[cfg(unix)]
fn send_job_control(pid: u32, stop: bool) -> Result<(), ProcessError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = if stop { Signal::SIGSTOP } else { Signal::SIGCONT };
    kill(Pid::from_raw(pid as i32), signal).map_err(|e| ProcessError::Signal(e.to_string()))
}

#[cfg(not(unix))]
fn send_job_control(_pid: u32, _stop: bool) -> Result<(), ProcessError> {
    Err(ProcessError::Signal(
        "suspending processes is not supported on this platform".to_string(),
    ))
}

/// Graceful terminate, escalating to a hard kill after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let pid = Pid::from_raw(pid as i32);
            if let Err(e) = kill(pid, Signal::SIGTERM) {
                debug!(error = %e, "SIGTERM failed");
            }
            // A stopped process only acts on SIGTERM once continued.
            let _ = kill(pid, Signal::SIGCONT);
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill process");
    }
}

async fn remove_temp_files(session_id: &str, paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(session_id, path = %path.display(), "Removed temp file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(session_id, path = %path.display(), error = %e, "Failed to remove temp file"),
        }
    }
}

/// Reads the next stderr chunk; pends forever once the stream is gone.
async fn read_chunk(stderr: &mut Option<ChildStderr>, buf: &mut [u8]) -> Option<usize> {
    match stderr {
        Some(stream) => match stream.read(buf).await {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(n),
        },
        None => std::future::pending().await,
    }
}

struct StreamState {
    scanner: LineScanner,
    tail: DiagnosticTail,
    tracker: ProgressTracker,
}

enum Outcome {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut(Duration),
    Killed,
}

struct Monitor {
    session_id: String,
    sessions: SessionMap,
    observer: Arc<dyn ProcessObserver>,
    timeout: Option<Duration>,
    kill_grace: Duration,
    stream: StreamState,
}

impl Monitor {
    async fn run(
        mut self,
        mut child: Child,
        mut stderr: Option<ChildStderr>,
        mut terminate_rx: mpsc::UnboundedReceiver<()>,
        exit_tx: watch::Sender<bool>,
    ) {
        let mut buf = vec![0u8; 8192];
        let timeout = self.timeout;
        let deadline = async move {
            match timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                read = read_chunk(&mut stderr, &mut buf) => match read {
                    Some(n) => self.consume(&buf[..n]),
                    None => stderr = None,
                },
                status = child.wait() => {
                    break match status {
                        Ok(status) => Outcome::Exited(status),
                        Err(e) => Outcome::WaitFailed(e),
                    };
                }
                limit = &mut deadline => {
                    warn!(session_id = %self.session_id, ?limit, "Process timed out");
                    terminate(&mut child, self.kill_grace).await;
                    break Outcome::TimedOut(limit);
                }
                Some(()) = terminate_rx.recv() => {
                    terminate(&mut child, self.kill_grace).await;
                    break Outcome::Killed;
                }
            }
        };

        // Only a naturally exited process is known to have closed its stderr.
        if let (Outcome::Exited(_), Some(mut stream)) = (&outcome, stderr.take()) {
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, async {
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => self.consume(&buf[..n]),
                    }
                }
            })
            .await;
        }
        if let Some(line) = self.stream.scanner.finish() {
            self.handle_line(line);
        }

        let temp_files = lock_sessions(&self.sessions)
            .remove(&self.session_id)
            .map(|process| process.temp_files)
            .unwrap_or_default();

        let result = match outcome {
            Outcome::Exited(status) if status.success() => Ok(()),
            Outcome::Exited(status) => Err(ProcessError::Exit {
                code: status.code(),
                stderr: self.stream.tail.text(),
            }),
            Outcome::WaitFailed(e) => Err(ProcessError::Io(e)),
            Outcome::TimedOut(limit) => Err(ProcessError::Timeout(limit)),
            Outcome::Killed => Err(ProcessError::Killed),
        };

        match result {
            Ok(()) => {
                info!(session_id = %self.session_id, "Process completed");
                self.observer.on_complete(&self.session_id);
            }
            Err(e) => {
                remove_temp_files(&self.session_id, &temp_files).await;
                warn!(session_id = %self.session_id, error = %e, "Process failed");
                self.observer.on_error(&self.session_id, e);
            }
        }

        let _ = exit_tx.send(true);
    }

    fn consume(&mut self, chunk: &[u8]) {
        for line in self.stream.scanner.push(chunk) {
            self.handle_line(line);
        }
    }

    fn handle_line(&mut self, line: String) {
        let Some(raw) = parse_progress_line(&line) else {
            debug!(session_id = %self.session_id, line = %line, "stderr");
            self.stream.tail.push(line);
            return;
        };

        let progress = self.stream.tracker.update(&raw);
        if let Some(process) = lock_sessions(&self.sessions).get_mut(&self.session_id) {
            process.progress = Some(progress.clone());
        }
        self.observer.on_progress(&self.session_id, &progress);
    }
}

struct OneshotObserver {
    tx: Mutex<Option<oneshot::Sender<Result<(), ProcessError>>>>,
}

impl OneshotObserver {
    fn finish(&self, result: Result<(), ProcessError>) {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }
}

impl ProcessObserver for OneshotObserver {
    fn on_progress(&self, _session_id: &str, _progress: &TranscodingProgress) {}

    fn on_error(&self, _session_id: &str, error: ProcessError) {
        self.finish(Err(error));
    }

    fn on_complete(&self, _session_id: &str) {
        self.finish(Ok(()));
    }
}
