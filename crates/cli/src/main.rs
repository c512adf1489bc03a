//! CLI entry point for the transcoding orchestrator
//!
//! Loads configuration, runs startup checks, then either submits transcodes
//! and reports their lifecycle or runs one of the standalone tools.

use clap::{Parser, Subcommand};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use transcode_orchestrator::{
    derive_plan, run_startup_checks, Config, OrchestratorConfig, ProcessOrchestrator, Prober,
    Quality, TaskEvent, TaskOptions, TaskScheduler, ThumbnailGenerator, TranscodingConfig,
};

/// Transcoding orchestrator - priority-scheduled, supervised ffmpeg runs
#[derive(Parser, Debug)]
#[command(name = "transcodectl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Skip the transcoder/prober startup checks
    #[arg(long, global = true, default_value = "false")]
    skip_checks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transcode one or more files into a directory
    Transcode {
        /// Source files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Directory receiving the outputs
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Quality tier (low, medium, high, ultra)
        #[arg(short, long)]
        quality: Option<Quality>,

        /// Video encoder, e.g. libx264, libx265, libvpx-vp9, copy
        #[arg(long)]
        video_codec: Option<String>,

        /// Audio encoder
        #[arg(long)]
        audio_codec: Option<String>,

        /// Output container (mp4, webm, mkv, mov)
        #[arg(short, long)]
        format: Option<String>,

        #[arg(long)]
        max_width: Option<u32>,

        #[arg(long)]
        max_height: Option<u32>,

        /// Video bitrate cap in kbit/s
        #[arg(long)]
        video_bitrate: Option<u32>,

        /// Higher runs sooner
        #[arg(short, long)]
        priority: Option<i32>,

        #[arg(long)]
        max_retries: Option<u32>,

        /// Per-process timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Transcode even when the source is already playable
        #[arg(long)]
        force: bool,

        /// Print lifecycle events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Print the probed metadata of a file as JSON
    Probe { input: PathBuf },

    /// Extract evenly spaced JPEG thumbnails
    Thumbnails {
        input: PathBuf,

        #[arg(short, long)]
        output_dir: PathBuf,

        #[arg(short = 'n', long, default_value_t = 5)]
        count: u32,

        #[arg(short, long)]
        width: Option<u32>,
    },

    /// Render an animated GIF or WebP preview clip
    Preview {
        input: PathBuf,

        /// Output file; the extension selects GIF or WebP
        output: PathBuf,

        #[arg(long, default_value_t = 0.0)]
        start: f64,

        #[arg(long, default_value_t = 3.0)]
        duration: f64,

        #[arg(short, long)]
        width: Option<u32>,

        #[arg(long)]
        fps: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter_layer).with_writer(std::io::stderr).init();

    let cli = Cli::parse();

    let cfg = match load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    if cli.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&cfg).await {
        error!(error = %e, "Startup checks failed");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Command::Transcode {
            inputs,
            output_dir,
            quality,
            video_codec,
            audio_codec,
            format,
            max_width,
            max_height,
            video_bitrate,
            priority,
            max_retries,
            timeout,
            force,
            json,
        } => {
            let mut config = TranscodingConfig::from_defaults(&cfg.defaults);
            if let Some(quality) = quality {
                config.quality = quality;
            }
            if let Some(codec) = video_codec {
                config.video_codec = codec;
            }
            if let Some(codec) = audio_codec {
                config.audio_codec = codec;
            }
            if let Some(format) = format {
                config.format = format;
            }
            config.max_width = max_width;
            config.max_height = max_height;
            config.video_bitrate_kbps = video_bitrate;

            let options = TaskOptions {
                priority,
                max_retries,
                force_transcode: force,
                timeout: timeout.map(Duration::from_secs),
            };
            run_transcodes(&cfg, inputs, &output_dir, config, options, json).await
        }
        Command::Probe { input } => {
            let prober = Prober::new(cfg.process.ffprobe_path.clone());
            match prober.probe(&input).await {
                Ok(metadata) => match serde_json::to_string_pretty(&metadata) {
                    Ok(text) => {
                        println!("{}", text);
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize metadata");
                        ExitCode::FAILURE
                    }
                },
                Err(e) => {
                    error!(input = %input.display(), error = %e, "Probe failed");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Thumbnails {
            input,
            output_dir,
            count,
            width,
        } => match thumbnail_generator(&cfg)
            .generate_thumbnails(&input, &output_dir, count, width)
            .await
        {
            Ok(paths) => {
                for path in paths {
                    println!("{}", path.display());
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(input = %input.display(), error = %e, "Thumbnail extraction failed");
                ExitCode::FAILURE
            }
        },
        Command::Preview {
            input,
            output,
            start,
            duration,
            width,
            fps,
        } => match thumbnail_generator(&cfg)
            .generate_preview(&input, &output, start, duration, width, fps)
            .await
        {
            Ok(path) => {
                println!("{}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(input = %input.display(), error = %e, "Preview generation failed");
                ExitCode::FAILURE
            }
        },
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, transcode_orchestrator::config::ConfigError> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let mut cfg = Config::default();
            cfg.apply_env_overrides();
            Ok(cfg)
        }
    }
}

fn thumbnail_generator(cfg: &Config) -> ThumbnailGenerator {
    let plan = derive_plan(cfg);
    let orchestrator = Arc::new(ProcessOrchestrator::new(OrchestratorConfig::from_config(
        cfg, &plan,
    )));
    ThumbnailGenerator::new(
        orchestrator,
        Prober::new(cfg.process.ffprobe_path.clone()),
        cfg.process.ffmpeg_path.clone(),
    )
}

/// `<output_dir>/<input stem>.<format>` for each input.
///
/// Inputs sharing a stem get `-1`, `-2`, ... appended so no two tasks write
/// the same file.
fn output_paths(inputs: &[PathBuf], output_dir: &Path, format: &str) -> Vec<PathBuf> {
    let mut taken = HashSet::new();
    inputs
        .iter()
        .map(|input| {
            let stem = input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "output".to_string());
            let mut candidate = output_dir.join(format!("{}.{}", stem, format));
            let mut n = 1;
            while !taken.insert(candidate.clone()) {
                candidate = output_dir.join(format!("{}-{}.{}", stem, n, format));
                n += 1;
            }
            candidate
        })
        .collect()
}

async fn run_transcodes(
    cfg: &Config,
    inputs: Vec<PathBuf>,
    output_dir: &Path,
    config: TranscodingConfig,
    options: TaskOptions,
    json: bool,
) -> ExitCode {
    let (scheduler, mut events) = TaskScheduler::from_config(cfg);

    let mut names = HashMap::new();
    let mut failures = 0usize;
    let outputs = output_paths(&inputs, output_dir, &config.format);
    for (input, output) in inputs.into_iter().zip(outputs) {
        match scheduler
            .submit(input.clone(), output, config.clone(), options.clone())
            .await
        {
            Ok(task_id) => {
                names.insert(task_id, input);
            }
            Err(e) => {
                error!(input = %input.display(), error = %e, "Submission rejected");
                failures += 1;
            }
        }
    }

    let mut remaining = names.len();
    let mut interrupted = false;
    while remaining > 0 {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if event.is_terminal() {
                    remaining -= 1;
                    if !matches!(event, TaskEvent::TaskCompleted { .. }) {
                        failures += 1;
                    }
                }
                report(&event, &names, json);
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                info!("Interrupt received, shutting down");
                interrupted = true;
                scheduler.shutdown().await;
            }
        }
    }

    if interrupted {
        while let Ok(event) = events.try_recv() {
            report(&event, &names, json);
        }
    }

    let stats = scheduler.stats();
    info!(
        completed = stats.completed_tasks,
        failed = stats.failed_tasks,
        cancelled = stats.cancelled_tasks,
        retries = stats.retried_attempts,
        "All tasks settled"
    );

    if interrupted {
        ExitCode::from(130)
    } else if failures > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn report(event: &TaskEvent, names: &HashMap<String, PathBuf>, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Failed to serialize event"),
        }
        return;
    }

    let name = event
        .task_id()
        .and_then(|id| names.get(id))
        .map(|path| path.display().to_string())
        .unwrap_or_default();

    match event {
        TaskEvent::TaskQueued { .. } => println!("queued     {}", name),
        TaskEvent::TaskStarted { .. } => println!("started    {}", name),
        TaskEvent::Progress { progress, .. } => {
            let eta = progress
                .eta_secs
                .map(|eta| format!(", eta {:.0}s", eta))
                .unwrap_or_default();
            println!("progress   {} {:.1}%{}", name, progress.percent, eta);
        }
        TaskEvent::TaskRetry { attempt, .. } => println!("retry      {} (attempt {})", name, attempt),
        TaskEvent::TaskCompleted { result, .. } => println!(
            "completed  {} -> {} ({:.1}% smaller, quality {})",
            name,
            result.output_path.display(),
            result.compression_ratio * 100.0,
            result.quality_score
        ),
        TaskEvent::TaskFailed { error, .. } => println!("failed     {}: {}", name, error),
        TaskEvent::TaskCancelled { .. } => println!("cancelled  {}", name),
        TaskEvent::Shutdown => println!("shutdown"),
    }
}
