//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Quality tier requested for an output file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
    Ultra,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
            Quality::Ultra => "ultra",
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            "ultra" => Ok(Quality::Ultra),
            other => Err(format!("unknown quality tier '{}'", other)),
        }
    }
}

/// Scheduler-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum tasks processing at once (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_tasks: u32,
    /// Retry budget for a task whose transcode fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Priority assigned when a submission does not name one
    #[serde(default)]
    pub default_priority: i32,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 0,
            max_retries: default_max_retries(),
            default_priority: 0,
        }
    }
}

/// External process configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    /// Transcoder executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Prober executable
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Wall-clock timeout for a single transcoder run
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL when killing a process
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// System memory use (percent) above which new processes are refused
    #[serde(default = "default_memory_threshold_percent")]
    pub memory_threshold_percent: f32,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_timeout_secs() -> u64 {
    7200
}

fn default_kill_grace_ms() -> u64 {
    5000
}

fn default_memory_threshold_percent() -> f32 {
    90.0
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            timeout_secs: default_timeout_secs(),
            kill_grace_ms: default_kill_grace_ms(),
            memory_threshold_percent: default_memory_threshold_percent(),
        }
    }
}

/// Defaults applied to submissions that leave output settings unspecified
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub quality: Quality,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub hardware_acceleration: bool,
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_format() -> String {
    "mp4".to_string()
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            quality: Quality::default(),
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
            format: default_format(),
            hardware_acceleration: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

/// Parse an env var into `target`, leaving it untouched when unset or invalid.
fn override_from_env<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = env::var(key) {
        if let Ok(parsed) = val.trim().parse::<T>() {
            *target = parsed;
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - TRANSCODE_MAX_CONCURRENT_TASKS -> scheduler.max_concurrent_tasks
    /// - TRANSCODE_MAX_RETRIES -> scheduler.max_retries
    /// - TRANSCODE_PROCESS_TIMEOUT_SECS -> process.timeout_secs
    /// - TRANSCODE_MEMORY_THRESHOLD_PERCENT -> process.memory_threshold_percent
    /// - TRANSCODE_FFMPEG_PATH / TRANSCODE_FFPROBE_PATH -> process.ffmpeg_path / ffprobe_path
    /// - TRANSCODE_DEFAULT_QUALITY -> defaults.quality
    /// - TRANSCODE_DEFAULT_VIDEO_CODEC / TRANSCODE_DEFAULT_AUDIO_CODEC -> defaults codec pair
    pub fn apply_env_overrides(&mut self) {
        override_from_env(
            "TRANSCODE_MAX_CONCURRENT_TASKS",
            &mut self.scheduler.max_concurrent_tasks,
        );
        override_from_env("TRANSCODE_MAX_RETRIES", &mut self.scheduler.max_retries);
        override_from_env(
            "TRANSCODE_PROCESS_TIMEOUT_SECS",
            &mut self.process.timeout_secs,
        );
        override_from_env(
            "TRANSCODE_MEMORY_THRESHOLD_PERCENT",
            &mut self.process.memory_threshold_percent,
        );
        override_from_env("TRANSCODE_FFMPEG_PATH", &mut self.process.ffmpeg_path);
        override_from_env("TRANSCODE_FFPROBE_PATH", &mut self.process.ffprobe_path);
        override_from_env("TRANSCODE_DEFAULT_QUALITY", &mut self.defaults.quality);
        override_from_env(
            "TRANSCODE_DEFAULT_VIDEO_CODEC",
            &mut self.defaults.video_codec,
        );
        override_from_env(
            "TRANSCODE_DEFAULT_AUDIO_CODEC",
            &mut self.defaults.audio_codec,
        );
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}
