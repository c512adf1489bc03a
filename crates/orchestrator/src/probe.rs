//! Metadata prober.
//!
//! Runs the external prober with JSON output, turns the result into a
//! [`VideoMetadata`] snapshot, and decides whether a source needs transcoding
//! at all. Also hosts the best-effort free-space check done at submission.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Frame rate assumed when the prober reports nothing usable.
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Extra headroom required on top of 1.5x the input size.
const DISK_HEADROOM_BYTES: u64 = 1024 * 1024 * 1024;

/// H.264 profiles every mainstream player decodes.
const PLAYABLE_H264_PROFILES: &[&str] = &["baseline", "constrained baseline", "main"];

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Source is missing, unreadable or empty.
    #[error("Invalid input {path}: {reason}")]
    InvalidInput { path: PathBuf, reason: String },

    /// Prober exited non-zero or could not be started.
    #[error("ffprobe failed: {0}")]
    ToolFailed(String),

    /// Prober output could not be parsed.
    #[error("Failed to parse ffprobe output: {0}")]
    Parse(String),

    /// Not enough free space for the output.
    #[error("Insufficient disk space: {required} bytes required, {available} bytes available")]
    InsufficientSpace { required: u64, available: u64 },
}

/// An audio stream of a probed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    pub index: u32,
    pub codec: String,
    pub channels: u32,
    pub sample_rate: Option<u32>,
    pub bitrate: Option<u64>,
    pub language: Option<String>,
}

/// A subtitle stream of a probed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleStreamInfo {
    pub index: u32,
    pub codec: String,
    pub language: Option<String>,
}

/// Read-only snapshot of a media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    /// Codec of the first video stream (e.g. "h264", "hevc").
    pub codec: String,
    pub profile: Option<String>,
    pub width: u32,
    pub height: u32,
    pub duration_secs: f64,
    /// Bits per second; stream bitrate when known, container bitrate otherwise.
    pub bitrate: u64,
    pub frame_rate: f64,
    pub file_size: u64,
    pub needs_transcoding: bool,
    pub audio_streams: Vec<AudioStreamInfo>,
    pub subtitle_streams: Vec<SubtitleStreamInfo>,
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub index: Option<u32>,
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub profile: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub r_frame_rate: Option<String>,
        pub bit_rate: Option<String>,
        pub sample_rate: Option<String>,
        pub channels: Option<u32>,
        pub duration: Option<String>,
        pub tags: Option<HashMap<String, String>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
        pub size: Option<String>,
    }
}

/// Invokes the external prober.
#[derive(Debug, Clone)]
pub struct Prober {
    ffprobe_path: String,
}

impl Prober {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }

    /// Probe a media file.
    ///
    /// Fails with [`ProbeError::InvalidInput`] when the file is missing,
    /// unreadable or empty, and with [`ProbeError::ToolFailed`] /
    /// [`ProbeError::Parse`] when the prober misbehaves.
    pub async fn probe(&self, path: &Path) -> Result<VideoMetadata, ProbeError> {
        let file_size = check_input_file(path).await?;

        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| {
                ProbeError::ToolFailed(format!("could not run {}: {}", self.ffprobe_path, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::ToolFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let metadata = parse_ffprobe_output(&stdout, file_size)?;
        debug!(
            path = %path.display(),
            codec = %metadata.codec,
            width = metadata.width,
            height = metadata.height,
            needs_transcoding = metadata.needs_transcoding,
            "probed media file"
        );
        Ok(metadata)
    }
}

/// Verify the source exists, is a regular file and is not empty; returns its size.
async fn check_input_file(path: &Path) -> Result<u64, ProbeError> {
    let invalid = |reason: String| ProbeError::InvalidInput {
        path: path.to_path_buf(),
        reason,
    };

    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    if !meta.is_file() {
        return Err(invalid("not a regular file".to_string()));
    }
    if meta.len() == 0 {
        return Err(invalid("file is empty".to_string()));
    }
    // Opening confirms read permission; metadata alone does not.
    tokio::fs::File::open(path)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    Ok(meta.len())
}

/// Parses ffprobe JSON output into a [`VideoMetadata`].
///
/// `file_size` is used when the container does not report a size.
pub fn parse_ffprobe_output(json_str: &str, file_size: u64) -> Result<VideoMetadata, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::Parse("Missing format information in ffprobe output".to_string())
    })?;

    let mut video: Option<&ffprobe_json::Stream> = None;
    let mut audio_streams = Vec::new();
    let mut subtitle_streams = Vec::new();

    for (position, stream) in streams.iter().enumerate() {
        let index = stream.index.unwrap_or(position as u32);
        let codec = stream.codec_name.clone().unwrap_or_default();
        let language = stream
            .tags
            .as_ref()
            .and_then(|tags| tags.get("language").cloned());

        match stream.codec_type.as_deref().unwrap_or("") {
            "video" => {
                if video.is_none() {
                    video = Some(stream);
                }
            }
            "audio" => audio_streams.push(AudioStreamInfo {
                index,
                codec,
                channels: stream.channels.unwrap_or(0),
                sample_rate: stream.sample_rate.as_deref().and_then(|s| s.parse().ok()),
                bitrate: parse_u64(stream.bit_rate.as_deref()),
                language,
            }),
            "subtitle" => subtitle_streams.push(SubtitleStreamInfo {
                index,
                codec,
                language,
            }),
            _ => {}
        }
    }

    let video = video.ok_or_else(|| ProbeError::Parse("no video stream found".to_string()))?;
    let codec = video.codec_name.clone().unwrap_or_default().to_lowercase();
    let profile = video.profile.clone();

    let duration_secs = parse_f64(format.duration.as_deref())
        .or_else(|| parse_f64(video.duration.as_deref()))
        .unwrap_or(0.0);
    let bitrate = parse_u64(video.bit_rate.as_deref())
        .or_else(|| parse_u64(format.bit_rate.as_deref()))
        .unwrap_or(0);
    let size = parse_u64(format.size.as_deref()).unwrap_or(file_size);

    let needs_transcoding = needs_transcoding(&codec, profile.as_deref());

    Ok(VideoMetadata {
        codec,
        profile,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        duration_secs,
        bitrate,
        frame_rate: parse_frame_rate(video.r_frame_rate.as_deref().unwrap_or("")),
        file_size: size,
        needs_transcoding,
        audio_streams,
        subtitle_streams,
    })
}

fn parse_u64(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().parse::<u64>().ok())
}

fn parse_f64(value: Option<&str>) -> Option<f64> {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Parse a frame rate given as `"N/D"` or a plain number.
///
/// Falls back to [`DEFAULT_FRAME_RATE`] when the value is unparsable,
/// non-positive, or has a zero denominator.
pub fn parse_frame_rate(value: &str) -> f64 {
    let value = value.trim();
    let parsed = match value.split_once('/') {
        Some((num, den)) => match (num.trim().parse::<f64>(), den.trim().parse::<f64>()) {
            (Ok(n), Ok(d)) if d != 0.0 => Some(n / d),
            _ => None,
        },
        None => value.parse::<f64>().ok(),
    };

    parsed
        .filter(|fps| fps.is_finite() && *fps > 0.0)
        .unwrap_or(DEFAULT_FRAME_RATE)
}

/// Decide whether a source must be transcoded for broad playback.
///
/// True for HEVC, for H.264 outside the Baseline / Constrained Baseline /
/// Main profiles, and for any codec outside the known-safe set.
pub fn needs_transcoding(codec: &str, profile: Option<&str>) -> bool {
    match codec.trim().to_lowercase().as_str() {
        "h264" | "avc" | "avc1" => match profile {
            Some(p) => !PLAYABLE_H264_PROFILES.contains(&p.trim().to_lowercase().as_str()),
            None => false,
        },
        _ => true,
    }
}

/// Space required for an output derived from an input of `input_size` bytes.
pub fn required_space(input_size: u64) -> u64 {
    input_size
        .saturating_add(input_size / 2)
        .saturating_add(DISK_HEADROOM_BYTES)
}

/// Compare available space against the requirement for `input_size`.
pub fn ensure_space(available: u64, input_size: u64) -> Result<(), ProbeError> {
    let required = required_space(input_size);
    if available < required {
        return Err(ProbeError::InsufficientSpace {
            required,
            available,
        });
    }
    Ok(())
}

/// Check that `output_dir` has room for an output of an `input_size` source.
///
/// Best-effort: when free space cannot be determined a warning is logged and
/// the check passes.
pub fn check_disk_space(output_dir: &Path, input_size: u64) -> Result<(), ProbeError> {
    match available_space(output_dir) {
        Some(available) => ensure_space(available, input_size),
        None => {
            warn!(
                dir = %output_dir.display(),
                "could not determine free disk space, skipping check"
            );
            Ok(())
        }
    }
}

/// Free bytes on the filesystem holding `dir` (or its nearest existing ancestor).
fn available_space(dir: &Path) -> Option<u64> {
    use sysinfo::Disks;

    let existing = dir.ancestors().find(|p| p.exists())?;
    let resolved = existing.canonicalize().ok()?;

    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| resolved.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
