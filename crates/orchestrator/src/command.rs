//! Transcoder command builder.
//!
//! Pure translation of a [`TranscodingConfig`] plus the probed source metadata
//! into the argument list handed to the external transcoder. No I/O happens
//! here.

use crate::config::Quality;
use crate::probe::VideoMetadata;
use crate::task::{TranscodingConfig, TranscodingTask};
use std::path::PathBuf;

/// Codec family an encoder or decoder name belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecFamily {
    H264,
    Hevc,
    Vp9,
    Av1,
    Other(String),
}

impl CodecFamily {
    /// Classify an encoder name (`libx264`, `h264_nvenc`) or a probed codec (`h264`).
    pub fn of(name: &str) -> Self {
        let name = name.trim().to_lowercase();
        match name.as_str() {
            "h264" | "avc" | "avc1" | "libx264" | "libopenh264" => CodecFamily::H264,
            "hevc" | "h265" | "libx265" => CodecFamily::Hevc,
            "vp9" | "libvpx-vp9" => CodecFamily::Vp9,
            "av1" | "libaom-av1" | "libsvtav1" | "librav1e" | "libdav1d" => CodecFamily::Av1,
            _ if name.starts_with("h264_") => CodecFamily::H264,
            _ if name.starts_with("hevc_") => CodecFamily::Hevc,
            _ if name.starts_with("vp9_") => CodecFamily::Vp9,
            _ if name.starts_with("av1_") => CodecFamily::Av1,
            _ => CodecFamily::Other(name),
        }
    }
}

/// Substrings that mark a hardware encoder, decoder or acceleration API.
pub const HARDWARE_MARKERS: &[&str] = &[
    "nvenc",
    "qsv",
    "vaapi",
    "videotoolbox",
    "amf",
    "cuda",
    "v4l2m2m",
];

/// True when `codec` names a hardware encoder.
pub fn is_hardware_encoder(codec: &str) -> bool {
    let lower = codec.to_lowercase();
    HARDWARE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Preset and CRF for a quality tier (x264/x265 scale).
pub fn quality_params(quality: Quality) -> (&'static str, u8) {
    match quality {
        Quality::Low => ("ultrafast", 28),
        Quality::Medium => ("medium", 23),
        Quality::High => ("slow", 18),
        Quality::Ultra => ("veryslow", 15),
    }
}

/// CRF for VP9 / AV1 encoders, which use a 0-63 scale.
pub fn constant_quality_crf(quality: Quality) -> u8 {
    match quality {
        Quality::Low => 40,
        Quality::Medium => 33,
        Quality::High => 28,
        Quality::Ultra => 24,
    }
}

/// Fit `width`x`height` inside the optional bounds.
///
/// The result never exceeds either bound, keeps the source aspect ratio up to
/// rounding, is never larger than the source, and has both dimensions rounded
/// down to an even number (minimum 2). Bounds below 2 cannot be met by an even
/// dimension and are ignored. A zero-sized source yields `(0, 0)`.
pub fn calculate_output_resolution(
    width: u32,
    height: u32,
    max_width: Option<u32>,
    max_height: Option<u32>,
) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (0, 0);
    }

    // Scale factor kept as an exact fraction num/den, starting at 1.
    let (mut num, mut den) = (1u64, 1u64);
    for (bound, dimension) in [(max_width, width), (max_height, height)] {
        if let Some(bound) = bound.filter(|&bound| bound >= 2) {
            if (bound as u64) * den < num * dimension as u64 {
                num = bound as u64;
                den = dimension as u64;
            }
        }
    }

    let fit = |dimension: u32| -> u32 {
        let scaled = (dimension as u64 * num / den) as u32;
        (scaled - scaled % 2).max(2)
    };

    (fit(width), fit(height))
}

/// Inputs for building one transcoder invocation.
#[derive(Debug, Clone)]
pub struct TranscodeParams {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub config: TranscodingConfig,
    /// Probed source; enables resolution fitting and frame-rate capping.
    pub source: Option<VideoMetadata>,
    /// Encoder threads; omitted when `None`.
    pub threads: Option<u32>,
}

impl TranscodeParams {
    /// Parameters for the current attempt of `task`, writing to its partial output path.
    pub fn for_task(task: &TranscodingTask, threads: Option<u32>) -> Self {
        Self {
            input_path: task.input_path.clone(),
            output_path: task.partial_output_path(),
            config: task.config.clone(),
            source: task.input_metadata.clone(),
            threads,
        }
    }
}

/// Muxer name passed to `-f` for a container extension.
fn muxer_name(format: &str) -> String {
    match format.to_lowercase().as_str() {
        "mkv" | "matroska" => "matroska".to_string(),
        "m4v" => "mp4".to_string(),
        other => other.to_string(),
    }
}

/// Build the full transcoder argument list.
///
/// Order: global flags, optional hardware decode hint, input, codecs,
/// resolution, rate caps, quality pair, threads, container flags, passthrough
/// arguments, muxer, overwrite flag, output path.
pub fn build_transcode_args(params: &TranscodeParams) -> Vec<String> {
    let cfg = &params.config;
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into()];

    if cfg.hardware_acceleration {
        args.extend(["-hwaccel".into(), "auto".into()]);
    }

    args.push("-i".into());
    args.push(params.input_path.to_string_lossy().into_owned());

    args.extend(["-c:v".into(), cfg.video_codec.clone()]);
    args.extend(["-c:a".into(), cfg.audio_codec.clone()]);

    let copy_video = cfg.video_codec.eq_ignore_ascii_case("copy");
    let family = CodecFamily::of(&cfg.video_codec);
    let hardware = is_hardware_encoder(&cfg.video_codec);

    if !copy_video {
        push_resolution(&mut args, params);
        push_rate_caps(&mut args, params, hardware);
        push_quality(&mut args, cfg.quality, &family, hardware);
    }

    if let Some(kbps) = cfg.audio_bitrate_kbps {
        if !cfg.audio_codec.eq_ignore_ascii_case("copy") {
            args.extend(["-b:a".into(), format!("{}k", kbps)]);
        }
    }

    if let Some(threads) = params.threads.filter(|t| *t > 0) {
        args.extend(["-threads".into(), threads.to_string()]);
    }

    push_format_flags(&mut args, cfg, &family, copy_video);

    args.extend(cfg.extra_args.iter().cloned());

    args.extend(["-f".into(), muxer_name(&cfg.format)]);
    args.push("-y".into());
    args.push(params.output_path.to_string_lossy().into_owned());

    args
}

fn push_resolution(args: &mut Vec<String>, params: &TranscodeParams) {
    let Some(source) = params.source.as_ref() else {
        return;
    };
    let (width, height) = calculate_output_resolution(
        source.width,
        source.height,
        params.config.max_width,
        params.config.max_height,
    );
    if width == 0 || height == 0 {
        return;
    }
    if (width, height) != (source.width, source.height) {
        args.extend(["-s".into(), format!("{}x{}", width, height)]);
    }
}

fn push_rate_caps(args: &mut Vec<String>, params: &TranscodeParams, hardware: bool) {
    let cfg = &params.config;

    if let Some(kbps) = cfg.video_bitrate_kbps {
        if hardware {
            args.extend(["-b:v".into(), format!("{}k", kbps)]);
        } else {
            // Capped CRF: quality target with a ceiling.
            args.extend(["-maxrate".into(), format!("{}k", kbps)]);
            args.extend(["-bufsize".into(), format!("{}k", kbps.saturating_mul(2))]);
        }
    }

    if let Some(cap) = cfg.max_frame_rate.filter(|r| r.is_finite() && *r > 0.0) {
        let source_rate = params.source.as_ref().map(|s| s.frame_rate);
        if source_rate.map_or(true, |rate| rate > cap) {
            args.extend(["-r".into(), format_rate(cap)]);
        }
    }
}

fn format_rate(rate: f64) -> String {
    if rate.fract() == 0.0 {
        format!("{}", rate as u64)
    } else {
        format!("{:.3}", rate)
    }
}

fn push_quality(args: &mut Vec<String>, quality: Quality, family: &CodecFamily, hardware: bool) {
    if hardware {
        return;
    }
    match family {
        CodecFamily::H264 | CodecFamily::Hevc | CodecFamily::Other(_) => {
            let (preset, crf) = quality_params(quality);
            args.extend(["-preset".into(), preset.into()]);
            args.extend(["-crf".into(), crf.to_string()]);
        }
        CodecFamily::Vp9 | CodecFamily::Av1 => {
            args.extend(["-crf".into(), constant_quality_crf(quality).to_string()]);
            args.extend(["-b:v".into(), "0".into()]);
        }
    }
}

fn push_format_flags(args: &mut Vec<String>, cfg: &TranscodingConfig, family: &CodecFamily, copy_video: bool) {
    match cfg.format.to_lowercase().as_str() {
        "mp4" | "mov" | "m4v" => {
            args.extend(["-movflags".into(), "+faststart".into()]);
        }
        "webm" => {
            let (deadline, cpu_used) = if cfg.quality == Quality::Low {
                ("realtime", "5")
            } else {
                ("good", "2")
            };
            args.extend(["-deadline".into(), deadline.into()]);
            args.extend(["-cpu-used".into(), cpu_used.into()]);
        }
        _ => {}
    }

    if !copy_video && matches!(family, CodecFamily::H264 | CodecFamily::Hevc) {
        args.extend(["-pix_fmt".into(), "yuv420p".into()]);
    }
}
