//! Startup checks
//!
//! Preflight checks run before any task is accepted:
//! - Hardware encoders are only allowed when hardware acceleration is enabled
//! - The transcoder and prober can be executed
//! - The transcoder is recent enough

use crate::command::HARDWARE_MARKERS;
use crate::config::Config;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

/// Oldest transcoder major version with the flags the command builder emits
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("Hardware encoding detected: {0}")]
    HardwareEncodingDetected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Return the first hardware marker found in `s`, if any.
pub fn detect_hardware_flag(s: &str) -> Option<&'static str> {
    let lower = s.to_lowercase();
    HARDWARE_MARKERS
        .iter()
        .find(|&&flag| lower.contains(flag))
        .copied()
}

/// Reject arguments naming a hardware encoder unless hardware is allowed.
pub fn check_args_for_hardware_flags(
    args: &[&str],
    hardware_allowed: bool,
) -> Result<(), StartupError> {
    if hardware_allowed {
        return Ok(());
    }

    for arg in args {
        if let Some(flag) = detect_hardware_flag(arg) {
            return Err(StartupError::HardwareEncodingDetected(format!(
                "'{}' uses {}, but hardware acceleration is disabled",
                arg, flag
            )));
        }
    }

    Ok(())
}

/// The default codecs must be software encoders when hardware acceleration is off.
pub fn assert_software_only(cfg: &Config) -> Result<(), StartupError> {
    let codecs = [
        cfg.defaults.video_codec.as_str(),
        cfg.defaults.audio_codec.as_str(),
    ];
    check_args_for_hardware_flags(&codecs, cfg.defaults.hardware_acceleration)
}

/// Run `<path> -version` and return its stdout.
pub async fn check_tool_available(path: &str) -> Result<String, StartupError> {
    let unavailable = |reason: String| StartupError::ToolUnavailable {
        tool: path.to_string(),
        reason,
    };

    let output = Command::new(path)
        .arg("-version")
        .output()
        .await
        .map_err(|e| unavailable(format!("failed to run '{} -version'; is it installed and in PATH? {}", path, e)))?;

    if !output.status.success() {
        return Err(unavailable(format!("'{} -version' exited with {}", path, output.status)));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extract the major version from `-version` output.
///
/// Handles release builds ("ffmpeg version 6.1.1") and n-prefixed builds
/// ("ffmpeg version n7.0-12-gabcdef"). Git snapshot builds ("N-112233-g...")
/// carry no release number and yield `None`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(" version "))?;

    let version_part = version_line
        .to_lowercase()
        .split(" version ")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Run all startup checks in order
///
/// 1. Software-only assertion
/// 2. Prober availability
/// 3. Transcoder availability and version
pub async fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    assert_software_only(cfg)?;
    check_tool_available(&cfg.process.ffprobe_path).await?;

    let version_output = check_tool_available(&cfg.process.ffmpeg_path).await?;
    match parse_ffmpeg_version(&version_output) {
        Some(major) if major < MIN_FFMPEG_MAJOR => {
            return Err(StartupError::FfmpegVersion(format!(
                "FFmpeg {}.x or newer required, got: {}",
                MIN_FFMPEG_MAJOR, major
            )));
        }
        Some(major) => info!(major, "Transcoder version detected"),
        None => warn!(
            first_line = version_output.lines().next().unwrap_or("(empty)"),
            "Could not parse transcoder version, continuing"
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const FLAGS: &[&str] = HARDWARE_MARKERS;

    // Property: any string containing a hardware marker is detected and
    // rejected while hardware acceleration is off.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_hardware_flag_detection(
            prefix in "[a-z0-9_-]{0,10}",
            suffix in "[a-z0-9_-]{0,10}",
            flag_idx in 0..HARDWARE_MARKERS.len(),
        ) {
            let test_string = format!("{}{}{}", prefix, FLAGS[flag_idx], suffix);

            let detected = detect_hardware_flag(&test_string);
            prop_assert!(detected.is_some(), "Should detect hardware flag in '{}'", test_string);
            prop_assert!(FLAGS.contains(&detected.unwrap()));

            let args = vec![test_string.as_str()];
            prop_assert!(check_args_for_hardware_flags(&args, false).is_err());
            prop_assert!(check_args_for_hardware_flags(&args, true).is_ok());
        }

        #[test]
        fn prop_clean_strings_pass(
            s in "[a-z]{0,20}".prop_filter("no hardware flags", |s| {
                !FLAGS.iter().any(|flag| s.contains(flag))
            }),
        ) {
            prop_assert!(detect_hardware_flag(&s).is_none());
            let args = vec![s.as_str()];
            prop_assert!(check_args_for_hardware_flags(&args, false).is_ok());
        }
    }

    // Property: the major version is recovered from release and n-prefixed
    // version lines, including multi-line output.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let version_output = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024\nbuilt with gcc 12.2.0",
                major, minor, git_hash
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }
    }

    #[test]
    fn test_detect_hardware_flag() {
        assert_eq!(detect_hardware_flag("h264_nvenc"), Some("nvenc"));
        assert_eq!(detect_hardware_flag("-c:v HEVC_QSV"), Some("qsv"));
        assert_eq!(detect_hardware_flag("h264_videotoolbox"), Some("videotoolbox"));
        assert_eq!(detect_hardware_flag("libx264"), None);
        assert_eq!(detect_hardware_flag("libvpx-vp9"), None);
        assert_eq!(detect_hardware_flag(""), None);
    }

    #[test]
    fn test_parse_version_variants() {
        assert_eq!(parse_ffmpeg_version("ffprobe version 6.1.1-3ubuntu5 Copyright"), Some(6));
        assert_eq!(parse_ffmpeg_version("ffmpeg version N-112233-gabcdef0 Copyright"), None);
        assert_eq!(parse_ffmpeg_version("not ffmpeg output"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn test_assert_software_only() {
        let mut cfg = Config::default();
        assert!(assert_software_only(&cfg).is_ok());

        cfg.defaults.video_codec = "h264_nvenc".to_string();
        let err = assert_software_only(&cfg).unwrap_err();
        assert!(err.to_string().contains("nvenc"));

        cfg.defaults.hardware_acceleration = true;
        assert!(assert_software_only(&cfg).is_ok());
    }

    #[cfg(unix)]
    mod tools {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn tool(dir: &TempDir, name: &str, body: &str) -> String {
            let path = dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().to_string()
        }

        fn config(ffmpeg: String, ffprobe: String) -> Config {
            let mut cfg = Config::default();
            cfg.process.ffmpeg_path = ffmpeg;
            cfg.process.ffprobe_path = ffprobe;
            cfg
        }

        #[tokio::test]
        async fn test_startup_checks_pass_with_working_tools() {
            let dir = TempDir::new().unwrap();
            let ffmpeg = tool(&dir, "ffmpeg", "#!/bin/sh\necho 'ffmpeg version n7.1-4-gabc Copyright'\n");
            let ffprobe = tool(&dir, "ffprobe", "#!/bin/sh\necho 'ffprobe version n7.1-4-gabc Copyright'\n");

            assert!(run_startup_checks(&config(ffmpeg, ffprobe)).await.is_ok());
        }

        #[tokio::test]
        async fn test_startup_checks_reject_old_or_missing_tools() {
            let dir = TempDir::new().unwrap();
            let old = tool(&dir, "ffmpeg", "#!/bin/sh\necho 'ffmpeg version 3.4.8 Copyright'\n");
            let ffprobe = tool(&dir, "ffprobe", "#!/bin/sh\necho 'ffprobe version 3.4.8'\n");
            let broken = tool(&dir, "broken", "#!/bin/sh\nexit 1\n");

            let result = run_startup_checks(&config(old, ffprobe.clone())).await;
            assert!(matches!(result, Err(StartupError::FfmpegVersion(_))));

            let result = run_startup_checks(&config(broken, ffprobe.clone())).await;
            assert!(matches!(result, Err(StartupError::ToolUnavailable { .. })));

            let missing = dir.path().join("missing").to_string_lossy().to_string();
            let result = run_startup_checks(&config(missing, ffprobe)).await;
            assert!(matches!(result, Err(StartupError::ToolUnavailable { .. })));
        }
    }
}
