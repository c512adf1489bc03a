//! Thumbnails and animated previews.
//!
//! Frames are extracted by the transcoder, run through the shared
//! [`ProcessOrchestrator`] so they count against its process limit.

use crate::probe::{ProbeError, Prober};
use crate::process::{ProcessError, ProcessOrchestrator, ProcessSpec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_THUMBNAIL_WIDTH: u32 = 320;
pub const DEFAULT_PREVIEW_FPS: u32 = 10;

/// Keeps seeks clear of the very last frame, which may not decode.
const END_MARGIN_SECS: f64 = 0.1;

/// Error type for thumbnail and preview generation
#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Generated file is empty: {}", .0.display())]
    EmptyOutput(PathBuf),

    /// Previews are written as GIF or WebP
    #[error("Unsupported preview format: {0}")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Keep a seek position inside `[0, duration)`.
pub fn clamp_timestamp(at_secs: f64, duration_secs: f64) -> f64 {
    if !duration_secs.is_finite() || duration_secs <= 0.0 || !at_secs.is_finite() {
        return 0.0;
    }
    at_secs.clamp(0.0, (duration_secs - END_MARGIN_SECS).max(0.0))
}

/// `count` timestamps spread evenly across the duration, excluding both ends.
pub fn thumbnail_timestamps(duration_secs: f64, count: u32) -> Vec<f64> {
    let duration = if duration_secs.is_finite() {
        duration_secs.max(0.0)
    } else {
        0.0
    };
    (0..count)
        .map(|i| duration * f64::from(i + 1) / f64::from(count + 1))
        .collect()
}

/// Arguments extracting a single JPEG frame.
pub fn thumbnail_args(input: &Path, output: &Path, at_secs: f64, width: u32) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-nostdin".to_string(),
        "-ss".to_string(),
        format!("{at_secs:.3}"),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
        "-frames:v".to_string(),
        "1".to_string(),
        "-vf".to_string(),
        format!("scale={width}:-2"),
        "-q:v".to_string(),
        "2".to_string(),
        "-an".to_string(),
        "-y".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

/// Arguments for an animated preview; the container follows the output extension.
///
/// GIF output builds its palette inside a single filter graph.
pub fn preview_args(
    input: &Path,
    output: &Path,
    start_secs: f64,
    duration_secs: f64,
    width: u32,
    fps: u32,
) -> Result<Vec<String>, ThumbnailError> {
    let extension = output
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let mut args = vec![
        "-hide_banner".to_string(),
        "-nostdin".to_string(),
        "-ss".to_string(),
        format!("{start_secs:.3}"),
        "-t".to_string(),
        format!("{duration_secs:.3}"),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
    ];

    let scale = format!("fps={fps},scale={width}:-2:flags=lanczos");
    match extension.as_str() {
        "gif" => {
            args.push("-filter_complex".to_string());
            args.push(format!(
                "[0:v]{scale},split[a][b];[a]palettegen[p];[b][p]paletteuse"
            ));
        }
        "webp" => {
            args.extend([
                "-vf".to_string(),
                scale,
                "-c:v".to_string(),
                "libwebp".to_string(),
                "-quality".to_string(),
                "75".to_string(),
            ]);
        }
        other => return Err(ThumbnailError::UnsupportedFormat(other.to_string())),
    }

    args.extend([
        "-loop".to_string(),
        "0".to_string(),
        "-an".to_string(),
        "-y".to_string(),
        output.to_string_lossy().to_string(),
    ]);
    Ok(args)
}

/// Runs frame extraction through the process orchestrator.
pub struct ThumbnailGenerator {
    orchestrator: Arc<ProcessOrchestrator>,
    prober: Prober,
    ffmpeg_path: String,
}

impl ThumbnailGenerator {
    pub fn new(
        orchestrator: Arc<ProcessOrchestrator>,
        prober: Prober,
        ffmpeg_path: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            prober,
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Extract one frame. Defaults: 10% into the source, 320 px wide.
    pub async fn generate_thumbnail(
        &self,
        input: &Path,
        output: &Path,
        at_secs: Option<f64>,
        width: Option<u32>,
    ) -> Result<PathBuf, ThumbnailError> {
        let metadata = self.prober.probe(input).await?;
        let at = clamp_timestamp(
            at_secs.unwrap_or(metadata.duration_secs * 0.1),
            metadata.duration_secs,
        );
        self.extract_frame(input, output, at, width.unwrap_or(DEFAULT_THUMBNAIL_WIDTH))
            .await?;
        Ok(output.to_path_buf())
    }

    /// Extract `count` frames evenly spaced across the source into `out_dir`.
    pub async fn generate_thumbnails(
        &self,
        input: &Path,
        out_dir: &Path,
        count: u32,
        width: Option<u32>,
    ) -> Result<Vec<PathBuf>, ThumbnailError> {
        let metadata = self.prober.probe(input).await?;
        tokio::fs::create_dir_all(out_dir).await?;

        let width = width.unwrap_or(DEFAULT_THUMBNAIL_WIDTH);
        let mut outputs = Vec::with_capacity(count as usize);
        for (i, at) in thumbnail_timestamps(metadata.duration_secs, count)
            .into_iter()
            .enumerate()
        {
            let output = out_dir.join(format!("thumb_{:03}.jpg", i + 1));
            let at = clamp_timestamp(at, metadata.duration_secs);
            self.extract_frame(input, &output, at, width).await?;
            outputs.push(output);
        }

        info!(input = %input.display(), count = outputs.len(), "Generated thumbnails");
        Ok(outputs)
    }

    /// Render an animated GIF or WebP clip of the source.
    pub async fn generate_preview(
        &self,
        input: &Path,
        output: &Path,
        start_secs: f64,
        duration_secs: f64,
        width: Option<u32>,
        fps: Option<u32>,
    ) -> Result<PathBuf, ThumbnailError> {
        let metadata = self.prober.probe(input).await?;
        let start = clamp_timestamp(start_secs, metadata.duration_secs);
        let length = duration_secs
            .min(metadata.duration_secs - start)
            .max(END_MARGIN_SECS);

        let args = preview_args(
            input,
            output,
            start,
            length,
            width.unwrap_or(DEFAULT_THUMBNAIL_WIDTH),
            fps.unwrap_or(DEFAULT_PREVIEW_FPS).max(1),
        )?;
        self.run(args, output).await?;

        info!(output = %output.display(), start, length, "Generated preview");
        Ok(output.to_path_buf())
    }

    async fn extract_frame(
        &self,
        input: &Path,
        output: &Path,
        at_secs: f64,
        width: u32,
    ) -> Result<(), ThumbnailError> {
        self.run(thumbnail_args(input, output, at_secs, width), output)
            .await
    }

    async fn run(&self, args: Vec<String>, output: &Path) -> Result<(), ThumbnailError> {
        let session_id = format!("thumb-{}", Uuid::new_v4());
        let spec = ProcessSpec::new(self.ffmpeg_path.clone(), args)
            .with_temp_file(output.to_path_buf());
        self.orchestrator.execute_and_wait(spec, &session_id).await?;
        ensure_non_empty(output).await
    }
}

async fn ensure_non_empty(path: &Path) -> Result<(), ThumbnailError> {
    let size = tokio::fs::metadata(path).await?.len();
    if size > 0 {
        return Ok(());
    }
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove empty output");
    }
    Err(ThumbnailError::EmptyOutput(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_thumbnail_timestamps() {
        assert_eq!(thumbnail_timestamps(100.0, 3), vec![25.0, 50.0, 75.0]);
        assert_eq!(thumbnail_timestamps(10.0, 1), vec![5.0]);
        assert!(thumbnail_timestamps(10.0, 0).is_empty());
        assert_eq!(thumbnail_timestamps(0.0, 2), vec![0.0, 0.0]);
    }

    #[test]
    fn test_clamp_timestamp() {
        assert_eq!(clamp_timestamp(5.0, 10.0), 5.0);
        assert_eq!(clamp_timestamp(-3.0, 10.0), 0.0);
        assert!((clamp_timestamp(50.0, 10.0) - 9.9).abs() < 1e-9);
        assert_eq!(clamp_timestamp(5.0, 0.0), 0.0);
        assert_eq!(clamp_timestamp(f64::NAN, 10.0), 0.0);
    }

    #[test]
    fn test_thumbnail_args() {
        let args = thumbnail_args(Path::new("/in.mkv"), Path::new("/out.jpg"), 12.5, 320);
        let joined = args.join(" ");
        assert!(joined.contains("-ss 12.500 -i /in.mkv"));
        assert!(joined.contains("-frames:v 1"));
        assert!(joined.contains("-vf scale=320:-2"));
        assert_eq!(args.last().map(String::as_str), Some("/out.jpg"));
    }

    #[test]
    fn test_preview_args_by_extension() {
        let gif = preview_args(Path::new("/in.mp4"), Path::new("/p.gif"), 1.0, 3.0, 480, 12).unwrap();
        let graph_at = gif.iter().position(|a| a == "-filter_complex").expect("filter graph");
        assert!(gif[graph_at + 1].contains("palettegen"));
        assert!(gif[graph_at + 1].contains("paletteuse"));
        assert!(gif[graph_at + 1].contains("fps=12,scale=480:-2"));

        let webp = preview_args(Path::new("/in.mp4"), Path::new("/p.WEBP"), 0.0, 2.0, 320, 10).unwrap();
        assert!(webp.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libwebp"));
        assert!(!webp.contains(&"-filter_complex".to_string()));

        assert!(matches!(
            preview_args(Path::new("/in.mp4"), Path::new("/p.mp4"), 0.0, 2.0, 320, 10),
            Err(ThumbnailError::UnsupportedFormat(ext)) if ext == "mp4"
        ));
    }

    #[cfg(unix)]
    mod generator {
        use super::*;
        use crate::process::OrchestratorConfig;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;
        use tempfile::TempDir;

        fn script(path: &Path, body: &str) {
            std::fs::write(path, body).unwrap();
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        fn generator(dir: &TempDir, ffmpeg_body: &str) -> ThumbnailGenerator {
            let ffprobe = dir.path().join("ffprobe");
            let ffmpeg = dir.path().join("ffmpeg");
            script(&ffprobe, "#!/bin/sh\nfor last; do :; done\ncat \"$last.json\"\n");
            script(&ffmpeg, ffmpeg_body);

            let orchestrator = Arc::new(ProcessOrchestrator::new(OrchestratorConfig {
                max_processes: 2,
                timeout: Some(Duration::from_secs(30)),
                kill_grace: Duration::from_millis(200),
                memory_threshold_percent: 100.0,
            }));
            ThumbnailGenerator::new(
                orchestrator,
                Prober::new(ffprobe.to_string_lossy().to_string()),
                ffmpeg.to_string_lossy().to_string(),
            )
        }

        fn source(dir: &TempDir) -> PathBuf {
            let input = dir.path().join("in.mkv");
            std::fs::write(&input, b"video").unwrap();
            std::fs::write(
                dir.path().join("in.mkv.json"),
                r#"{"streams":[{"codec_type":"video","codec_name":"hevc","width":1920,"height":1080,"r_frame_rate":"24/1"}],"format":{"duration":"40.0"}}"#,
            )
            .unwrap();
            input
        }

        const WRITES_LAST_ARG: &str = "#!/bin/sh\nfor last; do :; done\nprintf 'jpeg' > \"$last\"\n";

        #[tokio::test]
        async fn test_generate_thumbnails() {
            let dir = TempDir::new().unwrap();
            let generator = generator(&dir, WRITES_LAST_ARG);
            let input = source(&dir);

            let outputs = generator
                .generate_thumbnails(&input, &dir.path().join("thumbs"), 3, None)
                .await
                .expect("thumbnails");
            assert_eq!(outputs.len(), 3);
            for output in &outputs {
                assert!(std::fs::metadata(output).unwrap().len() > 0);
            }
            assert!(outputs[0].ends_with("thumbs/thumb_001.jpg"));
        }

        #[tokio::test]
        async fn test_generate_preview_and_single_thumbnail() {
            let dir = TempDir::new().unwrap();
            let generator = generator(&dir, WRITES_LAST_ARG);
            let input = source(&dir);

            let preview = dir.path().join("preview.gif");
            generator
                .generate_preview(&input, &preview, 5.0, 3.0, None, None)
                .await
                .expect("preview");
            assert!(preview.exists());

            let thumb = dir.path().join("poster.jpg");
            generator
                .generate_thumbnail(&input, &thumb, Some(500.0), Some(160))
                .await
                .expect("thumbnail");
            assert!(thumb.exists());
        }

        #[tokio::test]
        async fn test_empty_frame_is_an_error() {
            let dir = TempDir::new().unwrap();
            let generator = generator(&dir, "#!/bin/sh\nfor last; do :; done\n: > \"$last\"\n");
            let input = source(&dir);
            let output = dir.path().join("empty.jpg");

            let result = generator.generate_thumbnail(&input, &output, None, None).await;
            assert!(matches!(result, Err(ThumbnailError::EmptyOutput(_))));
            assert!(!output.exists());
        }

        #[tokio::test]
        async fn test_transcoder_failure_is_reported() {
            let dir = TempDir::new().unwrap();
            let generator = generator(&dir, "#!/bin/sh\necho 'seek failed' >&2\nexit 1\n");
            let input = source(&dir);

            let result = generator
                .generate_thumbnail(&input, &dir.path().join("x.jpg"), None, None)
                .await;
            assert!(matches!(
                result,
                Err(ThumbnailError::Process(ProcessError::Exit { .. }))
            ));
        }
    }

    // Property: generated timestamps are increasing and strictly inside the duration.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_timestamps_inside_duration(duration in 0.5f64..36_000.0, count in 1u32..50) {
            let stamps = thumbnail_timestamps(duration, count);
            prop_assert_eq!(stamps.len(), count as usize);
            for pair in stamps.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
            prop_assert!(stamps.iter().all(|t| *t > 0.0 && *t < duration));
        }
    }
}
