//! Output validation
//!
//! Confirms a finished transcode produced a usable file and scores it against
//! the source.

use crate::command::CodecFamily;
use crate::probe::{ProbeError, Prober, VideoMetadata};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Error type for output validation
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The transcoder produced a zero-byte file
    #[error("Output file is empty: {}", .0.display())]
    EmptyOutput(PathBuf),

    /// The output's video codec is not in the requested family
    #[error("Codec mismatch: expected {expected}, found {actual}")]
    CodecMismatch { expected: String, actual: String },

    #[error("Failed to probe output: {0}")]
    Probe(#[from] ProbeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validate a transcoded file and return its metadata.
///
/// `expected_codec` is the encoder that was requested; `copy` skips the codec
/// check. An invalid output is deleted before the error is returned.
pub async fn validate_output(
    prober: &Prober,
    output_path: &Path,
    expected_codec: &str,
) -> Result<VideoMetadata, ValidationError> {
    let result = check_output(prober, output_path, expected_codec).await;
    if let Err(ref e) = result {
        discard_invalid_output(output_path, e).await;
    }
    result
}

async fn check_output(
    prober: &Prober,
    output_path: &Path,
    expected_codec: &str,
) -> Result<VideoMetadata, ValidationError> {
    let size = tokio::fs::metadata(output_path).await?.len();
    if size == 0 {
        return Err(ValidationError::EmptyOutput(output_path.to_path_buf()));
    }

    let metadata = prober.probe(output_path).await?;

    if !expected_codec.eq_ignore_ascii_case("copy")
        && CodecFamily::of(expected_codec) != CodecFamily::of(&metadata.codec)
    {
        return Err(ValidationError::CodecMismatch {
            expected: expected_codec.to_string(),
            actual: metadata.codec.clone(),
        });
    }

    debug!(
        path = %output_path.display(),
        codec = %metadata.codec,
        width = metadata.width,
        height = metadata.height,
        "Output validated"
    );
    Ok(metadata)
}

async fn discard_invalid_output(path: &Path, reason: &ValidationError) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => warn!(path = %path.display(), %reason, "Deleted invalid output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete invalid output"),
    }
}

/// Synthetic 0-100 score of how much quality survived the transcode.
///
/// Penalties: resolution shrink (up to 30), bitrate collapse (40 below 30% of
/// the source, 25 below 50%, 10 below 70%), frame-rate reduction (up to 20),
/// output more than twice the source size (10).
pub fn compute_quality_score(input: &VideoMetadata, output: &VideoMetadata) -> u8 {
    let mut score = 100.0_f64;

    let input_area = input.width as f64 * input.height as f64;
    let output_area = output.width as f64 * output.height as f64;
    if input_area > 0.0 && output_area < input_area {
        score -= 30.0 * (1.0 - output_area / input_area);
    }

    if input.bitrate > 0 {
        let ratio = output.bitrate as f64 / input.bitrate as f64;
        score -= if ratio < 0.3 {
            40.0
        } else if ratio < 0.5 {
            25.0
        } else if ratio < 0.7 {
            10.0
        } else {
            0.0
        };
    }

    if input.frame_rate > 0.0 && output.frame_rate < input.frame_rate {
        score -= 20.0 * (1.0 - output.frame_rate.max(0.0) / input.frame_rate);
    }

    if input.file_size > 0 && output.file_size > input.file_size.saturating_mul(2) {
        score -= 10.0;
    }

    score.round().clamp(0.0, 100.0) as u8
}

/// Fraction of the original size saved: `(original - compressed) / original`.
///
/// Negative when the output grew; 0 for an empty original.
pub fn compute_compression_ratio(original_bytes: u64, compressed_bytes: u64) -> f64 {
    if original_bytes == 0 {
        return 0.0;
    }
    (original_bytes as f64 - compressed_bytes as f64) / original_bytes as f64
}
