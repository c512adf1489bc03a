//! Incremental parsing of the transcoder's diagnostic stream.
//!
//! The transcoder rewrites its status line with `\r`, so the stream is split on
//! both `\r` and `\n`. Chunks arrive at arbitrary boundaries; [`LineScanner`]
//! keeps the partial line between reads. Each field of a status line is matched
//! independently, so field order does not matter.

use crate::task::TranscodingProgress;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::LazyLock;

static FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"frame=\s*(\d+)").expect("valid frame regex"));
static FPS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"fps=\s*(\d+(?:\.\d+)?)").expect("valid fps regex"));
static BITRATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"bitrate=\s*(\d+(?:\.\d+)?)\s*kbits/s").expect("valid bitrate regex")
});
static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid time regex")
});
static SPEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"speed=\s*(\d+(?:\.\d+)?)x").expect("valid speed regex"));

/// Upper bound on a buffered partial line.
const MAX_PARTIAL_LINE: usize = 64 * 1024;

/// Splits a byte stream into lines across arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub struct LineScanner {
    partial: Vec<u8>,
}

impl LineScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every line completed by it. Empty lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !self.partial.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.partial).into_owned());
                    self.partial.clear();
                }
            } else if self.partial.len() < MAX_PARTIAL_LINE {
                self.partial.push(byte);
            }
        }
        lines
    }

    /// Flush the trailing partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        Some(line)
    }
}

/// Fields recovered from one status line.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProgress {
    pub frame: u64,
    pub fps: Option<f32>,
    pub bitrate_kbps: Option<f32>,
    pub time_secs: f64,
    pub speed: Option<f32>,
}

fn capture<'a>(re: &Regex, line: &'a str) -> Option<&'a str> {
    re.captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Parse a status line. A frame counter and a time marker are both required.
pub fn parse_progress_line(line: &str) -> Option<RawProgress> {
    let frame = capture(&FRAME_RE, line)?.parse::<u64>().ok()?;

    let time = TIME_RE.captures(line)?;
    let hours: f64 = time.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = time.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = time.get(3)?.as_str().parse().ok()?;

    Some(RawProgress {
        frame,
        fps: capture(&FPS_RE, line).and_then(|v| v.parse().ok()),
        bitrate_kbps: capture(&BITRATE_RE, line).and_then(|v| v.parse().ok()),
        time_secs: hours * 3600.0 + minutes * 60.0 + seconds,
        speed: capture(&SPEED_RE, line).and_then(|v| v.parse().ok()),
    })
}

/// Turns raw records into [`TranscodingProgress`] against a known duration.
///
/// Percent is clamped to [0, 100] and never decreases.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    duration_secs: Option<f64>,
    last_percent: f32,
}

impl ProgressTracker {
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs: duration_secs.filter(|d| d.is_finite() && *d > 0.0),
            last_percent: 0.0,
        }
    }

    pub fn update(&mut self, raw: &RawProgress) -> TranscodingProgress {
        let mut percent = self.last_percent;
        let mut eta_secs = None;

        if let Some(duration) = self.duration_secs {
            let measured = (raw.time_secs / duration * 100.0).clamp(0.0, 100.0) as f32;
            percent = percent.max(measured);

            let remaining = (duration - raw.time_secs).max(0.0);
            eta_secs = raw
                .speed
                .filter(|s| *s > 0.0)
                .map(|speed| remaining / speed as f64);
        }
        self.last_percent = percent;

        TranscodingProgress {
            frame: raw.frame,
            fps: raw.fps.unwrap_or(0.0),
            bitrate_kbps: raw.bitrate_kbps,
            time_secs: raw.time_secs,
            speed: raw.speed,
            percent,
            eta_secs,
        }
    }
}

/// Keeps the last few diagnostic lines for error reporting.
#[derive(Debug)]
pub struct DiagnosticTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl DiagnosticTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn text(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}
