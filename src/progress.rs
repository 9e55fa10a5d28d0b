//! Progress reporting for transfers and streaming decryption.
//!
//! Transfer tasks are transport-free state machines, so instead of touching
//! a terminal they emit [`ProgressEvent`] values. The client feeds those into
//! a [`ProgressDisplay`]; the server just logs them.

use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::time::Duration;

/// Direction of a transfer as seen by the local peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// A point-in-time progress report emitted by a transfer or decrypt task.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub title: String,
    pub direction: Direction,
    /// Completion in percent, `0.0..=100.0`.
    pub percent: f64,
    pub total_bytes: u64,
    pub elapsed: Duration,
    pub eta_seconds: u64,
}

impl ProgressEvent {
    pub fn new(
        title: &str,
        direction: Direction,
        percent: f64,
        total_bytes: u64,
        elapsed: Duration,
    ) -> Self {
        Self {
            title: title.to_string(),
            direction,
            percent,
            total_bytes,
            elapsed,
            eta_seconds: estimate_eta_seconds(percent, elapsed),
        }
    }

    /// Bytes accounted as complete, derived from the percentage.
    pub fn bytes_done(&self) -> u64 {
        (self.percent / 100.0 * self.total_bytes as f64) as u64
    }
}

/// Completion percentage derived from portion-level accounting.
///
/// `portion_index` portions are fully confirmed, and `pending_chunks` of the
/// current portion's `chunks_in_portion` chunks are still outstanding. The
/// current portion is weighted by the nominal portion byte size, so the
/// shorter tail portion overshoots slightly and the result is clamped.
pub fn portion_progress(
    portion_index: u64,
    chunks_in_portion: u64,
    pending_chunks: u64,
    portion_size: u64,
    file_size: u64,
) -> f64 {
    if file_size == 0 {
        return 100.0;
    }
    let portion_fraction = if chunks_in_portion == 0 {
        0.0
    } else {
        chunks_in_portion.saturating_sub(pending_chunks) as f64 / chunks_in_portion as f64
    };
    let fraction =
        (portion_index as f64 + portion_fraction) * portion_size as f64 / file_size as f64;
    (fraction * 100.0).min(100.0)
}

/// Projects the observed rate over the remaining work. Returns zero when no
/// progress has been made yet or the work is done.
pub fn estimate_eta_seconds(percent: f64, elapsed: Duration) -> u64 {
    if percent <= 0.0 || percent >= 100.0 {
        return 0;
    }
    (elapsed.as_secs_f64() * (100.0 - percent) / percent).round() as u64
}

/// Terminal progress bar fed by [`ProgressEvent`]s.
pub struct ProgressDisplay {
    bar: ProgressBar,
}

impl ProgressDisplay {
    pub fn new(title: &str, total_bytes: u64) -> Self {
        let bar = ProgressBar::new(total_bytes);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg:25.25} {bytes:>10}/{total_bytes:>10} {percent:>5}% {bytes_per_sec:>12} {eta:>8}")
                .unwrap()
                .progress_chars("█▉▊▋▌▍▎▏ "),
        );
        bar.set_message(title.to_string());
        Self { bar }
    }

    pub fn apply(&self, event: &ProgressEvent) {
        self.bar.set_position(event.bytes_done());
    }

    pub fn finish(&self) {
        let msg = self.bar.message();
        self.bar.finish_with_message(msg);
    }
}
