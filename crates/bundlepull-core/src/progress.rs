//! Progress reporting for long-running transfers.
//!
//! • `ProgressTracker` — thread-safe byte counter with ETA estimation
//! • `ProgressSink` — render target injected into the tracker
//! • `ConsoleProgress` — single-line terminal bar, suppressed off-TTY
//!
//! All tracker state lives behind one mutex; sinks are invoked outside it so
//! a slow terminal never blocks transfer workers mid-update.

use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Minimum interval between two non-forced sink renders.
const EMIT_INTERVAL: Duration = Duration::from_millis(100);

/// Width of the console bar in characters.
const BAR_WIDTH: usize = 30;

// ── Formatting helpers ───────────────────────────────────────────────────────

/// Format a byte count as a human-readable string (`512B`, `1.5KB`, `2.0GB`).
pub fn format_bytes(value: u64) -> String {
    let mut size = value as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return if unit == "B" {
                format!("{}B", value)
            } else {
                format!("{:.1}{}", size, unit)
            };
        }
        size /= 1024.0;
    }
    format!("{:.1}TB", size)
}

/// Format a duration as a compact time string (`45s`, `1m30s`, `2h05m`).
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    if total < 60 {
        format!("{}s", total)
    } else if total < 3600 {
        format!("{}m{:02}s", total / 60, total % 60)
    } else {
        format!("{}h{:02}m", total / 3600, (total % 3600) / 60)
    }
}

/// Remaining-time estimate from linear extrapolation of the observed rate.
///
/// Returns `None` until more than 1% has transferred (too noisy) and once the
/// ratio reaches 100% (nothing left to estimate).
pub fn estimate_eta(elapsed: Duration, transferred: u64, total: u64) -> Option<Duration> {
    if total == 0 {
        return None;
    }
    let ratio = (transferred as f64 / total as f64).min(1.0);
    if ratio <= 0.01 || ratio >= 1.0 {
        return None;
    }
    let total_time = elapsed.as_secs_f64() / ratio;
    Some(Duration::from_secs_f64(total_time - elapsed.as_secs_f64()))
}

// ── Sink trait ───────────────────────────────────────────────────────────────

/// Point-in-time view of a tracker, handed to sinks on every emit.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub label: String,
    pub transferred: u64,
    /// Total bytes expected, `0` while still unknown.
    pub total: u64,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

/// Render target for progress updates. Injected into `ProgressTracker` so
/// tests can capture emissions instead of scraping a terminal.
pub trait ProgressSink: Send + Sync {
    fn render(&self, snapshot: &ProgressSnapshot);
    fn finish(&self, snapshot: &ProgressSnapshot);
}

// ── Console sink ─────────────────────────────────────────────────────────────

/// Single-line progress bar on stdout. Output is suppressed entirely when
/// stdout is not a terminal, so piped runs stay clean.
pub struct ConsoleProgress {
    inner: Mutex<ConsoleState>,
    enabled: bool,
}

struct ConsoleState {
    last_len: usize,
}

impl ConsoleProgress {
    pub fn stdout() -> Self {
        Self {
            inner: Mutex::new(ConsoleState { last_len: 0 }),
            enabled: io::stdout().is_terminal(),
        }
    }

    fn compose(snapshot: &ProgressSnapshot) -> String {
        if snapshot.total == 0 {
            return format!("{} {}", snapshot.label, format_bytes(snapshot.transferred));
        }
        let ratio = (snapshot.transferred as f64 / snapshot.total as f64).min(1.0);
        let filled = (BAR_WIDTH as f64 * ratio) as usize;
        let bar = format!("{}{}", "=".repeat(filled), " ".repeat(BAR_WIDTH - filled));
        let eta = match snapshot.eta {
            Some(remaining) => format!(" ETA {}", format_duration(remaining)),
            None => String::new(),
        };
        format!(
            "{} [{}] {:5.1}% {}/{}{}",
            snapshot.label,
            bar,
            ratio * 100.0,
            format_bytes(snapshot.transferred),
            format_bytes(snapshot.total),
            eta
        )
    }

    fn draw(&self, line: &str) {
        if let Ok(mut state) = self.inner.lock() {
            // Pad with spaces so a shorter line fully overwrites the last one.
            let padding = " ".repeat(state.last_len.saturating_sub(line.len()));
            let mut out = io::stdout();
            let _ = write!(out, "\r{}{}", line, padding);
            let _ = out.flush();
            state.last_len = line.len();
        }
    }
}

impl ProgressSink for ConsoleProgress {
    fn render(&self, snapshot: &ProgressSnapshot) {
        if !self.enabled {
            return;
        }
        self.draw(&Self::compose(snapshot));
    }

    fn finish(&self, snapshot: &ProgressSnapshot) {
        if !self.enabled {
            return;
        }
        self.draw(&Self::compose(snapshot));
        let mut out = io::stdout();
        let _ = writeln!(out);
        let _ = out.flush();
    }
}

// ── Tracker ──────────────────────────────────────────────────────────────────

struct TrackerState {
    transferred: u64,
    total: u64,
    started: Instant,
    last_emit: Option<Instant>,
    finished: bool,
}

/// Shared byte counter for a transfer operation.
///
/// Workers call `advance` concurrently; emissions to the sink are rate-limited
/// to one per [`EMIT_INTERVAL`] except for the forced final render in
/// `finish`. After `finish` the tracker is closed and further advances are
/// ignored.
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
    sink: Arc<dyn ProgressSink>,
    label: String,
}

impl ProgressTracker {
    pub fn new(label: impl Into<String>, total: u64, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                transferred: 0,
                total,
                started: Instant::now(),
                last_emit: None,
                finished: false,
            }),
            sink,
            label: label.into(),
        }
    }

    /// Tracker rendering to the controlling terminal.
    pub fn console(label: impl Into<String>, total: u64) -> Self {
        Self::new(label, total, Arc::new(ConsoleProgress::stdout()))
    }

    /// Record `delta` transferred bytes. A zero delta is ignored outright —
    /// it carries no information and must not trigger a render.
    pub fn advance(&self, delta: u64) {
        if delta == 0 {
            return;
        }
        let snapshot = {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if state.finished {
                return;
            }
            state.transferred += delta;
            let now = Instant::now();
            if let Some(prev) = state.last_emit {
                if now.duration_since(prev) < EMIT_INTERVAL {
                    return;
                }
            }
            state.last_emit = Some(now);
            self.snapshot_of(&state)
        };
        self.sink.render(&snapshot);
    }

    /// Replace the expected total, e.g. once enumeration has finished.
    pub fn set_total(&self, total: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.total = total;
        }
    }

    /// Force a final render and close the tracker. Idempotent.
    pub fn finish(&self) {
        let snapshot = {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if state.finished {
                return;
            }
            state.finished = true;
            state.last_emit = Some(Instant::now());
            self.snapshot_of(&state)
        };
        self.sink.finish(&snapshot);
    }

    /// Current counters, for callers that report progress elsewhere.
    pub fn snapshot(&self) -> ProgressSnapshot {
        match self.state.lock() {
            Ok(state) => self.snapshot_of(&state),
            Err(_) => ProgressSnapshot {
                label: self.label.clone(),
                transferred: 0,
                total: 0,
                elapsed: Duration::ZERO,
                eta: None,
            },
        }
    }

    pub fn transferred(&self) -> u64 {
        self.state.lock().map(|s| s.transferred).unwrap_or(0)
    }

    fn snapshot_of(&self, state: &TrackerState) -> ProgressSnapshot {
        let elapsed = state.started.elapsed();
        ProgressSnapshot {
            label: self.label.clone(),
            transferred: state.transferred,
            total: state.total,
            elapsed,
            eta: estimate_eta(elapsed, state.transferred, state.total),
        }
    }
}
