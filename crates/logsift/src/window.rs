//! Tumbling-window frequency tracking.
//!
//! Entries are bucketed into fixed-length windows aligned to the first
//! entry seen. Retired windows are kept in a bounded history and scanned for
//! error-rate spikes, volume bursts and silence gaps.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::config::{WindowConfig, to_chrono};
use crate::traits::Detector;
use crate::types::{Anomaly, AnomalyCategory, AnomalySeverity, LogEntry};

/// Counts for one tumbling window `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStats {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
    /// Entries counted.
    pub total: usize,
    /// Entries at `Error` or `Critical`.
    pub errors: usize,
    /// Entries per source; the empty key collects entries without one.
    pub by_source: HashMap<String, usize>,
}

impl WindowStats {
    fn open(start: DateTime<Utc>, length: Duration) -> Self {
        Self {
            start,
            end: start + length,
            total: 0,
            errors: 0,
            by_source: HashMap::new(),
        }
    }

    /// Returns true if `ts` falls in `[start, end)`.
    #[must_use]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Fraction of entries that were error-like.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.errors as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Default)]
struct WindowState {
    current: Option<WindowStats>,
    history: VecDeque<WindowStats>,
    dropped_late: u64,
}

/// Tumbling-window tracker for error rate, volume and silence.
#[derive(Debug)]
pub struct WindowedFrequencyTracker {
    config: WindowConfig,
    window: Duration,
    silence: Duration,
    state: Mutex<WindowState>,
}

impl WindowedFrequencyTracker {
    /// Creates a tracker with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(WindowConfig::default())
    }

    /// Creates a tracker with a custom configuration.
    #[must_use]
    pub fn with_config(config: WindowConfig) -> Self {
        let window = to_chrono(config.window_size).max(Duration::milliseconds(1));
        let silence = to_chrono(config.silence_threshold);
        info!(
            window_secs = config.window_size.as_secs(),
            error_rate_threshold = config.error_rate_threshold,
            burst_threshold = config.burst_threshold,
            "windowed frequency tracker created"
        );
        Self {
            config,
            window,
            silence,
            state: Mutex::new(WindowState::default()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Counts an entry into its window, rolling windows forward as needed.
    pub fn add_entry(&self, entry: &LogEntry) {
        let ts = entry.timestamp;
        let mut state = self.state.lock();

        let current = match state.current.take() {
            None => WindowStats::open(ts, self.window),
            Some(cur) if ts < cur.start => {
                state.dropped_late += 1;
                trace!(timestamp = %ts, window_start = %cur.start, "dropping late entry");
                state.current = Some(cur);
                return;
            }
            Some(cur) if ts >= cur.end => {
                // Jump over any empty windows arithmetically.
                let window_ms = self.window.num_milliseconds().max(1);
                let skipped = (ts - cur.end).num_milliseconds() / window_ms;
                let next_start = cur.end + Duration::milliseconds(window_ms * skipped);
                debug!(
                    closed_start = %cur.start,
                    total = cur.total,
                    skipped_windows = skipped,
                    "window rolled over"
                );
                state.history.push_back(cur);
                while state.history.len() > self.config.max_history {
                    state.history.pop_front();
                }
                WindowStats::open(next_start, self.window)
            }
            Some(cur) => cur,
        };

        let mut current = current;
        current.total += 1;
        if entry.level.is_error_like() {
            current.errors += 1;
        }
        *current
            .by_source
            .entry(entry.source.clone().unwrap_or_default())
            .or_insert(0) += 1;
        state.current = Some(current);
    }

    /// Returns the open window, if any entry has been seen.
    #[must_use]
    pub fn current_stats(&self) -> Option<WindowStats> {
        self.state.lock().current.clone()
    }

    /// Returns retired windows, oldest first.
    #[must_use]
    pub fn history_stats(&self) -> Vec<WindowStats> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Number of entries dropped for arriving before the open window.
    #[must_use]
    pub fn dropped_late(&self) -> u64 {
        self.state.lock().dropped_late
    }

    fn grade(score: f64) -> AnomalySeverity {
        AnomalySeverity::grade(
            score,
            AnomalySeverity::Low,
            AnomalySeverity::Medium,
            AnomalySeverity::High,
        )
    }

    fn check_window(&self, w: &WindowStats, out: &mut Vec<Anomaly>) {
        let rate = w.error_rate();
        if w.total > 0 && rate > self.config.error_rate_threshold {
            let score = (rate * 2.0).min(1.0);
            out.push(Anomaly::new(
                self.name(),
                AnomalyCategory::FrequencySpike,
                Self::grade(score),
                w.start,
                w.end,
                score,
                format!(
                    "High error rate: {:.1}% ({}/{} events)",
                    rate * 100.0,
                    w.errors,
                    w.total
                ),
            ));
        }

        if w.total > self.config.burst_threshold {
            let score = (w.total as f64 / self.config.burst_threshold as f64).min(1.0);
            out.push(Anomaly::new(
                self.name(),
                AnomalyCategory::FrequencySpike,
                Self::grade(score),
                w.start,
                w.end,
                score,
                format!(
                    "Volume burst: {} events in {}s (threshold {})",
                    w.total,
                    self.window.num_seconds(),
                    self.config.burst_threshold
                ),
            ));
        }
    }

    fn check_gap(&self, prev: &WindowStats, next: &WindowStats, out: &mut Vec<Anomaly>) {
        let gap = next.start - prev.end;
        if gap > self.silence {
            let silence_ms = self.silence.num_milliseconds().max(1) as f64;
            let score = (gap.num_milliseconds() as f64 / silence_ms).min(1.0);
            out.push(Anomaly::new(
                self.name(),
                AnomalyCategory::Silence,
                Self::grade(score),
                prev.end,
                next.start,
                score,
                format!("Silence detected: no events for {}s", gap.num_seconds()),
            ));
        }
    }
}

impl Default for WindowedFrequencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for WindowedFrequencyTracker {
    fn name(&self) -> &'static str {
        "window"
    }

    fn process(&self, entry: &LogEntry) -> Vec<Anomaly> {
        self.add_entry(entry);
        Vec::new()
    }

    fn detect_anomalies(&self) -> Vec<Anomaly> {
        let state = self.state.lock();
        let windows: Vec<&WindowStats> = state.history.iter().chain(state.current.as_ref()).collect();

        let mut out = Vec::new();
        for w in &windows {
            self.check_window(w, &mut out);
        }
        for pair in windows.windows(2) {
            self.check_gap(pair[0], pair[1], &mut out);
        }
        out
    }

    fn reset(&self) {
        *self.state.lock() = WindowState::default();
        debug!("windowed frequency tracker reset");
    }
}
