//! Short-window versus baseline spike detection.
//!
//! Each source keeps two sliding windows of timestamps. A spike is declared
//! when the short-window rate outpaces the baseline rate by more than the
//! configured ratio and both windows hold enough events to be meaningful.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::config::{SpikeConfig, to_chrono};
use crate::traits::Detector;
use crate::types::{Anomaly, AnomalyCategory, AnomalySeverity, LogEntry};

/// Spike measurements for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeStats {
    /// Source name.
    pub source: String,
    /// Events in the short window.
    pub current_count: usize,
    /// Events in the baseline window.
    pub baseline_count: usize,
    /// Short-window rate over baseline rate.
    pub spike_ratio: f64,
    /// Events in the previous tumbling short-length interval.
    pub previous_count: usize,
    /// Relative change against `previous_count`, when it is non-zero.
    pub rate_of_change: Option<f64>,
}

#[derive(Debug, Default)]
struct SourceWindows {
    short: VecDeque<DateTime<Utc>>,
    baseline: VecDeque<DateTime<Utc>>,
    samples: VecDeque<LogEntry>,
    bucket_start: Option<DateTime<Utc>>,
    bucket_count: usize,
    previous_count: usize,
    last_seen: Option<DateTime<Utc>>,
}

fn evict(window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, span: Duration) {
    while window.front().is_some_and(|t| now - *t > span) {
        window.pop_front();
    }
}

impl SourceWindows {
    fn roll_bucket(&mut self, ts: DateTime<Utc>, span: Duration) {
        let start = *self.bucket_start.get_or_insert(ts);
        if ts - start >= span {
            let span_ms = span.num_milliseconds().max(1);
            let elapsed = (ts - start).num_milliseconds() / span_ms;
            self.previous_count = if elapsed == 1 { self.bucket_count } else { 0 };
            self.bucket_start = Some(start + Duration::milliseconds(span_ms * elapsed));
            self.bucket_count = 0;
        }
        self.bucket_count += 1;
    }
}

/// Per-source spike tracker comparing a short window to a longer baseline.
#[derive(Debug)]
pub struct SpikeBaselineTracker {
    config: SpikeConfig,
    short: Duration,
    baseline: Duration,
    state: Mutex<HashMap<String, SourceWindows>>,
}

impl SpikeBaselineTracker {
    /// Creates a tracker with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SpikeConfig::default())
    }

    /// Creates a tracker with a custom configuration, clamping the threshold.
    #[must_use]
    pub fn with_config(config: SpikeConfig) -> Self {
        let config = config.clamped();
        info!(
            spike_threshold = config.spike_threshold,
            short_window_secs = config.short_window.as_secs(),
            baseline_window_secs = config.baseline_window.as_secs(),
            "spike tracker created"
        );
        Self {
            short: to_chrono(config.short_window).max(Duration::milliseconds(1)),
            baseline: to_chrono(config.baseline_window).max(Duration::milliseconds(1)),
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the effective configuration.
    #[must_use]
    pub fn config(&self) -> &SpikeConfig {
        &self.config
    }

    /// Short-window rate over baseline rate; 1.0 when the baseline is empty.
    #[must_use]
    pub fn spike_ratio(&self, current_count: usize, baseline_count: usize) -> f64 {
        let short_secs = self.short.num_milliseconds() as f64 / 1000.0;
        let baseline_secs = self.baseline.num_milliseconds() as f64 / 1000.0;
        let baseline_rate = baseline_count as f64 / baseline_secs;
        if baseline_rate == 0.0 {
            return 1.0;
        }
        (current_count as f64 / short_secs) / baseline_rate
    }

    /// Returns true if the measurements qualify as a spike.
    #[must_use]
    pub fn is_spike(&self, ratio: f64, current_count: usize, baseline_count: usize) -> bool {
        ratio > self.config.spike_threshold
            && current_count >= self.config.min_current_count
            && baseline_count >= self.config.min_baseline_count
    }

    fn measure(&self, source: &str, w: &mut SourceWindows, now: DateTime<Utc>) -> SpikeStats {
        evict(&mut w.short, now, self.short);
        evict(&mut w.baseline, now, self.baseline);
        let current_count = w.short.len();
        let baseline_count = w.baseline.len();
        let rate_of_change = (w.previous_count > 0).then(|| {
            (current_count as f64 - w.previous_count as f64) / w.previous_count as f64
        });
        SpikeStats {
            source: source.to_string(),
            current_count,
            baseline_count,
            spike_ratio: self.spike_ratio(current_count, baseline_count),
            previous_count: w.previous_count,
            rate_of_change,
        }
    }

    fn evaluate(&self, source: &str, w: &mut SourceWindows, now: DateTime<Utc>) -> Option<Anomaly> {
        let stats = self.measure(source, w, now);
        if !self.is_spike(stats.spike_ratio, stats.current_count, stats.baseline_count) {
            return None;
        }

        let threshold = self.config.spike_threshold;
        let factor = ((stats.spike_ratio - 1.0) / (threshold - 1.0)).min(1.0);
        let severity = AnomalySeverity::grade(
            factor,
            AnomalySeverity::Medium,
            AnomalySeverity::High,
            AnomalySeverity::Critical,
        );
        let roc = stats
            .rate_of_change
            .map_or_else(|| "n/a".to_string(), |r| format!("{:+.0}%", r * 100.0));
        debug!(
            source,
            ratio = stats.spike_ratio,
            current = stats.current_count,
            baseline = stats.baseline_count,
            "spike detected"
        );

        Some(
            Anomaly::new(
                self.name(),
                AnomalyCategory::FrequencySpike,
                severity,
                now - self.short,
                now,
                stats.spike_ratio,
                format!(
                    "Spike detected: {source} ({} events in {}s, {:.1}x baseline, ROC={roc})",
                    stats.current_count,
                    self.short.num_seconds(),
                    stats.spike_ratio
                ),
            )
            .with_source(source)
            .with_samples(w.samples.iter().cloned()),
        )
    }

    /// Returns current measurements for a source, evaluated at its last entry.
    #[must_use]
    pub fn stats(&self, source: &str) -> Option<SpikeStats> {
        let mut state = self.state.lock();
        let w = state.get_mut(source)?;
        let now = w.last_seen?;
        Some(self.measure(source, w, now))
    }

    /// Re-evaluates every source at its last-seen time.
    pub fn check_all_spikes(&self) -> Vec<Anomaly> {
        let mut state = self.state.lock();
        let mut sources: Vec<String> = state.keys().cloned().collect();
        sources.sort();

        sources
            .iter()
            .filter_map(|source| {
                let w = state.get_mut(source)?;
                let now = w.last_seen?;
                self.evaluate(source, w, now)
            })
            .collect()
    }

    /// Number of sources tracked.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.state.lock().len()
    }
}

impl Default for SpikeBaselineTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for SpikeBaselineTracker {
    fn name(&self) -> &'static str {
        "spike"
    }

    fn process(&self, entry: &LogEntry) -> Vec<Anomaly> {
        let Some(source) = entry.source_key() else {
            trace!("spike tracker skipping entry without source");
            return Vec::new();
        };
        let now = entry.timestamp;

        let mut state = self.state.lock();
        let w = state.entry(source.to_string()).or_default();
        w.short.push_back(now);
        w.baseline.push_back(now);
        w.roll_bucket(now, self.short);
        w.samples.push_back(entry.clone());
        while w.samples.len() > self.config.max_samples {
            w.samples.pop_front();
        }
        w.last_seen = Some(w.last_seen.map_or(now, |prev| prev.max(now)));

        self.evaluate(source, w, now).into_iter().collect()
    }

    fn detect_anomalies(&self) -> Vec<Anomaly> {
        self.check_all_spikes()
    }

    fn reset(&self) {
        self.state.lock().clear();
        debug!("spike tracker reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogLevel;
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;

    fn ts_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn entry(ms: i64, source: &str) -> LogEntry {
        LogEntry::new(ts_ms(ms), LogLevel::Info, "query ok").with_source(source)
    }

    fn short_baseline(short: u64, baseline: u64) -> SpikeBaselineTracker {
        SpikeBaselineTracker::with_config(SpikeConfig {
            short_window: StdDuration::from_secs(short),
            baseline_window: StdDuration::from_secs(baseline),
            ..SpikeConfig::default()
        })
    }

    // =========================================================================
    // Ratio and gating
    // =========================================================================

    #[test]
    fn ratio_defaults_to_one_on_empty_baseline() {
        let tracker = short_baseline(10, 60);
        assert!((tracker.spike_ratio(7, 0) - 1.0).abs() < f64::EPSILON);
        // (10 / 10) / (60 / 60)
        assert!((tracker.spike_ratio(10, 60) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn ratio_equal_to_threshold_does_not_fire() {
        let tracker = short_baseline(10, 60);
        // (5 / 10) / (10 / 60) == 3.0
        let ratio = tracker.spike_ratio(5, 10);
        assert!((ratio - 3.0).abs() < 1e-12);
        assert!(!tracker.is_spike(3.0, 5, 10));
        assert!(tracker.is_spike(3.0001, 5, 10));
    }

    #[test]
    fn floors_suppress_small_counts() {
        let tracker = short_baseline(10, 60);
        assert!(!tracker.is_spike(100.0, 4, 50));
        assert!(!tracker.is_spike(100.0, 50, 9));
        assert!(tracker.is_spike(100.0, 5, 10));
    }

    #[test]
    fn threshold_is_clamped() {
        let tracker = SpikeBaselineTracker::with_config(SpikeConfig {
            spike_threshold: 0.5,
            ..SpikeConfig::default()
        });
        assert!((tracker.config().spike_threshold - 1.1).abs() < f64::EPSILON);
    }

    // =========================================================================
    // Streaming behavior
    // =========================================================================

    #[test]
    fn entries_without_source_are_declined() {
        let tracker = SpikeBaselineTracker::new();
        for i in 0..100 {
            assert!(tracker
                .process(&LogEntry::new(ts_ms(i), LogLevel::Info, "x"))
                .is_empty());
        }
        assert_eq!(tracker.source_count(), 0);
    }

    #[test]
    fn steady_rate_does_not_spike() {
        let tracker = short_baseline(10, 60);
        let mut fired = Vec::new();
        for s in 0..300 {
            fired.extend(tracker.process(&entry(s * 1000, "db")));
        }
        // warm-up may report while the baseline fills; a steady stream must not
        assert!(fired.iter().all(|a| a.window_end < ts_ms(30_000)));
        let stats = tracker.stats("db").unwrap();
        assert_eq!(stats.current_count, 11);
        assert_eq!(stats.baseline_count, 61);
        assert!(stats.spike_ratio < 1.2);
    }

    #[test]
    fn burst_after_baseline_spikes() {
        let tracker = short_baseline(10, 60);
        for s in 0..120 {
            tracker.process(&entry(s * 1000, "db"));
        }
        let mut spikes = Vec::new();
        for s in 120..125 {
            for k in 0..50 {
                spikes.extend(tracker.process(&entry(s * 1000 + k * 20, "db")));
            }
        }

        assert!(!spikes.is_empty());
        let last = spikes.last().unwrap();
        assert_eq!(last.category, AnomalyCategory::FrequencySpike);
        assert!(last.score > 3.0);
        assert_eq!(last.source.as_deref(), Some("db"));
        assert_eq!(last.samples.len(), 5);
        assert!(last.description.starts_with("Spike detected: db ("));

        let stats = tracker.stats("db").unwrap();
        assert!(stats.current_count >= 5);
        assert!(stats.spike_ratio > 3.0);
        assert!(stats.rate_of_change.is_some());
    }

    #[test]
    fn previous_count_tracks_last_interval() {
        let tracker = short_baseline(10, 60);
        for s in 0..10 {
            tracker.process(&entry(s * 1000, "api"));
        }
        tracker.process(&entry(10_000, "api"));
        assert_eq!(tracker.stats("api").unwrap().previous_count, 10);

        // skipping a whole interval resets the comparison point
        tracker.process(&entry(35_000, "api"));
        assert_eq!(tracker.stats("api").unwrap().previous_count, 0);
        assert!(tracker.stats("api").unwrap().rate_of_change.is_none());
    }

    #[test]
    fn check_all_spikes_uses_last_seen() {
        let tracker = short_baseline(10, 60);
        for s in 0..60 {
            tracker.process(&entry(s * 1000, "db"));
        }
        for k in 0..100 {
            tracker.process(&entry(60_000 + k * 10, "db"));
        }
        let found = tracker.check_all_spikes();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].window_end, ts_ms(60_990));
    }

    #[test]
    fn reset_clears_sources() {
        let tracker = SpikeBaselineTracker::new();
        tracker.process(&entry(0, "db"));
        tracker.reset();
        assert!(tracker.stats("db").is_none());
    }
}
