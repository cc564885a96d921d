//! Per-source event-rate model with Z-score outlier detection.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{StatisticalConfig, to_chrono};
use crate::traits::Detector;
use crate::types::{Anomaly, AnomalyCategory, AnomalySeverity, LogEntry};

/// Running mean and variance via Welford's algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OnlineStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl OnlineStats {
    /// Creates empty statistics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    /// Adds a sample.
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Number of samples.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Running mean.
    #[must_use]
    pub const fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance; zero with fewer than two samples.
    #[must_use]
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    /// Sample standard deviation.
    #[must_use]
    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Z-score of `value`, or zero during warm-up or with no spread.
    #[must_use]
    pub fn z_score(&self, value: f64, min_samples: u64) -> f64 {
        let sd = self.stddev();
        if self.count < min_samples || sd == 0.0 {
            return 0.0;
        }
        (value - self.mean) / sd
    }
}

/// Snapshot of one source's rate model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateStats {
    /// Source name.
    pub source: String,
    /// Rate samples seen.
    pub count: u64,
    /// Mean rate in events per minute.
    pub mean: f64,
    /// Standard deviation of the rate.
    pub stddev: f64,
    /// Most recent rate sample.
    pub last_rate: f64,
    /// Z-score of the most recent sample.
    pub last_z: f64,
    /// Mean of the most recent samples.
    pub moving_average: f64,
    /// Exponentially weighted average of the rate.
    pub ewma: f64,
    /// When the model was last fed.
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SourceModel {
    stats: OnlineStats,
    timestamps: VecDeque<DateTime<Utc>>,
    recent: VecDeque<f64>,
    ewma: Option<f64>,
    last_rate: f64,
    last_z: f64,
    last_seen: Option<DateTime<Utc>>,
}

impl SourceModel {
    fn push_timestamp(&mut self, ts: DateTime<Utc>, window: Duration, cap: usize) -> f64 {
        self.timestamps.push_back(ts);
        while self.timestamps.front().is_some_and(|t| ts - *t > window) {
            self.timestamps.pop_front();
        }
        while self.timestamps.len() > cap {
            self.timestamps.pop_front();
        }
        rate_per_minute(&self.timestamps, window)
    }

    fn snapshot(&self, source: &str) -> RateStats {
        let moving_average = if self.recent.is_empty() {
            0.0
        } else {
            self.recent.iter().sum::<f64>() / self.recent.len() as f64
        };
        RateStats {
            source: source.to_string(),
            count: self.stats.count(),
            mean: self.stats.mean(),
            stddev: self.stats.stddev(),
            last_rate: self.last_rate,
            last_z: self.last_z,
            moving_average,
            ewma: self.ewma.unwrap_or(0.0),
            last_seen: self.last_seen,
        }
    }
}

/// Events per minute over the retained timestamps.
fn rate_per_minute(timestamps: &VecDeque<DateTime<Utc>>, window: Duration) -> f64 {
    let n = timestamps.len() as f64;
    match (timestamps.front(), timestamps.back()) {
        (Some(first), Some(last)) if timestamps.len() >= 2 => {
            let span_secs = ((*last - *first).num_milliseconds() as f64 / 1000.0).max(1.0);
            n * 60.0 / span_secs
        }
        _ => n * 60.0 / (window.num_seconds().max(1) as f64),
    }
}

#[derive(Debug, Default)]
struct ModelState {
    sources: HashMap<String, SourceModel>,
    global: OnlineStats,
}

/// Per-source rate model flagging rates far from their running mean.
///
/// Each rate is scored against the baseline as it stood before that rate
/// was added, so an outlier never dilutes its own Z-score.
#[derive(Debug)]
pub struct OnlineStatisticalModel {
    config: StatisticalConfig,
    rate_window: Duration,
    state: Mutex<ModelState>,
}

impl OnlineStatisticalModel {
    /// Creates a model with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StatisticalConfig::default())
    }

    /// Creates a model with a custom configuration, clamping out-of-range values.
    #[must_use]
    pub fn with_config(config: StatisticalConfig) -> Self {
        let config = config.clamped();
        info!(
            z_threshold = config.z_threshold,
            rate_window_secs = config.rate_window.as_secs(),
            min_samples = config.min_samples,
            "statistical model created"
        );
        Self {
            rate_window: to_chrono(config.rate_window),
            config,
            state: Mutex::new(ModelState::default()),
        }
    }

    /// Returns the effective configuration.
    #[must_use]
    pub fn config(&self) -> &StatisticalConfig {
        &self.config
    }

    /// Feeds a pre-computed rate sample for `source`.
    ///
    /// Returns an anomaly if the sample is an outlier against the source's
    /// history before this sample.
    pub fn observe_rate(&self, source: &str, rate: f64, at: DateTime<Utc>) -> Option<Anomaly> {
        let mut state = self.state.lock();
        let z = self.record(&mut state, source, rate, at);
        drop(state);
        self.outlier(source, rate, z, at)
    }

    fn record(&self, state: &mut ModelState, source: &str, rate: f64, at: DateTime<Utc>) -> f64 {
        state.global.update(rate);
        let model = state.sources.entry(source.to_string()).or_default();
        self.apply_sample(model, rate, at)
    }

    fn apply_sample(&self, model: &mut SourceModel, rate: f64, at: DateTime<Utc>) -> f64 {
        let z = model.stats.z_score(rate, self.config.min_samples);
        model.stats.update(rate);

        model.recent.push_back(rate);
        while model.recent.len() > self.config.sample_window {
            model.recent.pop_front();
        }
        let alpha = self.config.smoothing_factor;
        model.ewma = Some(match model.ewma {
            Some(prev) => alpha * rate + (1.0 - alpha) * prev,
            None => rate,
        });
        model.last_rate = rate;
        model.last_z = z;
        model.last_seen = Some(at);
        z
    }

    fn outlier(&self, source: &str, rate: f64, z: f64, at: DateTime<Utc>) -> Option<Anomaly> {
        let threshold = self.config.z_threshold;
        if z.abs() <= threshold {
            return None;
        }
        let factor = (z.abs() / threshold).min(1.0);
        let severity = AnomalySeverity::grade(
            factor,
            AnomalySeverity::Low,
            AnomalySeverity::Medium,
            AnomalySeverity::High,
        );
        debug!(source, rate, z, "statistical outlier");
        Some(
            Anomaly::new(
                self.name(),
                AnomalyCategory::StatisticalOutlier,
                severity,
                at,
                at,
                z,
                format!("Statistical outlier: {source} rate {rate:.2}/min (z={z:.2})"),
            )
            .with_source(source),
        )
    }

    /// Returns the snapshot for one source.
    #[must_use]
    pub fn stats(&self, source: &str) -> Option<RateStats> {
        self.state
            .lock()
            .sources
            .get(source)
            .map(|m| m.snapshot(source))
    }

    /// Returns snapshots for every source, sorted by name.
    #[must_use]
    pub fn all_stats(&self) -> Vec<RateStats> {
        let state = self.state.lock();
        let mut all: Vec<_> = state
            .sources
            .iter()
            .map(|(name, m)| m.snapshot(name))
            .collect();
        all.sort_by(|a, b| a.source.cmp(&b.source));
        all
    }

    /// Returns the cross-source statistics over every rate sample.
    #[must_use]
    pub fn global_stats(&self) -> OnlineStats {
        self.state.lock().global
    }
}

impl Default for OnlineStatisticalModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for OnlineStatisticalModel {
    fn name(&self) -> &'static str {
        "statistical"
    }

    fn process(&self, entry: &LogEntry) -> Vec<Anomaly> {
        let source = entry.source_or_unknown();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let model = state.sources.entry(source.to_string()).or_default();
        let rate = model.push_timestamp(
            entry.timestamp,
            self.rate_window,
            self.config.max_rate_timestamps,
        );
        let z = self.apply_sample(model, rate, entry.timestamp);
        state.global.update(rate);
        drop(guard);

        self.outlier(source, rate, z, entry.timestamp)
            .map(|a| a.with_samples([entry.clone()]))
            .into_iter()
            .collect()
    }

    fn detect_anomalies(&self) -> Vec<Anomaly> {
        let state = self.state.lock();
        let mut flagged: Vec<(String, f64, f64, DateTime<Utc>)> = state
            .sources
            .iter()
            .filter(|(_, m)| m.last_z.abs() > self.config.z_threshold)
            .filter_map(|(name, m)| Some((name.clone(), m.last_rate, m.last_z, m.last_seen?)))
            .collect();
        drop(state);
        flagged.sort_by(|a, b| a.0.cmp(&b.0));

        flagged
            .into_iter()
            .filter_map(|(source, rate, z, at)| self.outlier(&source, rate, z, at))
            .collect()
    }

    fn reset(&self) {
        *self.state.lock() = ModelState::default();
        debug!("statistical model reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogLevel;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    // =========================================================================
    // OnlineStats
    // =========================================================================

    #[test]
    fn welford_basic() {
        let mut s = OnlineStats::new();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            s.update(v);
        }
        assert_eq!(s.count(), 8);
        assert!((s.mean() - 5.0).abs() < 1e-12);
        assert!((s.variance() - 32.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn variance_zero_below_two_samples() {
        let mut s = OnlineStats::new();
        assert!(s.variance().abs() < f64::EPSILON);
        s.update(42.0);
        assert!(s.variance().abs() < f64::EPSILON);
    }

    #[test]
    fn z_score_boundary_is_strict() {
        // mean 10, variance 36 / 9 = 4, stddev 2
        let baseline = OnlineStats {
            count: 10,
            mean: 10.0,
            m2: 36.0,
        };
        let model = OnlineStatisticalModel::new();

        let z_at = baseline.z_score(16.0, 10);
        assert!((z_at - 3.0).abs() < 1e-12);
        assert!(model.outlier("db", 16.0, z_at, ts(0)).is_none());

        let z_beyond = baseline.z_score(16.01, 10);
        assert!(model.outlier("db", 16.01, z_beyond, ts(0)).is_some());
    }

    #[test]
    fn z_score_guards() {
        let flat = OnlineStats {
            count: 50,
            mean: 3.0,
            m2: 0.0,
        };
        assert!(flat.z_score(100.0, 10).abs() < f64::EPSILON);

        let young = OnlineStats {
            count: 9,
            mean: 3.0,
            m2: 8.0,
        };
        assert!(young.z_score(100.0, 10).abs() < f64::EPSILON);
    }

    // =========================================================================
    // Model
    // =========================================================================

    #[test]
    fn warm_up_suppresses_first_nine_samples() {
        let model = OnlineStatisticalModel::new();
        let rates = [1.0, 1000.0, 2.0, 5000.0, 0.0, 3.0, 9000.0, 1.0, 100_000.0];
        for (i, rate) in rates.iter().enumerate() {
            assert!(model.observe_rate("api", *rate, ts(i as i64)).is_none());
        }
        assert_eq!(model.stats("api").unwrap().count, 9);
    }

    #[test]
    fn outlier_after_stable_baseline() {
        let model = OnlineStatisticalModel::new();
        for i in 0..20 {
            let rate = if i % 2 == 0 { 10.0 } else { 12.0 };
            assert!(model.observe_rate("api", rate, ts(i)).is_none());
        }
        let anomaly = model.observe_rate("api", 50.0, ts(20)).unwrap();
        assert_eq!(anomaly.category, AnomalyCategory::StatisticalOutlier);
        assert_eq!(anomaly.severity, AnomalySeverity::High);
        assert_eq!(anomaly.source.as_deref(), Some("api"));
        assert!(anomaly.score > 3.0);

        let flagged = model.detect_anomalies();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].source.as_deref(), Some("api"));
    }

    #[test]
    fn sample_scored_against_prior_baseline() {
        let model = OnlineStatisticalModel::new();
        let mut prior = OnlineStats::new();
        for i in 0..10 {
            let rate = if i % 2 == 0 { 10.0 } else { 12.0 };
            model.observe_rate("api", rate, ts(i));
            prior.update(rate);
        }
        model.observe_rate("api", 20.0, ts(10));

        let expected = prior.z_score(20.0, 10);
        let last_z = model.stats("api").unwrap().last_z;
        assert!((last_z - expected).abs() < 1e-12);

        prior.update(20.0);
        assert!(last_z > prior.z_score(20.0, 10));
    }

    #[test]
    fn rate_from_entries() {
        let model = OnlineStatisticalModel::new();
        let e = |s| LogEntry::new(ts(s), LogLevel::Info, "tick").with_source("db");

        model.process(&e(0));
        // single timestamp: 1 * 60 / 600
        assert!((model.stats("db").unwrap().last_rate - 0.1).abs() < 1e-12);

        model.process(&e(30));
        // two timestamps over 30s: 2 * 60 / 30
        assert!((model.stats("db").unwrap().last_rate - 4.0).abs() < 1e-12);
    }

    #[test]
    fn rate_window_evicts_old_timestamps() {
        let model = OnlineStatisticalModel::with_config(StatisticalConfig {
            rate_window: std::time::Duration::from_secs(60),
            ..StatisticalConfig::default()
        });
        let e = |s| LogEntry::new(ts(s), LogLevel::Info, "tick").with_source("db");
        model.process(&e(0));
        model.process(&e(10));
        model.process(&e(200));
        // only the newest timestamp survives: 1 * 60 / 60
        assert!((model.stats("db").unwrap().last_rate - 1.0).abs() < 1e-12);
    }

    #[test]
    fn missing_source_uses_placeholder_and_global_model() {
        let model = OnlineStatisticalModel::new();
        model.process(&LogEntry::new(ts(0), LogLevel::Info, "x"));
        model.process(&LogEntry::new(ts(1), LogLevel::Info, "y").with_source("api"));

        assert!(model.stats(crate::types::UNKNOWN_SOURCE).is_some());
        assert_eq!(model.global_stats().count(), 2);
        assert_eq!(model.all_stats().len(), 2);
    }

    #[test]
    fn moving_average_and_ewma() {
        let model = OnlineStatisticalModel::with_config(StatisticalConfig {
            smoothing_factor: 0.5,
            ..StatisticalConfig::default()
        });
        model.observe_rate("a", 10.0, ts(0));
        model.observe_rate("a", 20.0, ts(1));
        let s = model.stats("a").unwrap();
        assert!((s.moving_average - 15.0).abs() < 1e-12);
        assert!((s.ewma - 15.0).abs() < 1e-12);
    }

    #[test]
    fn reset_clears_sources() {
        let model = OnlineStatisticalModel::new();
        model.observe_rate("a", 1.0, ts(0));
        model.reset();
        assert!(model.stats("a").is_none());
        assert_eq!(model.global_stats().count(), 0);
    }

    // =========================================================================
    // Properties
    // =========================================================================

    proptest! {
        #[test]
        fn welford_matches_two_pass(values in proptest::collection::vec(-1.0e6f64..1.0e6, 2..200)) {
            let mut s = OnlineStats::new();
            for v in &values {
                s.update(*v);
            }
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);

            prop_assert!((s.mean() - mean).abs() <= 1e-6 * mean.abs().max(1.0));
            prop_assert!((s.variance() - var).abs() <= 1e-6 * var.abs().max(1.0));
        }

        #[test]
        fn warm_up_never_flags(rates in proptest::collection::vec(0.0f64..1.0e9, 1..10)) {
            let model = OnlineStatisticalModel::new();
            for (i, rate) in rates.iter().enumerate() {
                prop_assert!(model.observe_rate("src", *rate, ts(i as i64)).is_none());
            }
        }
    }
}
