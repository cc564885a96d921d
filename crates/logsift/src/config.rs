//! Detector configuration.
//!
//! Every detector has its own config struct with defaults suited to
//! minute-scale log streams. [`EngineConfig`] aggregates them and can be
//! populated from a flat [`ConfigView`] produced by an external loader.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SiftError};

/// Parses a bool-like string (`1/true/yes/on`, `0/false/no/off`).
#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Converts a std duration into a chrono duration, saturating on overflow.
#[must_use]
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 1000))
}

/// An already-parsed, flat key/value configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigView {
    values: BTreeMap<String, String>,
}

impl ConfigView {
    /// Creates an empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a key, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values.insert(key.into(), value.into())
    }

    /// Adds a key in builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Returns the raw value for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns true if the key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates keys starting with `prefix`, in key order.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.values
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parses a value with [`FromStr`].
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|e| SiftError::invalid_config(key, e.to_string()))
            })
            .transpose()
    }

    /// Parses a float value.
    pub fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        self.get_parsed(key)
    }

    /// Parses an unsigned integer value.
    pub fn get_usize(&self, key: &str) -> Result<Option<usize>> {
        self.get_parsed(key)
    }

    /// Parses a bool-like value.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        self.get(key)
            .map(|raw| {
                parse_bool(raw)
                    .ok_or_else(|| SiftError::invalid_config(key, format!("not a boolean: {raw}")))
            })
            .transpose()
    }

    /// Parses a whole number of seconds.
    pub fn get_secs(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.get_parsed::<u64>(key)?.map(Duration::from_secs))
    }

    fn read<T>(&self, key: &str, target: &mut T) -> Result<()>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(value) = self.get_parsed(key)? {
            *target = value;
        }
        Ok(())
    }

    fn read_bool(&self, key: &str, target: &mut bool) -> Result<()> {
        if let Some(value) = self.get_bool(key)? {
            *target = value;
        }
        Ok(())
    }

    fn read_secs(&self, key: &str, target: &mut Duration) -> Result<()> {
        if let Some(value) = self.get_secs(key)? {
            *target = value;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConfigView {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Configuration for the tumbling-window frequency tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Length of each tumbling window.
    pub window_size: Duration,
    /// Error/total ratio above which a window is flagged.
    pub error_rate_threshold: f64,
    /// Event count above which a window is flagged.
    pub burst_threshold: usize,
    /// Gap between windows above which silence is flagged.
    pub silence_threshold: Duration,
    /// Number of retired windows kept.
    pub max_history: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: Duration::from_secs(60),
            error_rate_threshold: 0.5,
            burst_threshold: 100,
            silence_threshold: Duration::from_secs(300),
            max_history: 12,
        }
    }
}

/// Configuration for the per-source rate model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticalConfig {
    /// Absolute Z-score above which an entry is an outlier.
    pub z_threshold: f64,
    /// Span of timestamps used to compute a source's rate.
    pub rate_window: Duration,
    /// Samples required before a Z-score is meaningful.
    pub min_samples: u64,
    /// Size of the moving-average sample window.
    pub sample_window: usize,
    /// Weight of the newest sample in the exponential average.
    pub smoothing_factor: f64,
    /// Hard cap on timestamps retained per source.
    pub max_rate_timestamps: usize,
}

impl Default for StatisticalConfig {
    fn default() -> Self {
        Self {
            z_threshold: 3.0,
            rate_window: Duration::from_secs(600),
            min_samples: 10,
            sample_window: 100,
            smoothing_factor: 0.1,
            max_rate_timestamps: 10_000,
        }
    }
}

impl StatisticalConfig {
    /// Returns a copy with out-of-range values clamped.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.z_threshold = self.z_threshold.max(1.0);
        self.sample_window = self.sample_window.max(10);
        self.smoothing_factor = self.smoothing_factor.clamp(0.01, 0.5);
        self.max_rate_timestamps = self.max_rate_timestamps.max(2);
        self
    }
}

/// Configuration for the short-vs-baseline spike tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeConfig {
    /// Ratio of short-window rate to baseline rate that counts as a spike.
    pub spike_threshold: f64,
    /// Length of the short (current activity) window.
    pub short_window: Duration,
    /// Length of the baseline window.
    pub baseline_window: Duration,
    /// Sample entries retained per source.
    pub max_samples: usize,
    /// Minimum events in the short window.
    pub min_current_count: usize,
    /// Minimum events in the baseline window.
    pub min_baseline_count: usize,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            spike_threshold: 3.0,
            short_window: Duration::from_secs(60),
            baseline_window: Duration::from_secs(600),
            max_samples: 5,
            min_current_count: 5,
            min_baseline_count: 10,
        }
    }
}

impl SpikeConfig {
    /// Returns a copy with out-of-range values clamped.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.spike_threshold = self.spike_threshold.max(1.1);
        self
    }
}

/// Configuration for the repeated-message burst tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurstConfig {
    /// Sliding window over which repeats are counted.
    pub window: Duration,
    /// Repeats within the window that trigger a burst.
    pub min_repeats: usize,
    /// Sample entries attached to a burst.
    pub max_samples: usize,
    /// Distinct signatures tracked before the stalest is evicted.
    pub max_signatures: usize,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            min_repeats: 20,
            max_samples: 5,
            max_signatures: 10_000,
        }
    }
}

/// Configuration for the event-sequence tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Number of recent events considered.
    pub window_size: usize,
    /// Example entries retained per sequence.
    pub max_examples: usize,
    /// Leading message words kept in an event signature.
    pub prefix_words: usize,
    /// Idle time after which a pattern is considered stale.
    pub pattern_timeout: Duration,
    /// Distinct sequences tracked before stale ones are evicted.
    pub max_patterns: usize,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            max_examples: 3,
            prefix_words: 3,
            pattern_timeout: Duration::from_secs(30 * 60),
            max_patterns: 50_000,
        }
    }
}

/// Default value extractor: IPv4-shaped tokens.
pub const DEFAULT_RARE_PATTERN: &str = r"\b\d{1,3}(?:\.\d{1,3}){3}\b";

/// Configuration for the rare-value tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RareValueConfig {
    /// Sightings up to and including this count are rare.
    pub max_count_for_rare: u64,
    /// Distinct values tracked before the oldest is evicted.
    pub max_tracked_values: usize,
    /// Extraction regex; capture group 1 is used when present.
    pub pattern: String,
}

impl Default for RareValueConfig {
    fn default() -> Self {
        Self {
            max_count_for_rare: 5,
            max_tracked_values: 100_000,
            pattern: DEFAULT_RARE_PATTERN.to_string(),
        }
    }
}

/// Configuration for the per-source/per-prefix frequency profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyConfig {
    /// Source count over the mean per-source count that counts as a spike.
    pub spike_multiplier: f64,
    /// Prefixes seen fewer times than this are rare.
    pub min_occurrences: u64,
    /// Leading message words forming a prefix.
    pub prefix_words: usize,
    /// Distinct message prefixes tracked.
    pub max_prefixes: usize,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            spike_multiplier: 3.0,
            min_occurrences: 2,
            prefix_words: 3,
            max_prefixes: 100_000,
        }
    }
}

/// Configuration for the rule engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEngineConfig {
    /// Severity given to rules that do not set one.
    pub default_severity: f64,
    /// Threshold given to threshold rules that do not set one.
    pub default_frequency_threshold: u64,
    /// Window given to threshold rules that do not set one.
    pub default_time_window: Duration,
    /// Multiplier given to adaptive rules that do not set one.
    pub default_adaptive_multiplier: f64,
    /// Global switch for adaptive threshold scaling.
    pub adaptive_thresholds: bool,
    /// Whether per-entry results are cached.
    pub enable_cache: bool,
    /// Cached entries before the oldest is evicted.
    pub max_cache_entries: usize,
    /// Timestamps retained per threshold counter.
    pub counter_capacity: usize,
    /// Whether the built-in ERROR/CRITICAL keyword rules are installed.
    pub install_default_rules: bool,
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self {
            default_severity: 0.8,
            default_frequency_threshold: 5,
            default_time_window: Duration::from_secs(60),
            default_adaptive_multiplier: 1.5,
            adaptive_thresholds: false,
            enable_cache: true,
            max_cache_entries: 10_000,
            counter_capacity: 1000,
            install_default_rules: true,
        }
    }
}

/// Configuration for every detector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tumbling-window tracker.
    #[serde(default)]
    pub window: WindowConfig,
    /// Rate model.
    #[serde(default)]
    pub statistical: StatisticalConfig,
    /// Spike tracker.
    #[serde(default)]
    pub spike: SpikeConfig,
    /// Burst tracker.
    #[serde(default)]
    pub burst: BurstConfig,
    /// Sequence tracker.
    #[serde(default)]
    pub sequence: SequenceConfig,
    /// Rare-value tracker.
    #[serde(default)]
    pub rare: RareValueConfig,
    /// Frequency profile.
    #[serde(default)]
    pub frequency: FrequencyConfig,
    /// Rule engine.
    #[serde(default)]
    pub rules: RuleEngineConfig,
}

impl EngineConfig {
    /// Builds a config from a flat view, keeping defaults for missing keys.
    ///
    /// Fails if a present key cannot be parsed or the result is invalid.
    pub fn from_view(view: &ConfigView) -> Result<Self> {
        let mut cfg = Self::default();

        let w = &mut cfg.window;
        view.read_secs("window.size_secs", &mut w.window_size)?;
        view.read("window.error_rate_threshold", &mut w.error_rate_threshold)?;
        view.read("window.burst_threshold", &mut w.burst_threshold)?;
        view.read_secs("window.silence_secs", &mut w.silence_threshold)?;
        view.read("window.max_history", &mut w.max_history)?;

        let s = &mut cfg.statistical;
        view.read("statistical.z_threshold", &mut s.z_threshold)?;
        view.read_secs("statistical.rate_window_secs", &mut s.rate_window)?;
        view.read("statistical.min_samples", &mut s.min_samples)?;
        view.read("statistical.sample_window", &mut s.sample_window)?;
        view.read("statistical.smoothing_factor", &mut s.smoothing_factor)?;

        let sp = &mut cfg.spike;
        view.read("spike.threshold", &mut sp.spike_threshold)?;
        view.read_secs("spike.short_window_secs", &mut sp.short_window)?;
        view.read_secs("spike.baseline_window_secs", &mut sp.baseline_window)?;
        view.read("spike.max_samples", &mut sp.max_samples)?;
        view.read("spike.min_current_count", &mut sp.min_current_count)?;
        view.read("spike.min_baseline_count", &mut sp.min_baseline_count)?;

        let b = &mut cfg.burst;
        view.read_secs("burst.window_secs", &mut b.window)?;
        view.read("burst.min_repeats", &mut b.min_repeats)?;
        view.read("burst.max_samples", &mut b.max_samples)?;
        view.read("burst.max_signatures", &mut b.max_signatures)?;

        let q = &mut cfg.sequence;
        view.read("sequence.window_size", &mut q.window_size)?;
        view.read("sequence.max_examples", &mut q.max_examples)?;
        view.read("sequence.prefix_words", &mut q.prefix_words)?;
        view.read_secs("sequence.pattern_timeout_secs", &mut q.pattern_timeout)?;
        view.read("sequence.max_patterns", &mut q.max_patterns)?;

        let r = &mut cfg.rare;
        view.read("rare.max_count", &mut r.max_count_for_rare)?;
        view.read("rare.max_tracked", &mut r.max_tracked_values)?;
        if let Some(pattern) = view.get("rare.pattern") {
            r.pattern = pattern.to_string();
        }

        let f = &mut cfg.frequency;
        view.read("frequency.spike_multiplier", &mut f.spike_multiplier)?;
        view.read("frequency.min_occurrences", &mut f.min_occurrences)?;
        view.read("frequency.prefix_words", &mut f.prefix_words)?;
        view.read("frequency.max_prefixes", &mut f.max_prefixes)?;

        let ru = &mut cfg.rules;
        view.read("rules.default_severity", &mut ru.default_severity)?;
        view.read("rules.frequency_threshold", &mut ru.default_frequency_threshold)?;
        view.read_secs("rules.time_window_secs", &mut ru.default_time_window)?;
        view.read("rules.adaptive_multiplier", &mut ru.default_adaptive_multiplier)?;
        view.read_bool("rules.adaptive", &mut ru.adaptive_thresholds)?;
        view.read_bool("rules.cache", &mut ru.enable_cache)?;
        view.read("rules.max_cache_entries", &mut ru.max_cache_entries)?;
        view.read("rules.counter_capacity", &mut ru.counter_capacity)?;
        view.read_bool("rules.install_defaults", &mut ru.install_default_rules)?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects zero-length windows and zero capacities.
    pub fn validate(&self) -> Result<()> {
        fn nonzero_duration(key: &str, d: Duration) -> Result<()> {
            if d.is_zero() {
                return Err(SiftError::invalid_config(key, "must be greater than zero"));
            }
            Ok(())
        }
        fn nonzero(key: &str, n: usize) -> Result<()> {
            if n == 0 {
                return Err(SiftError::invalid_config(key, "must be greater than zero"));
            }
            Ok(())
        }
        fn finite(key: &str, v: f64) -> Result<()> {
            if !v.is_finite() || v < 0.0 {
                return Err(SiftError::invalid_config(key, "must be a finite non-negative number"));
            }
            Ok(())
        }

        nonzero_duration("window.size_secs", self.window.window_size)?;
        finite("window.error_rate_threshold", self.window.error_rate_threshold)?;
        nonzero("window.burst_threshold", self.window.burst_threshold)?;
        nonzero_duration("window.silence_secs", self.window.silence_threshold)?;
        nonzero("window.max_history", self.window.max_history)?;

        finite("statistical.z_threshold", self.statistical.z_threshold)?;
        nonzero_duration("statistical.rate_window_secs", self.statistical.rate_window)?;
        finite("statistical.smoothing_factor", self.statistical.smoothing_factor)?;

        finite("spike.threshold", self.spike.spike_threshold)?;
        nonzero_duration("spike.short_window_secs", self.spike.short_window)?;
        nonzero_duration("spike.baseline_window_secs", self.spike.baseline_window)?;

        nonzero_duration("burst.window_secs", self.burst.window)?;
        nonzero("burst.min_repeats", self.burst.min_repeats)?;
        nonzero("burst.max_signatures", self.burst.max_signatures)?;

        if self.sequence.window_size < 2 {
            return Err(SiftError::invalid_config(
                "sequence.window_size",
                "must be at least 2",
            ));
        }
        nonzero("sequence.prefix_words", self.sequence.prefix_words)?;
        nonzero("sequence.max_patterns", self.sequence.max_patterns)?;

        nonzero("rare.max_tracked", self.rare.max_tracked_values)?;
        if self.rare.pattern.is_empty() {
            return Err(SiftError::invalid_config("rare.pattern", "must not be empty"));
        }

        finite("frequency.spike_multiplier", self.frequency.spike_multiplier)?;
        nonzero("frequency.prefix_words", self.frequency.prefix_words)?;
        nonzero("frequency.max_prefixes", self.frequency.max_prefixes)?;

        finite("rules.default_severity", self.rules.default_severity)?;
        finite("rules.adaptive_multiplier", self.rules.default_adaptive_multiplier)?;
        nonzero_duration("rules.time_window_secs", self.rules.default_time_window)?;
        nonzero("rules.max_cache_entries", self.rules.max_cache_entries)?;
        nonzero("rules.counter_capacity", self.rules.counter_capacity)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    // =========================================================================
    // Bool parsing
    // =========================================================================

    #[test_case("1", Some(true) ; "one")]
    #[test_case("TRUE", Some(true) ; "upper true")]
    #[test_case("Yes", Some(true) ; "yes")]
    #[test_case("on", Some(true) ; "on")]
    #[test_case("0", Some(false) ; "zero")]
    #[test_case("False", Some(false) ; "false")]
    #[test_case("NO", Some(false) ; "no")]
    #[test_case(" off ", Some(false) ; "padded off")]
    #[test_case("maybe", None ; "garbage")]
    fn bool_like_values(input: &str, expected: Option<bool>) {
        assert_eq!(parse_bool(input), expected);
    }

    // =========================================================================
    // ConfigView
    // =========================================================================

    #[test]
    fn view_typed_getters() {
        let view = ConfigView::new()
            .with("a.float", "2.5")
            .with("a.int", "7")
            .with("a.flag", "yes")
            .with("a.secs", "90")
            .with("a.bad", "x");

        assert_eq!(view.get_f64("a.float").unwrap(), Some(2.5));
        assert_eq!(view.get_usize("a.int").unwrap(), Some(7));
        assert_eq!(view.get_bool("a.flag").unwrap(), Some(true));
        assert_eq!(view.get_secs("a.secs").unwrap(), Some(Duration::from_secs(90)));
        assert_eq!(view.get_f64("missing").unwrap(), None);
        assert!(view.get_usize("a.bad").is_err());
        assert!(view.get_bool("a.bad").is_err());
    }

    #[test]
    fn view_prefix_iteration_is_ordered_and_scoped() {
        let view: ConfigView = [
            ("rule.b", "2"),
            ("rule.a", "1"),
            ("rules.adaptive", "on"),
            ("other", "x"),
            ("rule.a.enabled", "no"),
        ]
        .into_iter()
        .collect();

        let keys: Vec<_> = view.with_prefix("rule.").map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["rule.a", "rule.a.enabled", "rule.b"]);
    }

    // =========================================================================
    // EngineConfig
    // =========================================================================

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.window.window_size, Duration::from_secs(60));
        assert_eq!(cfg.burst.min_repeats, 20);
        assert_eq!(cfg.rare.max_count_for_rare, 5);
        assert!((cfg.rules.default_severity - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn from_view_overrides_present_keys() {
        let view = ConfigView::new()
            .with("spike.short_window_secs", "10")
            .with("spike.baseline_window_secs", "60")
            .with("burst.min_repeats", "4")
            .with("rules.adaptive", "on")
            .with("rare.pattern", r"user=(\w+)");

        let cfg = EngineConfig::from_view(&view).unwrap();
        assert_eq!(cfg.spike.short_window, Duration::from_secs(10));
        assert_eq!(cfg.spike.baseline_window, Duration::from_secs(60));
        assert_eq!(cfg.burst.min_repeats, 4);
        assert!(cfg.rules.adaptive_thresholds);
        assert_eq!(cfg.rare.pattern, r"user=(\w+)");
        assert_eq!(cfg.window.max_history, 12);
    }

    #[test]
    fn from_view_rejects_unparseable_value() {
        let view = ConfigView::new().with("window.size_secs", "soon");
        let err = EngineConfig::from_view(&view).unwrap_err();
        assert!(err.to_string().contains("window.size_secs"));
    }

    #[test]
    fn from_view_rejects_zero_window() {
        let view = ConfigView::new().with("burst.window_secs", "0");
        assert!(EngineConfig::from_view(&view).is_err());
    }

    #[test]
    fn clamping_applies_floors() {
        let stats = StatisticalConfig {
            z_threshold: 0.2,
            sample_window: 3,
            smoothing_factor: 0.9,
            ..StatisticalConfig::default()
        }
        .clamped();
        assert!((stats.z_threshold - 1.0).abs() < f64::EPSILON);
        assert_eq!(stats.sample_window, 10);
        assert!((stats.smoothing_factor - 0.5).abs() < f64::EPSILON);

        let spike = SpikeConfig {
            spike_threshold: 1.0,
            ..SpikeConfig::default()
        }
        .clamped();
        assert!((spike.spike_threshold - 1.1).abs() < f64::EPSILON);
    }

    #[test]
    fn config_serializes() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
