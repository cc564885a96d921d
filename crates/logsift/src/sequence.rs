//! Event-sequence pattern tracking.
//!
//! Keeps the most recent events as compact signatures and, on every event,
//! re-counts each contiguous run of the window at every offset, so a run
//! that stays in the window is counted again with each arrival. Sequences
//! seen only once, and especially ones involving error events, are reported.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{SequenceConfig, to_chrono};
use crate::traits::Detector;
use crate::types::{Anomaly, AnomalyCategory, AnomalySeverity, LogEntry};

const PREFIX_CHARS: usize = 20;
const HIGH_SEVERITY_TOKENS: [&str; 3] = ["ERROR", "CRITICAL", "FATAL"];

/// Reduces an entry to `source:LEVEL:prefix`.
#[must_use]
pub fn event_signature(entry: &LogEntry, prefix_words: usize) -> String {
    let prefix: String = entry
        .message
        .split_whitespace()
        .take(prefix_words)
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(PREFIX_CHARS)
        .collect();
    format!(
        "{}:{}:{}",
        entry.source_or_unknown(),
        entry.level.label(),
        prefix
    )
}

/// Bookkeeping for one observed sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencePattern {
    /// Event signatures joined with `->`.
    pub signature: String,
    /// Times the sequence occurred.
    pub frequency: u64,
    /// First occurrence.
    pub first_seen: DateTime<Utc>,
    /// Latest occurrence.
    pub last_seen: DateTime<Utc>,
    /// Error-like events in the sequence.
    pub error_events: usize,
    /// The most recent entries that were counted against the sequence,
    /// oldest first.
    pub examples: Vec<LogEntry>,
}

impl SequencePattern {
    /// Returns true if the signature mentions an error-class token.
    #[must_use]
    pub fn is_high_severity(&self) -> bool {
        HIGH_SEVERITY_TOKENS
            .iter()
            .any(|tok| self.signature.contains(tok))
    }
}

/// Aggregate view over tracked sequences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternStats {
    /// Distinct sequences tracked.
    pub total_patterns: usize,
    /// Sequences seen at least twice.
    pub repeating_patterns: usize,
    /// Sequences with three or more error-like events.
    pub error_chains: usize,
    /// The ten most frequent sequences.
    pub top_patterns: Vec<(String, u64)>,
}

#[derive(Debug, Default)]
struct SequenceState {
    recent: VecDeque<(String, bool)>,
    patterns: HashMap<String, SequencePattern>,
}

/// Sliding-window n-gram tracker over event signatures.
#[derive(Debug)]
pub struct SequencePatternTracker {
    config: SequenceConfig,
    timeout: Duration,
    state: Mutex<SequenceState>,
}

impl SequencePatternTracker {
    /// Creates a tracker with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SequenceConfig::default())
    }

    /// Creates a tracker with a custom configuration.
    #[must_use]
    pub fn with_config(config: SequenceConfig) -> Self {
        info!(
            window_size = config.window_size,
            max_patterns = config.max_patterns,
            "sequence tracker created"
        );
        Self {
            timeout: to_chrono(config.pattern_timeout),
            config,
            state: Mutex::new(SequenceState::default()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &SequenceConfig {
        &self.config
    }

    /// Returns a tracked sequence by signature.
    #[must_use]
    pub fn pattern(&self, signature: &str) -> Option<SequencePattern> {
        self.state.lock().patterns.get(signature).cloned()
    }

    /// Number of distinct sequences tracked.
    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.state.lock().patterns.len()
    }

    /// Summarizes tracked sequences.
    #[must_use]
    pub fn stats(&self) -> PatternStats {
        let state = self.state.lock();
        let mut by_freq: Vec<(String, u64)> = state
            .patterns
            .values()
            .map(|p| (p.signature.clone(), p.frequency))
            .collect();
        by_freq.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        by_freq.truncate(10);

        PatternStats {
            total_patterns: state.patterns.len(),
            repeating_patterns: state.patterns.values().filter(|p| p.frequency >= 2).count(),
            error_chains: state.patterns.values().filter(|p| p.error_events >= 3).count(),
            top_patterns: by_freq,
        }
    }

    /// Signatures idle for longer than the pattern timeout at `now`.
    ///
    /// Stale patterns are reported but never evicted on this basis.
    #[must_use]
    pub fn stale_patterns(&self, now: DateTime<Utc>) -> Vec<String> {
        let state = self.state.lock();
        let mut stale: Vec<String> = state
            .patterns
            .values()
            .filter(|p| now - p.last_seen > self.timeout)
            .map(|p| p.signature.clone())
            .collect();
        stale.sort();
        stale
    }

    fn evict_oldest(&self, patterns: &mut HashMap<String, SequencePattern>) {
        let excess = patterns.len().saturating_sub(self.config.max_patterns);
        if excess == 0 {
            return;
        }
        let batch = (self.config.max_patterns / 10).max(excess).max(1);
        let mut by_age: Vec<(DateTime<Utc>, String)> = patterns
            .values()
            .map(|p| (p.last_seen, p.signature.clone()))
            .collect();
        by_age.sort();
        for (_, sig) in by_age.into_iter().take(batch) {
            patterns.remove(&sig);
        }
        debug!(evicted = batch, "sequence patterns evicted");
    }
}

impl Default for SequencePatternTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for SequencePatternTracker {
    fn name(&self) -> &'static str {
        "sequence"
    }

    fn process(&self, entry: &LogEntry) -> Vec<Anomaly> {
        let signature = event_signature(entry, self.config.prefix_words);
        let now = entry.timestamp;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state
            .recent
            .push_back((signature, entry.level.is_error_like()));
        while state.recent.len() > self.config.window_size {
            state.recent.pop_front();
        }

        // every contiguous run of the window, at every offset
        let len = state.recent.len();
        for n in 2..=len {
            for start in 0..=len - n {
                let mut parts = Vec::with_capacity(n);
                let mut errors = 0;
                for (sig, is_error) in state.recent.range(start..start + n) {
                    parts.push(sig.as_str());
                    errors += usize::from(*is_error);
                }
                let joined = parts.join("->");

                let pattern = state
                    .patterns
                    .entry(joined.clone())
                    .or_insert_with(|| SequencePattern {
                        signature: joined,
                        frequency: 0,
                        first_seen: now,
                        last_seen: now,
                        error_events: errors,
                        examples: Vec::new(),
                    });
                pattern.frequency += 1;
                pattern.last_seen = pattern.last_seen.max(now);
                pattern.examples.push(entry.clone());
                if pattern.examples.len() > self.config.max_examples {
                    pattern.examples.remove(0);
                }
            }
        }

        self.evict_oldest(&mut state.patterns);
        Vec::new()
    }

    fn detect_anomalies(&self) -> Vec<Anomaly> {
        let state = self.state.lock();
        let mut out: Vec<Anomaly> = state
            .patterns
            .values()
            .filter(|p| p.frequency == 1)
            .map(|p| {
                let (severity, description) = if p.is_high_severity() {
                    let head: String = p.signature.chars().take(50).collect();
                    (
                        AnomalySeverity::High,
                        format!("Novel high-severity pattern: {head}..."),
                    )
                } else {
                    (
                        AnomalySeverity::Medium,
                        format!("New sequence pattern: {}", p.signature),
                    )
                };
                Anomaly::new(
                    self.name(),
                    AnomalyCategory::SequenceViolation,
                    severity,
                    p.first_seen,
                    p.last_seen,
                    p.frequency as f64,
                    description,
                )
                .with_source_opt(p.examples.last().and_then(LogEntry::source_key))
                .with_samples(p.examples.iter().cloned())
            })
            .collect();
        drop(state);

        out.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.window_start.cmp(&b.window_start))
                .then_with(|| a.description.cmp(&b.description))
        });
        out
    }

    fn reset(&self) {
        *self.state.lock() = SequenceState::default();
        debug!("sequence tracker reset");
    }
}
