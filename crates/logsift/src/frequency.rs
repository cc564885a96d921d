//! Whole-stream frequency profile by source, level and message prefix.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::FrequencyConfig;
use crate::traits::Detector;
use crate::types::{Anomaly, AnomalyCategory, AnomalySeverity, LogEntry, LogLevel};

const TOP_N: usize = 10;

/// Upper-cased leading words of a message, or `EMPTY`.
#[must_use]
pub fn message_prefix(message: &str, words: usize) -> String {
    let prefix: Vec<String> = message
        .split_whitespace()
        .take(words)
        .map(str::to_uppercase)
        .collect();
    if prefix.is_empty() {
        "EMPTY".to_string()
    } else {
        prefix.join(" ")
    }
}

/// Snapshot of the profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyStats {
    /// Entries counted.
    pub total_events: u64,
    /// Entries per source.
    pub by_source: BTreeMap<String, u64>,
    /// Entries per level.
    pub by_level: BTreeMap<LogLevel, u64>,
    /// Most frequent sources.
    pub top_sources: Vec<(String, u64)>,
    /// Most frequent message prefixes.
    pub top_prefixes: Vec<(String, u64)>,
    /// Entries whose prefix was not tracked because the table was full.
    pub overflow: u64,
}

#[derive(Debug, Clone, Copy)]
struct Seen {
    count: u64,
    first: DateTime<Utc>,
    last: DateTime<Utc>,
}

impl Seen {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            first: at,
            last: at,
        }
    }

    fn bump(&mut self, at: DateTime<Utc>) {
        self.count += 1;
        self.first = self.first.min(at);
        self.last = self.last.max(at);
    }
}

#[derive(Debug, Default)]
struct ProfileState {
    total: u64,
    sources: HashMap<String, Seen>,
    levels: BTreeMap<LogLevel, u64>,
    prefixes: HashMap<String, Seen>,
    overflow: u64,
}

fn top(map: &HashMap<String, Seen>) -> Vec<(String, u64)> {
    let mut all: Vec<(String, u64)> = map.iter().map(|(k, s)| (k.clone(), s.count)).collect();
    all.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    all.truncate(TOP_N);
    all
}

/// Counts entries by source, level and message prefix.
#[derive(Debug)]
pub struct FrequencyProfile {
    config: FrequencyConfig,
    state: Mutex<ProfileState>,
}

impl FrequencyProfile {
    /// Creates a profile with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(FrequencyConfig::default())
    }

    /// Creates a profile with a custom configuration.
    #[must_use]
    pub fn with_config(config: FrequencyConfig) -> Self {
        info!(
            spike_multiplier = config.spike_multiplier,
            min_occurrences = config.min_occurrences,
            "frequency profile created"
        );
        Self {
            config,
            state: Mutex::new(ProfileState::default()),
        }
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn stats(&self) -> FrequencyStats {
        let state = self.state.lock();
        FrequencyStats {
            total_events: state.total,
            by_source: state
                .sources
                .iter()
                .map(|(k, s)| (k.clone(), s.count))
                .collect(),
            by_level: state.levels.clone(),
            top_sources: top(&state.sources),
            top_prefixes: top(&state.prefixes),
            overflow: state.overflow,
        }
    }
}

impl Default for FrequencyProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for FrequencyProfile {
    fn name(&self) -> &'static str {
        "frequency"
    }

    fn process(&self, entry: &LogEntry) -> Vec<Anomaly> {
        let prefix = message_prefix(&entry.message, self.config.prefix_words);
        let at = entry.timestamp;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.total += 1;
        state
            .sources
            .entry(entry.source.clone().unwrap_or_default())
            .or_insert_with(|| Seen::new(at))
            .bump(at);
        *state.levels.entry(entry.level).or_insert(0) += 1;

        let full = state.prefixes.len() >= self.config.max_prefixes;
        match state.prefixes.get_mut(&prefix) {
            Some(seen) => seen.bump(at),
            None if full => state.overflow += 1,
            None => {
                let mut seen = Seen::new(at);
                seen.bump(at);
                state.prefixes.insert(prefix, seen);
            }
        }
        Vec::new()
    }

    fn detect_anomalies(&self) -> Vec<Anomaly> {
        let state = self.state.lock();
        let mut out = Vec::new();

        if state.sources.len() >= 2 {
            let mean = state.total as f64 / state.sources.len() as f64;
            let mut sources: Vec<_> = state.sources.iter().collect();
            sources.sort_by(|a, b| a.0.cmp(b.0));
            for (source, seen) in sources {
                let count = seen.count as f64;
                if count > mean * self.config.spike_multiplier {
                    let ratio = count / mean;
                    let label = if source.is_empty() { "<none>" } else { source.as_str() };
                    out.push(
                        Anomaly::new(
                            self.name(),
                            AnomalyCategory::FrequencySpike,
                            AnomalySeverity::Medium,
                            seen.first,
                            seen.last,
                            ratio,
                            format!(
                                "Source '{label}' spike: {} events ({ratio:.1}x average)",
                                seen.count
                            ),
                        )
                        .with_source_opt((!source.is_empty()).then_some(source.as_str())),
                    );
                }
            }
        }

        let mut rare: Vec<_> = state
            .prefixes
            .iter()
            .filter(|(_, s)| s.count < self.config.min_occurrences)
            .collect();
        rare.sort_by(|a, b| a.1.first.cmp(&b.1.first).then_with(|| a.0.cmp(b.0)));
        for (prefix, seen) in rare {
            out.push(Anomaly::new(
                self.name(),
                AnomalyCategory::RarePattern,
                AnomalySeverity::Low,
                seen.first,
                seen.last,
                seen.count as f64,
                format!("Rare message pattern '{prefix}': only {} occurrences", seen.count),
            ));
        }
        out
    }

    fn reset(&self) {
        *self.state.lock() = ProfileState::default();
        debug!("frequency profile reset");
    }
}
