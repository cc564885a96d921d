//! Rare-value detection over values extracted from messages.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info};

use crate::config::{DEFAULT_RARE_PATTERN, RareValueConfig};
use crate::error::Result;
use crate::traits::Detector;
use crate::types::{Anomaly, AnomalyCategory, AnomalySeverity, LogEntry};

static IPV4_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(DEFAULT_RARE_PATTERN).unwrap_or_else(|_| unreachable!()));

#[derive(Debug, Clone)]
struct ValueRecord {
    count: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RareState {
    counts: HashMap<String, ValueRecord>,
    insertion: VecDeque<String>,
}

/// Global frequency table over one extracted value per entry.
#[derive(Debug)]
pub struct RareValueTracker {
    config: RareValueConfig,
    pattern: Regex,
    state: Mutex<RareState>,
}

impl RareValueTracker {
    /// Creates a tracker extracting IPv4 addresses with default limits.
    #[must_use]
    pub fn new() -> Self {
        let config = RareValueConfig::default();
        Self::build(config, IPV4_REGEX.clone())
    }

    /// Creates a tracker from a config, compiling its extraction pattern.
    pub fn from_config(config: RareValueConfig) -> Result<Self> {
        let pattern = Regex::new(&config.pattern)?;
        Ok(Self::build(config, pattern))
    }

    fn build(config: RareValueConfig, pattern: Regex) -> Self {
        info!(
            pattern = %pattern,
            max_count_for_rare = config.max_count_for_rare,
            "rare value tracker created"
        );
        Self {
            config,
            pattern,
            state: Mutex::new(RareState::default()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RareValueConfig {
        &self.config
    }

    /// Extracts the tracked value from a message.
    ///
    /// Uses capture group 1 when the pattern has one, else the whole match.
    #[must_use]
    pub fn extract<'a>(&self, message: &'a str) -> Option<&'a str> {
        let caps = self.pattern.captures(message)?;
        caps.get(1).or_else(|| caps.get(0)).map(|m| m.as_str())
    }

    /// Times a value has been seen.
    #[must_use]
    pub fn count(&self, value: &str) -> u64 {
        self.state.lock().counts.get(value).map_or(0, |r| r.count)
    }

    /// Number of distinct values tracked.
    #[must_use]
    pub fn distinct_values(&self) -> usize {
        self.state.lock().counts.len()
    }

    fn rarity(&self, value: &str, count: u64, at: DateTime<Utc>, until: DateTime<Utc>) -> Anomaly {
        Anomaly::new(
            self.name(),
            AnomalyCategory::RarePattern,
            AnomalySeverity::Low,
            at,
            until,
            1.0,
            format!("Rare value observed (count={count}): {value}"),
        )
    }
}

impl Default for RareValueTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for RareValueTracker {
    fn name(&self) -> &'static str {
        "rare"
    }

    fn process(&self, entry: &LogEntry) -> Vec<Anomaly> {
        let Some(value) = self.extract(&entry.message) else {
            return Vec::new();
        };
        let now = entry.timestamp;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let count = match state.counts.get_mut(value) {
            Some(record) => {
                record.count += 1;
                record.last_seen = record.last_seen.max(now);
                record.count
            }
            None => {
                state.counts.insert(
                    value.to_string(),
                    ValueRecord {
                        count: 1,
                        first_seen: now,
                        last_seen: now,
                    },
                );
                state.insertion.push_back(value.to_string());
                while state.counts.len() > self.config.max_tracked_values {
                    let Some(oldest) = state.insertion.pop_front() else {
                        break;
                    };
                    state.counts.remove(&oldest);
                }
                1
            }
        };
        drop(guard);

        if count > self.config.max_count_for_rare {
            return Vec::new();
        }
        vec![
            self.rarity(value, count, now, now)
                .with_source_opt(entry.source_key())
                .with_samples([entry.clone()]),
        ]
    }

    fn detect_anomalies(&self) -> Vec<Anomaly> {
        let state = self.state.lock();
        let mut rare: Vec<(&String, &ValueRecord)> = state
            .counts
            .iter()
            .filter(|(_, r)| r.count <= self.config.max_count_for_rare)
            .collect();
        rare.sort_by(|a, b| a.1.first_seen.cmp(&b.1.first_seen).then_with(|| a.0.cmp(b.0)));
        let out = rare
            .into_iter()
            .map(|(value, r)| self.rarity(value, r.count, r.first_seen, r.last_seen))
            .collect();
        drop(state);
        out
    }

    fn reset(&self) {
        *self.state.lock() = RareState::default();
        debug!("rare value tracker reset");
    }
}
