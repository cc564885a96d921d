//! Repeated-message burst detection.
//!
//! Messages are normalized so that variable tokens (ids, numbers) do not
//! split otherwise identical lines, then counted per signature over a
//! sliding window.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info, trace};

use crate::config::{BurstConfig, to_chrono};
use crate::traits::Detector;
use crate::types::{Anomaly, AnomalyCategory, AnomalySeverity, LogEntry};

/// Long hexadecimal or identifier-like runs.
static HEX_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9a-f]{8,}").unwrap_or_else(|_| unreachable!()));

/// Standalone numbers.
static NUMBER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d+\b").unwrap_or_else(|_| unreachable!()));

/// Reduces a message to its shape.
///
/// Lowercases, replaces long hex runs with `<id>` and standalone numbers
/// with `<n>`, and collapses whitespace.
#[must_use]
pub fn normalize_message(message: &str) -> String {
    let lowered = message.to_lowercase();
    let ids = HEX_ID_REGEX.replace_all(&lowered, "<id>");
    let numbers = NUMBER_REGEX.replace_all(&ids, "<n>");
    numbers.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Builds the burst signature for an entry with a source.
#[must_use]
pub fn burst_signature(source: &str, entry: &LogEntry) -> String {
    format!(
        "{source}|{}|{}",
        entry.level.as_index(),
        normalize_message(&entry.message)
    )
}

#[derive(Debug)]
struct SignatureWindow {
    source: String,
    hits: VecDeque<LogEntry>,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BurstState {
    signatures: HashMap<String, SignatureWindow>,
    latest: Option<DateTime<Utc>>,
    bursts_emitted: u64,
}

/// Per-signature repetition tracker.
#[derive(Debug)]
pub struct BurstSignatureTracker {
    config: BurstConfig,
    window: Duration,
    state: Mutex<BurstState>,
}

impl BurstSignatureTracker {
    /// Creates a tracker with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BurstConfig::default())
    }

    /// Creates a tracker with a custom configuration.
    #[must_use]
    pub fn with_config(config: BurstConfig) -> Self {
        info!(
            window_secs = config.window.as_secs(),
            min_repeats = config.min_repeats,
            "burst tracker created"
        );
        Self {
            window: to_chrono(config.window),
            config,
            state: Mutex::new(BurstState::default()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &BurstConfig {
        &self.config
    }

    /// Entries retained after a burst fires.
    fn retained_after_burst(&self) -> usize {
        (self.config.min_repeats / 2).max(1)
    }

    /// Number of distinct signatures tracked.
    #[must_use]
    pub fn signature_count(&self) -> usize {
        self.state.lock().signatures.len()
    }

    /// Total bursts emitted since creation or reset.
    #[must_use]
    pub fn bursts_emitted(&self) -> u64 {
        self.state.lock().bursts_emitted
    }

    /// Live repeat count per signature, highest first.
    #[must_use]
    pub fn active_signatures(&self) -> Vec<(String, usize)> {
        let state = self.state.lock();
        let mut active: Vec<_> = state
            .signatures
            .iter()
            .map(|(sig, w)| (sig.clone(), w.hits.len()))
            .collect();
        active.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        active
    }

    fn evict_stale_signature(state: &mut BurstState) {
        let oldest = state
            .signatures
            .iter()
            .min_by_key(|(_, w)| w.last_seen)
            .map(|(sig, _)| sig.clone());
        if let Some(sig) = oldest {
            trace!(signature = %sig, "evicting stale burst signature");
            state.signatures.remove(&sig);
        }
    }
}

impl Default for BurstSignatureTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for BurstSignatureTracker {
    fn name(&self) -> &'static str {
        "burst"
    }

    fn process(&self, entry: &LogEntry) -> Vec<Anomaly> {
        let Some(source) = entry.source_key() else {
            trace!("burst tracker skipping entry without source");
            return Vec::new();
        };
        let now = entry.timestamp;
        let signature = burst_signature(source, entry);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.latest = Some(state.latest.map_or(now, |t| t.max(now)));
        let is_new = !state.signatures.contains_key(&signature);
        let window = state
            .signatures
            .entry(signature.clone())
            .or_insert_with(|| SignatureWindow {
                source: source.to_string(),
                hits: VecDeque::new(),
                last_seen: now,
            });

        while window
            .hits
            .front()
            .is_some_and(|e| now - e.timestamp > self.window)
        {
            window.hits.pop_front();
        }
        window.hits.push_back(entry.clone());
        window.last_seen = window.last_seen.max(now);

        let mut out = Vec::new();
        let count = window.hits.len();
        if count >= self.config.min_repeats {
            let start = window.hits.front().map_or(now, |e| e.timestamp);
            let skip = count.saturating_sub(self.config.max_samples);
            let anomaly = Anomaly::new(
                self.name(),
                AnomalyCategory::SequenceViolation,
                AnomalySeverity::High,
                start,
                now,
                count as f64,
                format!(
                    "Burst repetition detected: {count} repeats within {}s",
                    self.window.num_seconds()
                ),
            )
            .with_source(source)
            .with_samples(window.hits.iter().skip(skip).cloned());

            let keep = self.retained_after_burst();
            while window.hits.len() > keep {
                window.hits.pop_front();
            }
            debug!(signature = %signature, count, "burst detected");
            state.bursts_emitted += 1;
            out.push(anomaly);
        }

        if is_new && state.signatures.len() > self.config.max_signatures {
            Self::evict_stale_signature(state);
        }
        out
    }

    fn detect_anomalies(&self) -> Vec<Anomaly> {
        let mut state = self.state.lock();
        let Some(latest) = state.latest else {
            return Vec::new();
        };
        let keep = self.retained_after_burst();
        let window_len = self.window;

        let mut building: Vec<Anomaly> = state
            .signatures
            .values_mut()
            .filter_map(|w| {
                while w
                    .hits
                    .front()
                    .is_some_and(|e| latest - e.timestamp > window_len)
                {
                    w.hits.pop_front();
                }
                let count = w.hits.len();
                if count <= keep {
                    return None;
                }
                let start = w.hits.front().map_or(latest, |e| e.timestamp);
                Some(
                    Anomaly::new(
                        self.name(),
                        AnomalyCategory::SequenceViolation,
                        AnomalySeverity::Low,
                        start,
                        w.last_seen,
                        count as f64,
                        format!(
                            "Repetition building: {count} repeats within {}s",
                            window_len.num_seconds()
                        ),
                    )
                    .with_source(w.source.clone()),
                )
            })
            .collect();
        building.sort_by(|a, b| b.score.total_cmp(&a.score));
        building
    }

    fn reset(&self) {
        *self.state.lock() = BurstState::default();
        debug!("burst tracker reset");
    }
}
