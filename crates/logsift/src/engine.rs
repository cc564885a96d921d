//! Fan-out over every detector.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::burst::BurstSignatureTracker;
use crate::config::{ConfigView, EngineConfig};
use crate::error::Result;
use crate::frequency::FrequencyProfile;
use crate::rare::RareValueTracker;
use crate::rules::RuleEngine;
use crate::sequence::SequencePatternTracker;
use crate::spike::SpikeBaselineTracker;
use crate::statistical::OnlineStatisticalModel;
use crate::traits::Detector;
use crate::types::{Anomaly, AnomalyCategory, LogEntry, sort_anomalies};
use crate::window::WindowedFrequencyTracker;

/// Anomaly counts over the current detector state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSummary {
    /// Entries fed to the engine since creation or reset.
    pub entries_processed: u64,
    /// Total summary anomalies.
    pub total_anomalies: usize,
    /// Counts per category.
    pub by_category: BTreeMap<AnomalyCategory, usize>,
    /// Counts per detector name.
    pub by_detector: BTreeMap<String, usize>,
}

/// Owns one of each detector and feeds every entry to all of them.
#[derive(Debug)]
pub struct AnomalyEngine {
    config: EngineConfig,
    window: WindowedFrequencyTracker,
    statistical: OnlineStatisticalModel,
    spike: SpikeBaselineTracker,
    burst: BurstSignatureTracker,
    sequence: SequencePatternTracker,
    rare: RareValueTracker,
    frequency: FrequencyProfile,
    rules: RuleEngine,
    processed: AtomicU64,
}

impl AnomalyEngine {
    /// Creates an engine with default settings for every detector.
    #[must_use]
    pub fn new() -> Self {
        let config = EngineConfig::default();
        Self {
            window: WindowedFrequencyTracker::with_config(config.window.clone()),
            statistical: OnlineStatisticalModel::with_config(config.statistical.clone()),
            spike: SpikeBaselineTracker::with_config(config.spike.clone()),
            burst: BurstSignatureTracker::with_config(config.burst.clone()),
            sequence: SequencePatternTracker::with_config(config.sequence.clone()),
            rare: RareValueTracker::new(),
            frequency: FrequencyProfile::with_config(config.frequency.clone()),
            rules: RuleEngine::with_config(config.rules.clone()),
            processed: AtomicU64::new(0),
            config,
        }
    }

    /// Creates an engine from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the rare-value
    /// pattern does not compile.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let engine = Self {
            window: WindowedFrequencyTracker::with_config(config.window.clone()),
            statistical: OnlineStatisticalModel::with_config(config.statistical.clone()),
            spike: SpikeBaselineTracker::with_config(config.spike.clone()),
            burst: BurstSignatureTracker::with_config(config.burst.clone()),
            sequence: SequencePatternTracker::with_config(config.sequence.clone()),
            rare: RareValueTracker::from_config(config.rare.clone())?,
            frequency: FrequencyProfile::with_config(config.frequency.clone()),
            rules: RuleEngine::with_config(config.rules.clone()),
            processed: AtomicU64::new(0),
            config,
        };
        info!(detectors = engine.detectors().len(), "anomaly engine created");
        Ok(engine)
    }

    /// Creates an engine from a flat view, loading any `rule.*` definitions.
    ///
    /// # Errors
    ///
    /// Returns an error if a setting fails to parse or validate.
    pub fn from_view(view: &ConfigView) -> Result<Self> {
        let engine = Self::from_config(EngineConfig::from_view(view)?)?;
        let loaded = engine.rules.load_rules(view, true);
        debug!(loaded, "rules loaded from view");
        Ok(engine)
    }

    /// Every detector in dispatch order.
    #[must_use]
    pub fn detectors(&self) -> [&dyn Detector; 8] {
        [
            &self.window,
            &self.statistical,
            &self.spike,
            &self.burst,
            &self.sequence,
            &self.rare,
            &self.frequency,
            &self.rules,
        ]
    }

    /// Feeds one entry to every detector, returning the anomalies it raised.
    pub fn process(&self, entry: &LogEntry) -> Vec<Anomaly> {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let anomalies: Vec<Anomaly> = self
            .detectors()
            .iter()
            .flat_map(|d| d.process(entry))
            .collect();
        if !anomalies.is_empty() {
            debug!(
                source = entry.source_or_unknown(),
                count = anomalies.len(),
                "entry raised anomalies"
            );
        }
        anomalies
    }

    /// Feeds a batch of entries in order.
    pub fn process_all<'a, I>(&self, entries: I) -> Vec<Anomaly>
    where
        I: IntoIterator<Item = &'a LogEntry>,
    {
        entries
            .into_iter()
            .flat_map(|entry| self.process(entry))
            .collect()
    }

    /// Collects summary anomalies from every detector, most severe first.
    #[must_use]
    pub fn detect_current_anomalies(&self) -> Vec<Anomaly> {
        let mut anomalies: Vec<Anomaly> = self
            .detectors()
            .iter()
            .flat_map(|d| d.detect_anomalies())
            .collect();
        sort_anomalies(&mut anomalies);
        anomalies
    }

    /// Counts the current summary anomalies.
    #[must_use]
    pub fn summary(&self) -> EngineSummary {
        let anomalies = self.detect_current_anomalies();
        let mut summary = EngineSummary {
            entries_processed: self.entries_processed(),
            total_anomalies: anomalies.len(),
            ..EngineSummary::default()
        };
        for anomaly in &anomalies {
            *summary.by_category.entry(anomaly.category).or_insert(0) += 1;
            *summary
                .by_detector
                .entry(anomaly.detector.clone())
                .or_insert(0) += 1;
        }
        summary
    }

    /// Entries processed since creation or the last reset.
    #[must_use]
    pub fn entries_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Clears every detector. Rule definitions are kept.
    pub fn reset(&self) {
        for detector in self.detectors() {
            detector.reset();
        }
        self.processed.store(0, Ordering::Relaxed);
        info!("anomaly engine reset");
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Tumbling-window tracker.
    #[must_use]
    pub fn window(&self) -> &WindowedFrequencyTracker {
        &self.window
    }

    /// Per-source rate model.
    #[must_use]
    pub fn statistical(&self) -> &OnlineStatisticalModel {
        &self.statistical
    }

    /// Short-vs-baseline spike tracker.
    #[must_use]
    pub fn spike(&self) -> &SpikeBaselineTracker {
        &self.spike
    }

    /// Repetition tracker.
    #[must_use]
    pub fn burst(&self) -> &BurstSignatureTracker {
        &self.burst
    }

    /// Event-order tracker.
    #[must_use]
    pub fn sequence(&self) -> &SequencePatternTracker {
        &self.sequence
    }

    /// Rare-value tracker.
    #[must_use]
    pub fn rare(&self) -> &RareValueTracker {
        &self.rare
    }

    /// Frequency profile.
    #[must_use]
    pub fn frequency(&self) -> &FrequencyProfile {
        &self.frequency
    }

    /// Rule engine.
    #[must_use]
    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }
}

impl Default for AnomalyEngine {
    fn default() -> Self {
        Self::new()
    }
}
