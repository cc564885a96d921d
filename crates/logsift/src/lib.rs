//! # logsift
//!
//! Streaming anomaly detection over structured log entries.
//!
//! Entries are fed one at a time to a set of independent detectors. Each
//! detector keeps bounded, lock-guarded state and can be shared across
//! threads.
//!
//! ## Detectors
//!
//! - [`WindowedFrequencyTracker`] - Error spikes, bursts and silence per tumbling window
//! - [`OnlineStatisticalModel`] - Per-source event rate outliers by Z-score
//! - [`SpikeBaselineTracker`] - Short-window volume against a longer baseline
//! - [`BurstSignatureTracker`] - The same normalized message repeated rapidly
//! - [`SequencePatternTracker`] - Event orderings never seen before
//! - [`RareValueTracker`] - Extracted values (IPv4 by default) seen only a few times
//! - [`FrequencyProfile`] - Source volume and message prefix profile
//! - [`RuleEngine`] - Declarative keyword, source, level and threshold rules
//!
//! [`AnomalyEngine`] owns one of each and fans every entry out to all of
//! them; [`EngineWorker`] runs it on a tokio task.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use logsift::{AnomalyEngine, LogEntry, LogLevel};
//!
//! let engine = AnomalyEngine::new();
//! let entry = LogEntry::new(Utc::now(), LogLevel::Error, "ERROR connection refused")
//!     .with_source("db");
//!
//! let anomalies = engine.process(&entry);
//! assert!(anomalies.iter().any(|a| a.detector == "rules"));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod burst;
pub mod config;
pub mod engine;
pub mod error;
pub mod frequency;
pub mod rare;
pub mod rules;
pub mod sequence;
pub mod spike;
pub mod statistical;
pub mod traits;
pub mod types;
pub mod window;
pub mod worker;

// Re-export main types
pub use burst::BurstSignatureTracker;
pub use config::{
    BurstConfig, ConfigView, EngineConfig, FrequencyConfig, RareValueConfig, RuleEngineConfig,
    SequenceConfig, SpikeConfig, StatisticalConfig, WindowConfig,
};
pub use engine::{AnomalyEngine, EngineSummary};
pub use error::{Result, SiftError};
pub use frequency::FrequencyProfile;
pub use rare::RareValueTracker;
pub use rules::{
    EngineStatistics, FnPlugin, RuleDefinition, RuleEngine, RuleMatch, RulePlugin, RulePriority,
    RuleStatistics, RuleType,
};
pub use sequence::{SequencePattern, SequencePatternTracker};
pub use spike::SpikeBaselineTracker;
pub use statistical::{OnlineStatisticalModel, OnlineStats};
pub use traits::Detector;
pub use types::{Anomaly, AnomalyCategory, AnomalySeverity, LogEntry, LogLevel, sort_anomalies};
pub use window::{WindowStats, WindowedFrequencyTracker};
pub use worker::{EngineHandle, EngineWorker};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{ConfigView, EngineConfig};
    pub use crate::engine::AnomalyEngine;
    pub use crate::error::{Result, SiftError};
    pub use crate::rules::{RuleDefinition, RuleEngine, RulePriority, RuleType};
    pub use crate::traits::Detector;
    pub use crate::types::{Anomaly, AnomalyCategory, AnomalySeverity, LogEntry, LogLevel};
    pub use crate::worker::{EngineHandle, EngineWorker};
}
