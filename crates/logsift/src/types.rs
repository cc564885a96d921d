//! Core record types shared by every detector.
//!
//! This module provides:
//! - [`LogLevel`] - Ordered severity of an input record
//! - [`LogEntry`] - Normalized input record
//! - [`AnomalyCategory`] / [`AnomalySeverity`] - Classification of findings
//! - [`Anomaly`] - A finding emitted by a detector

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Placeholder used by detectors that can proceed without a source.
pub const UNKNOWN_SOURCE: &str = "<unknown>";

/// Log severity levels, ordered from most verbose to most severe.
///
/// `Unknown` sorts last so that unparsed levels are never mistaken for
/// low-severity noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information
    Trace = 0,
    /// Debugging information
    Debug = 1,
    /// General information
    Info = 2,
    /// Warning conditions
    Warn = 3,
    /// Error conditions
    Error = 4,
    /// Critical or fatal conditions
    Critical = 5,
    /// Level could not be determined
    Unknown = 6,
}

impl LogLevel {
    /// All levels in ascending order.
    pub const ALL: [Self; 7] = [
        Self::Trace,
        Self::Debug,
        Self::Info,
        Self::Warn,
        Self::Error,
        Self::Critical,
        Self::Unknown,
    ];

    /// Returns the lowercase string representation of this level.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        }
    }

    /// Returns the uppercase label used in signatures.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Returns the numeric encoding of this level.
    #[must_use]
    pub const fn as_index(&self) -> u8 {
        *self as u8
    }

    /// Decodes a numeric level, if in range.
    #[must_use]
    pub const fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Trace),
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            3 => Some(Self::Warn),
            4 => Some(Self::Error),
            5 => Some(Self::Critical),
            6 => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Returns true for `Error` and `Critical`.
    #[must_use]
    pub const fn is_error_like(&self) -> bool {
        matches!(self, Self::Error | Self::Critical)
    }

    /// Returns true if this level is at least as severe as the given level.
    #[must_use]
    pub fn is_at_least(&self, level: Self) -> bool {
        *self >= level
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a level name or index is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized log level: {0}")]
pub struct ParseLevelError(pub String);

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    /// Accepts a numeric index (`0`..=`6`) or a case-insensitive level name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(index) = trimmed.parse::<u8>() {
            return Self::from_index(index).ok_or_else(|| ParseLevelError(s.to_string()));
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" | "err" => Ok(Self::Error),
            "critical" | "crit" | "fatal" => Ok(Self::Critical),
            "unknown" => Ok(Self::Unknown),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// A normalized log record.
///
/// Entries are produced by an external parser and are never mutated by
/// detectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the event happened
    pub timestamp: DateTime<Utc>,
    /// Severity level
    pub level: LogLevel,
    /// Emitting component, if known
    #[serde(default)]
    pub source: Option<String>,
    /// The log message
    pub message: String,
    /// The original unparsed line
    #[serde(default)]
    pub raw_line: Option<String>,
}

impl LogEntry {
    /// Creates a new entry without source or raw line.
    pub fn new(timestamp: DateTime<Utc>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level,
            source: None,
            message: message.into(),
            raw_line: None,
        }
    }

    /// Sets the source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the raw line.
    #[must_use]
    pub fn with_raw_line(mut self, raw: impl Into<String>) -> Self {
        self.raw_line = Some(raw.into());
        self
    }

    /// Returns the source if present and non-empty.
    #[must_use]
    pub fn source_key(&self) -> Option<&str> {
        self.source.as_deref().filter(|s| !s.is_empty())
    }

    /// Returns the source or [`UNKNOWN_SOURCE`].
    #[must_use]
    pub fn source_or_unknown(&self) -> &str {
        self.source_key().unwrap_or(UNKNOWN_SOURCE)
    }
}

/// What kind of abnormal behavior an anomaly describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyCategory {
    /// Event volume well above normal
    FrequencySpike,
    /// A value or pattern that is seldom seen
    RarePattern,
    /// A metric far from its running mean
    StatisticalOutlier,
    /// Unexpected repetition or event ordering
    SequenceViolation,
    /// A gap with no events
    Silence,
    /// Anything else, typically rule matches
    Other,
}

impl AnomalyCategory {
    /// Returns the string representation of this category.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FrequencySpike => "frequency_spike",
            Self::RarePattern => "rare_pattern",
            Self::StatisticalOutlier => "statistical_outlier",
            Self::SequenceViolation => "sequence_violation",
            Self::Silence => "silence",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for AnomalyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How serious an anomaly is.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    /// Worth a look
    #[default]
    Low,
    /// Likely needs attention
    Medium,
    /// Needs attention soon
    High,
    /// Needs attention now
    Critical,
}

impl AnomalySeverity {
    /// Returns the string representation of this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Grades a normalized `[0, 1]` factor into `low`, `mid` or `high`.
    ///
    /// Factors at or above 0.9 map to `high`, at or above 0.6 to `mid`.
    #[must_use]
    pub fn grade(factor: f64, low: Self, mid: Self, high: Self) -> Self {
        if factor >= 0.9 {
            high
        } else if factor >= 0.6 {
            mid
        } else {
            low
        }
    }
}

impl fmt::Display for AnomalySeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finding emitted by a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// Unique identifier
    pub id: Uuid,
    /// Kind of finding
    pub category: AnomalyCategory,
    /// How serious it is
    pub severity: AnomalySeverity,
    /// Start of the affected interval
    pub window_start: DateTime<Utc>,
    /// End of the affected interval (never before `window_start`)
    pub window_end: DateTime<Utc>,
    /// Detector-local score
    pub score: f64,
    /// Human-readable description
    pub description: String,
    /// Source the finding relates to
    #[serde(default)]
    pub source: Option<String>,
    /// Name of the detector that produced it
    pub detector: String,
    /// Representative entries, at most [`Anomaly::MAX_SAMPLES`]
    #[serde(default)]
    pub samples: Vec<LogEntry>,
}

impl Anomaly {
    /// Upper bound on retained sample entries.
    pub const MAX_SAMPLES: usize = 10;

    /// Creates a new anomaly.
    ///
    /// If `window_end` precedes `window_start` it is raised to `window_start`.
    pub fn new(
        detector: impl Into<String>,
        category: AnomalyCategory,
        severity: AnomalySeverity,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        score: f64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            severity,
            window_start,
            window_end: window_end.max(window_start),
            score,
            description: description.into(),
            source: None,
            detector: detector.into(),
            samples: Vec::new(),
        }
    }

    /// Sets the related source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the related source if one is given.
    #[must_use]
    pub fn with_source_opt(mut self, source: Option<&str>) -> Self {
        self.source = source.map(str::to_string);
        self
    }

    /// Sets sample entries, keeping only the most recent ones.
    #[must_use]
    pub fn with_samples(mut self, samples: impl IntoIterator<Item = LogEntry>) -> Self {
        let mut samples: Vec<LogEntry> = samples.into_iter().collect();
        if samples.len() > Self::MAX_SAMPLES {
            samples.drain(..samples.len() - Self::MAX_SAMPLES);
        }
        self.samples = samples;
        self
    }

    /// Returns the duration of the affected interval.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.window_end - self.window_start
    }
}

/// Sorts anomalies by severity (highest first), then score, then window start.
pub fn sort_anomalies(anomalies: &mut [Anomaly]) {
    anomalies.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.score.total_cmp(&a.score))
            .then_with(|| a.window_start.cmp(&b.window_start))
    });
}
