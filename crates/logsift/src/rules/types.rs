//! Rule definitions, compiled rule kinds and match records.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SiftError};
use crate::types::LogLevel;

/// How a rule's condition is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    /// Case-insensitive substring of the message.
    Keyword,
    /// Event count within a time window.
    Threshold,
    /// Exact severity level.
    Level,
    /// Case-insensitive exact source.
    Source,
    /// Plugin-evaluated time window logic.
    TimeWindow,
    /// Plugin-evaluated event ordering.
    Sequence,
    /// Plugin-evaluated pattern.
    Pattern,
    /// Plugin-evaluated combination of conditions.
    Composite,
    /// Externally registered plugin logic.
    Custom,
}

impl RuleType {
    /// Returns the configuration name of this type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "KEYWORD",
            Self::Threshold => "THRESHOLD",
            Self::Level => "LEVEL",
            Self::Source => "SOURCE",
            Self::TimeWindow => "TIME_WINDOW",
            Self::Sequence => "SEQUENCE",
            Self::Pattern => "PATTERN",
            Self::Composite => "COMPOSITE",
            Self::Custom => "CUSTOM",
        }
    }

    /// Parses a type name case-insensitively, falling back to `Keyword`.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "THRESHOLD" => Self::Threshold,
            "LEVEL" => Self::Level,
            "SOURCE" => Self::Source,
            "TIME_WINDOW" => Self::TimeWindow,
            "SEQUENCE" => Self::Sequence,
            "PATTERN" => Self::Pattern,
            "COMPOSITE" => Self::Composite,
            "CUSTOM" => Self::Custom,
            _ => Self::Keyword,
        }
    }

    /// Returns true for types evaluated only through plugins.
    #[must_use]
    pub const fn is_extension(&self) -> bool {
        matches!(
            self,
            Self::TimeWindow | Self::Sequence | Self::Pattern | Self::Composite | Self::Custom
        )
    }

    /// Whether results of this type may be cached per entry.
    #[must_use]
    pub const fn default_cacheable(&self) -> bool {
        matches!(self, Self::Keyword | Self::Level | Self::Source)
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution priority; lower sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RulePriority {
    /// Evaluated first
    Critical = 0,
    /// Evaluated second
    High = 1,
    /// Default priority
    #[default]
    Medium = 2,
    /// Evaluated last
    Low = 3,
}

impl RulePriority {
    /// Parses a priority name or number (`0`..=`3`).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "critical" | "0" => Some(Self::Critical),
            "high" | "1" => Some(Self::High),
            "medium" | "2" => Some(Self::Medium),
            "low" | "3" => Some(Self::Low),
            _ => None,
        }
    }
}

/// A declarative rule as supplied by configuration or the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Condition interpretation.
    pub rule_type: RuleType,
    /// Execution priority.
    pub priority: RulePriority,
    /// Condition text.
    pub condition: String,
    /// Severity weight in `[0, 1]`.
    pub severity: f64,
    /// Whether the rule is evaluated.
    pub enabled: bool,
    /// Events within `time_window` needed by threshold rules.
    pub frequency_threshold: u64,
    /// Counting window for threshold rules.
    pub time_window: Duration,
    /// Whether adaptive scaling applies to this rule.
    pub adaptive_threshold: bool,
    /// Scale applied to the threshold when adaptive.
    pub adaptive_multiplier: f64,
    /// Whether matches may be served from the entry cache.
    pub cacheable: bool,
    /// Free-form annotations.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RuleDefinition {
    /// Creates an enabled rule with default weights.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        rule_type: RuleType,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rule_type,
            priority: RulePriority::default(),
            condition: condition.into(),
            severity: 0.8,
            enabled: true,
            frequency_threshold: 5,
            time_window: Duration::from_secs(60),
            adaptive_threshold: false,
            adaptive_multiplier: 1.5,
            cacheable: rule_type.default_cacheable(),
            metadata: BTreeMap::new(),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: RulePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the severity, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_severity(mut self, severity: f64) -> Self {
        self.severity = severity.clamp(0.0, 1.0);
        self
    }

    /// Enables or disables the rule.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the threshold and counting window.
    #[must_use]
    pub fn with_threshold(mut self, count: u64, window: Duration) -> Self {
        self.frequency_threshold = count;
        self.time_window = window;
        self
    }

    /// Enables adaptive scaling with the given multiplier.
    #[must_use]
    pub fn with_adaptive(mut self, multiplier: f64) -> Self {
        self.adaptive_threshold = true;
        self.adaptive_multiplier = multiplier;
        self
    }

    /// Overrides cacheability.
    ///
    /// Threshold and plugin rules are never served from cache regardless.
    #[must_use]
    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Effective cacheability after type restrictions.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.cacheable && self.rule_type.default_cacheable()
    }

    /// Threshold after adaptive scaling, if enabled globally and on this rule.
    #[must_use]
    pub fn effective_threshold(&self, adaptive_enabled: bool) -> f64 {
        let base = self.frequency_threshold as f64;
        if adaptive_enabled && self.adaptive_threshold {
            base * self.adaptive_multiplier
        } else {
            base
        }
    }
}

/// A rule firing on one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    /// Id of the rule that fired.
    pub rule_id: String,
    /// Name of the rule that fired.
    pub rule_name: String,
    /// Type of the rule.
    pub rule_type: RuleType,
    /// Priority of the rule.
    pub priority: RulePriority,
    /// What matched.
    pub details: String,
    /// The rule's severity weight.
    pub score: f64,
    /// Timestamp of the matching entry.
    pub timestamp: DateTime<Utc>,
}

/// Compiled predicate data for a rule.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RuleKind {
    Keyword { needle: String },
    Source { source: String },
    Level { level: Option<LogLevel> },
    Threshold { filter: Option<String> },
    Extension(RuleType),
}

impl RuleKind {
    fn compile(def: &RuleDefinition) -> Result<Self> {
        let condition = def.condition.trim();
        match def.rule_type {
            RuleType::Keyword => {
                if condition.is_empty() {
                    return Err(SiftError::invalid_rule(&def.id, "keyword rule needs a keyword"));
                }
                Ok(Self::Keyword {
                    needle: condition.to_lowercase(),
                })
            }
            RuleType::Source => {
                if condition.is_empty() {
                    return Err(SiftError::invalid_rule(&def.id, "source rule needs a source"));
                }
                Ok(Self::Source {
                    source: condition.to_lowercase(),
                })
            }
            RuleType::Level => {
                let level = condition.parse::<LogLevel>().ok();
                if level.is_none() {
                    warn!(rule_id = %def.id, condition, "unrecognized level; rule will never match");
                }
                Ok(Self::Level { level })
            }
            RuleType::Threshold => Ok(Self::Threshold {
                filter: (!condition.is_empty()).then(|| condition.to_lowercase()),
            }),
            other => Ok(Self::Extension(other)),
        }
    }
}

/// Execution and match counters for one rule.
#[derive(Debug, Default)]
pub(crate) struct RuleCounters {
    pub executions: AtomicU64,
    pub matches: AtomicU64,
    pub last_match: Mutex<Option<DateTime<Utc>>>,
}

impl RuleCounters {
    pub fn record(&self, matched: Option<DateTime<Utc>>) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if let Some(at) = matched {
            self.matches.fetch_add(1, Ordering::Relaxed);
            *self.last_match.lock() = Some(at);
        }
    }

    pub fn reset(&self) {
        self.executions.store(0, Ordering::Relaxed);
        self.matches.store(0, Ordering::Relaxed);
        *self.last_match.lock() = None;
    }
}

/// A definition with its compiled kind and live counters.
#[derive(Debug)]
pub(crate) struct CompiledRule {
    pub def: RuleDefinition,
    pub kind: RuleKind,
    pub counters: Arc<RuleCounters>,
}

impl CompiledRule {
    pub fn compile(mut def: RuleDefinition, counters: Option<Arc<RuleCounters>>) -> Result<Self> {
        if def.id.trim().is_empty() {
            return Err(SiftError::invalid_rule(&def.name, "rule id must not be empty"));
        }
        def.severity = def.severity.clamp(0.0, 1.0);
        let kind = RuleKind::compile(&def)?;
        Ok(Self {
            def,
            kind,
            counters: counters.unwrap_or_default(),
        })
    }
}

/// Per-rule counters snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStatistics {
    /// Rule id.
    pub rule_id: String,
    /// Times the rule was evaluated.
    pub executions: u64,
    /// Times the rule matched.
    pub matches: u64,
    /// Timestamp of the last matching entry.
    pub last_match: Option<DateTime<Utc>>,
}

/// Engine-wide counters snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatistics {
    /// Entries checked.
    pub total_checks: u64,
    /// Checks answered partly from cache.
    pub cache_hits: u64,
    /// Checks that missed the cache.
    pub cache_misses: u64,
    /// Individual rule evaluations.
    pub rule_evaluations: u64,
    /// Entries currently cached.
    pub cached_entries: usize,
    /// Rules loaded.
    pub rule_count: usize,
}
