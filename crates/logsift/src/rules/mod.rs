//! Declarative rule evaluation.
//!
//! Rules are loaded from `rule.*` keys of a [`ConfigView`](crate::ConfigView)
//! or managed through the [`RuleEngine`] API. Built-in rule types cover
//! keywords, sources, levels and windowed thresholds; the remaining types are
//! delegated to registered [`RulePlugin`]s.

mod cache;
mod counter;
pub mod engine;
pub mod plugin;
pub mod types;

pub use engine::{RULE_PREFIX, RuleEngine, default_rules, severity_for_score};
pub use plugin::{FnPlugin, RulePlugin};
pub use types::{
    EngineStatistics, RuleDefinition, RuleMatch, RulePriority, RuleStatistics, RuleType,
};
