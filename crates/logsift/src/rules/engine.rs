//! Rule evaluation, management and hot reload.
//!
//! The rule table sits behind a read/write lock: evaluation clones a
//! snapshot of `Arc`ed compiled rules under a brief read lock, while loads
//! and edits build their replacement outside the lock and swap it in.
//! Every swap bumps a generation counter; cached matches carry the
//! generation they were computed against and are never served to, or
//! stored for, a different one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::cache::{CacheKey, MatchCache};
use super::counter::TimeWindowCounter;
use super::plugin::{PluginRegistry, RulePlugin};
use super::types::{
    CompiledRule, EngineStatistics, RuleCounters, RuleDefinition, RuleKind, RuleMatch,
    RulePriority, RuleStatistics, RuleType,
};
use crate::config::{ConfigView, RuleEngineConfig, parse_bool, to_chrono};
use crate::error::{Result, SiftError};
use crate::traits::Detector;
use crate::types::{Anomaly, AnomalyCategory, AnomalySeverity, LogEntry};

/// Key prefix marking a rule definition.
pub const RULE_PREFIX: &str = "rule.";

/// Suffixes of per-rule override keys.
const COMPANION_SUFFIXES: [&str; 8] = [
    ".enabled",
    ".severity",
    ".priority",
    ".threshold",
    ".window_secs",
    ".adaptive",
    ".multiplier",
    ".cacheable",
];

/// Maps a rule score to an anomaly severity.
#[must_use]
pub fn severity_for_score(score: f64) -> AnomalySeverity {
    if score >= 0.9 {
        AnomalySeverity::Critical
    } else if score >= 0.7 {
        AnomalySeverity::High
    } else if score >= 0.4 {
        AnomalySeverity::Medium
    } else {
        AnomalySeverity::Low
    }
}

/// The built-in ERROR and CRITICAL keyword rules.
#[must_use]
pub fn default_rules() -> Vec<RuleDefinition> {
    vec![
        RuleDefinition::new("error_keyword", "Error keyword", RuleType::Keyword, "ERROR")
            .with_priority(RulePriority::High)
            .with_severity(0.9),
        RuleDefinition::new(
            "critical_keyword",
            "Critical keyword",
            RuleType::Keyword,
            "CRITICAL",
        )
        .with_priority(RulePriority::Critical)
        .with_severity(1.0),
    ]
}

fn is_companion_key(view: &ConfigView, key: &str) -> bool {
    COMPANION_SUFFIXES
        .iter()
        .any(|suffix| key.strip_suffix(suffix).is_some_and(|base| view.contains(base)))
}

fn sort_by_priority(rules: &mut [Arc<CompiledRule>]) {
    rules.sort_by_key(|r| r.def.priority);
}

/// Declarative rule evaluator.
pub struct RuleEngine {
    config: RuleEngineConfig,
    rules: RwLock<Vec<Arc<CompiledRule>>>,
    plugins: PluginRegistry,
    cache: RwLock<MatchCache>,
    /// Bumped under the rules write lock whenever the table changes.
    generation: AtomicU64,
    counters: Mutex<HashMap<String, TimeWindowCounter>>,
    adaptive: AtomicBool,
    total_checks: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    rule_evaluations: AtomicU64,
}

impl RuleEngine {
    /// Creates an engine with the default configuration and built-in rules.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuleEngineConfig::default())
    }

    /// Creates an engine with a custom configuration.
    #[must_use]
    pub fn with_config(config: RuleEngineConfig) -> Self {
        let mut rules: Vec<Arc<CompiledRule>> = if config.install_default_rules {
            default_rules()
                .into_iter()
                .filter_map(|def| CompiledRule::compile(def, None).ok())
                .map(Arc::new)
                .collect()
        } else {
            Vec::new()
        };
        sort_by_priority(&mut rules);
        info!(
            rules = rules.len(),
            cache = config.enable_cache,
            adaptive = config.adaptive_thresholds,
            "rule engine created"
        );
        Self {
            cache: RwLock::new(MatchCache::new(config.max_cache_entries)),
            generation: AtomicU64::new(0),
            adaptive: AtomicBool::new(config.adaptive_thresholds),
            config,
            rules: RwLock::new(rules),
            plugins: PluginRegistry::default(),
            counters: Mutex::new(HashMap::new()),
            total_checks: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            rule_evaluations: AtomicU64::new(0),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RuleEngineConfig {
        &self.config
    }

    // ---- evaluation -------------------------------------------------------

    /// Evaluates every enabled rule against an entry, in priority order.
    pub fn check_entry(&self, entry: &LogEntry) -> Vec<RuleMatch> {
        self.total_checks.fetch_add(1, Ordering::Relaxed);
        let (rules, generation) = self.snapshot();

        if !self.config.enable_cache {
            return rules
                .iter()
                .filter(|r| r.def.enabled)
                .filter_map(|r| self.evaluate(r, entry))
                .collect();
        }

        let key = CacheKey::of(entry);
        let cached = self.cache.read().get(&key, generation).cloned();
        if let Some(cached) = cached {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            let mut matches = Vec::new();
            for rule in rules.iter().filter(|r| r.def.enabled) {
                if rule.def.is_cacheable() {
                    if let Some(hit) = cached.iter().find(|m| m.rule_id == rule.def.id) {
                        let mut hit = hit.clone();
                        hit.timestamp = entry.timestamp;
                        matches.push(hit);
                    }
                } else if let Some(m) = self.evaluate(rule, entry) {
                    matches.push(m);
                }
            }
            return matches;
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let matches: Vec<RuleMatch> = rules
            .iter()
            .filter(|r| r.def.enabled)
            .filter_map(|r| self.evaluate(r, entry))
            .collect();
        let cacheable: Vec<RuleMatch> = matches
            .iter()
            .filter(|m| {
                rules
                    .iter()
                    .any(|r| r.def.id == m.rule_id && r.def.is_cacheable())
            })
            .cloned()
            .collect();
        self.store(key, generation, cacheable);
        matches
    }

    /// Current rule table and the generation it belongs to.
    fn snapshot(&self) -> (Vec<Arc<CompiledRule>>, u64) {
        let rules = self.rules.read();
        (rules.clone(), self.generation.load(Ordering::SeqCst))
    }

    /// Caches matches computed against `generation`; dropped if the table
    /// has changed since. Returns whether the matches were stored.
    fn store(&self, key: CacheKey, generation: u64, matches: Vec<RuleMatch>) -> bool {
        let mut cache = self.cache.write();
        if self.generation.load(Ordering::SeqCst) != generation {
            trace!(generation, "discarding matches from a replaced rule table");
            return false;
        }
        cache.insert(key, generation, matches);
        true
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Evaluates a batch of entries in order.
    pub fn check_entries<'a, I>(&self, entries: I) -> Vec<RuleMatch>
    where
        I: IntoIterator<Item = &'a LogEntry>,
    {
        entries
            .into_iter()
            .flat_map(|entry| self.check_entry(entry))
            .collect()
    }

    fn evaluate(&self, rule: &CompiledRule, entry: &LogEntry) -> Option<RuleMatch> {
        self.rule_evaluations.fetch_add(1, Ordering::Relaxed);
        let def = &rule.def;

        let details = match &rule.kind {
            RuleKind::Keyword { needle } => entry
                .message
                .to_lowercase()
                .contains(needle.as_str())
                .then(|| format!("KEYWORD matched: '{}'", def.condition.trim())),
            RuleKind::Source { source } => entry
                .source_key()
                .filter(|s| s.to_lowercase() == *source)
                .map(|s| format!("SOURCE matched: {s}")),
            RuleKind::Level { level } => (*level == Some(entry.level))
                .then(|| format!("LEVEL matched: {}", entry.level.label())),
            RuleKind::Threshold { filter } => {
                let passes = filter
                    .as_ref()
                    .is_none_or(|f| entry.message.to_lowercase().contains(f.as_str()));
                if passes {
                    self.check_threshold(def, entry)
                } else {
                    None
                }
            }
            RuleKind::Extension(rule_type) => self
                .plugins
                .first_match(*rule_type, entry, def)
                .map(|plugin| format!("{rule_type} plugin triggered: {plugin}")),
        };

        rule.counters
            .record(details.as_ref().map(|_| entry.timestamp));
        let details = details?;
        Some(RuleMatch {
            rule_id: def.id.clone(),
            rule_name: def.name.clone(),
            rule_type: def.rule_type,
            priority: def.priority,
            details,
            score: def.severity,
            timestamp: entry.timestamp,
        })
    }

    fn check_threshold(&self, def: &RuleDefinition, entry: &LogEntry) -> Option<String> {
        let window = to_chrono(def.time_window);
        let count = self
            .counters
            .lock()
            .entry(def.id.clone())
            .or_insert_with(|| TimeWindowCounter::new(window, self.config.counter_capacity))
            .record(entry.timestamp);
        let threshold = def.effective_threshold(self.adaptive.load(Ordering::Relaxed));
        (count as f64 >= threshold).then(|| {
            format!(
                "THRESHOLD exceeded: {count} in {}s (threshold={threshold})",
                def.time_window.as_secs()
            )
        })
    }

    /// Converts matches for an entry into anomalies.
    #[must_use]
    pub fn matches_to_anomalies(&self, entry: &LogEntry, matches: &[RuleMatch]) -> Vec<Anomaly> {
        matches
            .iter()
            .map(|m| {
                Anomaly::new(
                    self.name(),
                    AnomalyCategory::Other,
                    severity_for_score(m.score),
                    entry.timestamp,
                    entry.timestamp,
                    m.score,
                    format!("Rule '{}' matched: {}", m.rule_name, m.details),
                )
                .with_source_opt(entry.source_key())
                .with_samples([entry.clone()])
            })
            .collect()
    }

    // ---- management -------------------------------------------------------

    fn invalidate(&self, rule_ids: Option<&[String]>) {
        self.cache.write().clear();
        let mut counters = self.counters.lock();
        match rule_ids {
            Some(ids) => ids.iter().for_each(|id| {
                counters.remove(id);
            }),
            None => counters.clear(),
        }
    }

    fn existing_counters(&self, id: &str) -> Option<Arc<RuleCounters>> {
        self.rules
            .read()
            .iter()
            .find(|r| r.def.id == id)
            .map(|r| Arc::clone(&r.counters))
    }

    /// Adds a rule, replacing any rule with the same id.
    pub fn add_rule(&self, def: RuleDefinition) -> Result<()> {
        let compiled = Arc::new(CompiledRule::compile(def, None)?);
        let id = compiled.def.id.clone();
        {
            let mut rules = self.rules.write();
            match rules.iter_mut().find(|r| r.def.id == id) {
                Some(slot) => *slot = compiled,
                None => rules.push(compiled),
            }
            sort_by_priority(&mut rules);
            self.bump_generation();
        }
        self.invalidate(Some(std::slice::from_ref(&id)));
        info!(rule_id = %id, "rule added");
        Ok(())
    }

    /// Replaces an existing rule, keeping its statistics.
    pub fn update_rule(&self, def: RuleDefinition) -> Result<()> {
        let counters = self
            .existing_counters(&def.id)
            .ok_or_else(|| SiftError::RuleNotFound(def.id.clone()))?;
        let compiled = Arc::new(CompiledRule::compile(def, Some(counters))?);
        let id = compiled.def.id.clone();
        {
            let mut rules = self.rules.write();
            let slot = rules
                .iter_mut()
                .find(|r| r.def.id == id)
                .ok_or_else(|| SiftError::RuleNotFound(id.clone()))?;
            *slot = compiled;
            sort_by_priority(&mut rules);
            self.bump_generation();
        }
        self.invalidate(Some(std::slice::from_ref(&id)));
        info!(rule_id = %id, "rule updated");
        Ok(())
    }

    /// Removes a rule; returns false if it did not exist.
    pub fn remove_rule(&self, id: &str) -> bool {
        let removed = {
            let mut rules = self.rules.write();
            let before = rules.len();
            rules.retain(|r| r.def.id != id);
            let removed = rules.len() != before;
            if removed {
                self.bump_generation();
            }
            removed
        };
        if removed {
            let owned = id.to_string();
            self.invalidate(Some(std::slice::from_ref(&owned)));
            info!(rule_id = %id, "rule removed");
        }
        removed
    }

    /// Enables or disables a rule.
    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut def = self
            .get_rule(id)
            .ok_or_else(|| SiftError::RuleNotFound(id.to_string()))?;
        def.enabled = enabled;
        self.update_rule(def)
    }

    /// Returns a rule definition by id.
    #[must_use]
    pub fn get_rule(&self, id: &str) -> Option<RuleDefinition> {
        self.rules
            .read()
            .iter()
            .find(|r| r.def.id == id)
            .map(|r| r.def.clone())
    }

    /// Returns all rule definitions in execution order.
    #[must_use]
    pub fn rules(&self) -> Vec<RuleDefinition> {
        self.rules.read().iter().map(|r| r.def.clone()).collect()
    }

    /// Number of rules loaded.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Registers a plugin; returns true if it replaced one with the same name.
    pub fn register_plugin(&self, plugin: Arc<dyn RulePlugin>) -> bool {
        let name = plugin.plugin_name().to_string();
        let replaced = self.plugins.register(plugin).is_some();
        info!(plugin = %name, replaced, "rule plugin registered");
        replaced
    }

    /// Unregisters a plugin by name.
    pub fn unregister_plugin(&self, name: &str) -> bool {
        let removed = self.plugins.unregister(name);
        if removed {
            info!(plugin = %name, "rule plugin unregistered");
        }
        removed
    }

    /// Names of registered plugins.
    #[must_use]
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.names()
    }

    /// Turns adaptive threshold scaling on or off for all rules.
    pub fn set_adaptive_thresholds(&self, enabled: bool) {
        self.adaptive.store(enabled, Ordering::Relaxed);
        debug!(enabled, "adaptive thresholds toggled");
    }

    /// Whether adaptive threshold scaling is on.
    #[must_use]
    pub fn adaptive_thresholds(&self) -> bool {
        self.adaptive.load(Ordering::Relaxed)
    }

    // ---- configuration loading -------------------------------------------

    /// Parses one `rule.*` entry with its companion keys.
    ///
    /// The value is `<name> <TYPE> <condition...>`; the rule id is the key
    /// without the `rule.` prefix.
    pub fn parse_rule(&self, view: &ConfigView, key: &str, value: &str) -> Result<RuleDefinition> {
        let id = key.strip_prefix(RULE_PREFIX).unwrap_or(key);
        let mut parts = value.split_whitespace();
        let (Some(name), Some(type_name)) = (parts.next(), parts.next()) else {
            return Err(SiftError::invalid_rule(
                key,
                "expected '<name> <TYPE> <condition>'",
            ));
        };
        let condition = parts.collect::<Vec<_>>().join(" ");
        let rule_type = RuleType::parse(type_name);

        let mut def = RuleDefinition::new(id, name, rule_type, condition)
            .with_severity(self.config.default_severity)
            .with_threshold(
                self.config.default_frequency_threshold,
                self.config.default_time_window,
            );
        def.adaptive_multiplier = self.config.default_adaptive_multiplier;

        let companion = |suffix: &str| view.get(&format!("{key}{suffix}"));
        let bool_of = |suffix: &str| -> Result<Option<bool>> {
            companion(suffix)
                .map(|raw| {
                    parse_bool(raw).ok_or_else(|| {
                        SiftError::invalid_rule(key, format!("{suffix} is not a boolean: {raw}"))
                    })
                })
                .transpose()
        };
        let parsed = |suffix: &str| -> Result<Option<f64>> {
            companion(suffix)
                .map(|raw| {
                    raw.trim().parse::<f64>().map_err(|_| {
                        SiftError::invalid_rule(key, format!("{suffix} is not a number: {raw}"))
                    })
                })
                .transpose()
        };

        if let Some(enabled) = bool_of(".enabled")? {
            def.enabled = enabled;
        }
        if let Some(severity) = parsed(".severity")? {
            def.severity = severity.clamp(0.0, 1.0);
        }
        if let Some(raw) = companion(".priority") {
            def.priority = RulePriority::parse(raw)
                .ok_or_else(|| SiftError::invalid_rule(key, format!("bad priority: {raw}")))?;
        }
        if let Some(threshold) = parsed(".threshold")? {
            def.frequency_threshold = threshold.max(0.0) as u64;
        }
        if let Some(secs) = parsed(".window_secs")? {
            def.time_window = std::time::Duration::try_from_secs_f64(secs).map_err(|_| {
                SiftError::invalid_rule(key, format!(".window_secs out of range: {secs}"))
            })?;
        }
        if let Some(adaptive) = bool_of(".adaptive")? {
            def.adaptive_threshold = adaptive;
        }
        if let Some(multiplier) = parsed(".multiplier")? {
            def.adaptive_multiplier = multiplier;
        }
        if let Some(cacheable) = bool_of(".cacheable")? {
            def.cacheable = cacheable;
        }
        Ok(def)
    }

    /// Loads `rule.*` definitions from a view.
    ///
    /// Without `merge` the current table is replaced; with it, loaded rules
    /// replace same-id rules and others are kept. Malformed definitions are
    /// skipped. Returns the number of rules loaded or updated.
    pub fn load_rules(&self, view: &ConfigView, merge: bool) -> usize {
        let mut loaded: Vec<CompiledRule> = Vec::new();
        for (key, value) in view.with_prefix(RULE_PREFIX) {
            if is_companion_key(view, key) {
                continue;
            }
            let compiled = self
                .parse_rule(view, key, value)
                .and_then(|def| {
                    let counters = self.existing_counters(&def.id);
                    CompiledRule::compile(def, counters)
                });
            match compiled {
                Ok(rule) => loaded.push(rule),
                Err(err) => warn!(key, error = %err, "skipping malformed rule"),
            }
        }

        let count = loaded.len();
        let ids: Vec<String> = loaded.iter().map(|r| r.def.id.clone()).collect();
        let mut next: Vec<Arc<CompiledRule>> = if merge {
            self.rules.read().clone()
        } else {
            Vec::new()
        };
        for rule in loaded {
            let rule = Arc::new(rule);
            match next.iter_mut().find(|r| r.def.id == rule.def.id) {
                Some(slot) => *slot = rule,
                None => next.push(rule),
            }
        }
        sort_by_priority(&mut next);

        {
            let mut rules = self.rules.write();
            *rules = next;
            self.bump_generation();
        }
        if merge {
            self.invalidate(Some(ids.as_slice()));
        } else {
            self.invalidate(None);
        }
        info!(loaded = count, merge, total = self.rule_count(), "rules loaded");
        count
    }

    /// Replaces the rule table from a view.
    pub fn reload_rules(&self, view: &ConfigView) -> usize {
        self.load_rules(view, false)
    }

    // ---- statistics -------------------------------------------------------

    /// Engine-wide counters.
    #[must_use]
    pub fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            total_checks: self.total_checks.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            rule_evaluations: self.rule_evaluations.load(Ordering::Relaxed),
            cached_entries: self.cache.read().len(),
            rule_count: self.rule_count(),
        }
    }

    /// Per-rule counters in execution order.
    #[must_use]
    pub fn rule_statistics(&self) -> Vec<RuleStatistics> {
        self.rules
            .read()
            .iter()
            .map(|r| RuleStatistics {
                rule_id: r.def.id.clone(),
                executions: r.counters.executions.load(Ordering::Relaxed),
                matches: r.counters.matches.load(Ordering::Relaxed),
                last_match: *r.counters.last_match.lock(),
            })
            .collect()
    }

    /// Zeroes engine and per-rule counters.
    pub fn reset_statistics(&self) {
        self.total_checks.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.rule_evaluations.store(0, Ordering::Relaxed);
        for rule in self.rules.read().iter() {
            rule.counters.reset();
        }
    }

    /// Drops cached matches and threshold counters.
    pub fn clear_caches(&self) {
        self.invalidate(None);
        debug!("rule caches cleared");
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("config", &self.config)
            .field("rules", &self.rule_count())
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

impl Detector for RuleEngine {
    fn name(&self) -> &'static str {
        "rules"
    }

    fn process(&self, entry: &LogEntry) -> Vec<Anomaly> {
        let matches = self.check_entry(entry);
        self.matches_to_anomalies(entry, &matches)
    }

    fn detect_anomalies(&self) -> Vec<Anomaly> {
        Vec::new()
    }

    fn reset(&self) {
        self.clear_caches();
        self.reset_statistics();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::FnPlugin;
    use crate::types::LogLevel;
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;
    use test_case::test_case;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn entry(secs: i64, level: LogLevel, source: &str, msg: &str) -> LogEntry {
        LogEntry::new(ts(secs), level, msg).with_source(source)
    }

    fn bare_engine() -> RuleEngine {
        RuleEngine::with_config(RuleEngineConfig {
            install_default_rules: false,
            ..RuleEngineConfig::default()
        })
    }

    // =========================================================================
    // Built-in rules and evaluation
    // =========================================================================

    #[test]
    fn default_rules_installed_in_priority_order() {
        let engine = RuleEngine::new();
        let ids: Vec<_> = engine.rules().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["critical_keyword", "error_keyword"]);
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let engine = RuleEngine::new();
        let matches = engine.check_entry(&entry(0, LogLevel::Info, "db", "Connection error"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule_id, "error_keyword");
        assert!((matches[0].score - 0.9).abs() < f64::EPSILON);

        let both = engine.check_entry(&entry(0, LogLevel::Info, "db", "critical ERROR"));
        let ids: Vec<_> = both.iter().map(|m| m.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["critical_keyword", "error_keyword"]);
    }

    #[test]
    fn source_rule_exact_and_case_insensitive() {
        let engine = bare_engine();
        engine
            .add_rule(RuleDefinition::new("s", "payments", RuleType::Source, "Payments"))
            .unwrap();
        assert_eq!(engine.check_entry(&entry(0, LogLevel::Info, "PAYMENTS", "x")).len(), 1);
        assert!(engine.check_entry(&entry(0, LogLevel::Info, "payments-v2", "x")).is_empty());
        assert!(engine
            .check_entry(&LogEntry::new(ts(0), LogLevel::Info, "payments"))
            .is_empty());
    }

    #[test]
    fn level_rule_accepts_names_and_numbers() {
        let engine = bare_engine();
        engine
            .add_rule(RuleDefinition::new("lv", "warns", RuleType::Level, "warning"))
            .unwrap();
        engine
            .add_rule(RuleDefinition::new("ln", "crit", RuleType::Level, "5"))
            .unwrap();
        let warn = engine.check_entry(&entry(0, LogLevel::Warn, "a", "w"));
        assert_eq!(warn.len(), 1);
        assert_eq!(warn[0].rule_id, "lv");
        let crit = engine.check_entry(&entry(0, LogLevel::Critical, "a", "c"));
        assert_eq!(crit[0].rule_id, "ln");
    }

    #[test]
    fn threshold_fires_at_count_within_window() {
        let engine = bare_engine();
        engine
            .add_rule(
                RuleDefinition::new("t", "login failures", RuleType::Threshold, "login failed")
                    .with_threshold(3, Duration::from_secs(10)),
            )
            .unwrap();

        let fail = |s| entry(s, LogLevel::Warn, "auth", "login failed for bob");
        assert!(engine.check_entry(&fail(0)).is_empty());
        assert!(engine.check_entry(&entry(1, LogLevel::Info, "auth", "login ok")).is_empty());
        assert!(engine.check_entry(&fail(2)).is_empty());
        let fired = engine.check_entry(&fail(3));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].details, "THRESHOLD exceeded: 3 in 10s (threshold=3)");

        // outside the window the count restarts
        assert!(engine.check_entry(&fail(30)).is_empty());
    }

    #[test]
    fn adaptive_threshold_scales_when_enabled() {
        let engine = bare_engine();
        engine
            .add_rule(
                RuleDefinition::new("t", "burst", RuleType::Threshold, "")
                    .with_threshold(2, Duration::from_secs(60))
                    .with_adaptive(2.0),
            )
            .unwrap();
        engine.set_adaptive_thresholds(true);

        let e = |s| entry(s, LogLevel::Info, "a", "x");
        assert!(engine.check_entry(&e(0)).is_empty());
        assert!(engine.check_entry(&e(1)).is_empty());
        assert!(engine.check_entry(&e(2)).is_empty());
        assert_eq!(engine.check_entry(&e(3)).len(), 1);
    }

    #[test]
    fn extension_rules_need_plugins() {
        let engine = bare_engine();
        engine
            .add_rule(RuleDefinition::new("c", "odd", RuleType::Custom, "7"))
            .unwrap();
        let e = entry(0, LogLevel::Info, "a", "code 7 returned");
        assert!(engine.check_entry(&e).is_empty());

        engine.register_plugin(Arc::new(FnPlugin::new(
            "contains_condition",
            RuleType::Custom,
            |entry: &LogEntry, rule: &RuleDefinition| entry.message.contains(&rule.condition),
        )));
        let matches = engine.check_entry(&e);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].details, "CUSTOM plugin triggered: contains_condition");

        assert!(engine.unregister_plugin("contains_condition"));
        assert!(engine.check_entry(&e).is_empty());
    }

    // =========================================================================
    // Cache
    // =========================================================================

    #[test]
    fn cache_hit_is_idempotent() {
        let engine = RuleEngine::new();
        let e = entry(0, LogLevel::Error, "db", "query error");
        let first = engine.check_entry(&e);
        let second = engine.check_entry(&e);
        assert_eq!(first, second);

        let stats = engine.statistics();
        assert_eq!(stats.total_checks, 2);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cached_entries, 1);
    }

    #[test]
    fn cache_hit_still_evaluates_threshold_rules() {
        let engine = RuleEngine::new();
        engine
            .add_rule(
                RuleDefinition::new("t", "errors", RuleType::Threshold, "error")
                    .with_threshold(2, Duration::from_secs(60)),
            )
            .unwrap();
        let e = entry(0, LogLevel::Error, "db", "query error");
        let first = engine.check_entry(&e);
        assert_eq!(first.len(), 1);
        let second = engine.check_entry(&e);
        let ids: Vec<_> = second.iter().map(|m| m.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["error_keyword", "t"]);
        assert_eq!(engine.statistics().cache_hits, 1);
    }

    #[test]
    fn rule_mutation_clears_cache() {
        let engine = RuleEngine::new();
        let e = entry(0, LogLevel::Info, "db", "an error");
        engine.check_entry(&e);
        assert!(engine.remove_rule("error_keyword"));
        assert!(engine.check_entry(&e).is_empty());
        assert_eq!(engine.statistics().cache_misses, 2);
    }

    #[test]
    fn matches_from_replaced_table_are_not_cached() {
        let engine = bare_engine();
        engine.reload_rules(&ConfigView::new().with("rule.x", "x KEYWORD alpha"));
        let alpha = entry(0, LogLevel::Info, "s", "alpha");

        // a check that snapshotted the old table finishes after the reload
        let (_, stale_generation) = engine.snapshot();
        let stale = engine.check_entry(&alpha);
        assert_eq!(stale.len(), 1);
        engine.reload_rules(&ConfigView::new().with("rule.x", "x KEYWORD beta"));
        assert!(!engine.store(CacheKey::of(&alpha), stale_generation, stale.clone()));
        assert_eq!(engine.statistics().cached_entries, 0);
        assert!(engine.check_entry(&alpha).is_empty());

        // an entry written before the swap but not yet cleared is ignored
        engine
            .cache
            .write()
            .insert(CacheKey::of(&alpha), stale_generation, stale);
        assert!(engine.check_entry(&alpha).is_empty());
        let beta = engine.check_entry(&entry(1, LogLevel::Info, "s", "beta"));
        assert_eq!(beta.len(), 1);
        assert_eq!(beta[0].rule_id, "x");
    }

    #[test]
    fn cache_can_be_disabled() {
        let engine = RuleEngine::with_config(RuleEngineConfig {
            enable_cache: false,
            ..RuleEngineConfig::default()
        });
        let e = entry(0, LogLevel::Info, "db", "error");
        engine.check_entry(&e);
        engine.check_entry(&e);
        let stats = engine.statistics();
        assert_eq!(stats.cache_hits + stats.cache_misses, 0);
        assert_eq!(stats.rule_evaluations, 4);
    }

    // =========================================================================
    // Management
    // =========================================================================

    #[test]
    fn add_update_remove_lifecycle() {
        let engine = bare_engine();
        let def = RuleDefinition::new("oom", "oom", RuleType::Keyword, "out of memory");
        engine.add_rule(def.clone()).unwrap();
        assert_eq!(engine.rule_count(), 1);

        engine.check_entry(&entry(0, LogLevel::Error, "k", "Out of memory: kill"));
        engine
            .update_rule(def.clone().with_priority(RulePriority::Critical))
            .unwrap();
        assert_eq!(engine.get_rule("oom").unwrap().priority, RulePriority::Critical);
        // statistics survive updates
        assert_eq!(engine.rule_statistics()[0].matches, 1);

        let missing = RuleDefinition::new("nope", "nope", RuleType::Keyword, "x");
        assert!(matches!(
            engine.update_rule(missing),
            Err(SiftError::RuleNotFound(id)) if id == "nope"
        ));

        assert!(engine.remove_rule("oom"));
        assert!(!engine.remove_rule("oom"));
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let engine = RuleEngine::new();
        engine.set_rule_enabled("error_keyword", false).unwrap();
        assert!(engine.check_entry(&entry(0, LogLevel::Error, "a", "error")).is_empty());
        assert!(engine.set_rule_enabled("ghost", true).is_err());
    }

    #[test]
    fn invalid_rule_is_rejected() {
        let engine = bare_engine();
        assert!(engine
            .add_rule(RuleDefinition::new("k", "k", RuleType::Keyword, ""))
            .is_err());
        assert_eq!(engine.rule_count(), 0);
    }

    // =========================================================================
    // Loading
    // =========================================================================

    fn sample_view() -> ConfigView {
        ConfigView::new()
            .with("rule.disk", "disk_full KEYWORD no space left")
            .with("rule.disk.severity", "1.7")
            .with("rule.auth", "auth_src source AUTH")
            .with("rule.auth.enabled", "off")
            .with("rule.burst", "burst THRESHOLD timeout")
            .with("rule.burst.threshold", "2")
            .with("rule.burst.window_secs", "30")
            .with("rule.burst.priority", "critical")
            .with("rule.broken", "lonely")
            .with("rule.empty_kw", "kw KEYWORD")
            .with("rules.adaptive", "on")
    }

    #[test]
    fn load_parses_rules_and_companions() {
        let engine = RuleEngine::new();
        let loaded = engine.load_rules(&sample_view(), false);
        assert_eq!(loaded, 3);

        let ids: Vec<_> = engine.rules().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["burst", "auth", "disk"]);

        let disk = engine.get_rule("disk").unwrap();
        assert_eq!(disk.name, "disk_full");
        assert_eq!(disk.condition, "no space left");
        assert!((disk.severity - 1.0).abs() < f64::EPSILON);

        let auth = engine.get_rule("auth").unwrap();
        assert_eq!(auth.rule_type, RuleType::Source);
        assert!(!auth.enabled);

        let burst = engine.get_rule("burst").unwrap();
        assert_eq!(burst.frequency_threshold, 2);
        assert_eq!(burst.time_window, Duration::from_secs(30));
        assert_eq!(burst.priority, RulePriority::Critical);
    }

    #[test]
    fn load_with_merge_keeps_existing() {
        let engine = RuleEngine::new();
        let view = ConfigView::new().with("rule.disk", "disk KEYWORD disk full");
        assert_eq!(engine.load_rules(&view, true), 1);
        assert_eq!(engine.rule_count(), 3);

        assert_eq!(engine.reload_rules(&view), 1);
        assert_eq!(engine.rule_count(), 1);
    }

    #[test]
    fn unknown_type_defaults_to_keyword() {
        let engine = bare_engine();
        let view = ConfigView::new().with("rule.x", "x FANCY needle");
        engine.load_rules(&view, false);
        assert_eq!(engine.get_rule("x").unwrap().rule_type, RuleType::Keyword);
    }

    #[test]
    fn bad_companion_skips_rule() {
        let engine = bare_engine();
        let view = ConfigView::new()
            .with("rule.a", "a KEYWORD alpha")
            .with("rule.a.enabled", "perhaps")
            .with("rule.b", "b KEYWORD beta");
        assert_eq!(engine.load_rules(&view, false), 1);
        assert!(engine.get_rule("a").is_none());
    }

    #[test_case("inf" ; "infinite")]
    #[test_case("1e30" ; "too large")]
    #[test_case("NaN" ; "not a number")]
    #[test_case("-5" ; "negative")]
    fn window_companion_out_of_range_skips_rule(raw: &str) {
        let engine = bare_engine();
        let view = ConfigView::new()
            .with("rule.a", "a THRESHOLD x")
            .with("rule.a.window_secs", raw)
            .with("rule.b", "b KEYWORD beta");
        assert_eq!(engine.load_rules(&view, false), 1);
        assert!(engine.get_rule("a").is_none());
        assert!(engine.get_rule("b").is_some());
    }

    #[test]
    fn fractional_window_companion_is_kept() {
        let engine = bare_engine();
        let view = ConfigView::new()
            .with("rule.a", "a THRESHOLD x")
            .with("rule.a.window_secs", "2.5");
        assert_eq!(engine.load_rules(&view, false), 1);
        let rule = engine.get_rule("a").unwrap();
        assert_eq!(rule.time_window, Duration::from_millis(2500));
    }

    #[test]
    fn rule_anomalies_map_severity() {
        let engine = RuleEngine::new();
        let e = entry(0, LogLevel::Critical, "db", "CRITICAL failure");
        let anomalies = engine.process(&e);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].category, AnomalyCategory::Other);
        assert_eq!(anomalies[0].severity, AnomalySeverity::Critical);
        assert_eq!(anomalies[0].source.as_deref(), Some("db"));
        assert_eq!(anomalies[0].samples.len(), 1);
    }

    #[test]
    fn severity_mapping_bands() {
        assert_eq!(severity_for_score(1.0), AnomalySeverity::Critical);
        assert_eq!(severity_for_score(0.8), AnomalySeverity::High);
        assert_eq!(severity_for_score(0.5), AnomalySeverity::Medium);
        assert_eq!(severity_for_score(0.1), AnomalySeverity::Low);
    }

    #[test]
    fn statistics_reset() {
        let engine = RuleEngine::new();
        engine.check_entry(&entry(0, LogLevel::Info, "a", "error"));
        engine.reset_statistics();
        assert_eq!(engine.statistics().total_checks, 0);
        assert!(engine.rule_statistics().iter().all(|s| s.executions == 0));
    }
}
