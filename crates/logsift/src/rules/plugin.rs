//! Externally supplied rule evaluators.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::types::{RuleDefinition, RuleType};
use crate::types::LogEntry;

/// Evaluation logic for plugin-backed rule types.
///
/// A plugin answers for every rule whose type equals [`RulePlugin::plugin_type`].
pub trait RulePlugin: Send + Sync {
    /// Returns true if `entry` satisfies `rule`.
    fn evaluate(&self, entry: &LogEntry, rule: &RuleDefinition) -> bool;

    /// Unique registration name.
    fn plugin_name(&self) -> &str;

    /// The rule type this plugin serves.
    fn plugin_type(&self) -> RuleType;
}

/// A plugin backed by a closure.
pub struct FnPlugin<F> {
    name: String,
    rule_type: RuleType,
    func: F,
}

impl<F> FnPlugin<F>
where
    F: Fn(&LogEntry, &RuleDefinition) -> bool + Send + Sync,
{
    /// Wraps a closure as a plugin.
    pub fn new(name: impl Into<String>, rule_type: RuleType, func: F) -> Self {
        Self {
            name: name.into(),
            rule_type,
            func,
        }
    }
}

impl<F> fmt::Debug for FnPlugin<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPlugin")
            .field("name", &self.name)
            .field("rule_type", &self.rule_type)
            .finish_non_exhaustive()
    }
}

impl<F> RulePlugin for FnPlugin<F>
where
    F: Fn(&LogEntry, &RuleDefinition) -> bool + Send + Sync,
{
    fn evaluate(&self, entry: &LogEntry, rule: &RuleDefinition) -> bool {
        (self.func)(entry, rule)
    }

    fn plugin_name(&self) -> &str {
        &self.name
    }

    fn plugin_type(&self) -> RuleType {
        self.rule_type
    }
}

/// Name-ordered plugin table.
#[derive(Default)]
pub(crate) struct PluginRegistry {
    plugins: RwLock<BTreeMap<String, Arc<dyn RulePlugin>>>,
}

impl PluginRegistry {
    /// Registers a plugin, returning the one it replaced.
    pub fn register(&self, plugin: Arc<dyn RulePlugin>) -> Option<Arc<dyn RulePlugin>> {
        let name = plugin.plugin_name().to_string();
        self.plugins.write().insert(name, plugin)
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.plugins.write().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.read().keys().cloned().collect()
    }

    /// First plugin of `rule_type`, in name order, that accepts the entry.
    pub fn first_match(
        &self,
        rule_type: RuleType,
        entry: &LogEntry,
        rule: &RuleDefinition,
    ) -> Option<String> {
        let candidates: Vec<Arc<dyn RulePlugin>> = self
            .plugins
            .read()
            .values()
            .filter(|p| p.plugin_type() == rule_type)
            .cloned()
            .collect();
        candidates
            .into_iter()
            .find(|p| p.evaluate(entry, rule))
            .map(|p| p.plugin_name().to_string())
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
