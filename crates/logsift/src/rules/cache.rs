//! Bounded per-entry match cache.

use std::collections::{HashMap, VecDeque};

use super::types::RuleMatch;
use crate::types::{LogEntry, LogLevel};

/// Identity of an entry for caching purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    source: Option<String>,
    level: LogLevel,
    message: String,
}

impl CacheKey {
    pub fn of(entry: &LogEntry) -> Self {
        Self {
            source: entry.source.clone(),
            level: entry.level,
            message: entry.message.clone(),
        }
    }
}

/// Cached matches of cacheable rules, evicted in insertion order.
///
/// Each entry is tagged with the rule-table generation it was computed
/// against; lookups from another generation miss.
#[derive(Debug)]
pub(crate) struct MatchCache {
    capacity: usize,
    entries: HashMap<CacheKey, (u64, Vec<RuleMatch>)>,
    order: VecDeque<CacheKey>,
}

impl MatchCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, key: &CacheKey, generation: u64) -> Option<&Vec<RuleMatch>> {
        self.entries
            .get(key)
            .filter(|(tag, _)| *tag == generation)
            .map(|(_, matches)| matches)
    }

    pub fn insert(&mut self, key: CacheKey, generation: u64, matches: Vec<RuleMatch>) {
        if self
            .entries
            .insert(key.clone(), (generation, matches))
            .is_none()
        {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
