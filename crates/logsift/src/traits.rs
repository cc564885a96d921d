//! The common detector interface.

use crate::types::{Anomaly, LogEntry};

/// A stateful, independent analyzer over the entry stream.
///
/// Implementations guard their own state, so every method takes `&self` and
/// may be called concurrently on the same instance.
pub trait Detector: Send + Sync {
    /// Stable detector name, recorded on every anomaly it emits.
    fn name(&self) -> &'static str;

    /// Feeds one entry, returning anomalies raised by it.
    fn process(&self, entry: &LogEntry) -> Vec<Anomaly>;

    /// Returns summary anomalies over the state accumulated so far.
    fn detect_anomalies(&self) -> Vec<Anomaly>;

    /// Discards all accumulated state.
    fn reset(&self);

    /// Feeds a batch of entries in order.
    fn process_all<'a, I>(&self, entries: I) -> Vec<Anomaly>
    where
        I: IntoIterator<Item = &'a LogEntry>,
        Self: Sized,
    {
        entries
            .into_iter()
            .flat_map(|entry| self.process(entry))
            .collect()
    }
}
