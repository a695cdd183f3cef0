//! Per-instance rate computation

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    value: f64,
    timestamp_ms: i64,
}

/// Last observed sample of every rated metric, keyed by instance then by
/// metric identity
#[derive(Debug, Clone, Default)]
pub struct RateAggregator {
    samples: Arc<RwLock<HashMap<String, HashMap<String, Sample>>>>,
}

impl RateAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample and return the per-second rate against the previous
    /// one
    ///
    /// The first sample of an identity only seeds the baseline. The baseline
    /// always advances, even when the rate is not finite (same timestamp).
    pub fn observe(&self, instance: &str, identity: &str, value: f64, timestamp_ms: i64) -> Option<f64> {
        let mut samples = self.samples.write().unwrap_or_else(|e| e.into_inner());
        let previous = samples
            .entry(instance.to_string())
            .or_default()
            .insert(identity.to_string(), Sample { value, timestamp_ms })?;

        let elapsed_ms = (timestamp_ms - previous.timestamp_ms) as f64;
        let rate = 1000.0 * (value - previous.value) / elapsed_ms;
        rate.is_finite().then_some(rate)
    }

    /// Forget every sample of `instance`
    pub fn clear(&self, instance: &str) {
        let mut samples = self.samples.write().unwrap_or_else(|e| e.into_inner());
        samples.remove(instance);
    }

    /// Forget the identities of `instance` missing from `live`
    ///
    /// Returns the number of dropped baselines.
    pub fn retain(&self, instance: &str, live: &HashSet<String>) -> usize {
        let mut samples = self.samples.write().unwrap_or_else(|e| e.into_inner());
        let Some(tracked) = samples.get_mut(instance) else {
            return 0;
        };
        let before = tracked.len();
        tracked.retain(|identity, _| live.contains(identity));
        before - tracked.len()
    }

    /// Number of tracked identities of `instance`
    pub fn tracked(&self, instance: &str) -> usize {
        let samples = self.samples.read().unwrap_or_else(|e| e.into_inner());
        samples.get(instance).map_or(0, HashMap::len)
    }
}
