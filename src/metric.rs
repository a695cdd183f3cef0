//! Metric values handed to the reporter

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// How the reporter treats a metric
///
/// Anything but `Gauge` goes through the rate aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MetricType {
    /// Point-in-time value
    #[default]
    Gauge,
    /// Counter reported as a per-second rate
    Rate,
    /// Counter reported as its increase
    MonotonicCount,
    /// Distribution
    Histogram,
}

impl MetricType {
    /// Configuration string
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Rate => "rate",
            MetricType::MonotonicCount => "monotonic_count",
            MetricType::Histogram => "histogram",
        }
    }

    /// Whether the value is reported as-is
    pub fn is_gauge(&self) -> bool {
        matches!(self, MetricType::Gauge)
    }
}

impl Serialize for MetricType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MetricType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_lowercase().as_str() {
            "gauge" => Ok(MetricType::Gauge),
            // legacy name for a rate
            "rate" | "counter" => Ok(MetricType::Rate),
            "monotonic_count" => Ok(MetricType::MonotonicCount),
            "histogram" => Ok(MetricType::Histogram),
            other => Err(serde::de::Error::custom(format!(
                "unknown metric type '{}', expected one of: gauge, rate, counter, monotonic_count, histogram",
                other
            ))),
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One extracted metric
///
/// Alias, type and tags are fixed when the attribute is bound; only `value`
/// changes between extractions.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub alias: String,
    pub metric_type: MetricType,
    /// Sorted, no duplicates
    pub tags: Vec<String>,
    pub value: f64,
    pub check_name: String,
}

impl Metric {
    /// Build a metric; tags are sorted and deduplicated
    pub fn new(
        alias: impl Into<String>,
        metric_type: MetricType,
        tags: impl IntoIterator<Item = String>,
        check_name: impl Into<String>,
    ) -> Self {
        let mut tags: Vec<String> = tags.into_iter().collect();
        tags.sort();
        tags.dedup();
        Self {
            alias: alias.into(),
            metric_type,
            tags,
            value: 0.0,
            check_name: check_name.into(),
        }
    }

    /// Copy of this template carrying `value`
    pub fn with_value(&self, value: f64) -> Self {
        Self {
            value,
            ..self.clone()
        }
    }

    /// Add tags, keeping the set sorted
    pub fn add_tags(&mut self, extra: impl IntoIterator<Item = String>) {
        self.tags.extend(extra);
        self.tags.sort();
        self.tags.dedup();
    }

    /// Key identifying the series across extractions (alias and tags)
    pub fn identity(&self) -> String {
        let mut key = String::with_capacity(self.alias.len() + 16 * self.tags.len());
        key.push_str(&self.alias);
        for tag in &self.tags {
            key.push('|');
            key.push_str(tag);
        }
        key
    }
}
