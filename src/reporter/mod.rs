//! Metric sinks
//!
//! A [`ReportPipeline`] sits between the instances and a [`Reporter`]: it
//! drops non-finite values, turns every non-gauge metric into a per-second
//! rate and applies check-specific renames before handing points over.

pub mod console;
pub mod prometheus;
pub mod rate;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info};

use crate::metric::{Metric, MetricType};

pub use console::ConsoleReporter;
pub use prometheus::PrometheusReporter;
pub use rate::RateAggregator;

/// Iterations during which metric batches are logged at `info`
const VERBOSE_ITERATIONS: u64 = 5;

const CASSANDRA_PREFIX: &str = "jmx.org.apache.";

/// Status of a service check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceCheckStatus {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl ServiceCheckStatus {
    pub fn code(&self) -> u8 {
        match self {
            ServiceCheckStatus::Ok => 0,
            ServiceCheckStatus::Warning => 1,
            ServiceCheckStatus::Critical => 2,
            ServiceCheckStatus::Unknown => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceCheckStatus::Ok => "OK",
            ServiceCheckStatus::Warning => "WARNING",
            ServiceCheckStatus::Critical => "CRITICAL",
            ServiceCheckStatus::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ServiceCheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination of metric points and service checks
pub trait Reporter: Send + Sync {
    fn send_metric_point(&self, metric_type: MetricType, name: &str, value: f64, tags: &[String]);

    fn send_service_check(
        &self,
        check_name: &str,
        status: ServiceCheckStatus,
        message: Option<&str>,
        tags: &[String],
    );
}

/// Rate computation and renames in front of a [`Reporter`]
#[derive(Clone)]
pub struct ReportPipeline {
    reporter: Arc<dyn Reporter>,
    rates: RateAggregator,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Alias as reported: the cassandra check family drops `jmx.org.apache.`
fn reported_name<'a>(check_name: &str, alias: &'a str) -> &'a str {
    if check_name.starts_with("cassandra") {
        alias.strip_prefix(CASSANDRA_PREFIX).unwrap_or(alias)
    } else {
        alias
    }
}

impl ReportPipeline {
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self {
            reporter,
            rates: RateAggregator::new(),
        }
    }

    pub fn rates(&self) -> &RateAggregator {
        &self.rates
    }

    /// Report a batch collected from `instance` now
    ///
    /// Returns the number of points handed to the reporter.
    pub fn send_metrics(&self, metrics: &[Metric], instance: &str, iteration: u64) -> usize {
        self.send_metrics_at(metrics, instance, iteration, now_ms())
    }

    /// Report a batch collected from `instance` at `timestamp_ms`
    pub fn send_metrics_at(
        &self,
        metrics: &[Metric],
        instance: &str,
        iteration: u64,
        timestamp_ms: i64,
    ) -> usize {
        if iteration <= VERBOSE_ITERATIONS {
            info!(instance = %instance, metrics = metrics.len(), iteration, "Reporting metrics");
        } else {
            debug!(instance = %instance, metrics = metrics.len(), iteration, "Reporting metrics");
        }

        let mut sent = 0;
        let mut rated = HashSet::new();
        for metric in metrics {
            let identity = (!metric.metric_type.is_gauge()).then(|| metric.identity());
            if let Some(identity) = &identity {
                rated.insert(identity.clone());
            }
            if !metric.value.is_finite() {
                debug!(instance = %instance, metric = %metric.alias, value = metric.value, "Dropping non-finite value");
                continue;
            }

            let value = match identity {
                None => metric.value,
                Some(identity) => {
                    match self.rates.observe(instance, &identity, metric.value, timestamp_ms) {
                        Some(rate) => rate,
                        None => continue,
                    }
                }
            };

            let name = reported_name(&metric.check_name, &metric.alias);
            self.reporter
                .send_metric_point(metric.metric_type, name, value, &metric.tags);
            sent += 1;
        }

        // series gone from this batch no longer hold a baseline
        let dropped = self.rates.retain(instance, &rated);
        if dropped > 0 {
            debug!(instance = %instance, dropped, "Dropped rate baselines of vanished series");
        }
        sent
    }

    pub fn send_service_check(
        &self,
        check_name: &str,
        status: ServiceCheckStatus,
        message: Option<&str>,
        tags: &[String],
    ) {
        self.reporter
            .send_service_check(check_name, status, message, tags);
    }

    /// Drop rate baselines of a broken instance
    pub fn clear_rates_aggregator(&self, instance: &str) {
        self.rates.clear(instance);
    }
}
