//! Prometheus exposition format output
//!
//! Buffers the latest value of every point and renders them in the text
//! exposition format (version 0.0.4):
//!
//! ```text
//! # HELP <metric_name> <help_text>
//! # TYPE <metric_name> <type>
//! <metric_name>{<label1>="<value1>",<label2>="<value2>"} <value> [<timestamp>]
//! ```
//!
//! Aliases are dotted (`jvm.heap_memory`) and become `jvm_heap_memory`;
//! `key:value` tags become labels. Service checks are exposed as gauges
//! holding the status code.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{Reporter, ServiceCheckStatus};
use crate::metric::MetricType;

type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
struct Point {
    alias: String,
    metric_type: MetricType,
    value: f64,
    timestamp_ms: i64,
}

/// Reporter keeping the latest points for scraping
#[derive(Debug, Default)]
pub struct PrometheusReporter {
    /// metric name -> label set -> latest point
    points: RwLock<BTreeMap<String, BTreeMap<Labels, Point>>>,
    include_timestamp: bool,
}

impl PrometheusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether to include timestamps in output
    pub fn with_timestamps(mut self, include: bool) -> Self {
        self.include_timestamp = include;
        self
    }

    /// Number of buffered series
    pub fn len(&self) -> usize {
        let points = self.points.read().unwrap_or_else(|e| e.into_inner());
        points.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, alias: &str, metric_type: MetricType, value: f64, tags: &[String]) {
        let point = Point {
            alias: alias.to_string(),
            metric_type,
            value,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or_default(),
        };
        let mut points = self.points.write().unwrap_or_else(|e| e.into_inner());
        points
            .entry(sanitize_name(alias))
            .or_default()
            .insert(labels(tags), point);
    }

    /// Render every buffered series
    ///
    /// HELP and TYPE lines are emitted once per metric name; names and labels
    /// are sorted for deterministic output.
    pub fn render(&self) -> String {
        let points = self.points.read().unwrap_or_else(|e| e.into_inner());
        let mut output = String::with_capacity(points.len() * 100);

        for (name, series) in points.iter() {
            let Some(first) = series.values().next() else {
                continue;
            };
            output.push_str(&format!(
                "# HELP {} {} ({})\n",
                name,
                escape_help(&first.alias),
                first.metric_type
            ));
            output.push_str(&format!("# TYPE {} gauge\n", name));

            for (labels, point) in series {
                output.push_str(name);
                if !labels.is_empty() {
                    let pairs: Vec<String> = labels
                        .iter()
                        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
                        .collect();
                    output.push('{');
                    output.push_str(&pairs.join(","));
                    output.push('}');
                }
                output.push(' ');
                output.push_str(&format_value(point.value));
                if self.include_timestamp {
                    output.push(' ');
                    output.push_str(&point.timestamp_ms.to_string());
                }
                output.push('\n');
            }
        }

        output
    }
}

impl Reporter for PrometheusReporter {
    fn send_metric_point(&self, metric_type: MetricType, name: &str, value: f64, tags: &[String]) {
        self.record(name, metric_type, value, tags);
    }

    fn send_service_check(
        &self,
        check_name: &str,
        status: ServiceCheckStatus,
        _message: Option<&str>,
        tags: &[String],
    ) {
        self.record(check_name, MetricType::Gauge, f64::from(status.code()), tags);
    }
}

fn labels(tags: &[String]) -> Labels {
    tags.iter()
        .map(|tag| match tag.split_once(':') {
            Some((key, value)) => (sanitize_label(key), value.to_string()),
            None => (sanitize_label(tag), "true".to_string()),
        })
        .collect()
}

/// Replace characters outside `[a-zA-Z0-9_:]`; a leading digit gets a `_`
pub fn sanitize_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if sanitized.starts_with(|c: char| c.is_ascii_digit()) || sanitized.is_empty() {
        sanitized.insert(0, '_');
    }
    sanitized
}

fn sanitize_label(name: &str) -> String {
    sanitize_name(name).replace(':', "_")
}

/// Format a numeric value for Prometheus
///
/// - NaN → "NaN"
/// - +Inf → "+Inf"
/// - -Inf → "-Inf"
/// - Integers are formatted without decimal point
/// - Large/small floats use scientific notation
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else if value.abs() >= 1e6 || (value.abs() < 1e-3 && value != 0.0) {
        format!("{:e}", value)
    } else {
        format!("{}", value)
    }
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Escapes backslash, double-quote, and newline characters.
fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(c),
        }
    }
    escaped
}
