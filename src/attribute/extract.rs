//! Numeric coercion of live values

use std::collections::BTreeMap;

use crate::error::ExtractError;
use crate::filter::SortOrder;
use crate::metric::Metric;
use crate::value::JmxValue;

/// Apply a value conversion map: exact match on the string form, else the
/// `default` entry
pub fn convert_value(values: &BTreeMap<String, f64>, raw: &JmxValue) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    raw.scalar_string()
        .and_then(|key| values.get(&key).copied())
        .or_else(|| values.get("default").copied())
}

/// Coerce a live value to a number
///
/// # Errors
/// Returns `ExtractError::NumberFormat` for unparseable strings, nulls and
/// nested values.
pub fn coerce(attribute: &str, raw: &JmxValue) -> Result<f64, ExtractError> {
    let number_format = || ExtractError::NumberFormat {
        attribute: attribute.to_string(),
        value: raw.to_string(),
    };
    match raw {
        JmxValue::String(s) => s.trim().parse::<f64>().map_err(|_| number_format()),
        JmxValue::Integer(i) => Ok(*i as f64),
        JmxValue::Float(f) => Ok(*f),
        JmxValue::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        _ => Err(number_format()),
    }
}

/// Conversion map first, then coercion
pub fn to_number(
    attribute: &str,
    values: &BTreeMap<String, f64>,
    raw: &JmxValue,
) -> Result<f64, ExtractError> {
    match convert_value(values, raw) {
        Some(converted) => Ok(converted),
        None => coerce(attribute, raw),
    }
}

/// Keep the `limit` highest (`Desc`) or lowest (`Asc`) metrics
pub fn apply_limit(mut metrics: Vec<Metric>, limit: Option<usize>, sort: SortOrder) -> Vec<Metric> {
    let Some(limit) = limit else {
        return metrics;
    };
    match sort {
        SortOrder::Desc => metrics.sort_by(|a, b| b.value.total_cmp(&a.value)),
        SortOrder::Asc => metrics.sort_by(|a, b| a.value.total_cmp(&b.value)),
    }
    metrics.truncate(limit);
    metrics
}
