//! Live attribute values
//!
//! [`JmxValue`] is what a connection returns for one attribute read. Nested
//! statistic objects (WebSphere PMI style) are recognised through the
//! [`StatsAdapter`] capability so the matching and extraction code never
//! depends on a concrete statistics model.

use std::collections::BTreeMap;
use std::fmt;

/// Value of one attribute as returned by the target
#[derive(Debug, Clone, PartialEq)]
pub enum JmxValue {
    /// Null
    Null,
    /// Boolean
    Boolean(bool),
    /// Integral number (int, long, atomic variants)
    Integer(i64),
    /// Floating point number
    Float(f64),
    /// String
    String(String),
    /// One flat level of named values (CompositeData, Map)
    Composite(BTreeMap<String, JmxValue>),
    /// Index-keyed rows (TabularData)
    Tabular(TabularData),
    /// Array
    Array(Vec<JmxValue>),
}

impl JmxValue {
    /// Scalar string form, used for value conversions and `$value` aliases
    ///
    /// Floats render the way the JVM prints a double (`1.0`, `1.5E-5`), so
    /// conversion keys written against the target's output match.
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            JmxValue::Boolean(b) => Some(b.to_string()),
            JmxValue::Integer(i) => Some(i.to_string()),
            JmxValue::Float(f) => Some(java_double(*f)),
            JmxValue::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Whether the value is a leaf (neither composite, tabular nor array)
    pub fn is_scalar(&self) -> bool {
        !matches!(
            self,
            JmxValue::Composite(_) | JmxValue::Tabular(_) | JmxValue::Array(_)
        )
    }

    /// Composite entries, if this is a composite
    pub fn as_composite(&self) -> Option<&BTreeMap<String, JmxValue>> {
        match self {
            JmxValue::Composite(map) => Some(map),
            _ => None,
        }
    }

    /// Short name of the value shape for log messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            JmxValue::Null => "null",
            JmxValue::Boolean(_) => "boolean",
            JmxValue::Integer(_) => "integer",
            JmxValue::Float(_) => "float",
            JmxValue::String(_) => "string",
            JmxValue::Composite(_) => "composite",
            JmxValue::Tabular(_) => "tabular",
            JmxValue::Array(_) => "array",
        }
    }
}

// Double.toString: plain notation in [1e-3, 1e7), scientific outside
fn java_double(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }

    let magnitude = value.abs();
    if magnitude == 0.0 || (1e-3..1e7).contains(&magnitude) {
        let plain = value.to_string();
        return if plain.contains('.') {
            plain
        } else {
            format!("{}.0", plain)
        };
    }

    let scientific = format!("{:e}", value);
    match scientific.split_once('e') {
        Some((mantissa, exponent)) if mantissa.contains('.') => format!("{}E{}", mantissa, exponent),
        Some((mantissa, exponent)) => format!("{}.0E{}", mantissa, exponent),
        None => scientific,
    }
}

impl fmt::Display for JmxValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scalar_string() {
            Some(s) => f.write_str(&s),
            None => f.write_str(self.kind_name()),
        }
    }
}

/// TabularData: rows keyed by the tuple of their index columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabularData {
    /// Names of the index (primary key) columns
    pub index_names: Vec<String>,
    /// Rows
    pub rows: Vec<TabularRow>,
}

/// One tabular row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabularRow {
    /// Index tuple
    pub key: Vec<String>,
    /// Column values, index columns included
    pub values: BTreeMap<String, JmxValue>,
}

impl TabularRow {
    /// Row key: the comma-joined index tuple
    pub fn row_key(&self) -> String {
        self.key.join(",")
    }

    /// Value at a column path; `column.sub` descends one composite level
    pub fn get_path(&self, path: &str) -> Option<&JmxValue> {
        if let Some(value) = self.values.get(path) {
            return Some(value);
        }
        let (column, sub) = path.split_once('.')?;
        self.values.get(column)?.as_composite()?.get(sub)
    }
}

impl TabularData {
    /// Every non-index column path, flattening one level of composite values
    pub fn column_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for row in &self.rows {
            for (column, value) in &row.values {
                if self.index_names.contains(column) {
                    continue;
                }
                match value {
                    JmxValue::Composite(nested) => {
                        for (sub, nested_value) in nested {
                            if nested_value.is_scalar() {
                                paths.push(format!("{}.{}", column, sub));
                            }
                        }
                    }
                    v if v.is_scalar() => paths.push(column.clone()),
                    _ => {}
                }
            }
        }
        paths.sort();
        paths.dedup();
        paths
    }
}

/// Capability for statistic objects grouped into named sub-collections
///
/// The unnamed group `""` holds the top-level statistics.
pub trait StatsAdapter: Send + Sync + fmt::Debug {
    /// Whether the live value is a statistics object this adapter understands
    fn is_stat_object(&self, value: &JmxValue) -> bool;

    /// Group names, `""` first when top-level statistics exist
    fn list_groups(&self, value: &JmxValue) -> Vec<String>;

    /// Statistic paths (`Stat.field`) inside one group
    fn list_stat_paths(&self, value: &JmxValue, group: &str) -> Vec<String>;

    /// Read one statistic
    fn read_stat_value(&self, value: &JmxValue, group: &str, path: &str) -> Option<JmxValue>;
}

/// Reads WebSphere PMI `Stats` objects as serialized by Jolokia:
///
/// ```text
/// { "name": "connectionPoolModule",
///   "statistics": [ { "name": "PoolSize", "current": 10, "lowWaterMark": 1 } ],
///   "subStats":   [ { "name": "jdbc/orders", "statistics": [ ... ] } ] }
/// ```
#[derive(Debug, Clone, Default)]
pub struct PmiStatsAdapter;

const STATISTICS: &str = "statistics";
const SUB_STATS: &str = "subStats";
// timestamps, not measurements
const IGNORED_FIELDS: &[&str] = &["name", "unit", "description", "startTime", "lastSampleTime"];

impl PmiStatsAdapter {
    fn group<'a>(&self, value: &'a JmxValue, group: &str) -> Option<&'a BTreeMap<String, JmxValue>> {
        let root = value.as_composite()?;
        if group.is_empty() {
            return Some(root);
        }
        match root.get(SUB_STATS)? {
            JmxValue::Array(subs) => subs.iter().filter_map(JmxValue::as_composite).find(|sub| {
                matches!(sub.get("name"), Some(JmxValue::String(name)) if name == group)
            }),
            _ => None,
        }
    }

    fn statistics<'a>(&self, group: &'a BTreeMap<String, JmxValue>) -> Vec<(&'a str, &'a BTreeMap<String, JmxValue>)> {
        let Some(JmxValue::Array(stats)) = group.get(STATISTICS) else {
            return Vec::new();
        };
        stats
            .iter()
            .filter_map(JmxValue::as_composite)
            .filter_map(|stat| match stat.get("name") {
                Some(JmxValue::String(name)) => Some((name.as_str(), stat)),
                _ => None,
            })
            .collect()
    }
}

impl StatsAdapter for PmiStatsAdapter {
    fn is_stat_object(&self, value: &JmxValue) -> bool {
        match value.as_composite() {
            Some(map) => {
                matches!(map.get(STATISTICS), Some(JmxValue::Array(_)))
                    || matches!(map.get(SUB_STATS), Some(JmxValue::Array(_)))
            }
            None => false,
        }
    }

    fn list_groups(&self, value: &JmxValue) -> Vec<String> {
        let mut groups = Vec::new();
        let Some(root) = value.as_composite() else {
            return groups;
        };
        if !self.statistics(root).is_empty() {
            groups.push(String::new());
        }
        if let Some(JmxValue::Array(subs)) = root.get(SUB_STATS) {
            for sub in subs.iter().filter_map(JmxValue::as_composite) {
                if let Some(JmxValue::String(name)) = sub.get("name") {
                    groups.push(name.clone());
                }
            }
        }
        groups
    }

    fn list_stat_paths(&self, value: &JmxValue, group: &str) -> Vec<String> {
        let Some(group) = self.group(value, group) else {
            return Vec::new();
        };
        let mut paths = Vec::new();
        for (name, stat) in self.statistics(group) {
            for (field, field_value) in stat {
                if IGNORED_FIELDS.contains(&field.as_str()) || !field_value.is_scalar() {
                    continue;
                }
                paths.push(format!("{}.{}", name, field));
            }
        }
        paths
    }

    fn read_stat_value(&self, value: &JmxValue, group: &str, path: &str) -> Option<JmxValue> {
        let group = self.group(value, group)?;
        let (name, field) = path.split_once('.')?;
        self.statistics(group)
            .into_iter()
            .find(|(stat_name, _)| *stat_name == name)
            .and_then(|(_, stat)| stat.get(field).cloned())
    }
}
