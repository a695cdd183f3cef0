//! Include/exclude filters
//!
//! A [`Configuration`] pairs an include [`Filter`] with an optional exclude
//! filter and a few output options. Configurations are matched in declaration
//! order and the first one satisfied by an attribute wins.
//!
//! # Example Configuration (YAML)
//!
//! ```yaml
//! - include:
//!     domain: kafka.server
//!     bean_regex: "kafka\\.server:type=BrokerTopicMetrics,name=(.*)"
//!     attribute:
//!       Count:
//!         alias: kafka.broker.$1
//!         metric_type: rate
//!   exclude:
//!     type: [ReplicaManager]
//!   conf:
//!     metric_prefix: kafka
//! ```
//!
//! Any include key that is not one of the reserved names is a constraint on
//! the bean parameters (`type: [A, B]` requires `type=A` or `type=B`).

use std::collections::BTreeMap;

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::FilterError;
use crate::metric::MetricType;

/// Filter keys with a dedicated meaning; everything else constrains bean parameters
pub const RESERVED_KEYS: &[&str] = &[
    "domain",
    "domain_regex",
    "bean",
    "bean_name",
    "bean_regex",
    "attribute",
    "class",
    "class_regex",
    "tags",
    "exclude_tags",
];

/// One ordered entry of the configuration list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    pub include: Filter,

    #[serde(default)]
    pub exclude: Filter,

    #[serde(default)]
    pub conf: ConfOptions,
}

/// Output options of a configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfOptions {
    /// Prefix for generated aliases (`<prefix>.<domain>.<attribute>`)
    pub metric_prefix: Option<String>,

    /// Renames bean parameter tag keys (`beanKey -> tagKey`)
    #[serde(default)]
    pub tags_alias: BTreeMap<String, String>,
}

/// Declarative predicate over beans and attributes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    pub domain: Option<String>,

    pub domain_regex: Option<String>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub bean: Vec<String>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub bean_name: Vec<String>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub bean_regex: Vec<String>,

    pub class: Option<String>,

    pub class_regex: Option<String>,

    pub attribute: Option<AttributeFilter>,

    #[serde(default)]
    pub exclude_tags: Vec<String>,

    /// Additional tags; values may reference bean parameters as `$key`
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Bean parameter constraints
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_yaml::Value>,

    #[serde(skip)]
    compiled: OnceCell<CompiledFilter>,
}

/// Regexes and parameter constraints of a filter, built once
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    pub(crate) domain_regex: Option<Regex>,
    pub(crate) bean_names: Vec<String>,
    /// Anchored: bean regexes must match the whole bean name
    pub(crate) bean_regex: Vec<Regex>,
    pub(crate) class_regex: Option<Regex>,
    pub(crate) params: Vec<(String, Vec<String>)>,
}

impl Filter {
    /// Compile the filter (lazily, once)
    ///
    /// # Errors
    /// Returns `FilterError` if a regex is invalid or uses syntax the regex
    /// engine cannot express.
    pub fn compiled(&self) -> Result<&CompiledFilter, FilterError> {
        self.compiled.get_or_try_init(|| {
            let domain_regex = self.domain_regex.as_deref().map(compile_regex).transpose()?;
            let class_regex = self.class_regex.as_deref().map(compile_regex).transpose()?;
            let bean_regex = self
                .bean_regex
                .iter()
                .map(|pattern| compile_anchored(pattern))
                .collect::<Result<Vec<_>, _>>()?;

            let mut bean_names = self.bean.clone();
            bean_names.extend(self.bean_name.iter().cloned());

            let params = self
                .params
                .iter()
                .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), yaml_values(value)))
                .collect();

            Ok(CompiledFilter {
                domain_regex,
                bean_names,
                bean_regex,
                class_regex,
                params,
            })
        })
    }

    /// Whether the filter constrains the bean class
    pub fn references_class(&self) -> bool {
        self.class.is_some() || self.class_regex.is_some()
    }

    /// Scope patterns that cover every bean this filter can include, or
    /// `None` when it cannot be narrowed below "all beans"
    pub fn common_scopes(&self) -> Option<Vec<String>> {
        let mut names = self.bean.clone();
        names.extend(self.bean_name.iter().cloned());
        if !names.is_empty() {
            return Some(names);
        }

        let domain = self.domain.as_ref()?;
        let mut scope = format!("{}:", domain);
        for (key, value) in &self.params {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            // a pattern holds one value per key
            if let [single] = yaml_values(value).as_slice() {
                scope.push_str(key);
                scope.push('=');
                scope.push_str(single);
                scope.push(',');
            }
        }
        scope.push('*');
        Some(vec![scope])
    }
}

impl Configuration {
    /// Compile both filters
    ///
    /// # Errors
    /// Returns the first `FilterError` found.
    pub fn compile(&self) -> Result<(), FilterError> {
        self.include.compiled()?;
        self.exclude.compiled()?;
        Ok(())
    }

    /// Whether either filter constrains the bean class
    pub fn references_class(&self) -> bool {
        self.include.references_class() || self.exclude.references_class()
    }
}

/// Attribute selection of a filter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeFilter {
    /// Plain list of attribute names
    Names(Vec<String>),
    /// Attribute names with per-attribute options
    Detailed(BTreeMap<String, Option<AttributeOptions>>),
}

impl AttributeFilter {
    /// Whether `name` (an attribute or `Attribute.sub` path) is listed
    pub fn contains(&self, name: &str) -> bool {
        match self {
            AttributeFilter::Names(names) => names.iter().any(|n| n == name),
            AttributeFilter::Detailed(map) => map.contains_key(name),
        }
    }

    /// Options declared for exactly `name`
    pub fn options(&self, name: &str) -> Option<&AttributeOptions> {
        match self {
            AttributeFilter::Names(_) => None,
            AttributeFilter::Detailed(map) => map.get(name).and_then(Option::as_ref),
        }
    }

    /// Listed names
    pub fn names(&self) -> Vec<&str> {
        match self {
            AttributeFilter::Names(names) => names.iter().map(String::as_str).collect(),
            AttributeFilter::Detailed(map) => map.keys().map(String::as_str).collect(),
        }
    }
}

/// Row order used with `limit`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Keep the highest values
    #[default]
    Desc,
    /// Keep the lowest values
    Asc,
}

/// Per-attribute options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributeOptions {
    pub alias: Option<String>,

    #[serde(alias = "type")]
    pub metric_type: Option<MetricType>,

    /// Raw value -> number conversions; `default` catches unlisted values
    #[serde(default, deserialize_with = "value_conversions")]
    pub values: BTreeMap<String, f64>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    pub limit: Option<usize>,

    #[serde(default)]
    pub sort: SortOrder,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(one)) => vec![one],
        Some(OneOrMany::Many(many)) => many,
    })
}

// YAML keys such as `true:` or `1:` are not strings
fn value_conversions<'de, D>(deserializer: D) -> Result<BTreeMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let mapping = Option::<serde_yaml::Mapping>::deserialize(deserializer)?.unwrap_or_default();
    let mut values = BTreeMap::new();
    for (key, value) in &mapping {
        let key = yaml_scalar(key)
            .ok_or_else(|| serde::de::Error::custom("value conversion keys must be scalars"))?;
        let number = match value {
            serde_yaml::Value::Number(n) => n.as_f64(),
            serde_yaml::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            serde_yaml::Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            serde::de::Error::custom(format!("value conversion for '{}' is not a number", key))
        })?;
        values.insert(key, number);
    }
    Ok(values)
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn yaml_values(value: &serde_yaml::Value) -> Vec<String> {
    match value {
        serde_yaml::Value::Sequence(items) => items.iter().filter_map(yaml_scalar).collect(),
        other => yaml_scalar(other).into_iter().collect(),
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, FilterError> {
    let converted = convert_java_regex(pattern)?;
    Regex::new(&converted).map_err(|source| FilterError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn compile_anchored(pattern: &str) -> Result<Regex, FilterError> {
    let converted = convert_java_regex(pattern)?;
    Regex::new(&format!("^(?:{})$", converted)).map_err(|source| FilterError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Convert Java regex syntax to Rust regex syntax
///
/// Handles common differences between Java and Rust regex:
/// - Named groups: `(?<name>...)` → `(?P<name>...)`
/// - Possessive quantifiers: `++`, `*+`, `?+` → `+`, `*`, `?` (with warning)
/// - Atomic groups and lookaround: error (not supported)
///
/// # Errors
///
/// Returns `FilterError::UnsupportedSyntax` for unsupported features.
pub fn convert_java_regex(pattern: &str) -> Result<String, FilterError> {
    let unsupported = |feature: &str| FilterError::UnsupportedSyntax {
        pattern: pattern.to_string(),
        feature: feature.to_string(),
    };

    let mut result = String::with_capacity(pattern.len() + 16);
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '(' if chars.peek() == Some(&'?') => {
                chars.next();
                match chars.peek() {
                    Some('<') => {
                        chars.next();
                        match chars.peek() {
                            Some('=') => {
                                return Err(unsupported("positive lookbehind assertions (?<=...)"))
                            }
                            Some('!') => {
                                return Err(unsupported("negative lookbehind assertions (?<!...)"))
                            }
                            _ => result.push_str("(?P<"),
                        }
                    }
                    Some('>') => return Err(unsupported("atomic groups (?>...)")),
                    Some('=') => return Err(unsupported("positive lookahead assertions (?=...)")),
                    Some('!') => return Err(unsupported("negative lookahead assertions (?!...)")),
                    _ => result.push_str("(?"),
                }
            }
            '+' | '*' | '?' => {
                result.push(c);
                if chars.peek() == Some(&'+') {
                    chars.next();
                    tracing::warn!(
                        pattern = %pattern,
                        "Possessive quantifier '{}+' converted to '{}' - behavior may differ",
                        c, c
                    );
                }
            }
            '\\' => {
                result.push(c);
                if let Some(escaped) = chars.next() {
                    result.push(escaped);
                }
            }
            _ => result.push(c),
        }
    }

    Ok(result)
}
