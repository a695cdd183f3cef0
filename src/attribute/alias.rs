//! Metric alias derivation and name normalization

use once_cell::sync::Lazy;
use regex::Regex;

use crate::matcher::BeanParams;

static FIRST_CAP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(.)([A-Z][a-z]+)").unwrap());
static ALL_CAP: Lazy<Regex> = Lazy::new(|| Regex::new(r"([a-z0-9])([A-Z])").unwrap());
static ILLEGAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9_.]+").unwrap());
static DOT_UNDERSCORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_*\._*").unwrap());
static LEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^a-z]+").unwrap());

const CASSANDRA_DOMAIN: &str = "org.apache.cassandra";

/// Normalize a metric name
///
/// CamelCase becomes snake_case, everything outside `[a-z0-9_.]` becomes `_`,
/// underscores around dots are dropped and a name that does not start with a
/// letter gets a single leading `_`. Applying it twice changes nothing.
///
/// ```
/// use jmx_collector::attribute::alias::convert_metric_name;
///
/// assert_eq!(convert_metric_name("jmx.java.lang.HeapMemoryUsage"), "jmx.java.lang.heap_memory_usage");
/// ```
pub fn convert_metric_name(name: &str) -> String {
    let name = FIRST_CAP.replace_all(name, "${1}_${2}");
    let name = ALL_CAP.replace_all(&name, "${1}_${2}");
    let name = name.to_lowercase();
    let name = ILLEGAL.replace_all(&name, "_");
    let name = DOT_UNDERSCORE.replace_all(&name, ".");
    LEADING.replace(&name, "_").into_owned()
}

/// Inputs of alias derivation for one (sub-)attribute
#[derive(Debug, Clone, Copy)]
pub struct AliasContext<'a> {
    pub domain: &'a str,
    /// Attribute name, with `.<sub-path>` for nested attributes
    pub attribute: &'a str,
    /// Same, without the sub-path
    pub base_attribute: &'a str,
    pub params: &'a BeanParams,
    pub metric_prefix: Option<&'a str>,
    pub cassandra_aliasing: bool,
}

/// Alias before normalization
///
/// Priority: user template, then `metric_prefix`, then Cassandra naming,
/// then `jmx.<domain>.<attribute>`. `value` is only consulted by templates
/// containing `$value`.
pub fn raw_alias(template: Option<&str>, ctx: &AliasContext<'_>, value: Option<&str>) -> String {
    if let Some(template) = template {
        return substitute_alias(template, ctx, value);
    }
    if let Some(prefix) = ctx.metric_prefix {
        return format!("{}.{}.{}", prefix, ctx.domain, ctx.attribute);
    }
    if ctx.cassandra_aliasing && ctx.domain.starts_with(CASSANDRA_DOMAIN) {
        if let Some(name) = ctx.params.get("name") {
            return if ctx.base_attribute == "Value" && ctx.attribute == "Value" {
                format!("cassandra.{}", name)
            } else {
                format!("cassandra.{}.{}", name, ctx.attribute)
            };
        }
    }
    format!("jmx.{}.{}", ctx.domain, ctx.attribute)
}

/// Final alias
pub fn resolve_alias(template: Option<&str>, ctx: &AliasContext<'_>, value: Option<&str>) -> String {
    convert_metric_name(&raw_alias(template, ctx, value))
}

/// Whether a template needs the live value
pub fn needs_value(template: Option<&str>) -> bool {
    template.is_some_and(|t| t.contains("$value"))
}

fn substitute_alias(template: &str, ctx: &AliasContext<'_>, value: Option<&str>) -> String {
    let mut bindings: Vec<(String, &str)> = ctx
        .params
        .iter()
        .map(|(k, v)| (format!("${}", k), v.as_str()))
        .collect();
    bindings.push(("$attribute".to_string(), ctx.attribute));
    bindings.push(("$domain".to_string(), ctx.domain));
    if let Some(value) = value {
        bindings.push(("$value".to_string(), value));
    }
    substitute(template, bindings)
}

/// Replace `$key` placeholders, longest key first so `$name` never eats `$name2`
pub fn substitute<'a>(template: &str, mut bindings: Vec<(String, &'a str)>) -> String {
    if !template.contains('$') {
        return template.to_string();
    }
    bindings.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
    let mut result = template.to_string();
    for (placeholder, value) in bindings {
        if result.contains(&placeholder) {
            result = result.replace(&placeholder, value);
        }
    }
    result
}
