//! Bean and attribute match predicates
//!
//! Include predicates must all hold; no exclude predicate may hold. Bean-level
//! checks ([`match_bean_level`]) run once per bean and configuration; the
//! attribute check ([`match_attribute_names`]) runs per attribute with the
//! live sub-paths when the attribute is nested.

use std::collections::BTreeMap;

use crate::bean::Bean;
use crate::error::FilterError;
use crate::filter::{AttributeFilter, Configuration, Filter};

/// Bean parameters plus bean-regex captures (`"0"`, `"1"`, ...)
pub type BeanParams = BTreeMap<String, String>;

/// Outcome of matching an attribute name against an attribute filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeMatch {
    /// The attribute name itself is selected
    Whole,
    /// Only these sub-paths are selected
    Subset(Vec<String>),
    /// Nothing selected
    None,
}

impl AttributeMatch {
    pub fn is_match(&self) -> bool {
        !matches!(self, AttributeMatch::None)
    }
}

/// Include-side domain check
pub fn match_domain(filter: &Filter, domain: &str) -> Result<bool, FilterError> {
    let compiled = filter.compiled()?;
    if let Some(expected) = &filter.domain {
        if expected != domain {
            return Ok(false);
        }
    }
    if let Some(regex) = &compiled.domain_regex {
        if !regex.is_match(domain) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Include-side class check; a missing class name fails any class constraint
pub fn match_class(filter: &Filter, class_name: Option<&str>) -> Result<bool, FilterError> {
    let compiled = filter.compiled()?;
    if let Some(expected) = &filter.class {
        if class_name != Some(expected.as_str()) {
            return Ok(false);
        }
    }
    if let Some(regex) = &compiled.class_regex {
        match class_name {
            Some(name) if regex.is_match(name) => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

/// Include-side bean check
///
/// Returns the bean parameters extended with the capture groups of the first
/// matching `bean_regex`, or `None` when the bean is not included.
pub fn match_bean(filter: &Filter, bean: &Bean) -> Result<Option<BeanParams>, FilterError> {
    let compiled = filter.compiled()?;
    let name = bean.string_form();

    if !compiled.bean_names.is_empty() && !compiled.bean_names.iter().any(|n| n == name) {
        return Ok(None);
    }

    let mut params: BeanParams = bean
        .parameters()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if !compiled.bean_regex.is_empty() {
        let captures = compiled
            .bean_regex
            .iter()
            .find_map(|regex| regex.captures(name));
        let Some(captures) = captures else {
            return Ok(None);
        };
        for (index, group) in captures.iter().enumerate() {
            if let Some(group) = group {
                params.insert(index.to_string(), group.as_str().to_string());
            }
        }
    }

    for (key, allowed) in &compiled.params {
        match bean.get(key) {
            Some(value) if allowed.iter().any(|a| a == value) => {}
            _ => return Ok(None),
        }
    }

    Ok(Some(params))
}

/// Exclude-side domain check
pub fn exclude_domain(filter: &Filter, domain: &str) -> Result<bool, FilterError> {
    let compiled = filter.compiled()?;
    if filter.domain.as_deref() == Some(domain) {
        return Ok(true);
    }
    Ok(compiled
        .domain_regex
        .as_ref()
        .is_some_and(|regex| regex.is_match(domain)))
}

/// Exclude-side class check
pub fn exclude_class(filter: &Filter, class_name: Option<&str>) -> Result<bool, FilterError> {
    let compiled = filter.compiled()?;
    let Some(class_name) = class_name else {
        return Ok(false);
    };
    if filter.class.as_deref() == Some(class_name) {
        return Ok(true);
    }
    Ok(compiled
        .class_regex
        .as_ref()
        .is_some_and(|regex| regex.is_match(class_name)))
}

/// Exclude-side bean check: any listed name, regex or parameter value excludes
pub fn exclude_bean(filter: &Filter, bean: &Bean) -> Result<bool, FilterError> {
    let compiled = filter.compiled()?;
    let name = bean.string_form();

    if compiled.bean_names.iter().any(|n| n == name) {
        return Ok(true);
    }
    if compiled.bean_regex.iter().any(|regex| regex.is_match(name)) {
        return Ok(true);
    }
    Ok(compiled.params.iter().any(|(key, excluded)| {
        bean.get(key)
            .is_some_and(|value| excluded.iter().any(|e| e == value))
    }))
}

/// Every bean-level predicate of one configuration
///
/// Returns the parameter view used for alias and tag substitution when the
/// bean passes, `None` otherwise.
pub fn match_bean_level(
    configuration: &Configuration,
    bean: &Bean,
    class_name: Option<&str>,
) -> Result<Option<BeanParams>, FilterError> {
    let include = &configuration.include;
    let exclude = &configuration.exclude;

    if !match_domain(include, bean.domain())? || !match_class(include, class_name)? {
        return Ok(None);
    }
    if exclude_domain(exclude, bean.domain())? || exclude_class(exclude, class_name)? {
        return Ok(None);
    }
    let Some(params) = match_bean(include, bean)? else {
        return Ok(None);
    };
    if exclude_bean(exclude, bean)? {
        return Ok(None);
    }
    Ok(Some(params))
}

/// Match an attribute (and its live sub-paths) against an attribute filter
///
/// `sub_paths` are relative (`used`, `Stat.count`); entries are looked up as
/// `<name>.<sub_path>`. An unset filter selects everything when
/// `match_on_empty` holds (include side) and nothing otherwise (exclude side).
pub fn match_attribute_names(
    filter: Option<&AttributeFilter>,
    name: &str,
    sub_paths: &[String],
    match_on_empty: bool,
) -> AttributeMatch {
    let Some(filter) = filter else {
        return if match_on_empty {
            AttributeMatch::Whole
        } else {
            AttributeMatch::None
        };
    };

    if filter.contains(name) {
        return AttributeMatch::Whole;
    }

    let survivors: Vec<String> = sub_paths
        .iter()
        .filter(|path| filter.contains(&format!("{}.{}", name, path)))
        .cloned()
        .collect();

    if survivors.is_empty() {
        AttributeMatch::None
    } else {
        AttributeMatch::Subset(survivors)
    }
}

/// Sub-paths selected by the include match and not removed by the exclude match
pub fn select_sub_paths(
    all: &[String],
    include: &AttributeMatch,
    exclude: &AttributeMatch,
) -> Vec<String> {
    let included: Vec<String> = match include {
        AttributeMatch::Whole => all.to_vec(),
        AttributeMatch::Subset(paths) => paths.clone(),
        AttributeMatch::None => Vec::new(),
    };
    match exclude {
        AttributeMatch::Whole => Vec::new(),
        AttributeMatch::Subset(excluded) => included
            .into_iter()
            .filter(|path| !excluded.contains(path))
            .collect(),
        AttributeMatch::None => included,
    }
}
