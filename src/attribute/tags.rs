//! Tag assembly

use std::collections::BTreeMap;

use super::alias::substitute;
use crate::bean::Bean;
use crate::filter::Configuration;
use crate::matcher::BeanParams;

/// Tags shared by every metric of an attribute bound to `configuration`
///
/// Bean parameters come first (`host` is renamed `bean_host`, other keys go
/// through `tags_alias`), then `instance:`, `jmx_domain:` and the instance
/// tags. Keys listed in `exclude_tags` are dropped before the configured
/// `tags` are added.
pub fn base_tags(
    bean: &Bean,
    params: &BeanParams,
    configuration: &Configuration,
    instance_name: &str,
    instance_tags: &[String],
) -> Vec<String> {
    let exclude = &configuration.include.exclude_tags;
    let mut tags = Vec::with_capacity(bean.parameters().len() + instance_tags.len() + 2);

    for (key, value) in bean.parameters() {
        if exclude.iter().any(|e| e == key) {
            continue;
        }
        let key = match configuration.conf.tags_alias.get(key) {
            Some(renamed) => renamed.as_str(),
            None if key == "host" => "bean_host",
            None => key.as_str(),
        };
        if exclude.iter().any(|e| e == key) {
            continue;
        }
        tags.push(format!("{}:{}", key, value));
    }

    tags.push(format!("instance:{}", instance_name));
    tags.push(format!("jmx_domain:{}", bean.domain()));
    tags.extend(
        instance_tags
            .iter()
            .filter(|tag| !exclude.iter().any(|e| tag_key(tag) == e))
            .cloned(),
    );

    tags.extend(render_tags(&configuration.include.tags, params, &[]));
    tags
}

/// Render a `key -> value template` tag map
///
/// Templates may reference bean parameters (`$type`, `$1`) and the extra
/// bindings (sibling columns or statistics).
pub fn render_tags(
    templates: &BTreeMap<String, String>,
    params: &BeanParams,
    extra: &[(String, String)],
) -> Vec<String> {
    templates
        .iter()
        .map(|(key, template)| {
            let mut bindings: Vec<(String, &str)> = params
                .iter()
                .map(|(k, v)| (format!("${}", k), v.as_str()))
                .collect();
            bindings.extend(extra.iter().map(|(k, v)| (format!("${}", k), v.as_str())));
            format!("{}:{}", key, substitute(template, bindings))
        })
        .collect()
}

/// Key part of a `key:value` tag
pub fn tag_key(tag: &str) -> &str {
    tag.split_once(':').map_or(tag, |(key, _)| key)
}
