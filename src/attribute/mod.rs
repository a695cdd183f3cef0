//! Attributes: classification, binding and extraction
//!
//! An attribute starts as a [`Candidate`] (listed by the target, never
//! matched). Binding tries the configurations whose bean-level predicates hold,
//! in order; the first one that selects the attribute (or at least one of its
//! sub-paths) produces a [`MatchedAttribute`]. Alias, type and tags are
//! computed there and only there; extraction afterwards only refreshes values.

pub mod alias;
pub mod extract;
pub mod kind;
pub mod tags;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::bean::Bean;
use crate::connection::{AttributeInfo, Connection};
use crate::error::{ConnectionError, ExtractError};
use crate::filter::{AttributeFilter, AttributeOptions, Configuration, SortOrder};
use crate::matcher::{match_attribute_names, select_sub_paths, AttributeMatch, BeanParams};
use crate::metric::{Metric, MetricType};
use crate::value::{JmxValue, StatsAdapter, TabularData, TabularRow};

use alias::{needs_value, resolve_alias, AliasContext};
use extract::{apply_limit, to_number};
pub use kind::{classify_type, AttributeKind};
use tags::{base_tags, render_tags};

/// Instance-wide inputs of binding
#[derive(Debug, Clone, Default)]
pub struct InstanceContext {
    pub instance_name: String,
    pub check_name: String,
    /// `key:value` tags added to every metric
    pub instance_tags: Vec<String>,
    pub cassandra_aliasing: bool,
    pub stats: Option<Arc<dyn StatsAdapter>>,
}

/// A configuration whose bean-level predicates hold for a bean
#[derive(Debug, Clone)]
pub struct BeanMatch {
    pub configuration: Arc<Configuration>,
    /// Bean parameters plus bean-regex captures
    pub params: BeanParams,
}

/// Listing entry for one attribute
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeSummary {
    pub bean: String,
    pub attribute: String,
    pub type_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricSummary>,
}

/// Alias and type of one metric of a matched attribute
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub alias: String,
    pub metric_type: MetricType,
}

/// An attribute that has never been matched
#[derive(Debug, Clone)]
pub struct Candidate {
    bean: Arc<Bean>,
    name: String,
    type_name: String,
    kind: Option<AttributeKind>,
}

impl Candidate {
    pub fn new(bean: Arc<Bean>, info: AttributeInfo) -> Self {
        let kind = classify_type(&info.type_name);
        Self {
            bean,
            name: info.name,
            type_name: info.type_name,
            kind,
        }
    }

    pub fn bean(&self) -> &Bean {
        &self.bean
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Static kind, if the declared type is known
    pub fn kind(&self) -> Option<AttributeKind> {
        self.kind
    }

    pub fn summary(&self) -> AttributeSummary {
        AttributeSummary {
            bean: self.bean.to_string(),
            attribute: self.name.clone(),
            type_name: self.type_name.clone(),
            metrics: Vec::new(),
        }
    }

    /// Bind to the first configuration in `matches` selecting this attribute
    ///
    /// `matches` must only hold configurations whose bean-level predicates
    /// passed. Returns `Ok(None)` when nothing selects the attribute or its
    /// type is unsupported.
    ///
    /// # Errors
    /// Returns the `ConnectionError` of a failed live-value fetch.
    pub async fn bind(
        &self,
        matches: &[BeanMatch],
        instance: &InstanceContext,
        connection: &dyn Connection,
    ) -> Result<Option<MatchedAttribute>, ConnectionError> {
        if matches.is_empty() {
            return Ok(None);
        }

        let mut live = None;
        let kind = match self.kind {
            Some(kind) => kind,
            None => {
                let Some(stats) = instance.stats.as_deref() else {
                    debug!(bean = %self.bean, attribute = %self.name, type_name = %self.type_name, "Skipping attribute of unsupported type");
                    return Ok(None);
                };
                let value = connection.get_attribute(&self.bean, &self.name).await?;
                if !stats.is_stat_object(&value) {
                    debug!(bean = %self.bean, attribute = %self.name, type_name = %self.type_name, "Skipping attribute of unsupported type");
                    return Ok(None);
                }
                live = Some(value);
                AttributeKind::SubCollection
            }
        };

        for bean_match in matches {
            let bound = match kind {
                AttributeKind::Simple => {
                    self.bind_simple(bean_match, instance, connection, &mut live)
                        .await?
                }
                _ => {
                    self.bind_nested(kind, bean_match, instance, connection, &mut live)
                        .await?
                }
            };
            if bound.is_some() {
                return Ok(bound);
            }
        }
        Ok(None)
    }

    async fn live_value<'a>(
        &self,
        connection: &dyn Connection,
        live: &'a mut Option<JmxValue>,
    ) -> Result<&'a JmxValue, ConnectionError> {
        let value = match live.take() {
            Some(value) => value,
            None => connection.get_attribute(&self.bean, &self.name).await?,
        };
        Ok(live.insert(value))
    }

    async fn bind_simple(
        &self,
        bean_match: &BeanMatch,
        instance: &InstanceContext,
        connection: &dyn Connection,
        live: &mut Option<JmxValue>,
    ) -> Result<Option<MatchedAttribute>, ConnectionError> {
        let conf = &bean_match.configuration;
        let include = conf.include.attribute.as_ref();
        if !match_attribute_names(include, &self.name, &[], true).is_match()
            || match_attribute_names(conf.exclude.attribute.as_ref(), &self.name, &[], false)
                .is_match()
        {
            return Ok(None);
        }

        let options = include.and_then(|f| f.options(&self.name));
        let value = if needs_value(options.and_then(|o| o.alias.as_deref())) {
            self.live_value(connection, live).await?.scalar_string()
        } else {
            None
        };

        let metric = self.template(bean_match, instance, &self.name, options, None, value.as_deref(), true);
        let values = options.map(|o| o.values.clone()).unwrap_or_default();
        Ok(Some(self.matched(
            AttributeKind::Simple,
            bean_match,
            instance,
            Shape::Simple(Leaf {
                path: String::new(),
                metric,
                values,
            }),
            1,
        )))
    }

    async fn bind_nested(
        &self,
        kind: AttributeKind,
        bean_match: &BeanMatch,
        instance: &InstanceContext,
        connection: &dyn Connection,
        live: &mut Option<JmxValue>,
    ) -> Result<Option<MatchedAttribute>, ConnectionError> {
        let conf = &bean_match.configuration;
        let include_filter = conf.include.attribute.as_ref();

        // nothing under this name is listed: no need for the live value
        match include_filter {
            Some(filter) => {
                let prefix = format!("{}.", self.name);
                if !filter.contains(&self.name) && !filter.names().iter().any(|n| n.starts_with(&prefix)) {
                    return Ok(None);
                }
            }
            None if kind == AttributeKind::Tabular => return Ok(None),
            None => {}
        }

        let value = self.live_value(connection, live).await?;
        let stats = instance.stats.as_deref();
        let all = sub_paths(kind, value, stats);
        if all.is_empty() {
            debug!(bean = %self.bean, attribute = %self.name, "Skipping attribute without sub-attributes");
            return Ok(None);
        }

        // tabular columns are only emitted when listed explicitly
        let include = if kind == AttributeKind::Tabular {
            explicit_sub_paths(include_filter, &self.name, &all)
        } else {
            match_attribute_names(include_filter, &self.name, &all, true)
        };
        let exclude = match_attribute_names(conf.exclude.attribute.as_ref(), &self.name, &all, false);
        let selected = select_sub_paths(&all, &include, &exclude);
        if selected.is_empty() {
            return Ok(None);
        }

        let whole = include_filter.and_then(|f| f.options(&self.name));
        let mut leaves = Vec::with_capacity(selected.len());
        for path in selected {
            let full_name = format!("{}.{}", self.name, path);
            let exact = include_filter.and_then(|f| f.options(&full_name));
            let effective = exact.or(whole);
            let sub_value = match (kind, value) {
                (AttributeKind::Composite, JmxValue::Composite(map)) => {
                    map.get(&path).and_then(JmxValue::scalar_string)
                }
                _ => None,
            };
            // per-row and per-group tags are rendered at extraction
            let metric = self.template(
                bean_match,
                instance,
                &full_name,
                exact,
                whole,
                sub_value.as_deref(),
                kind == AttributeKind::Composite,
            );
            leaves.push(Column {
                leaf: Leaf {
                    path,
                    metric,
                    values: effective.map(|o| o.values.clone()).unwrap_or_default(),
                },
                tag_templates: effective.map(|o| o.tags.clone()).unwrap_or_default(),
                limit: effective.and_then(|o| o.limit),
                sort: effective.map(|o| o.sort).unwrap_or_default(),
            });
        }

        let (shape, count) = match kind {
            AttributeKind::Composite => {
                let count = leaves.len();
                (Shape::Composite(leaves.into_iter().map(|c| c.leaf).collect()), count)
            }
            AttributeKind::Tabular => {
                let count: usize = match value {
                    JmxValue::Tabular(table) => leaves
                        .iter()
                        .map(|column| {
                            let rows = table
                                .rows
                                .iter()
                                .filter(|row| row.get_path(&column.leaf.path).is_some())
                                .count();
                            column.limit.map_or(rows, |limit| rows.min(limit))
                        })
                        .sum(),
                    _ => 0,
                };
                (
                    Shape::Tabular {
                        columns: leaves,
                        cache: HashMap::new(),
                    },
                    count,
                )
            }
            _ => {
                let count: usize = stats
                    .map(|s| {
                        let groups = s.list_groups(value);
                        leaves
                            .iter()
                            .map(|column| {
                                let present = groups
                                    .iter()
                                    .filter(|group| {
                                        s.list_stat_paths(value, group).contains(&column.leaf.path)
                                    })
                                    .count();
                                column.limit.map_or(present, |limit| present.min(limit))
                            })
                            .sum::<usize>()
                    })
                    .unwrap_or(0);
                (
                    Shape::SubCollection {
                        columns: leaves,
                        cache: HashMap::new(),
                    },
                    count,
                )
            }
        };

        Ok(Some(self.matched(kind, bean_match, instance, shape, count)))
    }

    #[allow(clippy::too_many_arguments)]
    fn template(
        &self,
        bean_match: &BeanMatch,
        instance: &InstanceContext,
        full_name: &str,
        exact: Option<&AttributeOptions>,
        whole: Option<&AttributeOptions>,
        value: Option<&str>,
        with_option_tags: bool,
    ) -> Metric {
        let conf = &bean_match.configuration;
        let ctx = AliasContext {
            domain: self.bean.domain(),
            attribute: full_name,
            base_attribute: &self.name,
            params: &bean_match.params,
            metric_prefix: conf.conf.metric_prefix.as_deref(),
            cassandra_aliasing: instance.cassandra_aliasing,
        };
        let alias = resolve_alias(exact.and_then(|o| o.alias.as_deref()), &ctx, value);
        let metric_type = exact
            .and_then(|o| o.metric_type)
            .or_else(|| whole.and_then(|o| o.metric_type))
            .unwrap_or_default();

        let mut tags = base_tags(
            &self.bean,
            &bean_match.params,
            conf,
            &instance.instance_name,
            &instance.instance_tags,
        );
        if with_option_tags {
            if let Some(options) = exact.or(whole) {
                tags.extend(render_tags(&options.tags, &bean_match.params, &[]));
            }
        }
        Metric::new(alias, metric_type, tags, instance.check_name.clone())
    }

    fn matched(
        &self,
        kind: AttributeKind,
        bean_match: &BeanMatch,
        instance: &InstanceContext,
        shape: Shape,
        metric_count: usize,
    ) -> MatchedAttribute {
        MatchedAttribute {
            bean: Arc::clone(&self.bean),
            name: self.name.clone(),
            type_name: self.type_name.clone(),
            kind,
            params: bean_match.params.clone(),
            stats: instance.stats.clone(),
            shape,
            metric_count,
        }
    }
}

fn explicit_sub_paths(
    filter: Option<&AttributeFilter>,
    name: &str,
    all: &[String],
) -> AttributeMatch {
    let Some(filter) = filter else {
        return AttributeMatch::None;
    };
    let listed: Vec<String> = all
        .iter()
        .filter(|path| filter.contains(&format!("{}.{}", name, path)))
        .cloned()
        .collect();
    if listed.is_empty() {
        AttributeMatch::None
    } else {
        AttributeMatch::Subset(listed)
    }
}

fn sub_paths(kind: AttributeKind, value: &JmxValue, stats: Option<&dyn StatsAdapter>) -> Vec<String> {
    match kind {
        AttributeKind::Simple => Vec::new(),
        AttributeKind::Composite => value
            .as_composite()
            .map(|map| {
                map.iter()
                    .filter(|(_, v)| v.is_scalar())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default(),
        AttributeKind::Tabular => match value {
            JmxValue::Tabular(table) => table.column_paths(),
            _ => Vec::new(),
        },
        AttributeKind::SubCollection => {
            let Some(stats) = stats else {
                return Vec::new();
            };
            let mut paths: Vec<String> = stats
                .list_groups(value)
                .iter()
                .flat_map(|group| stats.list_stat_paths(value, group))
                .collect();
            paths.sort();
            paths.dedup();
            paths
        }
    }
}

/// One cached metric and its value conversions
#[derive(Debug, Clone)]
struct Leaf {
    path: String,
    metric: Metric,
    values: BTreeMap<String, f64>,
}

/// A selected column (tabular) or statistic path (sub-collection)
#[derive(Debug, Clone)]
struct Column {
    leaf: Leaf,
    tag_templates: BTreeMap<String, String>,
    limit: Option<usize>,
    sort: SortOrder,
}

#[derive(Debug)]
enum Shape {
    Simple(Leaf),
    Composite(Vec<Leaf>),
    /// Cache keyed by `row|column|rendered tags`, holding the rows of the
    /// last collection only
    Tabular {
        columns: Vec<Column>,
        cache: HashMap<String, Metric>,
    },
    /// Cache keyed by `group|path|rendered tags`, holding the groups of the
    /// last collection only
    SubCollection {
        columns: Vec<Column>,
        cache: HashMap<String, Metric>,
    },
}

/// An attribute bound to its configuration
#[derive(Debug)]
pub struct MatchedAttribute {
    bean: Arc<Bean>,
    name: String,
    type_name: String,
    kind: AttributeKind,
    params: BeanParams,
    stats: Option<Arc<dyn StatsAdapter>>,
    shape: Shape,
    metric_count: usize,
}

impl MatchedAttribute {
    /// Key used by failure tracking
    pub fn key(&self) -> String {
        format!("{}#{}", self.bean, self.name)
    }

    pub fn bean(&self) -> &Bean {
        &self.bean
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AttributeKind {
        self.kind
    }

    /// Metrics counted against the instance limit
    pub fn metric_count(&self) -> usize {
        self.metric_count
    }

    pub fn summary(&self) -> AttributeSummary {
        let templates: Vec<&Metric> = match &self.shape {
            Shape::Simple(leaf) => vec![&leaf.metric],
            Shape::Composite(leaves) => leaves.iter().map(|l| &l.metric).collect(),
            Shape::Tabular { columns, .. } | Shape::SubCollection { columns, .. } => {
                columns.iter().map(|c| &c.leaf.metric).collect()
            }
        };
        AttributeSummary {
            bean: self.bean.to_string(),
            attribute: self.name.clone(),
            type_name: self.type_name.clone(),
            metrics: templates
                .into_iter()
                .map(|m| MetricSummary {
                    alias: m.alias.clone(),
                    metric_type: m.metric_type,
                })
                .collect(),
        }
    }

    /// Fetch the live value and refresh every metric of the attribute
    ///
    /// # Errors
    /// Returns `ExtractError` when the fetch fails or a selected value cannot
    /// be turned into a number.
    pub async fn collect(&mut self, connection: &dyn Connection) -> Result<Vec<Metric>, ExtractError> {
        let value = connection.get_attribute(&self.bean, &self.name).await?;
        let MatchedAttribute {
            ref name,
            ref params,
            ref stats,
            ref mut shape,
            ..
        } = *self;

        match shape {
            Shape::Simple(leaf) => {
                leaf.metric.value = to_number(name, &leaf.values, &value)?;
                Ok(vec![leaf.metric.clone()])
            }
            Shape::Composite(leaves) => {
                let map = value.as_composite().ok_or_else(|| ExtractError::UnexpectedShape {
                    attribute: name.clone(),
                    expected: "composite",
                })?;
                let mut metrics = Vec::with_capacity(leaves.len());
                for leaf in leaves.iter_mut() {
                    let raw = map.get(&leaf.path).ok_or_else(|| ExtractError::MissingPath {
                        attribute: name.clone(),
                        path: leaf.path.clone(),
                    })?;
                    leaf.metric.value = to_number(&format!("{}.{}", name, leaf.path), &leaf.values, raw)?;
                    metrics.push(leaf.metric.clone());
                }
                Ok(metrics)
            }
            Shape::Tabular { columns, cache } => {
                let JmxValue::Tabular(table) = &value else {
                    return Err(ExtractError::UnexpectedShape {
                        attribute: name.clone(),
                        expected: "tabular",
                    });
                };
                let mut metrics = Vec::new();
                let mut seen = HashMap::with_capacity(cache.len());
                for column in columns.iter() {
                    let batch = collect_column(name, params, table, column, cache, &mut seen)?;
                    metrics.extend(apply_limit(batch, column.limit, column.sort));
                }
                *cache = seen;
                Ok(metrics)
            }
            Shape::SubCollection { columns, cache } => {
                let stats = stats
                    .as_deref()
                    .filter(|s| s.is_stat_object(&value))
                    .ok_or_else(|| ExtractError::UnexpectedShape {
                        attribute: name.clone(),
                        expected: "statistics object",
                    })?;
                let mut metrics = Vec::new();
                let mut seen = HashMap::with_capacity(cache.len());
                for column in columns.iter() {
                    let batch = collect_statistic(name, params, stats, &value, column, cache, &mut seen)?;
                    metrics.extend(apply_limit(batch, column.limit, column.sort));
                }
                *cache = seen;
                Ok(metrics)
            }
        }
    }
}

/// Entries of `cache` are moved into `seen` as their row shows up again
fn collect_column(
    name: &str,
    params: &BeanParams,
    table: &TabularData,
    column: &Column,
    cache: &mut HashMap<String, Metric>,
    seen: &mut HashMap<String, Metric>,
) -> Result<Vec<Metric>, ExtractError> {
    let full_name = format!("{}.{}", name, column.leaf.path);
    let mut batch = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let Some(raw) = row.get_path(&column.leaf.path) else {
            continue;
        };
        let number = to_number(&full_name, &column.leaf.values, raw)?;

        let siblings: Vec<(String, String)> = row
            .values
            .iter()
            .filter_map(|(k, v)| v.scalar_string().map(|s| (k.clone(), s)))
            .collect();
        let extra = render_tags(&column.tag_templates, params, &siblings);
        let key = format!("{}|{}|{}", row.row_key(), column.leaf.path, extra.join(","));

        let metric = seen.entry(key).or_insert_with_key(|key| {
            cache.remove(key).unwrap_or_else(|| {
                let mut metric = column.leaf.metric.clone();
                metric.add_tags(row_tags(table, row).into_iter().chain(extra));
                metric
            })
        });
        metric.value = number;
        batch.push(metric.clone());
    }
    Ok(batch)
}

fn collect_statistic(
    name: &str,
    params: &BeanParams,
    stats: &dyn StatsAdapter,
    value: &JmxValue,
    column: &Column,
    cache: &mut HashMap<String, Metric>,
    seen: &mut HashMap<String, Metric>,
) -> Result<Vec<Metric>, ExtractError> {
    let full_name = format!("{}.{}", name, column.leaf.path);
    let mut batch = Vec::new();
    for group in stats.list_groups(value) {
        let Some(raw) = stats.read_stat_value(value, &group, &column.leaf.path) else {
            continue;
        };
        let number = to_number(&full_name, &column.leaf.values, &raw)?;

        let extra = if column.tag_templates.is_empty() {
            Vec::new()
        } else {
            let siblings: Vec<(String, String)> = stats
                .list_stat_paths(value, &group)
                .into_iter()
                .filter_map(|path| {
                    stats
                        .read_stat_value(value, &group, &path)
                        .and_then(|v| v.scalar_string())
                        .map(|s| (path, s))
                })
                .collect();
            render_tags(&column.tag_templates, params, &siblings)
        };
        let key = format!("{}|{}|{}", group, column.leaf.path, extra.join(","));

        let metric = seen.entry(key).or_insert_with_key(|key| {
            cache.remove(key).unwrap_or_else(|| {
                let mut metric = column.leaf.metric.clone();
                let group_tag = (!group.is_empty()).then(|| format!("subcollection:{}", group));
                metric.add_tags(group_tag.into_iter().chain(extra));
                metric
            })
        });
        metric.value = number;
        batch.push(metric.clone());
    }
    Ok(batch)
}

fn row_tags(table: &TabularData, row: &TabularRow) -> Vec<String> {
    if !row.key.is_empty() && table.index_names.len() == row.key.len() {
        table
            .index_names
            .iter()
            .zip(&row.key)
            .map(|(index, key)| format!("{}:{}", index, key))
            .collect()
    } else {
        vec![format!("row:{}", row.row_key())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::PmiStatsAdapter;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Serves fixed values; `get_attribute` calls are counted
    #[derive(Default)]
    struct StaticConnection {
        values: HashMap<(String, String), JmxValue>,
        reads: Mutex<usize>,
    }

    impl StaticConnection {
        fn with(mut self, bean: &str, attribute: &str, value: JmxValue) -> Self {
            self.values
                .insert((bean.to_string(), attribute.to_string()), value);
            self
        }

        fn reads(&self) -> usize {
            *self.reads.lock().unwrap()
        }
    }

    #[async_trait]
    impl Connection for StaticConnection {
        async fn query_bean_names(&self, _scope: Option<&str>) -> Result<Vec<Bean>, ConnectionError> {
            Ok(Vec::new())
        }

        async fn list_attributes(&self, _bean: &Bean) -> Result<Vec<AttributeInfo>, ConnectionError> {
            Ok(Vec::new())
        }

        async fn get_attribute(&self, bean: &Bean, attribute: &str) -> Result<JmxValue, ConnectionError> {
            *self.reads.lock().unwrap() += 1;
            self.values
                .get(&(bean.to_string(), attribute.to_string()))
                .cloned()
                .ok_or_else(|| ConnectionError::AttributeUnavailable {
                    bean: bean.to_string(),
                    attribute: attribute.to_string(),
                    message: "not set".to_string(),
                })
        }

        async fn get_class_name(&self, _bean: &Bean) -> Result<String, ConnectionError> {
            Ok("Test".to_string())
        }

        async fn is_alive(&self) -> bool {
            true
        }

        async fn close(&self) {}

        async fn force_reconnect(&self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    fn instance() -> InstanceContext {
        InstanceContext {
            instance_name: "app".to_string(),
            check_name: "jmx".to_string(),
            instance_tags: vec!["env:test".to_string()],
            cassandra_aliasing: false,
            stats: Some(Arc::new(PmiStatsAdapter)),
        }
    }

    fn bean_match(bean: &Bean, yaml: &str) -> BeanMatch {
        let configuration: Configuration = serde_yaml::from_str(yaml).unwrap();
        let params = crate::matcher::match_bean_level(&configuration, bean, None)
            .unwrap()
            .expect("bean-level match");
        BeanMatch {
            configuration: Arc::new(configuration),
            params,
        }
    }

    fn candidate(bean: &Arc<Bean>, name: &str, type_name: &str) -> Candidate {
        Candidate::new(Arc::clone(bean), AttributeInfo::new(name, type_name))
    }

    fn composite(pairs: &[(&str, JmxValue)]) -> JmxValue {
        JmxValue::Composite(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_boolean_attribute_extracts_to_gauge_one() {
        let bean = Arc::new(Bean::parse("app:type=Status").unwrap());
        let conn = StaticConnection::default().with("app:type=Status", "Running", JmxValue::Boolean(true));
        let matches = vec![bean_match(&bean, "include: { domain: app }")];

        let mut matched = candidate(&bean, "Running", "boolean")
            .bind(&matches, &instance(), &conn)
            .await
            .unwrap()
            .unwrap();
        // binding a simple attribute without `$value` does not read it
        assert_eq!(conn.reads(), 0);

        let metrics = matched.collect(&conn).await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].value, 1.0);
        assert_eq!(metrics[0].metric_type, MetricType::Gauge);
        assert_eq!(metrics[0].alias, "jmx.app.running");
        assert!(metrics[0].tags.contains(&"type:Status".to_string()));
        assert!(metrics[0].tags.contains(&"instance:app".to_string()));
        assert!(metrics[0].tags.contains(&"env:test".to_string()));
    }

    #[tokio::test]
    async fn test_bean_regex_capture_in_alias() {
        let bean = Arc::new(Bean::parse("a.b:type=T").unwrap());
        let conn = StaticConnection::default().with("a.b:type=T", "Count", JmxValue::Integer(3));
        let matches = vec![bean_match(
            &bean,
            r#"include: { bean_regex: 'a\.b:type=(.*)', attribute: { Count: { alias: x.$1 } } }"#,
        )];

        let matched = candidate(&bean, "Count", "long")
            .bind(&matches, &instance(), &conn)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(matched.summary().metrics[0].alias, "x.t");
    }

    #[tokio::test]
    async fn test_first_configuration_wins() {
        let bean = Arc::new(Bean::parse("app:type=Pool").unwrap());
        let conn = StaticConnection::default().with("app:type=Pool", "Size", JmxValue::Integer(4));
        let matches = vec![
            bean_match(&bean, "include: { domain: app, attribute: { Size: { alias: first.size } } }"),
            bean_match(&bean, "include: { domain: app, attribute: { Size: { alias: second.size, metric_type: rate } } }"),
        ];

        let matched = candidate(&bean, "Size", "int")
            .bind(&matches, &instance(), &conn)
            .await
            .unwrap()
            .unwrap();
        let summary = matched.summary();
        assert_eq!(summary.metrics[0].alias, "first.size");
        assert_eq!(summary.metrics[0].metric_type, MetricType::Gauge);
    }

    #[tokio::test]
    async fn test_value_conversion_and_value_alias() {
        let bean = Arc::new(Bean::parse("app:type=Node").unwrap());
        let conn = StaticConnection::default().with("app:type=Node", "State", JmxValue::String("ACTIVE".to_string()));
        let matches = vec![bean_match(
            &bean,
            "include: { domain: app, attribute: { State: { alias: node.$value, values: { ACTIVE: 1, default: 0 } } } }",
        )];

        let mut matched = candidate(&bean, "State", "java.lang.String")
            .bind(&matches, &instance(), &conn)
            .await
            .unwrap()
            .unwrap();
        let metrics = matched.collect(&conn).await.unwrap();
        assert_eq!(metrics[0].alias, "node.active");
        assert_eq!(metrics[0].value, 1.0);
    }

    #[tokio::test]
    async fn test_composite_subset_and_exclude() {
        let bean = Arc::new(Bean::parse("java.lang:type=Memory").unwrap());
        let usage = composite(&[
            ("used", JmxValue::Integer(10)),
            ("max", JmxValue::Integer(100)),
            ("committed", JmxValue::Integer(50)),
        ]);
        let conn = StaticConnection::default().with("java.lang:type=Memory", "HeapMemoryUsage", usage);
        let composite_type = "javax.management.openmbean.CompositeData";

        let subset = vec![bean_match(
            &bean,
            "include: { domain: java.lang, attribute: { HeapMemoryUsage.used: { alias: jvm.heap_memory } } }",
        )];
        let mut matched = candidate(&bean, "HeapMemoryUsage", composite_type)
            .bind(&subset, &instance(), &conn)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(matched.metric_count(), 1);
        let metrics = matched.collect(&conn).await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].alias, "jvm.heap_memory");
        assert_eq!(metrics[0].value, 10.0);

        let whole = vec![bean_match(
            &bean,
            "include: { domain: java.lang, attribute: [HeapMemoryUsage] }\nexclude: { attribute: [HeapMemoryUsage.max] }",
        )];
        let mut matched = candidate(&bean, "HeapMemoryUsage", composite_type)
            .bind(&whole, &instance(), &conn)
            .await
            .unwrap()
            .unwrap();
        let mut aliases: Vec<String> = matched
            .collect(&conn)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.alias)
            .collect();
        aliases.sort();
        assert_eq!(
            aliases,
            vec![
                "jmx.java.lang.heap_memory_usage.committed",
                "jmx.java.lang.heap_memory_usage.used"
            ]
        );
    }

    #[tokio::test]
    async fn test_unlisted_nested_attribute_is_not_fetched() {
        let bean = Arc::new(Bean::parse("java.lang:type=Memory").unwrap());
        let conn = StaticConnection::default();
        let matches = vec![bean_match(&bean, "include: { domain: java.lang, attribute: [ThreadCount] }")];
        let bound = candidate(&bean, "HeapMemoryUsage", "javax.management.openmbean.CompositeData")
            .bind(&matches, &instance(), &conn)
            .await
            .unwrap();
        assert!(bound.is_none());
        assert_eq!(conn.reads(), 0);
    }

    fn gc_table(counts: &[(&str, i64)]) -> JmxValue {
        JmxValue::Tabular(TabularData {
            index_names: vec!["pool".to_string()],
            rows: counts
                .iter()
                .map(|(pool, count)| TabularRow {
                    key: vec![pool.to_string()],
                    values: BTreeMap::from([
                        ("pool".to_string(), JmxValue::String(pool.to_string())),
                        ("count".to_string(), JmxValue::Integer(*count)),
                        ("time".to_string(), JmxValue::Integer(count * 10)),
                    ]),
                })
                .collect(),
        })
    }

    #[tokio::test]
    async fn test_tabular_limit_and_row_tags() {
        let bean = Arc::new(Bean::parse("app:type=Gc").unwrap());
        let table = gc_table(&[("a", 5), ("b", 1), ("c", 3), ("d", 9), ("e", 2)]);
        let conn = StaticConnection::default().with("app:type=Gc", "Pools", table);
        let matches = vec![bean_match(
            &bean,
            "include: { domain: app, attribute: { Pools.count: { alias: gc.count, limit: 2, tags: { label: pool-$pool } } } }",
        )];

        let mut matched = candidate(&bean, "Pools", "javax.management.openmbean.TabularData")
            .bind(&matches, &instance(), &conn)
            .await
            .unwrap()
            .unwrap();
        // five rows, two kept by the limit
        assert_eq!(matched.metric_count(), 2);

        let metrics = matched.collect(&conn).await.unwrap();
        let values: Vec<f64> = metrics.iter().map(|m| m.value).collect();
        assert_eq!(values, vec![9.0, 5.0]);
        assert!(metrics[0].tags.contains(&"pool:d".to_string()));
        assert!(metrics[0].tags.contains(&"label:pool-d".to_string()));
    }

    #[tokio::test]
    async fn test_tabular_whole_name_needs_explicit_columns() {
        let bean = Arc::new(Bean::parse("app:type=Gc").unwrap());
        let conn = StaticConnection::default().with("app:type=Gc", "Pools", gc_table(&[("a", 1)]));
        let matches = vec![bean_match(&bean, "include: { domain: app, attribute: [Pools] }")];
        let bound = candidate(&bean, "Pools", "javax.management.openmbean.TabularData")
            .bind(&matches, &instance(), &conn)
            .await
            .unwrap();
        assert!(bound.is_none());

        let reads = conn.reads();
        let unfiltered = vec![bean_match(&bean, "include: { domain: app }")];
        let bound = candidate(&bean, "Pools", "javax.management.openmbean.TabularData")
            .bind(&unfiltered, &instance(), &conn)
            .await
            .unwrap();
        assert!(bound.is_none());
        assert_eq!(conn.reads(), reads);
    }

    #[tokio::test]
    async fn test_tabular_counts_every_row() {
        let bean = Arc::new(Bean::parse("app:type=Gc").unwrap());
        let rows: Vec<(String, i64)> = (0..50).map(|i| (format!("p{}", i), i)).collect();
        let rows: Vec<(&str, i64)> = rows.iter().map(|(p, c)| (p.as_str(), *c)).collect();
        let conn = StaticConnection::default().with("app:type=Gc", "Pools", gc_table(&rows));
        let matches = vec![bean_match(
            &bean,
            "include: { domain: app, attribute: { Pools.count: { alias: gc.count }, Pools.time: { alias: gc.time } } }",
        )];

        let matched = candidate(&bean, "Pools", "javax.management.openmbean.TabularData")
            .bind(&matches, &instance(), &conn)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(matched.metric_count(), 100);
    }

    #[tokio::test]
    async fn test_tabular_cache_follows_current_rows() {
        let bean = Arc::new(Bean::parse("app:type=Gc").unwrap());
        let matches = vec![bean_match(
            &bean,
            "include: { domain: app, attribute: { Pools.count: { alias: gc.count } } }",
        )];
        let first = StaticConnection::default().with("app:type=Gc", "Pools", gc_table(&[("a", 1), ("b", 2)]));
        let mut matched = candidate(&bean, "Pools", "javax.management.openmbean.TabularData")
            .bind(&matches, &instance(), &first)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(matched.collect(&first).await.unwrap().len(), 2);

        let churned = StaticConnection::default().with("app:type=Gc", "Pools", gc_table(&[("b", 3), ("c", 4)]));
        let metrics = matched.collect(&churned).await.unwrap();
        assert_eq!(metrics.len(), 2);
        assert!(metrics.iter().any(|m| m.tags.contains(&"pool:c".to_string())));
        let Shape::Tabular { cache, .. } = &matched.shape else {
            panic!("tabular shape expected");
        };
        assert_eq!(cache.len(), 2);
        assert!(cache.keys().all(|key| !key.starts_with("a|")));
    }

    fn pmi_stats() -> JmxValue {
        let stat = |name: &str, count: i64| {
            composite(&[
                ("name", JmxValue::String(name.to_string())),
                ("count", JmxValue::Integer(count)),
            ])
        };
        composite(&[
            ("statistics", JmxValue::Array(vec![stat("CreateCount", 1)])),
            (
                "subStats",
                JmxValue::Array(vec![composite(&[
                    ("name", JmxValue::String("jdbc/orders".to_string())),
                    (
                        "statistics",
                        JmxValue::Array(vec![stat("CreateCount", 7), stat("CloseCount", 2)]),
                    ),
                ])]),
            ),
        ])
    }

    #[tokio::test]
    async fn test_sub_collection_groups_are_tagged() {
        let bean = Arc::new(Bean::parse("WebSphere:type=ConnectionPool").unwrap());
        let conn = StaticConnection::default().with("WebSphere:type=ConnectionPool", "stats", pmi_stats());
        let matches = vec![bean_match(
            &bean,
            "include: { domain: WebSphere, attribute: { stats.CreateCount.count: { alias: pool.created, tags: { closed: $CloseCount.count } } } }",
        )];

        let mut matched = candidate(&bean, "stats", "javax.management.j2ee.statistics.Stats")
            .bind(&matches, &instance(), &conn)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(matched.kind(), AttributeKind::SubCollection);
        assert_eq!(matched.metric_count(), 2);

        let mut metrics = matched.collect(&conn).await.unwrap();
        metrics.sort_by(|a, b| a.value.total_cmp(&b.value));
        assert_eq!(metrics.len(), 2);
        assert!(!metrics[0].tags.iter().any(|t| t.starts_with("subcollection:")));
        assert!(metrics[1].tags.contains(&"subcollection:jdbc/orders".to_string()));
        assert!(metrics[1].tags.contains(&"closed:2".to_string()));
    }

    #[tokio::test]
    async fn test_unsupported_type_is_skipped() {
        let bean = Arc::new(Bean::parse("app:type=Misc").unwrap());
        let conn = StaticConnection::default().with("app:type=Misc", "Names", JmxValue::Array(Vec::new()));
        let matches = vec![bean_match(&bean, "include: { domain: app }")];
        let bound = candidate(&bean, "Names", "[Ljava.lang.String;")
            .bind(&matches, &instance(), &conn)
            .await
            .unwrap();
        assert!(bound.is_none());
    }

    #[tokio::test]
    async fn test_number_format_error() {
        let bean = Arc::new(Bean::parse("app:type=Node").unwrap());
        let conn = StaticConnection::default().with("app:type=Node", "State", JmxValue::String("RUNNING".to_string()));
        let matches = vec![bean_match(&bean, "include: { domain: app }")];
        let mut matched = candidate(&bean, "State", "java.lang.String")
            .bind(&matches, &instance(), &conn)
            .await
            .unwrap()
            .unwrap();
        let err = matched.collect(&conn).await.unwrap_err();
        assert!(matches!(err, ExtractError::NumberFormat { .. }));
        assert!(!err.is_fatal());
        assert_eq!(matched.key(), "app:type=Node#State");
    }
}
