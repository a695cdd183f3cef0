//! Per-endpoint collector
//!
//! An [`Instance`] owns one connection, the bean set discovered through it and
//! the attributes bound to configurations. Its lifecycle:
//!
//! ```text
//! Uninitialized -> Connected -> Ready -> Collecting
//!        any state -> Broken -> Recovering -> Connected | Broken
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::attribute::{AttributeSummary, BeanMatch, Candidate, InstanceContext, MatchedAttribute};
use crate::bean::Bean;
use crate::config::{InstanceConfig, InstanceSettings};
use crate::connection::{Connection, ConnectionFactory};
use crate::error::{ClassifiedError, ExtractError, InstanceError};
use crate::filter::Configuration;
use crate::matcher::match_bean_level;
use crate::metric::Metric;
use crate::value::{PmiStatsAdapter, StatsAdapter};

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Uninitialized,
    Connected,
    Ready,
    Collecting,
    Broken,
    Recovering,
}

/// What a match pass is run for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Collect,
    ListEverything,
    ListCollectedAttributes,
    ListMatchingAttributes,
    ListNotMatchingAttributes,
    ListLimitedAttributes,
}

impl Action {
    fn is_collect(self) -> bool {
        self == Action::Collect
    }

    fn lists_matching(self) -> bool {
        matches!(
            self,
            Action::ListEverything | Action::ListCollectedAttributes | Action::ListMatchingAttributes
        )
    }

    fn lists_not_matching(self) -> bool {
        matches!(self, Action::ListEverything | Action::ListNotMatchingAttributes)
    }

    fn lists_limited(self) -> bool {
        matches!(self, Action::ListEverything | Action::ListLimitedAttributes)
    }
}

/// Attributes seen by the last match pass of a listing action
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchReport {
    pub matching: Vec<AttributeSummary>,
    pub not_matching: Vec<AttributeSummary>,
    pub limited: Vec<AttributeSummary>,
    pub limit_reached: bool,
}

/// Collector of one JMX endpoint
pub struct Instance {
    config: InstanceConfig,
    configurations: Vec<Arc<Configuration>>,
    needs_class: bool,
    context: InstanceContext,
    settings: InstanceSettings,
    factory: Arc<dyn ConnectionFactory>,
    connection: Option<Arc<dyn Connection>>,
    state: InstanceState,
    beans: Vec<Arc<Bean>>,
    matched: Vec<MatchedAttribute>,
    failing: HashSet<String>,
    last_refresh: Option<Instant>,
    refreshed_since_init: bool,
    last_collection: Option<Instant>,
    limit_reached: bool,
    report: MatchReport,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.config.name)
            .field("state", &self.state)
            .field("beans", &self.beans.len())
            .field("matched", &self.matched.len())
            .finish()
    }
}

impl Instance {
    /// Build an uninitialized instance
    ///
    /// `configurations` are matched in order; the first one selecting an
    /// attribute wins.
    pub fn new(
        config: InstanceConfig,
        configurations: Vec<Configuration>,
        settings: InstanceSettings,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let stats: Option<Arc<dyn StatsAdapter>> = if config.websphere_stats {
            Some(Arc::new(PmiStatsAdapter))
        } else {
            None
        };
        let context = InstanceContext {
            instance_name: config.name.clone(),
            check_name: config.check_name.clone(),
            instance_tags: config.tags.clone(),
            cassandra_aliasing: config.cassandra_aliasing,
            stats,
        };
        let needs_class = configurations.iter().any(Configuration::references_class);

        Self {
            config,
            configurations: configurations.into_iter().map(Arc::new).collect(),
            needs_class,
            context,
            settings,
            factory,
            connection: None,
            state: InstanceState::Uninitialized,
            beans: Vec::new(),
            matched: Vec::new(),
            failing: HashSet::new(),
            last_refresh: None,
            refreshed_since_init: false,
            last_collection: None,
            limit_reached: false,
            report: MatchReport::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn check_name(&self) -> &str {
        &self.config.check_name
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Tags attached to service checks of this instance
    pub fn service_check_tags(&self) -> Vec<String> {
        let mut tags = vec![format!("instance:{}", self.config.name)];
        tags.extend(self.config.tags.iter().cloned());
        tags
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn beans(&self) -> &[Arc<Bean>] {
        &self.beans
    }

    pub fn matched_attributes(&self) -> &[MatchedAttribute] {
        &self.matched
    }

    /// Whether the last match pass stopped at `max_returned_metrics`
    pub fn limit_reached(&self) -> bool {
        self.limit_reached
    }

    pub fn last_refresh(&self) -> Option<Instant> {
        self.last_refresh
    }

    /// Report of the last match pass
    pub fn report(&self) -> &MatchReport {
        &self.report
    }

    /// Connect, discover beans and bind attributes for collection
    ///
    /// # Errors
    /// Any failure leaves the instance `Broken`.
    pub async fn init(&mut self, force_new_connection: bool) -> Result<(), InstanceError> {
        self.init_for(Action::Collect, force_new_connection).await
    }

    /// [`Instance::init`] with the match pass run for `action`
    pub async fn init_for(&mut self, action: Action, force_new_connection: bool) -> Result<(), InstanceError> {
        if self.state == InstanceState::Broken {
            self.state = InstanceState::Recovering;
        }
        info!(instance = %self.config.name, url = %self.config.url, state = ?self.state, "Initializing instance");

        let result = self.try_init(action, force_new_connection).await;
        match &result {
            Ok(()) => {
                self.state = InstanceState::Ready;
                info!(
                    instance = %self.config.name,
                    beans = self.beans.len(),
                    attributes = self.matched.len(),
                    "Instance initialized"
                );
            }
            Err(e) => {
                warn!(instance = %self.config.name, error = %e, "Instance initialization failed");
                self.mark_broken();
            }
        }
        result
    }

    async fn try_init(&mut self, action: Action, force_new_connection: bool) -> Result<(), InstanceError> {
        self.connect(force_new_connection).await?;
        self.state = InstanceState::Connected;
        self.refresh_beans().await?;
        self.refreshed_since_init = false;
        self.match_attributes(action).await
    }

    async fn connect(&mut self, force_new_connection: bool) -> Result<(), InstanceError> {
        if self.connection.is_some() && !force_new_connection {
            return Ok(());
        }
        if let Some(old) = self.connection.take() {
            old.close().await;
        }
        self.connection = Some(self.factory.connect(&self.config).await?);
        Ok(())
    }

    fn connection(&self) -> Result<Arc<dyn Connection>, InstanceError> {
        self.connection
            .clone()
            .ok_or_else(|| InstanceError::NotInitialized(self.config.name.clone()))
    }

    // union of the configurations' scopes; None when one of them is unscoped
    fn scopes(&self) -> Option<Vec<String>> {
        let mut scopes = Vec::new();
        for conf in &self.configurations {
            scopes.extend(conf.include.common_scopes()?);
        }
        scopes.sort();
        scopes.dedup();
        Some(scopes)
    }

    /// Replace the bean set with a fresh query
    ///
    /// # Errors
    /// Returns the connection error of the first failed query.
    pub async fn refresh_beans(&mut self) -> Result<(), InstanceError> {
        let connection = self.connection()?;

        let mut beans = match self.scopes() {
            Some(scopes) => {
                let mut beans = Vec::new();
                for scope in &scopes {
                    beans.extend(connection.query_bean_names(Some(scope)).await?);
                }
                beans
            }
            None => connection.query_bean_names(None).await?,
        };
        beans.sort_by(|a, b| a.string_form().cmp(b.string_form()));
        beans.dedup();

        debug!(instance = %self.config.name, beans = beans.len(), "Refreshed beans");
        self.beans = beans.into_iter().map(Arc::new).collect();
        self.failing.clear();
        self.last_refresh = Some(Instant::now());
        Ok(())
    }

    /// Bind every attribute of the bean set to the first configuration that
    /// selects it, up to `max_returned_metrics`
    ///
    /// # Errors
    /// Fatal connection errors and filter errors abort the pass; other
    /// per-bean failures skip the bean.
    pub async fn match_attributes(&mut self, action: Action) -> Result<(), InstanceError> {
        let connection = self.connection()?;
        let max_metrics = self.settings.max_returned_metrics;

        let mut matched = Vec::new();
        let mut report = MatchReport::default();
        let mut metric_count = 0usize;
        let mut limit_reached = false;

        'beans: for bean in &self.beans {
            let class_name = if self.needs_class {
                match connection.get_class_name(bean).await {
                    Ok(class_name) => Some(class_name),
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        debug!(bean = %bean, error = %e, "Class name unavailable");
                        None
                    }
                }
            } else {
                None
            };

            let mut bean_matches = Vec::new();
            for configuration in &self.configurations {
                if let Some(params) = match_bean_level(configuration, bean, class_name.as_deref())? {
                    bean_matches.push(BeanMatch {
                        configuration: Arc::clone(configuration),
                        params,
                    });
                }
            }
            if bean_matches.is_empty() && !action.lists_not_matching() {
                continue;
            }

            let attributes = match connection.list_attributes(bean).await {
                Ok(attributes) => attributes,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    debug!(bean = %bean, error = %e, "Cannot list attributes");
                    continue;
                }
            };

            for info in attributes {
                let candidate = Candidate::new(Arc::clone(bean), info);
                let bound = match candidate
                    .bind(&bean_matches, &self.context, connection.as_ref())
                    .await
                {
                    Ok(bound) => bound,
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        debug!(bean = %bean, attribute = %candidate.name(), error = %e, "Cannot bind attribute");
                        None
                    }
                };

                let Some(attribute) = bound else {
                    if action.lists_not_matching() {
                        report.not_matching.push(candidate.summary());
                    }
                    continue;
                };

                if metric_count + attribute.metric_count() > max_metrics {
                    limit_reached = true;
                    if action.is_collect() {
                        break 'beans;
                    }
                    if action.lists_limited() {
                        report.limited.push(attribute.summary());
                    }
                    continue;
                }

                metric_count += attribute.metric_count();
                if action.lists_matching() {
                    report.matching.push(attribute.summary());
                }
                matched.push(attribute);
            }
        }

        if limit_reached {
            warn!(
                instance = %self.config.name,
                max_returned_metrics = max_metrics,
                "Reached max_returned_metrics; remaining attributes are not collected"
            );
        }
        info!(
            instance = %self.config.name,
            attributes = matched.len(),
            metrics = metric_count,
            "Matched attributes"
        );

        report.limit_reached = limit_reached;
        self.matched = matched;
        self.limit_reached = limit_reached;
        self.report = report;
        Ok(())
    }

    fn refresh_due(&self) -> bool {
        let period = if self.refreshed_since_init {
            self.settings.refresh_period
        } else {
            self.settings
                .initial_refresh_period
                .or(self.settings.refresh_period)
        };
        match (period, self.last_refresh) {
            (Some(period), Some(last)) => last.elapsed() >= period,
            _ => false,
        }
    }

    /// Collect every matched attribute
    ///
    /// An attribute failing twice in a row is dropped until the next bean
    /// refresh.
    ///
    /// # Errors
    /// Fatal connection errors abort the collection and leave the instance
    /// `Broken`.
    pub async fn collect(&mut self) -> Result<Vec<Metric>, InstanceError> {
        let connection = self.connection()?;

        if self.refresh_due() {
            info!(instance = %self.config.name, "Refreshing beans");
            let refreshed = async {
                self.refresh_beans().await?;
                self.refreshed_since_init = true;
                self.match_attributes(Action::Collect).await
            }
            .await;
            if let Err(e) = refreshed {
                self.mark_broken();
                return Err(e);
            }
        }

        self.state = InstanceState::Collecting;
        self.last_collection = Some(Instant::now());

        let mut metrics = Vec::new();
        let mut index = 0;
        while index < self.matched.len() {
            let attribute = &mut self.matched[index];
            match attribute.collect(connection.as_ref()).await {
                Ok(collected) => {
                    self.failing.remove(&attribute.key());
                    metrics.extend(collected);
                    index += 1;
                }
                Err(e) => {
                    let ClassifiedError::TransientAttribute(reason) = ClassifiedError::from(&e) else {
                        self.mark_broken();
                        return Err(match e {
                            ExtractError::Connection(e) => e.into(),
                            e => e.into(),
                        });
                    };
                    let key = attribute.key();
                    if self.failing.remove(&key) {
                        warn!(instance = %self.config.name, attribute = %key, error = %reason, "Attribute failed twice, dropping it until the next bean refresh");
                        self.matched.remove(index);
                    } else {
                        warn!(instance = %self.config.name, attribute = %key, error = %reason, "Attribute collection failed");
                        self.failing.insert(key);
                        index += 1;
                    }
                }
            }
        }

        self.state = InstanceState::Ready;
        debug!(instance = %self.config.name, metrics = metrics.len(), "Collected");
        Ok(metrics)
    }

    /// Whether `min_collection_interval` has passed since the last collection
    pub fn time_to_collect(&self) -> bool {
        match (self.settings.min_collection_period, self.last_collection) {
            (Some(period), Some(last)) => last.elapsed() >= period,
            _ => true,
        }
    }

    /// Time left before the next collection is allowed
    pub fn until_next_collection(&self) -> Duration {
        match (self.settings.min_collection_period, self.last_collection) {
            (Some(period), Some(last)) => period.saturating_sub(last.elapsed()),
            _ => Duration::ZERO,
        }
    }

    pub fn mark_broken(&mut self) {
        self.state = InstanceState::Broken;
    }

    /// Close the connection and drop discovered state
    pub async fn clean_up(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.beans.clear();
        self.matched.clear();
        self.failing.clear();
        self.last_refresh = None;
        self.state = InstanceState::Uninitialized;
        debug!(instance = %self.config.name, "Instance cleaned up");
    }
}
