//! Collection orchestrator
//!
//! The [`App`] owns every instance and drives them through the two task
//! processors: collection for the periodic iteration, recovery for
//! initialisation, reconnection and shutdown.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, RwLock};

use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ConfigError};
use crate::connection::ConnectionFactory;
use crate::error::{ClassifiedError, InstanceError};
use crate::instance::{Action, Instance, MatchReport};
use crate::metric::Metric;
use crate::processor::{TaskOutcome, TaskProcessor, TaskStatus};
use crate::reporter::{ReportPipeline, Reporter, ServiceCheckStatus};

/// Shared handle on one instance
///
/// The mutex is held by exactly one task at a time.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    name: String,
    check_name: String,
    tags: Vec<String>,
    instance: Arc<Mutex<Instance>>,
}

impl InstanceHandle {
    pub fn new(instance: Instance) -> Self {
        Self {
            name: instance.name().to_string(),
            check_name: instance.check_name().to_string(),
            tags: instance.service_check_tags(),
            instance: Arc::new(Mutex::new(instance)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> &Arc<Mutex<Instance>> {
        &self.instance
    }

    fn service_check_name(&self) -> String {
        format!("{}.can_connect", self.check_name)
    }
}

/// Point-in-time view of the agent, served on `/health`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub ready: bool,
    pub iterations: u64,
    pub active_instances: usize,
    pub broken_instances: Vec<String>,
    pub last_metrics: usize,
}

/// Health state shared with the HTTP server
#[derive(Debug, Clone, Default)]
pub struct AgentHealth {
    inner: Arc<RwLock<HealthSnapshot>>,
}

impl AgentHealth {
    pub fn snapshot(&self) -> HealthSnapshot {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut HealthSnapshot)) {
        let mut snapshot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut snapshot);
    }
}

/// Outcome of one collection iteration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IterationSummary {
    pub iteration: u64,
    /// Instances collected successfully
    pub collected: usize,
    /// Instances whose collection failed
    pub failed: usize,
    /// Instances skipped by `min_collection_interval` or still busy
    pub skipped: usize,
    /// Instances moved to the broken set
    pub broken: usize,
    /// Points handed to the reporter
    pub metrics: usize,
}

/// Listing result of one instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceListing {
    pub instance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<MatchReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Collected {
    metrics: Vec<Metric>,
    limit_reached: bool,
}

fn classify<T>(outcome: TaskOutcome<T, InstanceError>) -> TaskStatus<T> {
    match outcome {
        TaskOutcome::Completed(Ok(data)) => TaskStatus::ok(data),
        TaskOutcome::Completed(Err(e)) => TaskStatus::failed(ClassifiedError::from(&e)),
        TaskOutcome::TimedOut(timeout) => TaskStatus::failed(ClassifiedError::ScheduleTimeout(timeout)),
        TaskOutcome::Panicked(message) => {
            TaskStatus::failed(ClassifiedError::ConnectionIo(format!("task panicked: {}", message)))
        }
        TaskOutcome::Cancelled => {
            TaskStatus::failed(ClassifiedError::InternalScheduler("task cancelled".to_string()))
        }
    }
}

/// Collection agent
pub struct App {
    config: AppConfig,
    collection: Arc<TaskProcessor>,
    recovery: TaskProcessor,
    pipeline: ReportPipeline,
    pending: Vec<InstanceHandle>,
    active: Vec<InstanceHandle>,
    broken: Arc<RwLock<Vec<InstanceHandle>>>,
    iteration: u64,
    health: AgentHealth,
}

impl App {
    /// Build every configured instance, uninitialized
    ///
    /// # Errors
    /// Returns `ConfigError` when the built-in configurations cannot be loaded.
    pub fn new(
        config: AppConfig,
        factory: Arc<dyn ConnectionFactory>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self, ConfigError> {
        let mut pending = Vec::with_capacity(config.instances.len());
        for instance_config in &config.instances {
            let instance = Instance::new(
                instance_config.clone(),
                config.configurations(instance_config)?,
                config.instance_settings(instance_config),
                Arc::clone(&factory),
            );
            pending.push(InstanceHandle::new(instance));
        }

        let init = &config.init_config;
        Ok(Self {
            collection: Arc::new(TaskProcessor::new("collection", init.collection_pool_size)),
            recovery: TaskProcessor::new("recovery", init.recovery_pool_size),
            pipeline: ReportPipeline::new(reporter),
            pending,
            active: Vec::new(),
            broken: Arc::new(RwLock::new(Vec::new())),
            iteration: 0,
            health: AgentHealth::default(),
            config,
        })
    }

    pub fn health(&self) -> AgentHealth {
        self.health.clone()
    }

    pub fn pipeline(&self) -> &ReportPipeline {
        &self.pipeline
    }

    /// Processor running the periodic collection batches
    pub fn collection_processor(&self) -> Arc<TaskProcessor> {
        Arc::clone(&self.collection)
    }

    pub fn active_instances(&self) -> Vec<String> {
        self.active.iter().map(|h| h.name.clone()).collect()
    }

    pub fn broken_instances(&self) -> Vec<String> {
        self.read_broken().iter().map(|h| h.name.clone()).collect()
    }

    fn read_broken(&self) -> std::sync::RwLockReadGuard<'_, Vec<InstanceHandle>> {
        self.broken.read().unwrap_or_else(|e| e.into_inner())
    }

    fn take_broken(&self) -> Vec<InstanceHandle> {
        std::mem::take(&mut *self.broken.write().unwrap_or_else(|e| e.into_inner()))
    }

    fn add_broken(&self, handles: impl IntoIterator<Item = InstanceHandle>) {
        self.broken
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
    }

    fn refresh_health(&self, summary: Option<&IterationSummary>) {
        let active = self.active.len();
        let broken = self.broken_instances();
        self.health.update(|health| {
            health.active_instances = active;
            health.broken_instances = broken;
            if let Some(summary) = summary {
                health.ready = true;
                health.iterations = summary.iteration;
                health.last_metrics = summary.metrics;
            }
        });
    }

    fn report_status(&self, handle: &InstanceHandle, status: ServiceCheckStatus, message: Option<&str>) {
        self.pipeline
            .send_service_check(&handle.service_check_name(), status, message, &handle.tags);
    }

    // run `job` on every handle through the recovery processor
    async fn on_recovery_pool<T, F, Fut>(
        &self,
        batch: &[InstanceHandle],
        job: F,
    ) -> Vec<TaskStatus<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<Mutex<Instance>>) -> Fut,
        Fut: Future<Output = Result<T, InstanceError>> + Send + 'static,
    {
        if !self.recovery.pool_is_healthy() {
            self.recovery.reset();
        }
        let tasks: Vec<Fut> = batch
            .iter()
            .map(|handle| job(Arc::clone(&handle.instance)))
            .collect();
        let timeout = self.config.init_config.recovery_timeout();
        match self
            .recovery
            .process_tasks(tasks, timeout, |_, outcome| classify(outcome))
            .await
        {
            Ok(statuses) => statuses,
            Err(e) => {
                error!(error = %e, "Recovery scheduler failed");
                let err = ClassifiedError::InternalScheduler(e.to_string());
                batch
                    .iter()
                    .map(|_| TaskStatus::failed(err.clone()))
                    .collect()
            }
        }
    }

    /// Initialise every configured instance
    ///
    /// Returns the number of instances that became active; the others join
    /// the broken set.
    pub async fn init(&mut self) -> usize {
        let batch = std::mem::take(&mut self.pending);
        info!(instances = batch.len(), "Initializing instances");
        if self.collection.is_stopped() {
            self.collection.reset();
        }

        let statuses = self
            .on_recovery_pool(&batch, |instance| async move {
                instance.lock().await.init(false).await
            })
            .await;

        let mut broken = Vec::new();
        for (handle, status) in batch.into_iter().zip(statuses) {
            match status.error {
                None => self.active.push(handle),
                Some(err) => {
                    let message = err.user_message(&handle.name);
                    warn!(instance = %handle.name, error = %err, "Instance failed to initialize");
                    self.report_status(&handle, ServiceCheckStatus::Critical, Some(&message));
                    broken.push(handle);
                }
            }
        }
        self.add_broken(broken);
        self.refresh_health(None);
        self.active.len()
    }

    /// Collect every due instance once and report the results
    pub async fn do_iteration(&mut self) -> IterationSummary {
        self.iteration += 1;
        let iteration = self.iteration;
        let mut summary = IterationSummary {
            iteration,
            ..Default::default()
        };

        if !self.collection.pool_is_healthy() {
            warn!(pool = %self.collection.name(), "Collection pool exhausted, rebuilding it");
            self.collection.reset();
        }

        let mut due = Vec::new();
        for handle in &self.active {
            match handle.instance.try_lock() {
                Ok(instance) if instance.time_to_collect() => due.push(handle.clone()),
                Ok(instance) => {
                    debug!(instance = %handle.name, wait = ?instance.until_next_collection(), "Not time to collect yet");
                    summary.skipped += 1;
                }
                Err(_) => {
                    warn!(instance = %handle.name, "Instance still busy from a previous iteration");
                    summary.skipped += 1;
                }
            }
        }

        let tasks: Vec<_> = due
            .iter()
            .map(|handle| {
                let instance = Arc::clone(&handle.instance);
                async move {
                    let mut instance = instance.lock().await;
                    let metrics = instance.collect().await?;
                    Ok::<_, InstanceError>(Collected {
                        metrics,
                        limit_reached: instance.limit_reached(),
                    })
                }
            })
            .collect();

        let timeout = self.config.init_config.collection_timeout();
        let statuses = match self
            .collection
            .process_tasks(tasks, timeout, |_, outcome| match outcome {
                TaskOutcome::Completed(Ok(collected)) if collected.metrics.is_empty() => {
                    TaskStatus::failed(ClassifiedError::NoMetrics)
                }
                outcome => classify(outcome),
            })
            .await
        {
            Ok(statuses) => statuses,
            Err(e) => {
                error!(error = %e, iteration, "Collection scheduler failed");
                let err = ClassifiedError::InternalScheduler(e.to_string());
                due.iter().map(|_| TaskStatus::failed(err.clone())).collect()
            }
        };

        let mut newly_broken = HashSet::new();
        for (handle, status) in due.iter().zip(statuses) {
            match status {
                TaskStatus {
                    data: Some(collected),
                    ..
                } => {
                    summary.collected += 1;
                    summary.metrics += self
                        .pipeline
                        .send_metrics(&collected.metrics, &handle.name, iteration);
                    if collected.limit_reached {
                        let message = format!(
                            "Number of returned metrics is too high for instance {}; only the first {} are collected",
                            handle.name, collected.metrics.len()
                        );
                        self.report_status(handle, ServiceCheckStatus::Warning, Some(&message));
                    } else {
                        self.report_status(handle, ServiceCheckStatus::Ok, None);
                    }
                }
                TaskStatus { error, .. } => {
                    let err = error.unwrap_or_else(|| {
                        ClassifiedError::InternalScheduler("task returned no data".to_string())
                    });
                    summary.failed += 1;
                    let message = err.user_message(&handle.name);
                    self.report_status(handle, ServiceCheckStatus::Critical, Some(&message));

                    if err.marks_broken() {
                        warn!(instance = %handle.name, error = %err, "Instance is broken, scheduling recovery");
                        if let Ok(mut instance) = handle.instance.try_lock() {
                            instance.mark_broken();
                        }
                        self.pipeline.clear_rates_aggregator(&handle.name);
                        newly_broken.insert(handle.name.clone());
                    } else {
                        warn!(instance = %handle.name, error = %err, "Collection failed");
                    }
                }
            }
        }

        if !newly_broken.is_empty() {
            let (broken, active): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
                .into_iter()
                .partition(|handle| newly_broken.contains(&handle.name));
            summary.broken = broken.len();
            self.active = active;
            self.add_broken(broken);
        }

        self.refresh_health(Some(&summary));
        summary
    }

    /// Try to reconnect every broken instance, in random order
    ///
    /// Returns the number of recovered instances.
    pub async fn process_recovery(&mut self) -> usize {
        let mut batch = self.take_broken();
        if batch.is_empty() {
            return 0;
        }
        batch.shuffle(&mut rand::thread_rng());
        info!(instances = batch.len(), "Recovering broken instances");

        let statuses = self
            .on_recovery_pool(&batch, |instance| async move {
                instance.lock().await.init(true).await
            })
            .await;

        let mut recovered = 0;
        let mut still_broken = Vec::new();
        for (handle, status) in batch.into_iter().zip(statuses) {
            match status.error {
                None => {
                    info!(instance = %handle.name, "Instance recovered");
                    recovered += 1;
                    self.active.push(handle);
                }
                Some(err) => {
                    debug!(instance = %handle.name, error = %err, "Instance still broken");
                    let message = err.user_message(&handle.name);
                    self.report_status(&handle, ServiceCheckStatus::Critical, Some(&message));
                    still_broken.push(handle);
                }
            }
        }
        self.add_broken(still_broken);
        self.refresh_health(None);
        recovered
    }

    /// Initialise, then iterate every `check_period` until `shutdown`
    /// resolves
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        self.init().await;

        let mut ticker = tokio::time::interval(self.config.init_config.check_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let summary = self.do_iteration().await;
                    debug!(?summary, "Iteration done");
                    self.process_recovery().await;
                }
            }
        }

        info!("Shutting down collection");
        self.clean_up().await;
    }

    /// Close every instance through the recovery processor
    pub async fn clean_up(&mut self) {
        self.collection.shutdown();
        let mut batch = std::mem::take(&mut self.active);
        batch.extend(self.take_broken());
        batch.extend(std::mem::take(&mut self.pending));

        self.on_recovery_pool(&batch, |instance| async move {
            instance.lock().await.clean_up().await;
            Ok(())
        })
        .await;

        self.pending = batch;
        self.refresh_health(None);
    }

    /// Run one match pass per instance for a listing action
    pub async fn list(&mut self, action: Action) -> Vec<InstanceListing> {
        let batch = std::mem::take(&mut self.pending);
        let statuses = self
            .on_recovery_pool(&batch, move |instance| async move {
                let mut instance = instance.lock().await;
                let result = instance.init_for(action, false).await;
                let report = instance.report().clone();
                instance.clean_up().await;
                result.map(|_| report)
            })
            .await;

        let listings = batch
            .iter()
            .zip(statuses)
            .map(|(handle, status)| InstanceListing {
                instance: handle.name.clone(),
                error: status.error.map(|e| e.user_message(&handle.name)),
                report: status.data,
            })
            .collect();
        self.pending = batch;
        listings
    }
}
