//! Bounded task processor
//!
//! Runs a batch of futures on a pool of at most `pool_size` concurrent
//! workers with one deadline shared by the whole batch. Every task outcome
//! (result, timeout, panic, cancellation) goes through a caller-supplied
//! classifier so no failure leaves the batch unclassified.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::error::{ClassifiedError, SchedulerError};

/// Raw outcome of one task
#[derive(Debug)]
pub enum TaskOutcome<T, E> {
    /// The task ran to completion
    Completed(Result<T, E>),
    /// The batch deadline passed first; the task was aborted
    TimedOut(Duration),
    /// The task panicked
    Panicked(String),
    /// The task was cancelled before it could finish
    Cancelled,
}

/// Classified outcome of one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus<T> {
    pub data: Option<T>,
    pub error: Option<ClassifiedError>,
}

impl<T> TaskStatus<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: ClassifiedError) -> Self {
        Self {
            data: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
struct WorkerPool {
    permits: Arc<Semaphore>,
    active: AtomicUsize,
}

impl WorkerPool {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(size)),
            active: AtomicUsize::new(0),
        })
    }
}

// counts a worker as busy while it holds a permit
struct ActiveGuard(Arc<WorkerPool>);

impl ActiveGuard {
    fn new(pool: Arc<WorkerPool>) -> Self {
        pool.active.fetch_add(1, Ordering::AcqRel);
        Self(pool)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Named pool of `pool_size` workers
#[derive(Debug)]
pub struct TaskProcessor {
    name: String,
    pool_size: usize,
    pool: Mutex<Arc<WorkerPool>>,
    stopped: AtomicBool,
}

impl TaskProcessor {
    pub fn new(name: impl Into<String>, pool_size: usize) -> Self {
        Self {
            name: name.into(),
            pool_size,
            pool: Mutex::new(WorkerPool::new(pool_size)),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    fn current_pool(&self) -> Arc<WorkerPool> {
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&pool)
    }

    /// Workers currently running a task
    pub fn active_workers(&self) -> usize {
        self.current_pool().active.load(Ordering::Acquire)
    }

    /// False when every worker is busy
    pub fn pool_is_healthy(&self) -> bool {
        self.active_workers() < self.pool_size
    }

    /// Replace the pool; tasks still holding workers of the old pool keep
    /// running against it. Also undoes [`TaskProcessor::shutdown`].
    pub fn reset(&self) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        *pool = WorkerPool::new(self.pool_size);
        self.stopped.store(false, Ordering::Release);
        warn!(pool = %self.name, size = self.pool_size, "Worker pool rebuilt");
    }

    /// Stop accepting batches
    ///
    /// Tasks already holding a worker run to completion; tasks still waiting
    /// for one end as [`TaskOutcome::Cancelled`].
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.current_pool().permits.close();
        debug!(pool = %self.name, "Task processor stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Run `tasks` with one shared deadline and classify each outcome
    ///
    /// Statuses are returned in submission order; `classify` receives the
    /// task index.
    ///
    /// # Errors
    /// Returns `SchedulerError::PoolExhausted` without running anything when
    /// every worker is busy, `SchedulerError::Internal` once the processor
    /// is stopped.
    pub async fn process_tasks<T, E, F, C>(
        &self,
        tasks: Vec<F>,
        timeout: Duration,
        mut classify: C,
    ) -> Result<Vec<TaskStatus<T>>, SchedulerError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
        C: FnMut(usize, TaskOutcome<T, E>) -> TaskStatus<T>,
    {
        if self.is_stopped() {
            return Err(SchedulerError::Internal(format!(
                "processor '{}' is stopped",
                self.name
            )));
        }

        let pool = self.current_pool();
        let active = pool.active.load(Ordering::Acquire);
        if active >= self.pool_size {
            return Err(SchedulerError::PoolExhausted {
                pool: self.name.clone(),
                active,
                size: self.pool_size,
            });
        }

        debug!(pool = %self.name, tasks = tasks.len(), timeout_ms = timeout.as_millis() as u64, "Processing tasks");
        let deadline = Instant::now() + timeout;

        let handles: Vec<JoinHandle<Option<Result<T, E>>>> = tasks
            .into_iter()
            .map(|task| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    let _permit = Arc::clone(&pool.permits).acquire_owned().await.ok()?;
                    let _active = ActiveGuard::new(pool);
                    Some(task.await)
                })
            })
            .collect();

        let mut statuses = Vec::with_capacity(handles.len());
        for (index, mut handle) in handles.into_iter().enumerate() {
            let outcome = match timeout_at(deadline, &mut handle).await {
                Ok(Ok(Some(result))) => TaskOutcome::Completed(result),
                Ok(Ok(None)) => TaskOutcome::Cancelled,
                Ok(Err(e)) if e.is_panic() => TaskOutcome::Panicked(panic_message(e)),
                Ok(Err(_)) => TaskOutcome::Cancelled,
                Err(_) => {
                    handle.abort();
                    TaskOutcome::TimedOut(timeout)
                }
            };
            statuses.push(classify(index, outcome));
        }
        Ok(statuses)
    }
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;
    use std::pin::Pin;

    type BoxedTask = Pin<Box<dyn Future<Output = Result<u32, String>> + Send>>;

    fn ready(result: Result<u32, String>) -> BoxedTask {
        Box::pin(async move { result })
    }

    fn delayed(delay: Duration, value: u32) -> BoxedTask {
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(value)
        })
    }

    fn explode() -> Result<u32, String> {
        panic!("boom")
    }

    fn panicking() -> BoxedTask {
        Box::pin(async { explode() })
    }

    fn stuck() -> BoxedTask {
        Box::pin(pending())
    }

    fn classify(_: usize, outcome: TaskOutcome<u32, String>) -> TaskStatus<u32> {
        match outcome {
            TaskOutcome::Completed(Ok(v)) => TaskStatus::ok(v),
            TaskOutcome::Completed(Err(e)) => TaskStatus::failed(ClassifiedError::ConnectionIo(e)),
            TaskOutcome::TimedOut(t) => TaskStatus::failed(ClassifiedError::ScheduleTimeout(t)),
            TaskOutcome::Panicked(m) => TaskStatus::failed(ClassifiedError::InternalScheduler(m)),
            TaskOutcome::Cancelled => {
                TaskStatus::failed(ClassifiedError::InternalScheduler("cancelled".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn test_outcomes_are_classified_in_order() {
        let processor = TaskProcessor::new("collection", 2);
        let tasks: Vec<BoxedTask> = vec![
            ready(Ok(1)),
            ready(Err("refused".to_string())),
            panicking(),
            ready(Ok(4)),
        ];

        let statuses = processor
            .process_tasks(tasks, Duration::from_secs(5), classify)
            .await
            .unwrap();

        assert_eq!(statuses.len(), 4);
        assert_eq!(statuses[0], TaskStatus::ok(1));
        assert_eq!(
            statuses[1].error,
            Some(ClassifiedError::ConnectionIo("refused".to_string()))
        );
        assert_eq!(
            statuses[2].error,
            Some(ClassifiedError::InternalScheduler("boom".to_string()))
        );
        assert_eq!(statuses[3].data, Some(4));
        assert!(processor.pool_is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_deadline_times_out_slow_tasks() {
        let processor = TaskProcessor::new("collection", 4);
        let tasks: Vec<BoxedTask> = vec![
            delayed(Duration::from_millis(500), 1),
            delayed(Duration::from_secs(30), 2),
        ];

        let started = Instant::now();
        let statuses = processor
            .process_tasks(tasks, Duration::from_secs(2), classify)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(statuses[0].data, Some(1));
        assert_eq!(
            statuses[1].error,
            Some(ClassifiedError::ScheduleTimeout(Duration::from_secs(2)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bounds_concurrency() {
        let processor = TaskProcessor::new("recovery", 1);
        let tasks: Vec<BoxedTask> = (0..3u32)
            .map(|i| delayed(Duration::from_secs(1), i))
            .collect();

        let statuses = processor
            .process_tasks(tasks, Duration::from_millis(2500), classify)
            .await
            .unwrap();

        // one worker: the third task cannot finish before the deadline
        assert!(statuses[0].is_ok());
        assert!(statuses[1].is_ok());
        assert!(matches!(
            statuses[2].error,
            Some(ClassifiedError::ScheduleTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_reported_and_reset() {
        let processor = Arc::new(TaskProcessor::new("collection", 1));

        let background = Arc::clone(&processor);
        let background_batch = tokio::spawn(async move {
            let tasks: Vec<BoxedTask> = vec![stuck()];
            background
                .process_tasks(tasks, Duration::from_secs(3600), classify)
                .await
        });
        while processor.active_workers() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(!processor.pool_is_healthy());
        let tasks: Vec<BoxedTask> = vec![ready(Ok(1))];
        let err = processor
            .process_tasks(tasks, Duration::from_secs(1), classify)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SchedulerError::PoolExhausted {
                pool: "collection".to_string(),
                active: 1,
                size: 1,
            }
        );

        processor.reset();
        assert!(processor.pool_is_healthy());
        let tasks: Vec<BoxedTask> = vec![ready(Ok(7))];
        let statuses = processor
            .process_tasks(tasks, Duration::from_secs(1), classify)
            .await
            .unwrap();
        assert_eq!(statuses[0].data, Some(7));

        background_batch.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_waiting_tasks() {
        let processor = Arc::new(TaskProcessor::new("collection", 1));
        let stopper = Arc::clone(&processor);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.shutdown();
        });

        let tasks: Vec<BoxedTask> = vec![
            delayed(Duration::from_secs(5), 1),
            delayed(Duration::from_secs(5), 2),
        ];
        let statuses = processor
            .process_tasks(tasks, Duration::from_secs(60), classify)
            .await
            .unwrap();

        // the first task holds the only worker and finishes
        let completed = statuses.iter().filter(|s| s.is_ok()).count();
        assert_eq!(completed, 1);
        assert!(statuses.iter().any(|s| s.error
            == Some(ClassifiedError::InternalScheduler("cancelled".to_string()))));

        let tasks: Vec<BoxedTask> = vec![ready(Ok(3))];
        let err = processor
            .process_tasks(tasks, Duration::from_secs(1), classify)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Internal(_)));

        processor.reset();
        assert!(!processor.is_stopped());
        let tasks: Vec<BoxedTask> = vec![ready(Ok(3))];
        let statuses = processor
            .process_tasks(tasks, Duration::from_secs(1), classify)
            .await
            .unwrap();
        assert_eq!(statuses[0].data, Some(3));
    }
}
