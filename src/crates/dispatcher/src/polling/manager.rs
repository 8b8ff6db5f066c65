//! Task lifecycle coordination
//!
//! Submissions are persisted as Pending and pushed onto a queue drained by a
//! fixed set of workers, so at most `workers.pool_size` tasks run at once.
//! Every status change is written to the [`TaskStore`] first and then
//! broadcast on the task's watch channel, which is what `wait` sleeps on.

use super::snapshot::TaskSnapshot;
use crate::config::{DefaultsConfig, DispatcherConfig, RequestConfig};
use crate::db::{DatabaseError, StatusUpdate, TaskRecord, TaskStore};
use crate::executor::{AttemptObserver, Executor, Outcome, RetryOrchestrator};
use crate::validation::{Validator, ValidatorRegistry};
use crate::{DispatchError, Result, TaskStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ORPHANED_ERROR: &str = "Task orphaned: the dispatcher restarted before it finished";

/// In-memory handle of a task that has not finished in this process
struct ActiveTask {
    cancel: CancellationToken,
    status: Arc<watch::Sender<TaskStatus>>,
}

/// Unit of work handed to a worker
struct Job {
    id: Uuid,
    request: RequestConfig,
    validators: Vec<Arc<dyn Validator>>,
}

/// State shared with the workers
struct Shared {
    store: TaskStore,
    executor: Arc<dyn Executor>,
    active: DashMap<Uuid, ActiveTask>,
    /// Parent of every task token
    shutdown: CancellationToken,
}

/// Submit, observe and cancel background LLM tasks
pub struct PollingManager {
    shared: Arc<Shared>,
    registry: ValidatorRegistry,
    defaults: DefaultsConfig,
    wait_fallback: Duration,
    retention: Option<Duration>,
    accepting: AtomicBool,
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
    janitor_stop: CancellationToken,
}

impl PollingManager {
    /// Open the configured database and start with the built-in validators
    pub async fn connect(config: &DispatcherConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        config.validate()?;
        let store = TaskStore::open(&config.database.url, config.database.max_connections).await?;
        Self::start(store, ValidatorRegistry::with_builtins(), executor, config).await
    }

    /// Start the worker pool
    ///
    /// Tasks left Pending or Running by a previous process are marked Failed
    /// first, unless `workers.recover_orphans` is off.
    pub async fn start(
        store: TaskStore,
        registry: ValidatorRegistry,
        executor: Arc<dyn Executor>,
        config: &DispatcherConfig,
    ) -> Result<Self> {
        config.validate()?;

        if config.workers.recover_orphans {
            let recovered = recover_orphans(&store).await?;
            if recovered > 0 {
                warn!(recovered, "Marked orphaned tasks as failed");
            }
        }

        let shared = Arc::new(Shared {
            store,
            executor,
            active: DashMap::new(),
            shutdown: CancellationToken::new(),
        });

        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..config.workers.pool_size)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                let rx = Arc::clone(&rx);
                tokio::spawn(worker_loop(worker_id, shared, rx))
            })
            .collect();

        let janitor_stop = CancellationToken::new();
        let janitor = config.retention().map(|retain| {
            tokio::spawn(janitor_loop(
                shared.store.clone(),
                retain,
                config.gc_interval(),
                janitor_stop.clone(),
            ))
        });

        info!(
            pool_size = config.workers.pool_size,
            retention_secs = ?config.retention.retain_terminal_secs,
            "Polling manager started"
        );

        Ok(Self {
            shared,
            registry,
            defaults: config.defaults.clone(),
            wait_fallback: config.wait_fallback(),
            retention: config.retention(),
            accepting: AtomicBool::new(true),
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            janitor: Mutex::new(janitor),
            janitor_stop,
        })
    }

    /// Accept a submission and schedule it
    ///
    /// Returns as soon as the task is stored as Pending.
    ///
    /// # Errors
    /// * `InvalidConfig` if required fields are missing, values are out of
    ///   range, or a validator is unknown or misconfigured
    /// * `ShuttingDown` after [`shutdown`](Self::shutdown)
    pub async fn submit(&self, config: Value) -> Result<Uuid> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }

        let mut request = RequestConfig::from_value(config)?;
        request.apply_defaults(&self.defaults);

        let validators = self
            .registry
            .build_chain(&request.validation)
            .map_err(|e| match e {
                DispatchError::ValidatorNotFound(name) => {
                    DispatchError::InvalidConfig(format!("unknown validator '{}'", name))
                }
                other => other,
            })?;

        let id = Uuid::new_v4();
        let model = request.model.clone();
        let record = TaskRecord::new(id.to_string(), serde_json::to_string(&request)?);
        self.shared.store.create(&record).await?;

        let (status_tx, _) = watch::channel(TaskStatus::Pending);
        self.shared.active.insert(
            id,
            ActiveTask {
                cancel: self.shared.shutdown.child_token(),
                status: Arc::new(status_tx),
            },
        );

        let job = Job {
            id,
            request,
            validators,
        };
        let sent = match self.queue.lock().as_ref() {
            Some(queue) => queue.send(job).is_ok(),
            None => false,
        };

        if !sent {
            // Shutdown won the race; don't leave the task pending forever
            self.shared.active.remove(&id);
            if let Err(e) = self
                .shared
                .store
                .update_status(&id.to_string(), TaskStatus::Cancelled, StatusUpdate::none())
                .await
            {
                warn!(task_id = %id, error = %e, "Failed to cancel unscheduled task");
            }
            return Err(DispatchError::ShuttingDown);
        }

        info!(task_id = %id, model = %model, "Task submitted");
        Ok(id)
    }

    /// Current state of a task
    pub async fn get_status(&self, id: Uuid) -> Result<TaskSnapshot> {
        let record = self.load(id).await?;
        TaskSnapshot::try_from(record)
    }

    /// Block until the task is terminal or `timeout` elapses
    ///
    /// # Returns
    /// The stored result of a completed task
    ///
    /// # Errors
    /// * `Timeout` if the task is still running when `timeout` elapses
    /// * `TaskFailed` for Failed and TimedOut tasks
    /// * `NeedsHumanReview` for escalated tasks
    /// * `TaskCancelled` for cancelled tasks
    /// * `TaskNotFound` for unknown ids
    pub async fn wait(&self, id: Uuid, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now().checked_add(timeout);

        loop {
            // Subscribe before reading so a transition in between still wakes us
            let mut notifications = self
                .shared
                .active
                .get(&id)
                .map(|task| task.status.subscribe());

            let record = self.load(id).await?;
            if record.is_terminal() {
                return terminal_result(id, record);
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                return Err(DispatchError::Timeout {
                    task_id: id.to_string(),
                    waited: timeout,
                });
            }

            let tick = remaining.min(self.wait_fallback);
            match notifications.as_mut() {
                Some(rx) => {
                    let _ = tokio::time::timeout(tick, rx.changed()).await;
                }
                None => tokio::time::sleep(tick).await,
            }
        }
    }

    /// Request cancellation of a Pending or Running task
    ///
    /// The task is marked Cancelled immediately; a result produced afterwards
    /// by a worker is discarded.
    ///
    /// # Returns
    /// `false` if the task had already finished
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let record = self.load(id).await?;
        if record.is_terminal() {
            return Ok(false);
        }

        match self
            .shared
            .store
            .update_status(&record.id, TaskStatus::Cancelled, StatusUpdate::none())
            .await
        {
            Ok(_) => {
                if let Some(task) = self.shared.active.get(&id) {
                    task.cancel.cancel();
                    task.status.send_replace(TaskStatus::Cancelled);
                }
                info!(task_id = %id, "Task cancelled");
                Ok(true)
            }
            Err(e) if e.is_invalid_transition() => {
                debug!(task_id = %id, "Task finished before it could be cancelled");
                Ok(false)
            }
            Err(e) if e.is_not_found() => Err(DispatchError::TaskNotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshots of all Pending and Running tasks
    pub async fn list_active(&self) -> Result<Vec<TaskSnapshot>> {
        self.shared
            .store
            .list_active()
            .await?
            .into_iter()
            .map(TaskSnapshot::try_from)
            .collect()
    }

    /// Delete terminal tasks completed more than `age` ago
    pub async fn purge_older_than(&self, age: Duration) -> Result<u64> {
        Ok(self.shared.store.delete_older_than(age).await?)
    }

    /// Apply the configured retention window once
    ///
    /// # Returns
    /// Deleted task count, 0 when no retention is configured
    pub async fn collect_garbage(&self) -> Result<u64> {
        match self.retention {
            Some(retain) => self.purge_older_than(retain).await,
            None => Ok(0),
        }
    }

    pub fn registry(&self) -> &ValidatorRegistry {
        &self.registry
    }

    pub fn store(&self) -> &TaskStore {
        &self.shared.store
    }

    /// Tasks submitted in this process that have not finished yet
    pub fn in_flight(&self) -> usize {
        self.shared.active.len()
    }

    /// Stop accepting work, cancel outstanding tasks and join the workers
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(in_flight = self.in_flight(), "Shutting down polling manager");

        self.queue.lock().take();
        self.shared.shutdown.cancel();
        self.janitor_stop.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "Worker terminated abnormally");
            }
        }

        let janitor = self.janitor.lock().take();
        if let Some(handle) = janitor {
            if let Err(e) = handle.await {
                error!(error = %e, "Janitor terminated abnormally");
            }
        }

        info!("Polling manager stopped");
    }

    async fn load(&self, id: Uuid) -> Result<TaskRecord> {
        self.shared.store.get(&id.to_string()).await.map_err(|e| {
            if e.is_not_found() {
                DispatchError::TaskNotFound(id.to_string())
            } else {
                e.into()
            }
        })
    }
}

impl Drop for PollingManager {
    fn drop(&mut self) {
        // Workers exit once the queue sender is gone; the janitor needs a signal
        self.janitor_stop.cancel();
    }
}

/// Map a terminal row to what `wait` returns
fn terminal_result(id: Uuid, record: TaskRecord) -> Result<Value> {
    let task_id = id.to_string();
    let error = record.error.clone().unwrap_or_default();

    match record.task_status() {
        Some(TaskStatus::Completed) => match record.result.as_deref() {
            Some(result) => Ok(serde_json::from_str(result)?),
            None => Ok(Value::Null),
        },
        Some(TaskStatus::Failed) if record.needs_review => Err(DispatchError::NeedsHumanReview {
            task_id,
            reason: error,
        }),
        Some(TaskStatus::Failed) | Some(TaskStatus::TimedOut) => {
            Err(DispatchError::TaskFailed { task_id, error })
        }
        Some(TaskStatus::Cancelled) => Err(DispatchError::TaskCancelled(task_id)),
        _ => Err(DatabaseError::corrupt(format!(
            "task {} is not terminal: '{}'",
            task_id, record.status
        ))
        .into()),
    }
}

/// Fail every task a previous process left unfinished
async fn recover_orphans(store: &TaskStore) -> Result<usize> {
    let mut recovered = 0;
    for record in store.list_active().await? {
        match store
            .update_status(&record.id, TaskStatus::Failed, StatusUpdate::failed(ORPHANED_ERROR))
            .await
        {
            Ok(_) => recovered += 1,
            Err(e) if e.is_invalid_transition() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(recovered)
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<Shared>,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
) {
    debug!(worker_id, "Worker started");

    loop {
        let job = {
            let mut queue = queue.lock().await;
            queue.recv().await
        };

        match job {
            Some(job) => {
                let id = job.id;
                run_job(&shared, job).await;
                shared.active.remove(&id);
            }
            None => break,
        }
    }

    debug!(worker_id, "Worker stopped");
}

async fn run_job(shared: &Shared, job: Job) {
    let task_id = job.id.to_string();
    let (cancel, status) = match shared.active.get(&job.id) {
        Some(task) => (task.cancel.clone(), Arc::clone(&task.status)),
        None => {
            warn!(task_id = %task_id, "Dropping job without an active handle");
            return;
        }
    };

    if cancel.is_cancelled() {
        // Cancelled while queued, or the manager is shutting down
        finish(shared, &task_id, &status, TaskStatus::Cancelled, StatusUpdate::none()).await;
        return;
    }

    match shared
        .store
        .update_status(&task_id, TaskStatus::Running, StatusUpdate::none())
        .await
    {
        Ok(_) => {
            status.send_replace(TaskStatus::Running);
        }
        Err(e) if e.is_invalid_transition() => {
            debug!(task_id = %task_id, "Task left Pending before pickup, skipping");
            return;
        }
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Failed to mark task running");
            let update = StatusUpdate::failed(format!("Failed to start task: {}", e));
            finish(shared, &task_id, &status, TaskStatus::Failed, update).await;
            return;
        }
    }

    let observer = ProgressObserver {
        store: &shared.store,
        task_id: &task_id,
    };
    let orchestrator = RetryOrchestrator::new(Arc::clone(&shared.executor))
        .with_validators(job.validators)
        .with_task_id(task_id.clone());
    let outcome = match AssertUnwindSafe(orchestrator.run(&job.request, &observer, &cancel))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(task_id = %task_id, panic = %message, "Task execution panicked");
            let update = StatusUpdate::failed(format!("Task panicked: {}", message));
            finish(shared, &task_id, &status, TaskStatus::Failed, update).await;
            return;
        }
    };

    let (next, update) = match outcome {
        Outcome::Success { completion, .. } => match serde_json::to_value(&completion) {
            Ok(result) => (TaskStatus::Completed, StatusUpdate::completed(result)),
            Err(e) => (
                TaskStatus::Failed,
                StatusUpdate::failed(format!("Failed to serialize result: {}", e)),
            ),
        },
        Outcome::Failure { error, .. } => (TaskStatus::Failed, StatusUpdate::failed(error)),
        Outcome::NeedsHumanReview { reason, attempts } => (
            TaskStatus::Failed,
            StatusUpdate::escalated(format!(
                "Needs human review after {} attempt(s): {}",
                attempts, reason
            )),
        ),
        Outcome::TimedOut { attempts } => (
            TaskStatus::TimedOut,
            StatusUpdate::failed(format!(
                "Deadline of {:.3}s exceeded after {} attempt(s)",
                job.request.timeout.unwrap_or_default(),
                attempts
            )),
        ),
        Outcome::Cancelled { .. } => (TaskStatus::Cancelled, StatusUpdate::none()),
    };

    finish(shared, &task_id, &status, next, update).await;
}

/// Persist a terminal status and notify waiters
///
/// A task that already reached a terminal status (cancelled by a caller)
/// keeps it; the late outcome is dropped.
async fn finish(
    shared: &Shared,
    task_id: &str,
    status: &watch::Sender<TaskStatus>,
    next: TaskStatus,
    update: StatusUpdate,
) {
    match shared.store.update_status(task_id, next, update).await {
        Ok(_) => {
            info!(task_id, status = %next, "Task finished");
            status.send_replace(next);
        }
        Err(e) if e.is_invalid_transition() => {
            debug!(task_id, discarded = %next, "Task already terminal, discarding late outcome");
        }
        Err(e) => {
            error!(task_id, status = %next, error = %e, "Failed to persist task outcome");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Persists attempt count and progress as the orchestrator advances
struct ProgressObserver<'a> {
    store: &'a TaskStore,
    task_id: &'a str,
}

#[async_trait]
impl<'a> AttemptObserver for ProgressObserver<'a> {
    async fn attempt_started(&self, attempt: u32, max_attempts: u32) {
        let progress = running_progress(attempt, max_attempts);
        if let Err(e) = self.store.update_progress(self.task_id, attempt, progress).await {
            warn!(task_id = self.task_id, attempt, error = %e, "Failed to record progress");
        }
    }
}

/// Progress while running; 100 is reserved for completion
fn running_progress(attempt: u32, max_attempts: u32) -> u8 {
    let max = u64::from(max_attempts.max(1));
    (u64::from(attempt) * 100 / max).min(99) as u8
}

async fn janitor_loop(store: TaskStore, retain: Duration, every: Duration, stop: CancellationToken) {
    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                match store.delete_older_than(retain).await {
                    Ok(deleted) => debug!(deleted, "Retention sweep finished"),
                    Err(e) => warn!(error = %e, "Retention sweep failed"),
                }
            }
        }
    }
}
