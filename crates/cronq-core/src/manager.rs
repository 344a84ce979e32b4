use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::CronqError;
use crate::executor::{Executor, Outcome};
use crate::models::{Eta, NewTask, Task, TaskLogEntry, TaskStatus};
use crate::periodic::{due_firings, Firing, PeriodicTask};
use crate::store::TaskStore;

/// Per-call knobs for [`TaskManager::schedule`].
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    /// Opaque correlation key, not unique.
    pub reference: Option<String>,
    /// Earliest run time; None means now.
    pub eta: Option<Eta>,
    pub max_retries: i32,
    /// Base delay added when the task is re-armed after a retryable failure.
    pub retry_delay: Duration,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            reference: None,
            eta: None,
            max_retries: 0,
            retry_delay: Duration::from_secs(60),
        }
    }
}

/// Lifecycle of a manager instance. New scan/tick cycles only start while
/// `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Running,
    Stopping,
    Stopped,
}

pub struct TaskManagerBuilder {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn Executor>,
    config: QueueConfig,
    periodic: Vec<PeriodicTask>,
}

impl TaskManagerBuilder {
    pub fn new(store: Arc<dyn TaskStore>, executor: Arc<dyn Executor>, config: QueueConfig) -> Self {
        Self {
            store,
            executor,
            config,
            periodic: Vec::new(),
        }
    }

    /// Register a recurring job. The crontab expression is validated here,
    /// not at tick time.
    pub fn register_periodic(
        mut self,
        name: &str,
        crontab: &str,
        strict: bool,
        date_arg: Option<&str>,
    ) -> Result<Self, CronqError> {
        self.periodic
            .push(PeriodicTask::new(name, crontab, strict, date_arg.map(String::from))?);
        Ok(self)
    }

    pub fn build(self) -> Result<Arc<TaskManager>, CronqError> {
        let tz: Tz = self
            .config
            .timezone
            .parse()
            .map_err(|_| CronqError::InvalidTimezone {
                tz: self.config.timezone.clone(),
            })?;
        let (wake_tx, _) = watch::channel(Instant::now());
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(TaskManager {
            store: self.store,
            executor: self.executor,
            config: self.config,
            periodic: self.periodic,
            tz,
            state: StdMutex::new(State::Created),
            scan_lock: Mutex::new(()),
            tick_lock: Mutex::new(()),
            wake_tx,
            shutdown_tx,
            scan_handle: StdMutex::new(None),
            tick_handle: StdMutex::new(None),
        }))
    }
}

/// The queue engine: owns the scan loop, the cron tick loop and the
/// schedule/cancel/health API. All persistent state lives in the
/// [`TaskStore`]; cross-process coordination is delegated entirely to it.
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn Executor>,
    config: QueueConfig,
    periodic: Vec<PeriodicTask>,
    tz: Tz,
    state: StdMutex<State>,
    /// At most one scan cycle per process; `stop` drains through it.
    scan_lock: Mutex<()>,
    /// Serializes cron tick cycles within this process.
    tick_lock: Mutex<()>,
    /// Earliest requested wake deadline for the scan loop. `schedule`
    /// publishes here; the sleeping loop pulls its deadline forward when a
    /// sooner one arrives. Supersedes the stale-timer problem: there is one
    /// loop and one deadline, so a later-firing arm request simply loses.
    wake_tx: watch::Sender<Instant>,
    shutdown_tx: watch::Sender<bool>,
    scan_handle: StdMutex<Option<JoinHandle<()>>>,
    tick_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl TaskManager {
    pub fn builder(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn Executor>,
        config: QueueConfig,
    ) -> TaskManagerBuilder {
        TaskManagerBuilder::new(store, executor, config)
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// Spawn the tick loop and, unless configured idle, the scan loop.
    pub fn start(self: &Arc<Self>) -> Result<(), CronqError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Created {
                return Err(CronqError::Lifecycle { expected: "created" });
            }
            *state = State::Running;
        }

        let tick = Arc::clone(self);
        *self.tick_handle.lock().unwrap() = Some(tokio::spawn(tick.tick_loop()));

        if self.config.idle {
            info!("task manager started idle: scan loop disabled");
        } else {
            let scan = Arc::clone(self);
            *self.scan_handle.lock().unwrap() = Some(tokio::spawn(scan.scan_loop()));
            info!(
                "task manager started (batch_size={}, max_scan_interval={}s, {} periodic task(s))",
                self.config.batch_size,
                self.config.max_scan_interval_secs,
                self.periodic.len()
            );
        }
        Ok(())
    }

    /// Signal shutdown and wait for both loops. An in-flight scan cycle
    /// finishes first; in-flight task executions are never interrupted.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Running {
                return;
            }
            *state = State::Stopping;
        }
        let _ = self.shutdown_tx.send(true);

        let tick_handle = self.tick_handle.lock().unwrap().take();
        if let Some(handle) = tick_handle {
            if let Err(err) = handle.await {
                error!("tick loop terminated abnormally: {}", err);
            }
        }
        let scan_handle = self.scan_handle.lock().unwrap().take();
        if let Some(handle) = scan_handle {
            if let Err(err) = handle.await {
                error!("scan loop terminated abnormally: {}", err);
            }
        }

        *self.state.lock().unwrap() = State::Stopped;
        info!("task manager stopped");
    }

    /// Insert a task and wake the scan loop early if the new task is due
    /// before the loop's current deadline. Returns the task id.
    pub async fn schedule(
        &self,
        name: &str,
        params: Map<String, Value>,
        opts: ScheduleOptions,
    ) -> anyhow::Result<i64> {
        let new = NewTask {
            name: name.to_string(),
            params,
            reference: opts.reference,
            eta: opts.eta.map(|eta| eta.resolve()),
            max_retries: opts.max_retries,
            retry_delay: opts.retry_delay,
        };
        let (id, delay) = self.store.task_add(&new).await?;
        debug!("scheduled task {} ({}), due in {:.3}s", id, new.name, delay);

        let deadline = Instant::now() + Duration::from_secs_f64(delay.max(0.0));
        let _ = self.wake_tx.send(deadline);
        Ok(id)
    }

    /// Cancel a not-yet-started task. False when the task is already
    /// running, archived or absent; an in-flight execution is never
    /// interrupted.
    pub async fn cancel(&self, task_id: i64) -> anyhow::Result<bool> {
        let canceled = self.store.task_cancel(task_id).await?;
        if canceled {
            info!("task {} canceled", task_id);
        }
        Ok(canceled)
    }

    pub async fn health(&self) -> anyhow::Result<()> {
        self.store.health().await
    }

    /// Look up tasks by correlation key, across both partitions.
    pub async fn find_by_reference(&self, reference: &str) -> anyhow::Result<Vec<Task>> {
        self.store.find_by_reference(reference).await
    }

    // --- scan loop ---------------------------------------------------------

    async fn scan_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut wake = self.wake_tx.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = {
                let _cycle = self.scan_lock.lock().await;
                if *shutdown.borrow() {
                    break;
                }
                match self.scan_cycle().await {
                    Ok(delay) => delay,
                    Err(err) => {
                        error!("scan cycle failed: {:#}", err);
                        Duration::from_secs(1)
                    }
                }
            };

            let mut deadline = Instant::now() + delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    changed = wake.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let requested = *wake.borrow_and_update();
                        if requested < deadline {
                            deadline = requested;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One scan cycle. Returns the delay before the next one: zero after a
    /// non-empty batch (there may be more backlog), otherwise the earliest
    /// pending ETA clamped to the configured maximum.
    async fn scan_cycle(&self) -> anyhow::Result<Duration> {
        let tasks = self.store.task_search(self.config.batch_size).await?;
        if tasks.is_empty() {
            let secs = match self.store.task_next_delay().await? {
                Some(next) => next.clamp(0.0, self.config.max_scan_interval_secs),
                None => self.config.max_scan_interval_secs,
            };
            return Ok(Duration::from_secs_f64(secs));
        }

        debug!("claimed {} task(s)", tasks.len());
        join_all(tasks.into_iter().map(|task| self.run_task(task))).await;
        Ok(Duration::ZERO)
    }

    // --- execution supervisor ----------------------------------------------

    async fn run_task(&self, task: Task) {
        let id = task.id;
        if let Err(err) = self.supervise(task).await {
            // The task stays claimed (`progress`); the log row, if written,
            // records the attempt. Recovery is an operator concern.
            error!("supervision of task {} failed: {:#}", id, err);
        }
    }

    async fn supervise(&self, task: Task) -> anyhow::Result<()> {
        let started = Utc::now();
        let outcome = self.executor.execute(&task.name, &task.params).await;
        let finished = Utc::now();

        let entry = match &outcome {
            Outcome::Success(result) => TaskLogEntry {
                task_id: task.id,
                eta: task.eta,
                started,
                finished,
                result: Some(result.clone()),
                error: None,
                error_cls: None,
                traceback: None,
            },
            Outcome::Retry(err) | Outcome::Fail(err) => TaskLogEntry {
                task_id: task.id,
                eta: task.eta,
                started,
                finished,
                result: None,
                error: Some(err.message.clone()),
                error_cls: err.error_cls.clone(),
                traceback: err.traceback.clone(),
            },
        };
        self.store.task_log_add(&entry).await?;

        match outcome {
            Outcome::Success(_) => {
                self.store
                    .task_move_arch(task.id, TaskStatus::Successful, Some(task.retries.unwrap_or(0)))
                    .await?;
                debug!("task {} ({}) succeeded", task.id, task.name);
            }
            Outcome::Retry(err) => {
                let attempts = task.retries.unwrap_or(0) + 1;
                if attempts > task.max_retries {
                    warn!(
                        "task {} ({}) out of retries after {} failed attempt(s): {}",
                        task.id, task.name, attempts, err
                    );
                    self.store
                        .task_move_arch(task.id, TaskStatus::Error, Some(attempts))
                        .await?;
                } else {
                    warn!(
                        "task {} ({}) failed, retry {}/{} in {:.0}s: {}",
                        task.id,
                        task.name,
                        attempts,
                        task.max_retries,
                        task.retry_delay.as_secs_f64(),
                        err
                    );
                    self.store
                        .task_retry(task.id, attempts, Some(task.retry_delay.as_secs_f64()))
                        .await?;
                }
            }
            Outcome::Fail(err) => {
                let attempts = task.retries.unwrap_or(0) + 1;
                error!("task {} ({}) failed: {}", task.id, task.name, err);
                self.store
                    .task_move_arch(task.id, TaskStatus::Error, Some(attempts))
                    .await?;
            }
        }
        Ok(())
    }

    // --- cron tick loop -----------------------------------------------------

    async fn tick_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut boot = true;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let (firings, next_sleep) = {
                let _cycle = self.tick_lock.lock().await;
                match self.tick_cycle(boot).await {
                    Ok(result) => result,
                    Err(err) => {
                        // Firings for this window are dropped; strict tasks
                        // pick them up on the next successful tick because
                        // the watermark only advances on commit.
                        error!("cron tick failed: {:#}", err);
                        (Vec::new(), None)
                    }
                }
            };
            boot = false;

            for firing in firings {
                let mut params = Map::new();
                if let Some(arg) = &firing.date_arg {
                    params.insert(arg.clone(), Value::String(firing.at.to_rfc3339()));
                }
                if let Err(err) = self
                    .schedule(&firing.name, params, ScheduleOptions::default())
                    .await
                {
                    error!("failed to schedule cron firing of {}: {:#}", firing.name, err);
                }
            }

            let delay = next_sleep.unwrap_or(Duration::from_secs(1));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn tick_cycle(&self, boot: bool) -> anyhow::Result<(Vec<Firing<Tz>>, Option<Duration>)> {
        let window = self.store.cron_window().await?;
        if window.first_boot {
            debug!("cron watermark initialized at {}", window.now);
        }
        let now = window.now.with_timezone(&self.tz);
        let last = window.last.with_timezone(&self.tz);

        let (firings, next) = due_firings(&self.periodic, &last, &now, boot);
        if !firings.is_empty() {
            info!(
                "cron tick: {} firing(s) due in window ({}, {}]",
                firings.len(),
                last,
                now
            );
        }
        Ok((firings, next.and_then(|d| d.to_std().ok())))
    }
}
