use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use cronq_core::models::{CronWindow, NewTask, Task, TaskLogEntry, TaskStatus};
use cronq_core::store::TaskStore;

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    pending: BTreeMap<i64, Task>,
    arch: BTreeMap<i64, Task>,
    log: Vec<TaskLogEntry>,
    cron_last: Option<DateTime<Utc>>,
}

/// In-process store with the same observable semantics as the Postgres
/// backend: claims are atomic under one mutex, so concurrent callers
/// partition due tasks disjointly. Used by engine tests and embedded runs;
/// state does not survive the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pending_task(&self, id: i64) -> Option<Task> {
        self.state.lock().await.pending.get(&id).cloned()
    }

    pub async fn archived_task(&self, id: i64) -> Option<Task> {
        self.state.lock().await.arch.get(&id).cloned()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn log_entries(&self, task_id: i64) -> Vec<TaskLogEntry> {
        self.state
            .lock()
            .await
            .log
            .iter()
            .filter(|entry| entry.task_id == task_id)
            .cloned()
            .collect()
    }
}

fn seconds_until(eta: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (eta - now).num_milliseconds() as f64 / 1000.0
}

fn claimable(task: &Task) -> bool {
    matches!(task.status, TaskStatus::Pending | TaskStatus::Retry)
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn task_add(&self, new: &NewTask) -> anyhow::Result<(i64, f64)> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let eta = new.eta.unwrap_or(now);
        state.next_id += 1;
        let id = state.next_id;
        state.pending.insert(
            id,
            Task {
                id,
                reference: new.reference.clone(),
                eta,
                name: new.name.clone(),
                params: new.params.clone(),
                max_retries: new.max_retries,
                retry_delay: new.retry_delay,
                status: TaskStatus::Pending,
                last_stamp: now,
                retries: None,
            },
        );
        Ok((id, seconds_until(eta, now).max(0.0)))
    }

    async fn task_search(&self, batch_size: i64) -> anyhow::Result<Vec<Task>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut due: Vec<(DateTime<Utc>, i64)> = state
            .pending
            .values()
            .filter(|task| task.eta < now && claimable(task))
            .map(|task| (task.eta, task.id))
            .collect();
        due.sort();
        due.truncate(batch_size.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(task) = state.pending.get_mut(&id) {
                task.status = TaskStatus::Progress;
                task.last_stamp = now;
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn task_search4cancel(&self, id: i64) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        match state.pending.get_mut(&id) {
            Some(task) if claimable(task) => {
                task.status = TaskStatus::Progress;
                task.last_stamp = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn task_cancel(&self, id: i64) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        match state.pending.get(&id) {
            Some(task) if claimable(task) => {}
            _ => return Ok(false),
        }
        let Some(mut task) = state.pending.remove(&id) else {
            return Ok(false);
        };
        task.status = TaskStatus::Canceled;
        task.last_stamp = Utc::now();
        state.arch.insert(id, task);
        Ok(true)
    }

    async fn task_next_delay(&self) -> anyhow::Result<Option<f64>> {
        let state = self.state.lock().await;
        let now = Utc::now();
        Ok(state
            .pending
            .values()
            .filter(|task| claimable(task))
            .map(|task| task.eta)
            .min()
            .map(|eta| seconds_until(eta, now)))
    }

    async fn task_retry(&self, id: i64, retries: i32, delay_secs: Option<f64>) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some(task) = state.pending.get_mut(&id) {
            task.status = TaskStatus::Retry;
            task.retries = Some(retries);
            if let Some(secs) = delay_secs {
                task.eta = now + chrono::Duration::from_std(Duration::from_secs_f64(secs.max(0.0)))?;
            }
            task.last_stamp = now;
        }
        Ok(())
    }

    async fn task_move_arch(
        &self,
        id: i64,
        status: TaskStatus,
        retries: Option<i32>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if let Some(mut task) = state.pending.remove(&id) {
            task.status = status;
            task.retries = retries.or(task.retries);
            task.last_stamp = Utc::now();
            state.arch.insert(id, task);
        }
        Ok(())
    }

    async fn task_log_add(&self, entry: &TaskLogEntry) -> anyhow::Result<()> {
        self.state.lock().await.log.push(entry.clone());
        Ok(())
    }

    async fn find_by_reference(&self, reference: &str) -> anyhow::Result<Vec<Task>> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .pending
            .values()
            .chain(state.arch.values())
            .filter(|task| task.reference.as_deref() == Some(reference))
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.id);
        Ok(tasks)
    }

    async fn cron_window(&self) -> anyhow::Result<CronWindow> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let (last, first_boot) = match state.cron_last {
            Some(last) => (last, false),
            None => (now, true),
        };
        state.cron_last = Some(now);
        Ok(CronWindow {
            now,
            last,
            first_boot,
        })
    }

    async fn health(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
