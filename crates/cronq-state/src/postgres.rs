mod core;
mod cron;
mod tasks;

pub use self::core::PostgresStore;

use async_trait::async_trait;

use cronq_core::models::{CronWindow, NewTask, Task, TaskLogEntry, TaskStatus};
use cronq_core::store::TaskStore;

#[async_trait]
impl TaskStore for PostgresStore {
    async fn task_add(&self, new: &NewTask) -> anyhow::Result<(i64, f64)> {
        self.task_add_impl(new).await
    }

    async fn task_search(&self, batch_size: i64) -> anyhow::Result<Vec<Task>> {
        self.task_search_impl(batch_size).await
    }

    async fn task_search4cancel(&self, id: i64) -> anyhow::Result<bool> {
        self.task_search4cancel_impl(id).await
    }

    async fn task_cancel(&self, id: i64) -> anyhow::Result<bool> {
        self.task_cancel_impl(id).await
    }

    async fn task_next_delay(&self) -> anyhow::Result<Option<f64>> {
        self.task_next_delay_impl().await
    }

    async fn task_retry(
        &self,
        id: i64,
        retries: i32,
        delay_secs: Option<f64>,
    ) -> anyhow::Result<()> {
        self.task_retry_impl(id, retries, delay_secs).await
    }

    async fn task_move_arch(
        &self,
        id: i64,
        status: TaskStatus,
        retries: Option<i32>,
    ) -> anyhow::Result<()> {
        self.task_move_arch_impl(id, status, retries).await
    }

    async fn task_log_add(&self, entry: &TaskLogEntry) -> anyhow::Result<()> {
        self.task_log_add_impl(entry).await
    }

    async fn find_by_reference(&self, reference: &str) -> anyhow::Result<Vec<Task>> {
        self.find_by_reference_impl(reference).await
    }

    async fn cron_window(&self) -> anyhow::Result<CronWindow> {
        self.cron_window_impl().await
    }

    async fn health(&self) -> anyhow::Result<()> {
        self.health_impl().await
    }
}
