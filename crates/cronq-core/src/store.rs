// Store contract for the queue engine.
// Implementations: PostgresStore, MemoryStore (cronq-state).

use async_trait::async_trait;

use crate::models::{CronWindow, NewTask, Task, TaskLogEntry, TaskStatus};

/// Storage interface the engine programs against.
///
/// Every mutating operation is atomic against concurrent claimers: a single
/// SQL statement or a single transaction, never a read-then-write round trip
/// from the caller. The Postgres backend relies on `FOR UPDATE SKIP LOCKED`
/// claims so independent worker processes partition due tasks disjointly.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert into the pending partition. Returns the new id and
    /// `max(eta - now, 0)` in seconds, computed in the same statement so the
    /// caller can arm a wake timer without a second query.
    async fn task_add(&self, new: &NewTask) -> anyhow::Result<(i64, f64)>;

    /// Claim up to `batch_size` due tasks (eta elapsed, status pending or
    /// retry), moving them to `progress`, and return the full rows. Rows
    /// already locked by a concurrent transaction are skipped, so two
    /// callers never observe the same task.
    ///
    /// A claimed row that is never resolved (process crash mid-execution)
    /// stays in `progress`; there is no automatic reaper sweep.
    async fn task_search(&self, batch_size: i64) -> anyhow::Result<Vec<Task>>;

    /// The claim-to-progress transition restricted to a single id with
    /// status pending or retry. False if the task is already running,
    /// archived, or absent.
    async fn task_search4cancel(&self, id: i64) -> anyhow::Result<bool>;

    /// Claim and archive as `canceled` in one transaction, preserving the
    /// stored retry count. False under the same conditions as
    /// [`task_search4cancel`](Self::task_search4cancel).
    async fn task_cancel(&self, id: i64) -> anyhow::Result<bool>;

    /// `eta - now` in seconds for the earliest unclaimed pending/retry row
    /// (may be negative when overdue); None when nothing is pending. Uses a
    /// non-blocking locked-row skip so a busy row never stalls the answer.
    async fn task_next_delay(&self) -> anyhow::Result<Option<f64>>;

    /// Re-arm a claimed task: status `retry`, store the new retry count and,
    /// when a delay is given, advance eta to `now + delay`. No delay leaves
    /// eta unchanged, an immediate retry at the already-elapsed time.
    async fn task_retry(&self, id: i64, retries: i32, delay_secs: Option<f64>)
        -> anyhow::Result<()>;

    /// Move a task from the pending partition to the archive with a terminal
    /// status, in one atomic operation: the id is visible in exactly one
    /// partition at any observable instant. `retries: None` preserves the
    /// stored count.
    async fn task_move_arch(
        &self,
        id: i64,
        status: TaskStatus,
        retries: Option<i32>,
    ) -> anyhow::Result<()>;

    /// Append one execution-log row.
    async fn task_log_add(&self, entry: &TaskLogEntry) -> anyhow::Result<()>;

    /// Tasks carrying this correlation key, across both partitions.
    async fn find_by_reference(&self, reference: &str) -> anyhow::Result<Vec<Task>>;

    /// Advance the cron watermark under the cooperative tick-table lock and
    /// return the window `(last, now]` this process owns. Concurrent replica
    /// ticks serialize on the lock; the loser observes the advanced
    /// watermark and computes an empty window.
    async fn cron_window(&self) -> anyhow::Result<CronWindow>;

    /// Liveness probe against the backing connection.
    async fn health(&self) -> anyhow::Result<()>;
}
