use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;

use cronq_core::models::{NewTask, Task, TaskLogEntry, TaskStatus};

use super::core::PostgresStore;

/// Column list shared by every query that returns full task rows. The
/// interval and enum columns come back as float seconds and text so the row
/// mapper stays storage-type free.
const TASK_COLUMNS: &str = "id, reference, eta, name, params, max_retries, \
    EXTRACT(EPOCH FROM retry_delay)::float8 AS retry_delay, \
    status::text AS status, last_stamp, retries";

impl PostgresStore {
    pub(super) async fn task_add_impl(&self, new: &NewTask) -> Result<(i64, f64)> {
        let query = format!(
            "INSERT INTO {schema}.task_pending \
             (eta, name, params, reference, max_retries, retry_delay) \
             VALUES (COALESCE($1, NOW()), $2, $3, $4, $5, make_interval(secs => $6)) \
             RETURNING id, GREATEST(EXTRACT(EPOCH FROM eta - NOW()), 0)::float8 AS delay",
            schema = self.schema
        );
        let row = sqlx::query(&query)
            .bind(new.eta)
            .bind(&new.name)
            .bind(Value::Object(new.params.clone()))
            .bind(&new.reference)
            .bind(new.max_retries)
            .bind(new.retry_delay.as_secs_f64())
            .fetch_one(&self.pool)
            .await?;
        Ok((row.try_get("id")?, row.try_get("delay")?))
    }

    /// Claim-to-progress in one statement: the inner select takes row locks
    /// and skips rows a concurrent claimer already holds, so two processes
    /// never observe the same task.
    pub(super) async fn task_search_impl(&self, batch_size: i64) -> Result<Vec<Task>> {
        let query = format!(
            "UPDATE {schema}.task_pending SET status = 'progress', last_stamp = NOW() \
             WHERE id IN (\
                 SELECT id FROM {schema}.task_pending \
                 WHERE eta < NOW() \
                   AND status = ANY(ARRAY['pending', 'retry']::{schema}.task_status[]) \
                 ORDER BY eta \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING {columns}",
            schema = self.schema,
            columns = TASK_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(batch_size)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub(super) async fn task_search4cancel_impl(&self, id: i64) -> Result<bool> {
        claim_for_cancel(&self.pool, &self.schema, id).await
    }

    /// Claim and archive in one transaction so the task is never observable
    /// as claimed-but-not-canceled after a crash.
    pub(super) async fn task_cancel_impl(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !claim_for_cancel(&mut *tx, &self.schema, id).await? {
            return Ok(false);
        }
        move_arch(&mut *tx, &self.schema, id, TaskStatus::Canceled, None).await?;
        tx.commit().await?;
        Ok(true)
    }

    pub(super) async fn task_next_delay_impl(&self) -> Result<Option<f64>> {
        let query = format!(
            "SELECT EXTRACT(EPOCH FROM eta - NOW())::float8 AS delay \
             FROM {schema}.task_pending \
             WHERE status = ANY(ARRAY['pending', 'retry']::{schema}.task_status[]) \
             ORDER BY eta \
             LIMIT 1 \
             FOR SHARE SKIP LOCKED",
            schema = self.schema
        );
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.map(|row| row.try_get("delay")).transpose()?)
    }

    pub(super) async fn task_retry_impl(
        &self,
        id: i64,
        retries: i32,
        delay_secs: Option<f64>,
    ) -> Result<()> {
        // NOW() + make_interval(NULL) is NULL, so a missing delay falls
        // through COALESCE and leaves the original eta in place.
        let query = format!(
            "UPDATE {schema}.task_pending \
             SET status = 'retry', retries = $2, \
                 eta = COALESCE(NOW() + make_interval(secs => $3), eta), \
                 last_stamp = NOW() \
             WHERE id = $1",
            schema = self.schema
        );
        sqlx::query(&query)
            .bind(id)
            .bind(retries)
            .bind(delay_secs)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(super) async fn task_move_arch_impl(
        &self,
        id: i64,
        status: TaskStatus,
        retries: Option<i32>,
    ) -> Result<()> {
        move_arch(&self.pool, &self.schema, id, status, retries).await
    }

    pub(super) async fn task_log_add_impl(&self, entry: &TaskLogEntry) -> Result<()> {
        let query = format!(
            "INSERT INTO {schema}.task_log \
             (task_id, eta, started, finished, result, error, error_cls, traceback) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            schema = self.schema
        );
        sqlx::query(&query)
            .bind(entry.task_id)
            .bind(entry.eta)
            .bind(entry.started)
            .bind(entry.finished)
            .bind(&entry.result)
            .bind(&entry.error)
            .bind(&entry.error_cls)
            .bind(&entry.traceback)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Inheritance makes the parent table span both partitions, so one
    /// query covers live and archived tasks.
    pub(super) async fn find_by_reference_impl(&self, reference: &str) -> Result<Vec<Task>> {
        let query = format!(
            "SELECT {columns} FROM {schema}.task WHERE reference = $1 ORDER BY id",
            schema = self.schema,
            columns = TASK_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(reference)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }
}

async fn claim_for_cancel(
    executor: impl sqlx::PgExecutor<'_>,
    schema: &str,
    id: i64,
) -> Result<bool> {
    let query = format!(
        "UPDATE {schema}.task_pending SET status = 'progress', last_stamp = NOW() \
         WHERE id = $1 AND status = ANY(ARRAY['pending', 'retry']::{schema}.task_status[]) \
         RETURNING id",
        schema = schema
    );
    let row = sqlx::query(&query).bind(id).fetch_optional(executor).await?;
    Ok(row.is_some())
}

/// Delete from the pending partition and insert into the archive in one
/// statement, so the row is visible in exactly one partition at any
/// observable instant and a crash leaves either both sides or neither.
async fn move_arch(
    executor: impl sqlx::PgExecutor<'_>,
    schema: &str,
    id: i64,
    status: TaskStatus,
    retries: Option<i32>,
) -> Result<()> {
    let query = format!(
        "WITH del AS (\
             DELETE FROM {schema}.task_pending WHERE id = $1 \
             RETURNING id, eta, name, params, max_retries, retry_delay, retries, reference) \
         INSERT INTO {schema}.task_arch \
             (id, eta, name, params, max_retries, retry_delay, status, retries, last_stamp, reference) \
         SELECT id, eta, name, params, max_retries, retry_delay, \
                $2::text::{schema}.task_status, COALESCE($3, retries), NOW(), reference \
         FROM del",
        schema = schema
    );
    sqlx::query(&query)
        .bind(id)
        .bind(status.as_str())
        .bind(retries)
        .execute(executor)
        .await?;
    Ok(())
}

fn task_from_row(row: &PgRow) -> Result<Task> {
    let status: String = row.try_get("status")?;
    let params = match row.try_get::<Value, _>("params")? {
        Value::Object(map) => map,
        other => return Err(anyhow!("task params is not a JSON object: {}", other)),
    };
    let retry_delay: f64 = row.try_get("retry_delay")?;
    Ok(Task {
        id: row.try_get("id")?,
        reference: row.try_get("reference")?,
        eta: row.try_get("eta")?,
        name: row.try_get("name")?,
        params,
        max_retries: row.try_get("max_retries")?,
        retry_delay: Duration::from_secs_f64(retry_delay.max(0.0)),
        status: TaskStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown task status {:?}", status))?,
        last_stamp: row.try_get("last_stamp")?,
        retries: row.try_get("retries")?,
    })
}
