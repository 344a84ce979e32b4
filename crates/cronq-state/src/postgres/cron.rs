use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::Row;

use cronq_core::models::CronWindow;

use super::core::PostgresStore;

impl PostgresStore {
    /// Advance the cron watermark and return the window this process owns.
    ///
    /// The cooperative table lock serializes competing replica ticks
    /// without blocking readers and writers of the task tables; whoever
    /// loses the race blocks here, then reads the already-advanced
    /// watermark and computes an empty window.
    pub(super) async fn cron_window_impl(&self) -> Result<CronWindow> {
        let mut tx = self.pool.begin().await?;

        let lock = format!(
            "LOCK TABLE {}.task_cron_tick IN SHARE UPDATE EXCLUSIVE MODE",
            self.schema
        );
        sqlx::query(&lock).execute(&mut *tx).await?;

        let select = format!(
            "SELECT NOW() AS now, last_stamp FROM {}.task_cron_tick WHERE id = 0",
            self.schema
        );
        let existing = sqlx::query(&select).fetch_optional(&mut *tx).await?;

        let (now, last, first_boot): (DateTime<Utc>, DateTime<Utc>, bool) = match existing {
            Some(row) => (row.try_get("now")?, row.try_get("last_stamp")?, false),
            None => {
                let insert = format!(
                    "INSERT INTO {}.task_cron_tick (id, last_stamp) VALUES (0, NOW()) \
                     RETURNING NOW() AS now, last_stamp",
                    self.schema
                );
                let row = sqlx::query(&insert).fetch_one(&mut *tx).await?;
                (row.try_get("now")?, row.try_get("last_stamp")?, true)
            }
        };

        let update = format!(
            "UPDATE {}.task_cron_tick SET last_stamp = $1 WHERE id = 0",
            self.schema
        );
        sqlx::query(&update).bind(now).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(CronWindow {
            now,
            last,
            first_boot,
        })
    }
}
