use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cronq_core::{
    Eta, Executor, Outcome, QueueConfig, ScheduleOptions, State, TaskError, TaskManager,
    TaskStatus,
};
use cronq_state::MemoryStore;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Executor returning pre-scripted outcomes per handler name; unscripted
/// calls succeed.
struct ScriptedExecutor {
    outcomes: Mutex<HashMap<String, Vec<Outcome>>>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    async fn script(&self, name: &str, outcomes: Vec<Outcome>) {
        self.outcomes
            .lock()
            .await
            .insert(name.to_string(), outcomes);
    }

    async fn calls_for(&self, name: &str) -> Vec<Map<String, Value>> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(called, _)| called == name)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, name: &str, params: &Map<String, Value>) -> Outcome {
        self.calls
            .lock()
            .await
            .push((name.to_string(), params.clone()));
        let mut outcomes = self.outcomes.lock().await;
        match outcomes.get_mut(name) {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => Outcome::Success(json!({"ok": true})),
        }
    }
}

fn test_config() -> QueueConfig {
    QueueConfig {
        database_url: String::new(),
        schema: "cronq".to_string(),
        connect_max_attempts: 1,
        connect_retry_delay_secs: 0.0,
        pool_size: 1,
        batch_size: 10,
        max_scan_interval_secs: 0.05,
        idle: false,
        timezone: "UTC".to_string(),
        create_objects: false,
    }
}

fn init_tracing() -> tracing::dispatcher::DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    tracing::subscriber::set_default(subscriber)
}

async fn wait_for_archive(store: &MemoryStore, id: i64) -> bool {
    for _ in 0..500 {
        if store.archived_task(id).await.is_some() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn schedule_and_execute_successfully() -> anyhow::Result<()> {
    let _guard = init_tracing();
    let store = MemoryStore::new();
    let executor = Arc::new(ScriptedExecutor::new());
    let manager =
        TaskManager::builder(Arc::new(store.clone()), executor.clone(), test_config()).build()?;
    manager.start()?;

    let mut params = Map::new();
    params.insert("to".to_string(), json!("a@b"));
    let id = manager
        .schedule("send_email", params, ScheduleOptions::default())
        .await?;

    assert!(wait_for_archive(&store, id).await, "task never archived");
    let task = store.archived_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Successful);
    assert_eq!(task.retries, Some(0));
    assert_eq!(task.name, "send_email");
    assert_eq!(task.params.get("to"), Some(&json!("a@b")));

    let log = store.log_entries(id).await;
    assert_eq!(log.len(), 1);
    assert!(log[0].result.is_some());
    assert!(log[0].error.is_none());
    assert!(log[0].finished >= log[0].started);

    manager.stop().await;
    assert_eq!(manager.state(), State::Stopped);
    Ok(())
}

#[tokio::test]
async fn retryable_failures_consume_budget_then_archive_as_error() -> anyhow::Result<()> {
    let _guard = init_tracing();
    let store = MemoryStore::new();
    let executor = Arc::new(ScriptedExecutor::new());
    executor
        .script(
            "flaky",
            vec![
                Outcome::Retry(TaskError::new("boom 1")),
                Outcome::Retry(TaskError::new("boom 2")),
                Outcome::Retry(TaskError::new("boom 3")),
            ],
        )
        .await;

    let manager =
        TaskManager::builder(Arc::new(store.clone()), executor.clone(), test_config()).build()?;
    manager.start()?;

    let opts = ScheduleOptions {
        max_retries: 2,
        retry_delay: Duration::from_millis(30),
        ..Default::default()
    };
    let id = manager.schedule("flaky", Map::new(), opts).await?;

    assert!(wait_for_archive(&store, id).await, "task never archived");
    let task = store.archived_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.retries, Some(3));

    // One log row per attempt, all failures.
    let log = store.log_entries(id).await;
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|entry| entry.result.is_none()));
    assert_eq!(log[0].error.as_deref(), Some("boom 1"));
    assert_eq!(log[2].error.as_deref(), Some("boom 3"));

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn fatal_failure_archives_immediately_despite_retry_budget() -> anyhow::Result<()> {
    let _guard = init_tracing();
    let store = MemoryStore::new();
    let executor = Arc::new(ScriptedExecutor::new());
    executor
        .script(
            "broken",
            vec![Outcome::Fail(
                TaskError::new("bad input").with_class("ValueError"),
            )],
        )
        .await;

    let manager =
        TaskManager::builder(Arc::new(store.clone()), executor.clone(), test_config()).build()?;
    manager.start()?;

    let opts = ScheduleOptions {
        max_retries: 5,
        ..Default::default()
    };
    let id = manager.schedule("broken", Map::new(), opts).await?;

    assert!(wait_for_archive(&store, id).await, "task never archived");
    let task = store.archived_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.retries, Some(1));

    let log = store.log_entries(id).await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].error_cls.as_deref(), Some("ValueError"));

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn future_eta_is_not_claimed_early() -> anyhow::Result<()> {
    let _guard = init_tracing();
    let store = MemoryStore::new();
    let executor = Arc::new(ScriptedExecutor::new());
    let manager =
        TaskManager::builder(Arc::new(store.clone()), executor.clone(), test_config()).build()?;
    manager.start()?;

    let eta = Utc::now() + chrono::Duration::milliseconds(300);
    let opts = ScheduleOptions {
        eta: Some(Eta::from(eta)),
        ..Default::default()
    };
    let id = manager.schedule("later", Map::new(), opts).await?;

    sleep(Duration::from_millis(100)).await;
    let still_pending = store.pending_task(id).await.unwrap();
    assert_eq!(still_pending.status, TaskStatus::Pending);
    assert!(executor.calls_for("later").await.is_empty());

    assert!(wait_for_archive(&store, id).await, "task never ran");
    assert!(!executor.calls_for("later").await.is_empty());

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn schedule_wakes_a_long_idle_scan_loop() -> anyhow::Result<()> {
    let _guard = init_tracing();
    let store = MemoryStore::new();
    let executor = Arc::new(ScriptedExecutor::new());
    let config = QueueConfig {
        max_scan_interval_secs: 30.0,
        ..test_config()
    };
    let manager = TaskManager::builder(Arc::new(store.clone()), executor.clone(), config).build()?;
    manager.start()?;

    // Let the first (empty) cycle park the loop on its 30 s deadline.
    sleep(Duration::from_millis(100)).await;

    let id = manager
        .schedule("quick", Map::new(), ScheduleOptions::default())
        .await?;

    // Without the early wake this would sit until the 30 s timer.
    assert!(wait_for_archive(&store, id).await, "early wake did not fire");

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn cancel_pending_task_and_refuse_claimed_one() -> anyhow::Result<()> {
    let _guard = init_tracing();
    let store = MemoryStore::new();
    let executor = Arc::new(ScriptedExecutor::new());
    let config = QueueConfig {
        idle: true,
        ..test_config()
    };
    let manager = TaskManager::builder(Arc::new(store.clone()), executor.clone(), config).build()?;
    manager.start()?;

    let opts = ScheduleOptions {
        eta: Some(Eta::from(Utc::now() + chrono::Duration::hours(1))),
        ..Default::default()
    };
    let id = manager.schedule("doomed", Map::new(), opts).await?;

    assert!(manager.cancel(id).await?);
    let task = store.archived_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);

    // Already archived: a second cancel is a no-op.
    assert!(!manager.cancel(id).await?);
    // Unknown id.
    assert!(!manager.cancel(999_999).await?);

    // A claimed task cannot be canceled and its outcome is unaffected.
    let due = manager
        .schedule("running", Map::new(), ScheduleOptions::default())
        .await?;
    sleep(Duration::from_millis(20)).await;
    use cronq_core::TaskStore;
    let claimed = store.task_search(10).await?;
    assert!(claimed.iter().any(|task| task.id == due));
    assert!(!manager.cancel(due).await?);
    assert_eq!(
        store.pending_task(due).await.unwrap().status,
        TaskStatus::Progress
    );

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn idle_manager_schedules_but_never_scans() -> anyhow::Result<()> {
    let _guard = init_tracing();
    let store = MemoryStore::new();
    let executor = Arc::new(ScriptedExecutor::new());
    let config = QueueConfig {
        idle: true,
        ..test_config()
    };
    let manager = TaskManager::builder(Arc::new(store.clone()), executor.clone(), config).build()?;
    manager.start()?;

    let id = manager
        .schedule("parked", Map::new(), ScheduleOptions::default())
        .await?;
    sleep(Duration::from_millis(200)).await;

    assert_eq!(
        store.pending_task(id).await.unwrap().status,
        TaskStatus::Pending
    );
    assert!(executor.calls_for("parked").await.is_empty());

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn periodic_task_fires_through_the_same_schedule_path() -> anyhow::Result<()> {
    let _guard = init_tracing();
    let store = MemoryStore::new();
    let executor = Arc::new(ScriptedExecutor::new());
    let manager = TaskManager::builder(Arc::new(store.clone()), executor.clone(), test_config())
        .register_periodic("heartbeat", "* * * * * *", false, Some("at"))?
        .build()?;
    manager.start()?;

    // Every-second schedule: at least one firing within three seconds.
    let mut fired = Vec::new();
    for _ in 0..300 {
        fired = executor.calls_for("heartbeat").await;
        if !fired.is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(!fired.is_empty(), "periodic task never fired");
    let at = fired[0].get("at").and_then(|value| value.as_str());
    assert!(at.is_some(), "date argument missing from params");

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn start_is_single_shot() -> anyhow::Result<()> {
    let _guard = init_tracing();
    let store = MemoryStore::new();
    let executor = Arc::new(ScriptedExecutor::new());
    let manager =
        TaskManager::builder(Arc::new(store.clone()), executor.clone(), test_config()).build()?;

    assert_eq!(manager.state(), State::Created);
    manager.start()?;
    assert_eq!(manager.state(), State::Running);
    assert!(manager.start().is_err());

    manager.stop().await;
    assert_eq!(manager.state(), State::Stopped);
    // Stopping twice is harmless.
    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn health_reports_store_liveness() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let executor = Arc::new(ScriptedExecutor::new());
    let manager =
        TaskManager::builder(Arc::new(store.clone()), executor.clone(), test_config()).build()?;
    manager.health().await?;
    Ok(())
}

#[tokio::test]
async fn invalid_crontab_fails_at_registration() {
    let store = MemoryStore::new();
    let executor = Arc::new(ScriptedExecutor::new());
    let result = TaskManager::builder(Arc::new(store), executor, test_config())
        .register_periodic("bad", "every day at noon", true, None);
    assert!(result.is_err());
}
