// Postgres-backed task queue and cron scheduler: engine, store contract and
// executor boundary. Storage backends live in cronq-state.

pub mod config;
pub mod error;
pub mod executor;
pub mod manager;
pub mod models;
pub mod periodic;
pub mod store;

pub use config::QueueConfig;
pub use error::{CronqError, CronqResult};
pub use executor::{Executor, Outcome, TaskError};
pub use manager::{ScheduleOptions, State, TaskManager, TaskManagerBuilder};
pub use models::{CronWindow, Eta, NewTask, Task, TaskLogEntry, TaskStatus};
pub use periodic::{due_firings, Firing, PeriodicTask};
pub use store::TaskStore;
