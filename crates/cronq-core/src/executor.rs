// Boundary to the business-logic dispatcher. The engine never interprets
// handler names or params; it only classifies the returned outcome.

use async_trait::async_trait;
use serde_json::{Map, Value};

/// Failure details recorded in the execution log.
#[derive(Debug, Clone)]
pub struct TaskError {
    pub message: String,
    pub error_cls: Option<String>,
    pub traceback: Option<String>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_cls: None,
            traceback: None,
        }
    }

    pub fn with_class(mut self, error_cls: impl Into<String>) -> Self {
        self.error_cls = Some(error_cls.into());
        self
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Classified result of one handler invocation.
///
/// `Retry` consumes one unit of the task's retry budget; any other failure
/// archives the task as `error` immediately.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(Value),
    Retry(TaskError),
    Fail(TaskError),
}

/// Executes a named handler with its keyword arguments.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, name: &str, params: &Map<String, Value>) -> Outcome;
}
