use thiserror::Error;

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum CronqError {
    /// Connection retry budget exhausted at startup. Fatal.
    #[error("could not connect to {url} after {attempts} attempts")]
    Connect { url: String, attempts: u32 },

    /// Schema bootstrap failed. Fatal at startup.
    #[error("failed to create schema objects at {url}: {source}")]
    Schema { url: String, source: BoxedError },

    #[error("invalid crontab expression {expr:?}: {source}")]
    InvalidCrontab { expr: String, source: BoxedError },

    #[error("unknown timezone {tz:?}")]
    InvalidTimezone { tz: String },

    #[error("task manager is not in state {expected}")]
    Lifecycle { expected: &'static str },
}

pub type CronqResult<T> = Result<T, CronqError>;
