use mongodb::error::{ErrorKind, WriteFailure};

/// MongoDB server error code raised when a change stream can no longer be
/// resumed because the oplog entries it needs have rolled off.
pub const CHANGE_STREAM_HISTORY_LOST: i32 = 280;

const DUPLICATE_KEY: i32 = 11000;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("bson serialization error: {0}")]
    Serialize(#[from] mongodb::bson::ser::Error),

    #[error("bson deserialization error: {0}")]
    Deserialize(#[from] mongodb::bson::de::Error),

    #[error("cron task `{id}` failed: {message}")]
    CronTaskFailed { id: String, message: String },

    /// The lock could not be acquired within the configured wait budget.
    #[error("lock `{0}` is already acquired")]
    LockAlreadyAcquired(String),

    /// Raised by a handler context when the source document no longer
    /// satisfies the task filter. The worker finalizes the item as completed.
    #[error("the source document no longer matches the task condition")]
    TaskConditionFailed,

    #[error("invalid interval `{input}`: {reason}")]
    InvalidInterval { input: String, reason: String },

    /// A plain string looked like a cron expression but did not carry the
    /// `CRON ` prefix. Refusing it beats silently treating `* * * * *` as a
    /// duration typo.
    #[error("`{0}` looks like a cron expression; prefix it with `CRON ` to schedule one")]
    BareCronExpression(String),

    #[error("cron expression `{0}` has no future occurrence")]
    NoFutureOccurrence(String),

    #[error("task `{0}` is already registered")]
    DuplicateTask(String),

    #[error("polling source `{0}` is already registered")]
    DuplicateSource(String),

    #[error("invalid task name `{name}`: {reason}")]
    InvalidTaskName { name: String, reason: &'static str },

    #[error("cron task `{0}` is not registered")]
    UnknownCronTask(String),

    /// `run_cron_task` was invoked from inside a cron task handler.
    #[error("recursive cron task invocation")]
    RecursiveCronCall,

    #[error("taskmill has already been initialized")]
    AlreadyInitialized,

    #[error("configuration error: {0}")]
    Configuration(String),

    /// The component was asked to do work after `stop()` completed.
    #[error("the scheduler is stopped")]
    Stopped,
}

/// Extract the server error code from a driver error, if there is one.
pub fn error_code(error: &mongodb::error::Error) -> Option<i32> {
    match error.kind.as_ref() {
        ErrorKind::Command(c) => Some(c.code),
        ErrorKind::Write(WriteFailure::WriteError(w)) => Some(w.code),
        ErrorKind::Write(WriteFailure::WriteConcernError(w)) => Some(w.code),
        _ => None,
    }
}

/// Duplicate-key write failures signal contention on a conditional upsert,
/// not corruption; callers retry them.
pub fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    error_code(error) == Some(DUPLICATE_KEY)
}

pub fn is_history_lost(error: &mongodb::error::Error) -> bool {
    error_code(error) == Some(CHANGE_STREAM_HISTORY_LOST)
}
