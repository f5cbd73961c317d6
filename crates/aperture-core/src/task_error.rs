//! Task execution error types
//!
//! A task handler returns `anyhow::Error`. Wrapping it in [`TaskError`] lets the handler
//! tell the work queue whether another attempt can succeed.

use std::fmt;

/// Handler failure tagged as retryable or not
#[derive(Debug)]
pub struct TaskError {
    inner: anyhow::Error,
    recoverable: bool,
}

impl TaskError {
    /// The queue fails the task immediately, without retrying.
    ///
    /// Use for input that will not change between attempts, such as a missing asset
    /// record or an original that no longer exists in storage.
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: false,
        }
    }

    /// The queue retries according to the task's retry budget.
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: true,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }

    /// True when `err` wraps a `TaskError` marked unrecoverable. Any other error counts
    /// as recoverable.
    pub fn is_unrecoverable(err: &anyhow::Error) -> bool {
        err.downcast_ref::<TaskError>()
            .map(|te| !te.is_recoverable())
            .unwrap_or(false)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::recoverable(err)
    }
}

/// Mark a result's error as unrecoverable
pub trait TaskResultExt<T> {
    fn unrecoverable(self) -> Result<T, TaskError>;
}

impl<T, E: Into<anyhow::Error>> TaskResultExt<T> for Result<T, E> {
    fn unrecoverable(self) -> Result<T, TaskError> {
        self.map_err(|e| TaskError::unrecoverable(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecoverable_is_detected_through_anyhow() {
        let err: anyhow::Error = TaskError::unrecoverable(anyhow::anyhow!("asset missing")).into();
        assert!(TaskError::is_unrecoverable(&err));
        assert!(err.to_string().contains("asset missing"));
    }

    #[test]
    fn recoverable_and_plain_errors_are_retryable() {
        let err: anyhow::Error = TaskError::recoverable(anyhow::anyhow!("timeout")).into();
        assert!(!TaskError::is_unrecoverable(&err));

        let plain = anyhow::anyhow!("generic");
        assert!(!TaskError::is_unrecoverable(&plain));
    }

    #[test]
    fn from_anyhow_defaults_to_recoverable() {
        let err: TaskError = anyhow::anyhow!("Some error").into();
        assert!(err.is_recoverable());
    }

    #[test]
    fn result_ext_marks_unrecoverable() {
        let result: Result<(), anyhow::Error> = Err(anyhow::anyhow!("bad payload"));
        let task_result = result.unrecoverable();
        assert!(!task_result.unwrap_err().is_recoverable());
    }
}
