use crate::panic::PanicError;

/// Options represents the options for a singleflight group
#[derive(Clone, Debug)]
pub struct Options {
    /// CaptureBacktrace captures a backtrace at the fault site when work panics. default is true
    /// the trace starts at the panicking frame, the panic runtime frames are trimmed.
    pub capture_backtrace: bool,
    /// LogPanics emits an error event when the leader's work panics. default is true
    pub log_panics: bool,
    /// Capacity is the initial capacity of the in-flight registry. default is 0
    pub capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            capture_backtrace: true,
            log_panics: true,
            capacity: 0,
        }
    }
}

/// Error is what a caller sees when the work for its key did not produce a value.
///
/// The leader and every follower of the same flight receive equal errors.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error<E> {
    /// The work returned an error, passed through untouched.
    #[error("{0}")]
    Work(E),
    /// The work panicked. `source()` yields the panic payload when it was an error.
    #[error(transparent)]
    Panic(PanicError),
}

impl<E> Error<E> {
    /// work returns the work's own error, if that is what this is.
    pub fn work(&self) -> Option<&E> {
        match self {
            Error::Work(e) => Some(e),
            Error::Panic(_) => None,
        }
    }

    /// panic returns the captured panic, if the work panicked.
    pub fn panic(&self) -> Option<&PanicError> {
        match self {
            Error::Work(_) => None,
            Error::Panic(p) => Some(p),
        }
    }
}

/// Outcome is the result of one call to `Group::work` or `Group::work_async`.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome<T, E> {
    /// The value or error produced by the flight's leader.
    pub result: Result<T, Error<E>>,
    /// Shared is false for the caller that ran the work and true for every
    /// caller that received someone else's result.
    pub shared: bool,
}

impl<T, E> Outcome<T, E> {
    pub fn into_result(self) -> Result<T, Error<E>> {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Options, Outcome};

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert!(opts.capture_backtrace);
        assert!(opts.log_panics);
        assert_eq!(opts.capacity, 0);
    }

    #[test]
    fn test_work_error_display() {
        let err: Error<String> = Error::Work("db unavailable".to_string());
        assert_eq!(err.to_string(), "db unavailable");
        assert_eq!(err.work().map(String::as_str), Some("db unavailable"));
        assert!(err.panic().is_none());
    }

    #[test]
    fn test_outcome_into_result() {
        let outcome: Outcome<i32, String> = Outcome {
            result: Ok(7),
            shared: true,
        };
        assert_eq!(outcome.into_result(), Ok(7));
    }
}
