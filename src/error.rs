//! Error types for CitySonic

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CitySonicError {
    /// No free slot in a fixed-capacity pool. The caller may retry later or drop the sound.
    #[error("{pool} pool exhausted (capacity {capacity})")]
    Exhausted { pool: &'static str, capacity: usize },

    /// Stale or out-of-range handle. Indicates a caller bug.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Playback requested before any buffer was filled. Retryable.
    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audio loading error: {0}")]
    AudioLoading(String),

    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CitySonicError {
    /// Whether the same call may succeed if issued again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::NotReady(_))
    }

    /// File open, read, or parse failures.
    pub fn is_io_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::AudioLoading(_))
    }
}

impl From<std::collections::TryReserveError> for CitySonicError {
    fn from(err: std::collections::TryReserveError) -> Self {
        Self::AllocationFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CitySonicError>;

/// Lock a mutex, reporting poisoning as an engine error.
pub(crate) fn lock<'a, T>(
    mutex: &'a std::sync::Mutex<T>,
    what: &str,
) -> Result<std::sync::MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| CitySonicError::Engine(format!("{} lock poisoned", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let exhausted = CitySonicError::Exhausted {
            pool: "source",
            capacity: 4,
        };
        assert!(exhausted.is_retryable());
        assert!(CitySonicError::NotReady("stream".into()).is_retryable());
        assert!(!CitySonicError::InvalidHandle("x".into()).is_retryable());
        assert!(!CitySonicError::AllocationFailure("ring".into()).is_retryable());
    }

    #[test]
    fn test_io_failure_classification() {
        let io = CitySonicError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(io.is_io_failure());
        assert!(CitySonicError::AudioLoading("bad header".into()).is_io_failure());
        assert!(!CitySonicError::Engine("x".into()).is_io_failure());
    }

    #[test]
    fn test_exhausted_message() {
        let err = CitySonicError::Exhausted {
            pool: "stream",
            capacity: 16,
        };
        assert_eq!(err.to_string(), "stream pool exhausted (capacity 16)");
    }
}
