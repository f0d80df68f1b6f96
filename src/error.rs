// ABOUTME: Defines all error types for the deckgate library using thiserror.
// ABOUTME: Each concern has its own error enum, unified under DeckgateError.

/// Top-level error type for the deckgate library.
#[derive(Debug, thiserror::Error)]
pub enum DeckgateError {
    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Faults raised while obtaining an admission resource.
///
/// An ordinary rejection (a cap is full, the job is already running) is not
/// an error and is reported through a `false` return instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("{resource} semaphore is closed")]
    Closed { resource: &'static str },
}

/// Errors from loading or validating [`Limits`](crate::config::Limits).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{key} is {value}, above the maximum of {max}")]
    TooLarge {
        key: &'static str,
        value: usize,
        max: usize,
    },
}
