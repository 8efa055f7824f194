use thiserror::Error;

/// Errors raised by models, datasets and training loops.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Prediction requested before a training dataset was set")]
    DatasetNotSet,

    #[error("Invalid number of mixture components: {0} (must be at least 1)")]
    InvalidComponentCount(usize),

    #[error("Log-likelihood function expects a {expected} density")]
    DensityMismatch { expected: &'static str },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Experience dataset is empty")]
    EmptyDataset,

    #[error("Non-finite {what} at step {step}")]
    NonFinite { what: &'static str, step: usize },

    #[error("No episode reaches timestep {0}")]
    TimestepOutOfRange(usize),

    #[error("Environment failure: {0}")]
    Environment(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    Tch(#[from] tch::TchError),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_not_set_display() {
        let e = Error::DatasetNotSet;
        assert_eq!(
            e.to_string(),
            "Prediction requested before a training dataset was set"
        );
    }

    #[test]
    fn dimension_mismatch_display() {
        let e = Error::DimensionMismatch {
            what: "state",
            expected: 3,
            actual: 2,
        };
        assert_eq!(
            e.to_string(),
            "Dimension mismatch for state: expected 3, got 2"
        );
    }

    #[test]
    fn invalid_component_count_display() {
        let e = Error::InvalidComponentCount(0);
        assert!(e.to_string().contains("at least 1"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
