use thiserror::Error;

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, CtrError>;

#[derive(Error, Debug)]
pub enum CtrError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] json::Error),

    /// A malformed line or record in an input file
    #[error("{path}:{line}: {message}")]
    Parse {
        path: String,
        line: usize,
        message: String,
    },

    #[error("Only [csv|libsvm|tfrecord] are supported now, got '{0}'")]
    UnsupportedFormat(String),

    #[error("Only [{supported}] are supported, got '{name}'")]
    Unsupported { name: String, supported: String },

    #[error("TFRecord error: {0}")]
    TfRecord(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
