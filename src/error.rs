use thiserror::Error;

/// Filter error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    /// Radar Jacobian undefined: the linearization point sits on the sensor.
    #[error("Degenerate linearization: range² {range_squared:.3e} below threshold")]
    DegenerateLinearization { range_squared: f64 },

    #[error("Innovation covariance is singular")]
    SingularInnovation,

    #[error("Measurement model mismatch: expected {expected}-D model, found {actual}-D")]
    ModelMismatch { expected: usize, actual: usize },
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Measurement log reading errors
#[derive(Error, Debug)]
pub enum LogError {
    #[error("Failed to read measurement log: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed measurement on line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}
