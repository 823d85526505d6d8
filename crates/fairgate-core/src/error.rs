use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("priority out of range: B={b}, U={u} (each must be in [0, 127])")]
    OutOfRange { b: i64, u: i64 },

    #[error("invalid priority value: {0} (must be in [0, 16383])")]
    InvalidValue(i64),

    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("config parse error: {0}")]
    ConfigParse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AdmissionError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        AdmissionError::Configuration {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AdmissionError>;
