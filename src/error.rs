use thiserror::Error;

pub type VizResult<T> = Result<T, VizError>;

/// Failures surfaced to callers of the visualization pipeline. None are retried here.
#[derive(Debug, Error)]
pub enum VizError {
    /// Malformed group or field options.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The feature service could not be reached or returned something unusable.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unknown classification method, or a class count outside 3..=9.
    #[error("Unsupported classification: {0}")]
    UnsupportedClassification(String),

    /// No values to classify.
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
}

impl VizError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedClassification(msg.into())
    }

    pub fn insufficient_data(msg: impl Into<String>) -> Self {
        Self::InsufficientData(msg.into())
    }

    /// Short machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            VizError::InvalidRequest(_) => "invalid_request",
            VizError::Transport(_) => "transport",
            VizError::UnsupportedClassification(_) => "unsupported_classification",
            VizError::InsufficientData(_) => "insufficient_data",
        }
    }
}

impl From<reqwest::Error> for VizError {
    fn from(e: reqwest::Error) -> Self {
        VizError::Transport(e.to_string())
    }
}
