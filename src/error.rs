use thiserror::Error;

#[derive(Error, Debug)]
pub enum DemError {
    #[error("config error: {0}")]
    Config(String),

    #[error("missing validation data: {0}")]
    MissingValidationData(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("non-finite {stage} loss at epoch {epoch}: {value}")]
    NonFiniteLoss {
        stage: &'static str,
        epoch: usize,
        value: f64,
    },

    #[error("model is not fitted: {0}")]
    NotFitted(String),

    #[error("corrupt model directory: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type DemResult<T> = std::result::Result<T, DemError>;

impl DemError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::MissingValidationData(_))
    }
}
