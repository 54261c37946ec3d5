use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("trace json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("op {index}: pool '{label}' was never initialized")]
    UnknownPool { index: usize, label: String },
    #[error("op {index}: pool '{label}' is already initialized")]
    DuplicatePool { index: usize, label: String },
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
}
