use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A construction-time contract was violated.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("shape error: {0}")]
    Shape(String),

    #[error("torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn validation(msg: impl Into<String>) -> Error {
    Error::Validation(msg.into())
}

pub(crate) fn shape(msg: impl Into<String>) -> Error {
    Error::Shape(msg.into())
}
