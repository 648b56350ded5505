use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Malformed task record: {0}")]
    Malformed(String),

    #[error("Invalid task status: {0}")]
    InvalidStatus(i32),

    #[error("Task record is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

pub type Result<T> = std::result::Result<T, TaskError>;
