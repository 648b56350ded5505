mod task;
mod error;

pub use task::{now_ms, Task, TaskId, TaskStatus};
pub use error::{TaskError, Result};

/// Field separator of the task record format.
pub const RECORD_DELIMITER: char = '|';

/// Escape character used inside `payload` and `result` fields.
pub const RECORD_ESCAPE: char = '\\';
