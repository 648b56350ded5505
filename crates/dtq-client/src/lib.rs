mod producer;

pub use producer::{Producer, SubmitOutcome};

use dtq_protocol::{ConnectionError, MessageType};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    ConnectionError(#[from] ConnectionError),

    #[error("Unexpected response: {0:?}")]
    UnexpectedResponse(MessageType),
}

pub type Result<T> = std::result::Result<T, ClientError>;
