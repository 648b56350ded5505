mod message;
mod codec;
mod connection;
mod retry;

pub use message::{Message, MessageType};
pub use codec::{Frame, FrameCodec, FrameHeader, HEADER_LEN};
pub use connection::{Connection, ConnectionError, Transport};
pub use retry::RetryPolicy;

use dtq_core::TaskError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message type: {0}")]
    InvalidMessageType(i32),

    #[error("Negative payload length: {0}")]
    NegativeLength(i32),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Unexpected message: expected {expected:?}, got {actual:?}")]
    UnexpectedMessage {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("Malformed task payload: {0}")]
    MalformedTask(#[from] TaskError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// An unknown tag leaves the byte stream aligned on the next frame;
    /// every other protocol error does not.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::InvalidMessageType(_))
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Largest payload a frame may declare (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
