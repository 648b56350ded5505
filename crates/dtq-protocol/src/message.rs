use crate::{Frame, ProtocolError, Result};
use bytes::Bytes;
use dtq_core::Task;

/// Message type tags carried in the first four bytes of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    ClientAddTask = 1,
    WorkerRequestTask = 2,
    WorkerSubmitResult = 3,
    ServerAssignTask = 4,
    ServerTaskAccepted = 5,
    ServerTaskRejected = 6,
    WorkerTaskReceived = 7,
    ServerResultConfirmed = 8,
    /// Reserved, never sent intentionally
    Invalid = 99,
}

impl MessageType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(MessageType::ClientAddTask),
            2 => Some(MessageType::WorkerRequestTask),
            3 => Some(MessageType::WorkerSubmitResult),
            4 => Some(MessageType::ServerAssignTask),
            5 => Some(MessageType::ServerTaskAccepted),
            6 => Some(MessageType::ServerTaskRejected),
            7 => Some(MessageType::WorkerTaskReceived),
            8 => Some(MessageType::ServerResultConfirmed),
            99 => Some(MessageType::Invalid),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Producer submits a new task
    AddTask(Task),

    /// Worker asks for the next task
    RequestTask,

    /// Worker reports a finished task
    SubmitResult(Task),

    /// Broker hands out a task, `None` when the queue is empty
    AssignTask(Option<Task>),

    /// Task was enqueued
    TaskAccepted,

    /// Task was not enqueued, with a reason
    TaskRejected(String),

    /// Worker acknowledges receipt of an assigned task
    TaskReceived,

    /// Broker recorded a submitted result
    ResultConfirmed,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::AddTask(_) => MessageType::ClientAddTask,
            Message::RequestTask => MessageType::WorkerRequestTask,
            Message::SubmitResult(_) => MessageType::WorkerSubmitResult,
            Message::AssignTask(_) => MessageType::ServerAssignTask,
            Message::TaskAccepted => MessageType::ServerTaskAccepted,
            Message::TaskRejected(_) => MessageType::ServerTaskRejected,
            Message::TaskReceived => MessageType::WorkerTaskReceived,
            Message::ResultConfirmed => MessageType::ServerResultConfirmed,
        }
    }

    /// Build the wire frame for this message
    pub fn to_frame(&self) -> Frame {
        let payload = match self {
            Message::AddTask(task) | Message::SubmitResult(task) => Bytes::from(task.to_bytes()),
            Message::AssignTask(Some(task)) => Bytes::from(task.to_bytes()),
            Message::TaskRejected(reason) => Bytes::copy_from_slice(reason.as_bytes()),
            Message::AssignTask(None)
            | Message::RequestTask
            | Message::TaskAccepted
            | Message::TaskReceived
            | Message::ResultConfirmed => Bytes::new(),
        };

        Frame::new(self.message_type().as_i32(), payload)
    }

    /// Interpret a frame. Payloads of data-less messages are ignored.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let message_type = MessageType::from_i32(frame.message_type)
            .ok_or(ProtocolError::InvalidMessageType(frame.message_type))?;

        let message = match message_type {
            MessageType::ClientAddTask => Message::AddTask(Task::from_bytes(&frame.payload)?),
            MessageType::WorkerRequestTask => Message::RequestTask,
            MessageType::WorkerSubmitResult => {
                Message::SubmitResult(Task::from_bytes(&frame.payload)?)
            }
            MessageType::ServerAssignTask => {
                if frame.payload.is_empty() {
                    Message::AssignTask(None)
                } else {
                    Message::AssignTask(Some(Task::from_bytes(&frame.payload)?))
                }
            }
            MessageType::ServerTaskAccepted => Message::TaskAccepted,
            MessageType::ServerTaskRejected => {
                Message::TaskRejected(String::from_utf8_lossy(&frame.payload).into_owned())
            }
            MessageType::WorkerTaskReceived => Message::TaskReceived,
            MessageType::ServerResultConfirmed => Message::ResultConfirmed,
            MessageType::Invalid => {
                return Err(ProtocolError::InvalidMessageType(frame.message_type))
            }
        };

        Ok(message)
    }
}

impl From<&Message> for Frame {
    fn from(message: &Message) -> Self {
        message.to_frame()
    }
}
