use rq_common::MessageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("duplicate queue: {0}")]
    DuplicateQueue(String),

    #[error("failed to acknowledge message: {0}")]
    Acknowledge(String),
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        QueueError::Transport(e.to_string())
    }
}
