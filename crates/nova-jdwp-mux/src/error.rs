use std::sync::Arc;

use thiserror::Error;

pub type Result<T, E = JdwpError> = std::result::Result<T, E>;

/// Errors produced by the JDWP sessions and the helpers built on top of them.
///
/// The type is `Clone` because a single terminal cause is reported to every
/// receiver of a shared session.
#[derive(Debug, Clone, Error)]
pub enum JdwpError {
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JDWP handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("timed out waiting for JDWP reply")]
    Timeout,

    #[error("JDWP connection reached end of stream")]
    EndOfStream,

    #[error("JDWP session is closed")]
    Closed,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no matching packet was received before end of stream")]
    NoSuchPacket,

    #[error("replay buffer is full (capacity {capacity})")]
    ReplayBufferFull { capacity: usize },

    #[error("DDMS command failed with code {code}: {message}")]
    DdmsFail { code: u32, message: String },

    #[error("DDMS protocol error: {0}")]
    DdmsCommand(String),
}

impl From<std::io::Error> for JdwpError {
    fn from(err: std::io::Error) -> Self {
        JdwpError::Io(Arc::new(err))
    }
}
