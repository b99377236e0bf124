//! Control client error types.

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Registration rejected: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Worker agent stopped")]
    AgentGone,
}
