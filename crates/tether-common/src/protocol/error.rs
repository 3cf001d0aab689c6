use thiserror::Error;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Connection closed by peer")]
    PeerClosed,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Handle {0} not found")]
    HandleNotFound(u32),

    #[error("Execution coordinator has stopped")]
    CoordinatorStopped,

    #[error("Blocking call issued from the coordinator thread")]
    Reentrant,

    #[error("Script error: {0}")]
    Script(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

impl TetherError {
    /// Returns `true` if this error came from an expired read or write deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TetherError::Timeout(_))
    }

    /// Returns `true` for errors that only end the affected connection.
    ///
    /// Transient I/O failures and framing violations are both treated as
    /// connection-level: they close the session and are never surfaced to
    /// the script.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            TetherError::Io(_)
                | TetherError::Timeout(_)
                | TetherError::PeerClosed
                | TetherError::Connection(_)
                | TetherError::Framing(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;
