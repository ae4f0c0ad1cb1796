use thiserror::Error;

/// Errors produced by the mux session layer.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet size too large: {0}")]
    PacketTooLarge(usize),

    #[error("chunk does not fit a u16 length header: {0}")]
    ChunkTooLarge(usize),

    #[error("session closed: {0}")]
    SessionClosed(u16),

    #[error("session not registered: {0}")]
    NotRegistered(u16),

    #[error("session manager closed")]
    ManagerClosed,

    #[error("pipe closed")]
    PipeClosed,

    #[error("{0}")]
    Other(String),
}

pub type MuxResult<T> = Result<T, MuxError>;
