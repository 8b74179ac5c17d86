use thiserror::Error;

/// Framing-level failures. Always fatal to the connection.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("bad magic: 0x{0:08X}")]
    BadMagic(u32),

    #[error("payload length {len} exceeds cap {max}")]
    PayloadTooLarge { len: u32, max: u32 },

    #[error("truncated header: got {0} bytes, need 24")]
    TruncatedHeader(usize),

    #[error("JSON payload invalid: {0}")]
    Json(#[from] serde_json::Error),
}

/// Byte-stream level failures seen by the frame transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session-level failures surfaced to observers.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("heartbeat timed out")]
    HeartbeatTimeout,

    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// True for errors that end the session cleanly rather than abnormally.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Self::Closed | Self::Transport(TransportError::ConnectionClosed))
    }
}
