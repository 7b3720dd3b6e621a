use std::io;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the server.
///
/// `Io` and `Codec` on the control connection are fatal to the owning
/// control session; handshake errors are fatal to the connection being
/// handshaken; everything else says which scope it kills in its message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame of {got} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { got: usize, limit: usize },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
