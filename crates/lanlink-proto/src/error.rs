use thiserror::Error;

/// Errors raised while framing or parsing protocol messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("wrong magic {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("frame size {size} out of range [{min}, {max}]")]
    SizeOutOfRange { size: usize, min: usize, max: usize },

    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown control action {0:?}")]
    UnknownAction(String),

    #[error("unknown control operator {0:?}")]
    BadOperator(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}
