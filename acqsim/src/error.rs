/*!
Error type for the simulation crate.
*/

use shared::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Error, Debug)]
pub enum SimError {
    /// Codec or parameter validation failure from the shared layer
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Configuration rejected by the pipeline
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pipeline channel was closed by its peer
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Worker thread panicked: {0}")]
    ThreadPanicked(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SimError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_passes_through() {
        let err: SimError = ProtocolError::config("rows 0 outside 1..=4096").into();
        assert_eq!(err.to_string(), "Configuration error: rows 0 outside 1..=4096");
        assert!(matches!(err, SimError::Protocol(_)));
    }
}
