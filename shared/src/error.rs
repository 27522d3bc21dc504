/*!
Common error types for the protocol layer shared by all pipeline tiers.
*/

use thiserror::Error;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Comprehensive error type for all shared operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer ended before a complete structure could be read
    #[error("Truncated data: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    /// Network packet did not start with the expected magic constant
    #[error("Bad magic: 0x{0:08X}")]
    BadMagic(u32),

    /// CRC check failed
    #[error("CRC mismatch: expected 0x{expected:04X}, computed 0x{computed:04X}")]
    CrcMismatch { expected: u16, computed: u16 },

    /// Payload exceeds the configured maximum
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// Invalid frame data
    #[error("Invalid frame data: {0}")]
    InvalidFrame(String),

    /// Invalid tier or timing parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// Packet structure is inconsistent (flags, lengths)
    #[error("Malformed packet: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Create a new invalid frame error
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new malformed packet error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}
