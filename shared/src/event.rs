/*!
Error taxonomy shared by the acquisition engine and the transport controller.

The eight error codes map one-to-one onto the sticky bits of the error flag
register (0x80).
*/

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::registers::ErrorFlags;

/// How an error must be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    /// Forces the safe state; needs an explicit clear
    FatalRequiresReset,
}

/// One of the eight defined error flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ErrorCode {
    Timeout = 0,
    Overflow = 1,
    SensorFault = 2,
    LinkInit = 3,
    Watchdog = 4,
    CrcMismatch = 5,
    ConfigInvalid = 6,
    LinkBackpressure = 7,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 8] = [
        Self::Timeout,
        Self::Overflow,
        Self::SensorFault,
        Self::LinkInit,
        Self::Watchdog,
        Self::CrcMismatch,
        Self::ConfigInvalid,
        Self::LinkBackpressure,
    ];

    /// Bit position in the error flag register
    pub fn bit(self) -> u8 {
        self as u8
    }

    pub fn flag(self) -> ErrorFlags {
        ErrorFlags::from_bits_truncate(1 << self.bit())
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::Timeout | Self::Overflow | Self::SensorFault | Self::LinkInit | Self::Watchdog => {
                Severity::FatalRequiresReset
            }
            Self::ConfigInvalid => Severity::Error,
            Self::CrcMismatch | Self::LinkBackpressure => Severity::Warning,
        }
    }

    pub fn is_fatal(self) -> bool {
        self.severity() == Severity::FatalRequiresReset
    }

    /// Codes set in a flag word, lowest bit first
    pub fn from_flags(flags: ErrorFlags) -> impl Iterator<Item = ErrorCode> {
        Self::ALL.into_iter().filter(move |code| flags.contains(code.flag()))
    }

    /// The highest-priority (lowest bit) fatal code in a flag word
    pub fn first_fatal(flags: ErrorFlags) -> Option<ErrorCode> {
        Self::from_flags(flags).find(|code| code.is_fatal())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Overflow => "overflow",
            Self::SensorFault => "sensor_fault",
            Self::LinkInit => "link_init",
            Self::Watchdog => "watchdog",
            Self::CrcMismatch => "crc_mismatch",
            Self::ConfigInvalid => "config_invalid",
            Self::LinkBackpressure => "link_backpressure",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised by the acquisition engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub code: ErrorCode,
    pub severity: Severity,
    pub frame_number: u32,
}

impl ErrorEvent {
    pub fn new(code: ErrorCode, frame_number: u32) -> Self {
        Self {
            code,
            severity: code.severity(),
            frame_number,
        }
    }
}

/// Structured report surfaced to the caller once local retries are exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub severity: Severity,
    pub frame_number: u32,
    pub retries_attempted: u8,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}) at frame {} after {} retries",
            self.code, self.severity, self.frame_number, self.retries_attempted
        )
    }
}
