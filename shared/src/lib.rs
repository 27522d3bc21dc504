/*!
# Shared Protocol Definitions

This crate contains the protocol definitions shared by every tier of the
acquisition pipeline: the sensor-timing model, the embedded transport
controller and the host reassembly endpoint.

## Core Types

- [`RegisterFile`] / [`RegisterAccess`] - 256-entry device register map
- [`TierParams`] - immutable resolution / timing bundle
- [`Frame`] - one complete image acquisition
- [`LinkPacket`] / [`LinkDecoder`] - sensor-link codec
- [`NetworkPacket`] - network fragment codec
- [`ErrorCode`] / [`ErrorReport`] - error taxonomy

## Modules

- [`crc`] - CRC-16/CCITT
- [`registers`] - register addresses, flag words, access rules
- [`tier`] - configuration tiers and derived timing
- [`frame`] - frame data structure
- [`link`] - link packet encoding and streaming decode
- [`network`] - network packet encoding and validation
- [`event`] - error codes, severities, reports
- [`error`] - protocol error type
*/

pub mod crc;
pub mod error;
pub mod event;
pub mod frame;
pub mod link;
pub mod network;
pub mod registers;
pub mod tier;

// Re-export commonly used types
pub use crc::{crc16_ccitt, Crc16};
pub use error::{ProtocolError, Result};
pub use event::{ErrorCode, ErrorEvent, ErrorReport, Severity};
pub use frame::{Frame, PixelMismatch};
pub use link::{LinkDecoder, LinkPacket, LinkStats};
pub use network::{NetworkPacket, PacketFlags};
pub use registers::{RegisterAccess, RegisterFile, WriteOutcome};
pub use tier::{BitDepth, ScanMode, Tier, TierParams, TimingParams};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
