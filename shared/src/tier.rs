/*!
Configuration tiers and the timing values derived from them.

A tier is an immutable bundle of geometry, bit depth, frame rate and link
speed. The timing register values (gate on/off in 10 ns units) and the
simulation tick length are derived from it deterministically so that the
software model and hardware agree bit-for-bit.
*/

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Register time unit in nanoseconds
pub const TIMING_UNIT_NS: u64 = 10;

/// Settle time between gate off and readout, in register units (1 µs)
pub const GATE_OFF_UNITS: u16 = 100;

/// Gate-on time as a fraction of the frame period
pub const GATE_ON_DIVISOR: u64 = 128;

/// A row costs one Readout tick and one LineDone tick
pub const TICKS_PER_LINE: u64 = 2;

/// Largest supported row or column count
pub const MAX_DIMENSION: usize = 4096;

/// Link lane speeds in Mbit/s, indexed by their speed-select code
pub const LANE_SPEEDS_MBPS: [u32; 3] = [1250, 2500, 5000];

/// Named configuration tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Minimum,
    Intermediate,
    Final,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Minimum, Tier::Intermediate, Tier::Final];

    pub fn params(self) -> TierParams {
        match self {
            Tier::Minimum => TierParams {
                rows: 1024,
                cols: 1024,
                bit_depth: BitDepth::Fourteen,
                target_fps: 30,
                lane_speed_mbps: 1250,
            },
            Tier::Intermediate => TierParams {
                rows: 2048,
                cols: 2048,
                bit_depth: BitDepth::Sixteen,
                target_fps: 15,
                lane_speed_mbps: 2500,
            },
            Tier::Final => TierParams {
                rows: 4096,
                cols: 4096,
                bit_depth: BitDepth::Sixteen,
                target_fps: 15,
                lane_speed_mbps: 5000,
            },
        }
    }
}

impl FromStr for Tier {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "minimum" | "min" => Ok(Self::Minimum),
            "intermediate" | "mid" => Ok(Self::Intermediate),
            "final" => Ok(Self::Final),
            _ => Err(ProtocolError::config(format!("unknown tier '{}'", s))),
        }
    }
}

/// Supported pixel bit depths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BitDepth {
    Fourteen,
    Sixteen,
}

impl BitDepth {
    pub fn bits(self) -> u8 {
        match self {
            BitDepth::Fourteen => 14,
            BitDepth::Sixteen => 16,
        }
    }

    /// Largest representable pixel value
    pub fn max_value(self) -> u16 {
        match self {
            BitDepth::Fourteen => (1 << 14) - 1,
            BitDepth::Sixteen => u16::MAX,
        }
    }
}

impl TryFrom<u8> for BitDepth {
    type Error = ProtocolError;

    fn try_from(bits: u8) -> Result<Self> {
        match bits {
            14 => Ok(BitDepth::Fourteen),
            16 => Ok(BitDepth::Sixteen),
            other => Err(ProtocolError::config(format!("unsupported bit depth {}", other))),
        }
    }
}

impl From<BitDepth> for u8 {
    fn from(depth: BitDepth) -> u8 {
        depth.bits()
    }
}

/// Transition policy of the scan state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// One full cycle per trigger
    Single,
    /// Auto-retrigger after each frame
    Continuous,
    /// Single cycle with the gate output suppressed (dark frame)
    Calibration,
}

impl ScanMode {
    /// Value of the scan mode register (0x22)
    pub fn register_value(self) -> u16 {
        match self {
            ScanMode::Single => 0,
            ScanMode::Continuous => 1,
            ScanMode::Calibration => 2,
        }
    }

    pub fn from_register(value: u16) -> Option<Self> {
        match value {
            0 => Some(ScanMode::Single),
            1 => Some(ScanMode::Continuous),
            2 => Some(ScanMode::Calibration),
            _ => None,
        }
    }
}

impl FromStr for ScanMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "continuous" => Ok(Self::Continuous),
            "calibration" | "dark" => Ok(Self::Calibration),
            _ => Err(ProtocolError::config(format!("unknown scan mode '{}'", s))),
        }
    }
}

/// Immutable parameter bundle consumed by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TierParams {
    pub rows: usize,
    pub cols: usize,
    pub bit_depth: BitDepth,
    pub target_fps: u32,
    pub lane_speed_mbps: u32,
}

impl TierParams {
    /// Reject parameter sets the hardware cannot run
    pub fn validate(&self) -> Result<()> {
        if self.rows == 0 || self.rows > MAX_DIMENSION {
            return Err(ProtocolError::config(format!("rows {} outside 1..={}", self.rows, MAX_DIMENSION)));
        }
        if self.cols == 0 || self.cols > MAX_DIMENSION {
            return Err(ProtocolError::config(format!("cols {} outside 1..={}", self.cols, MAX_DIMENSION)));
        }
        if self.target_fps == 0 || self.target_fps > 1000 {
            return Err(ProtocolError::config(format!("target fps {} outside 1..=1000", self.target_fps)));
        }
        if self.speed_code().is_none() {
            return Err(ProtocolError::config(format!(
                "lane speed {} Mbit/s is not one of {:?}",
                self.lane_speed_mbps, LANE_SPEEDS_MBPS
            )));
        }

        let timing = self.timing();
        let busy_ns = timing.gate_total_ns() + self.rows as u64 * timing.line_period_ns;
        if busy_ns > timing.frame_period_ns {
            return Err(ProtocolError::config(format!(
                "integration plus readout ({} ns) exceeds the frame period ({} ns)",
                busy_ns, timing.frame_period_ns
            )));
        }
        Ok(())
    }

    /// Link speed-select code (register 0x60)
    pub fn speed_code(&self) -> Option<u16> {
        LANE_SPEEDS_MBPS
            .iter()
            .position(|&speed| speed == self.lane_speed_mbps)
            .map(|code| code as u16)
    }

    pub fn num_pixels(&self) -> usize {
        self.rows * self.cols
    }

    /// Bytes per row on the wire; pixels are always shipped as 16-bit words
    pub fn row_bytes(&self) -> usize {
        self.cols * 2
    }

    pub fn frame_bytes(&self) -> usize {
        self.rows * self.row_bytes()
    }

    pub fn timing(&self) -> TimingParams {
        let frame_period_ns = 1_000_000_000 / self.target_fps.max(1) as u64;
        let row_bits = self.cols as u64 * 16;
        let line_period_ns = (row_bits * 1000).div_ceil(self.lane_speed_mbps.max(1) as u64);
        let gate_on_units = (frame_period_ns / GATE_ON_DIVISOR / TIMING_UNIT_NS).min(u16::MAX as u64) as u16;
        let tick_ns = line_period_ns.div_ceil(TICKS_PER_LINE).max(1);

        TimingParams {
            frame_period_ns,
            line_period_ns,
            gate_on_units,
            gate_off_units: GATE_OFF_UNITS,
            tick_ns,
        }
    }
}

/// Timing values derived from a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimingParams {
    pub frame_period_ns: u64,
    /// Time to ship one row over the link
    pub line_period_ns: u64,
    /// Register 0x50, 10 ns units
    pub gate_on_units: u16,
    /// Register 0x51, 10 ns units
    pub gate_off_units: u16,
    /// Length of one simulation tick
    pub tick_ns: u64,
}

impl TimingParams {
    pub fn gate_total_ns(&self) -> u64 {
        (self.gate_on_units as u64 + self.gate_off_units as u64) * TIMING_UNIT_NS
    }

    /// Readout of a single row may not take longer than this
    pub fn readout_timeout_ns(&self) -> u64 {
        2 * self.line_period_ns
    }

    /// Whole ticks needed to cover `ns`, never zero
    pub fn ticks_for(&self, ns: u64) -> u64 {
        ns.div_ceil(self.tick_ns).max(1)
    }
}
