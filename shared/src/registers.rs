/*!
Register file of the acquisition device.

A fixed 256-entry array of 16-bit values. The host side reaches it only
through [`RegisterAccess`]; the device model uses the inherent methods on
[`RegisterFile`] to publish status and consume commands.
*/

use bitflags::bitflags;

use crate::event::ErrorCode;

/// Canonical register addresses
pub mod addr {
    pub const DEVICE_ID_0: u8 = 0x00;
    pub const DEVICE_ID_1: u8 = 0x01;
    pub const STATUS: u8 = 0x20;
    pub const CONTROL: u8 = 0x21;
    pub const SCAN_MODE: u8 = 0x22;
    pub const SCAN_COUNT: u8 = 0x23;
    pub const FRAME_COUNT_LO: u8 = 0x30;
    pub const FRAME_COUNT_HI: u8 = 0x31;
    pub const GATE_ON: u8 = 0x50;
    pub const GATE_OFF: u8 = 0x51;
    pub const LINK_SPEED_SEL: u8 = 0x60;
    pub const LINK_SPEED_ACTIVE: u8 = 0x61;
    pub const LINK_STATUS: u8 = 0x70;
    pub const ERROR_FLAGS: u8 = 0x80;
}

/// Fixed device identifier held in 0x00..=0x01
pub const DEVICE_ID: [u16; 2] = [0xD1A0, 0x0003];

/// Number of addressable registers
pub const REGISTER_COUNT: usize = 256;

bitflags! {
    /// Read-only status flags (0x20)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Status: u16 {
        const IDLE = 1 << 0;
        const SCANNING = 1 << 1;
        const ERROR = 1 << 2;
        const FRAME_READY = 1 << 3;
    }
}

bitflags! {
    /// Command strobes (0x21)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Control: u16 {
        const START = 1 << 0;
        const STOP = 1 << 1;
        const SOFT_RESET = 1 << 2;
    }
}

bitflags! {
    /// Link status (0x70)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LinkStatus: u16 {
        const PHY_READY = 1 << 0;
        const TX_ACTIVE = 1 << 1;
        const FIFO_OVERFLOW = 1 << 2;
    }
}

bitflags! {
    /// Sticky write-1-to-clear error flags (0x80)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ErrorFlags: u16 {
        const TIMEOUT = 1 << 0;
        const OVERFLOW = 1 << 1;
        const SENSOR_FAULT = 1 << 2;
        const LINK_INIT = 1 << 3;
        const WATCHDOG = 1 << 4;
        const CRC_MISMATCH = 1 << 5;
        const CONFIG_INVALID = 1 << 6;
        const LINK_BACKPRESSURE = 1 << 7;
    }
}

impl ErrorFlags {
    /// Flags that force the safe state
    pub const FATAL: ErrorFlags = ErrorFlags::TIMEOUT
        .union(ErrorFlags::OVERFLOW)
        .union(ErrorFlags::SENSOR_FAULT)
        .union(ErrorFlags::LINK_INIT)
        .union(ErrorFlags::WATCHDOG);

    pub fn has_fatal(self) -> bool {
        self.intersects(Self::FATAL)
    }
}

/// How the host may touch a defined address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
    /// Bits written as 1 latch until the device consumes them
    Strobe,
    WriteOneToClear,
}

/// Access class of an address, `None` when the address is undefined
pub fn access(address: u8) -> Option<Access> {
    use addr::*;
    match address {
        DEVICE_ID_0 | DEVICE_ID_1 | STATUS | FRAME_COUNT_LO | FRAME_COUNT_HI | LINK_SPEED_ACTIVE
        | LINK_STATUS => Some(Access::ReadOnly),
        SCAN_MODE | SCAN_COUNT | GATE_ON | GATE_OFF | LINK_SPEED_SEL => Some(Access::ReadWrite),
        CONTROL => Some(Access::Strobe),
        ERROR_FLAGS => Some(Access::WriteOneToClear),
        _ => None,
    }
}

/// Result of a host write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    /// Undefined or read-only address; never an error
    Ignored,
}

/// Host-facing register access, implemented by the simulated device and by
/// any alternate backing store
pub trait RegisterAccess {
    fn read(&mut self, address: u8) -> u16;
    fn write(&mut self, address: u8, value: u16) -> WriteOutcome;
}

/// The 256-entry register array
#[derive(Debug, Clone)]
pub struct RegisterFile {
    regs: [u16; REGISTER_COUNT],
}

impl RegisterFile {
    /// Power-on contents: identity set, status idle, everything else zero
    pub fn new() -> Self {
        let mut regs = [0u16; REGISTER_COUNT];
        regs[addr::DEVICE_ID_0 as usize] = DEVICE_ID[0];
        regs[addr::DEVICE_ID_1 as usize] = DEVICE_ID[1];
        regs[addr::STATUS as usize] = Status::IDLE.bits();
        Self { regs }
    }

    /// Raw read without host semantics
    pub fn peek(&self, address: u8) -> u16 {
        self.regs[address as usize]
    }

    /// Raw device-side store; bypasses the host access rules
    pub fn poke(&mut self, address: u8, value: u16) {
        self.regs[address as usize] = value;
    }

    pub fn status(&self) -> Status {
        Status::from_bits_truncate(self.peek(addr::STATUS))
    }

    pub fn set_status(&mut self, status: Status) {
        self.poke(addr::STATUS, status.bits());
    }

    /// Consume the latched command bits
    pub fn take_control(&mut self) -> Control {
        let control = Control::from_bits_truncate(self.peek(addr::CONTROL));
        self.poke(addr::CONTROL, 0);
        control
    }

    pub fn error_flags(&self) -> ErrorFlags {
        ErrorFlags::from_bits_truncate(self.peek(addr::ERROR_FLAGS))
    }

    /// Set a sticky error bit
    pub fn raise(&mut self, code: ErrorCode) {
        let flags = self.error_flags() | code.flag();
        self.poke(addr::ERROR_FLAGS, flags.bits());
    }

    pub fn frame_count(&self) -> u32 {
        (self.peek(addr::FRAME_COUNT_HI) as u32) << 16 | self.peek(addr::FRAME_COUNT_LO) as u32
    }

    pub fn set_frame_count(&mut self, count: u32) {
        self.poke(addr::FRAME_COUNT_LO, (count & 0xFFFF) as u16);
        self.poke(addr::FRAME_COUNT_HI, (count >> 16) as u16);
    }

    pub fn link_status(&self) -> LinkStatus {
        LinkStatus::from_bits_truncate(self.peek(addr::LINK_STATUS))
    }

    pub fn set_link_status(&mut self, status: LinkStatus) {
        self.poke(addr::LINK_STATUS, status.bits());
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterAccess for RegisterFile {
    fn read(&mut self, address: u8) -> u16 {
        match access(address) {
            Some(_) => self.peek(address),
            None => 0,
        }
    }

    fn write(&mut self, address: u8, value: u16) -> WriteOutcome {
        match access(address) {
            None | Some(Access::ReadOnly) => WriteOutcome::Ignored,
            Some(Access::ReadWrite) => {
                self.poke(address, value);
                WriteOutcome::Accepted
            }
            Some(Access::Strobe) => {
                let latched = self.peek(address) | (value & Control::all().bits());
                self.poke(address, latched);
                WriteOutcome::Accepted
            }
            Some(Access::WriteOneToClear) => {
                let remaining = self.peek(address) & !value;
                self.poke(address, remaining);
                WriteOutcome::Accepted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_on_identity() {
        let mut regs = RegisterFile::new();
        assert_eq!(regs.read(addr::DEVICE_ID_0), 0xD1A0);
        assert_eq!(regs.read(addr::DEVICE_ID_1), 0x0003);
        assert_eq!(regs.status(), Status::IDLE);
    }

    #[test]
    fn test_undefined_address_is_ignored() {
        let mut regs = RegisterFile::new();
        assert_eq!(regs.write(0x42, 0xBEEF), WriteOutcome::Ignored);
        assert_eq!(regs.read(0x42), 0);
        assert_eq!(regs.peek(0x42), 0);
    }

    #[test]
    fn test_read_only_registers_ignore_writes() {
        let mut regs = RegisterFile::new();
        assert_eq!(regs.write(addr::STATUS, Status::ERROR.bits()), WriteOutcome::Ignored);
        assert_eq!(regs.write(addr::DEVICE_ID_0, 0), WriteOutcome::Ignored);
        assert_eq!(regs.status(), Status::IDLE);
        assert_eq!(regs.read(addr::DEVICE_ID_0), DEVICE_ID[0]);
    }

    #[test]
    fn test_error_flags_write_one_to_clear() {
        let mut regs = RegisterFile::new();
        regs.raise(ErrorCode::Timeout);
        regs.raise(ErrorCode::CrcMismatch);
        regs.write(addr::ERROR_FLAGS, ErrorFlags::TIMEOUT.bits());
        assert_eq!(regs.error_flags(), ErrorFlags::CRC_MISMATCH);
        // writing zero bits leaves flags alone
        regs.write(addr::ERROR_FLAGS, 0);
        assert_eq!(regs.error_flags(), ErrorFlags::CRC_MISMATCH);
    }

    #[test]
    fn test_control_latches_until_taken() {
        let mut regs = RegisterFile::new();
        regs.write(addr::CONTROL, Control::START.bits());
        regs.write(addr::CONTROL, Control::SOFT_RESET.bits() | 0x8000);
        assert_eq!(regs.take_control(), Control::START | Control::SOFT_RESET);
        assert_eq!(regs.take_control(), Control::empty());
    }

    #[test]
    fn test_frame_count_halves() {
        let mut regs = RegisterFile::new();
        regs.set_frame_count(0x0001_0002);
        assert_eq!(regs.read(addr::FRAME_COUNT_LO), 0x0002);
        assert_eq!(regs.read(addr::FRAME_COUNT_HI), 0x0001);
        assert_eq!(regs.frame_count(), 0x0001_0002);
    }
}
