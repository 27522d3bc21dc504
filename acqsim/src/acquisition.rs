/*!
Acquisition engine: the sensor-timing model.

Owns the register file, the scan state machine, the double-buffered line
store and the link packetizer. The engine advances one tick at a time; a
tick is half a line period, so a row costs one Readout tick plus one
LineDone tick and the packetizer drains one bank in the same two ticks.

The host side reaches the engine only through [`RegisterAccess`]. Command
bits written to CONTROL latch and are consumed on the next tick.
*/

use std::collections::VecDeque;

use bytes::Bytes;
use crossbeam_channel::{Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use shared::crc::crc16_ccitt;
use shared::link::{CRC_LEN, LINE_HEADER_LEN};
use shared::registers::{addr, Control, LinkStatus, Status, WriteOutcome};
use shared::tier::{LANE_SPEEDS_MBPS, TICKS_PER_LINE, TIMING_UNIT_NS};
use shared::{ErrorCode, ErrorEvent, Frame, LinkPacket, RegisterAccess, RegisterFile, ScanMode, TierParams, TimingParams};

use crate::error::{Result, SimError};
use crate::fault::{FaultInjector, FaultSpec};
use crate::line_store::LineStore;
use crate::scan_fsm::{ScanEvent, ScanState};
use crate::source::PixelSource;

/// Silence window after which the engine forces the safe state
pub const DEFAULT_WATCHDOG_NS: u64 = 100_000_000;

/// Ticks the link needs to train after a speed select
pub const DEFAULT_LINK_TRAIN_TICKS: u64 = 4;

const ERROR_LOG_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub watchdog_ns: u64,
    pub link_train_ticks: u64,
    /// Re-verify every emitted line packet's CRC
    pub self_check: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            watchdog_ns: DEFAULT_WATCHDOG_NS,
            link_train_ticks: DEFAULT_LINK_TRAIN_TICKS,
            self_check: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub frames_started: u64,
    pub frames_completed: u64,
    pub lines_emitted: u64,
    pub self_check_failures: u64,
    pub gate_ticks: u64,
    pub fatal_errors: u64,
    pub clears_rejected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phy {
    Down,
    Training { remaining: u64, code: u16 },
    Up { code: u16 },
}

#[derive(Debug)]
struct ActiveFrame {
    number: u32,
    pixels: Vec<u16>,
    integrate_ticks: u64,
    stalled_row: Option<usize>,
}

#[derive(Debug)]
enum Work {
    Marker(LinkPacket),
    Bank { extra_ticks: u64, bit_error: bool },
}

#[derive(Debug)]
struct Draining {
    bank: usize,
    remaining: u64,
    bit_error: bool,
}

/// Moves completed banks and frame markers onto the link in order
#[derive(Debug, Default)]
struct Packetizer {
    queue: VecDeque<Work>,
    current: Option<Draining>,
}

impl Packetizer {
    fn busy(&self) -> bool {
        self.current.is_some() || !self.queue.is_empty()
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.current = None;
    }
}

pub struct AcquisitionEngine {
    params: TierParams,
    timing: TimingParams,
    options: EngineOptions,
    regs: RegisterFile,
    state: ScanState,
    store: LineStore,
    packetizer: Packetizer,
    source: Box<dyn PixelSource>,
    faults: FaultInjector,
    link_tx: Sender<Bytes>,
    frame: Option<ActiveFrame>,
    mode: ScanMode,
    budget: Option<u32>,
    pending_start: bool,
    gate_enabled: bool,
    frame_ready: bool,
    fifo_overflow: bool,
    phy: Phy,
    ticks: u64,
    last_poll_tick: u64,
    error_log: VecDeque<ErrorEvent>,
    stats: EngineStats,
}

impl AcquisitionEngine {
    pub fn new(
        params: TierParams,
        options: EngineOptions,
        source: Box<dyn PixelSource>,
        link_tx: Sender<Bytes>,
    ) -> Result<Self> {
        params.validate()?;
        let timing = params.timing();
        info!(
            "Acquisition engine: {}x{} @ {} bit, line period {} ns, tick {} ns",
            params.rows,
            params.cols,
            params.bit_depth.bits(),
            timing.line_period_ns,
            timing.tick_ns
        );

        Ok(Self {
            params,
            timing,
            options,
            regs: RegisterFile::new(),
            state: ScanState::Idle,
            store: LineStore::new(params.cols),
            packetizer: Packetizer::default(),
            source,
            faults: FaultInjector::new(),
            link_tx,
            frame: None,
            mode: ScanMode::Single,
            budget: None,
            pending_start: false,
            gate_enabled: false,
            frame_ready: false,
            fifo_overflow: false,
            phy: Phy::Down,
            ticks: 0,
            last_poll_tick: 0,
            error_log: VecDeque::with_capacity(ERROR_LOG_DEPTH),
            stats: EngineStats::default(),
        })
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn params(&self) -> &TierParams {
        &self.params
    }

    pub fn timing(&self) -> &TimingParams {
        &self.timing
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn line_store(&self) -> &LineStore {
        &self.store
    }

    pub fn gate_enabled(&self) -> bool {
        self.gate_enabled
    }

    pub fn link_busy(&self) -> bool {
        self.packetizer.busy()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn error_log(&self) -> impl Iterator<Item = &ErrorEvent> {
        self.error_log.iter()
    }

    pub fn inject_fault(&mut self, spec: FaultSpec) {
        self.faults.inject(spec);
    }

    /// Swap in a new tier; only allowed between frames
    pub fn reconfigure(&mut self, params: TierParams) -> Result<()> {
        if self.state != ScanState::Idle || self.pending_start || self.packetizer.busy() {
            return Err(SimError::config(format!(
                "tier change refused while {} (stop the scan first)",
                self.state.name()
            )));
        }
        params.validate()?;

        self.params = params;
        self.timing = params.timing();
        self.store = LineStore::new(params.cols);
        info!("Acquisition engine reconfigured to {}x{}", params.rows, params.cols);
        Ok(())
    }

    /// Power-on reset; the only way the frame counter goes back to zero
    pub fn restart(&mut self) {
        self.regs = RegisterFile::new();
        self.state = ScanState::Idle;
        self.store.reset();
        self.packetizer.clear();
        self.frame = None;
        self.budget = None;
        self.pending_start = false;
        self.gate_enabled = false;
        self.frame_ready = false;
        self.fifo_overflow = false;
        self.phy = Phy::Down;
        self.last_poll_tick = self.ticks;
        info!("Acquisition engine restarted");
    }

    /// Advance the model by one tick
    pub fn tick(&mut self) {
        self.ticks += 1;
        self.apply_control();
        self.advance_phy();
        self.check_watchdog();
        self.step_fsm();
        self.step_packetizer();
        if self.gate_enabled {
            self.stats.gate_ticks += 1;
        }
        self.publish_status();
    }

    fn transition(&mut self, event: ScanEvent) -> bool {
        match self.state.on(event) {
            Some(next) => {
                debug!("scan {} -> {} on {:?}", self.state.name(), next.name(), event);
                self.state = next;
                true
            }
            None => {
                debug!("scan ignored {:?} in {}", event, self.state.name());
                false
            }
        }
    }

    fn apply_control(&mut self) {
        let control = self.regs.take_control();
        if control.is_empty() {
            return;
        }

        if control.contains(Control::STOP) {
            self.stop_scan();
        }

        if control.contains(Control::SOFT_RESET) {
            self.soft_reset();
        }

        if control.contains(Control::START) {
            if self.state == ScanState::Idle {
                self.mode = ScanMode::from_register(self.regs.peek(addr::SCAN_MODE)).unwrap_or(ScanMode::Single);
                self.budget = match self.mode {
                    ScanMode::Continuous => match self.regs.peek(addr::SCAN_COUNT) {
                        0 => None,
                        n => Some(n as u32),
                    },
                    _ => Some(1),
                };
                self.pending_start = true;
            } else {
                debug!("start ignored in {}", self.state.name());
            }
        }
    }

    fn stop_scan(&mut self) {
        self.pending_start = false;
        self.budget = None;
        if self.transition(ScanEvent::Stop) {
            info!("Scan stopped by host");
            self.halt_link();
        }
    }

    fn soft_reset(&mut self) {
        match self.state {
            ScanState::Error(code) => {
                if self.regs.error_flags().has_fatal() {
                    self.stats.clears_rejected += 1;
                    warn!("Clear rejected: fatal flags still set ({:?})", self.regs.error_flags());
                    return;
                }
                self.transition(ScanEvent::ClearAccepted);
                self.fifo_overflow = false;
                if self.phy == Phy::Down {
                    self.start_training(self.regs.peek(addr::LINK_SPEED_SEL));
                }
                info!("Clear accepted after {}", code);
            }
            _ => {
                self.fifo_overflow = false;
            }
        }
    }

    fn start_training(&mut self, code: u16) {
        if (code as usize) < LANE_SPEEDS_MBPS.len() {
            self.phy = Phy::Training {
                remaining: self.options.link_train_ticks,
                code,
            };
        } else {
            warn!("Invalid link speed code {}", code);
            self.phy = Phy::Down;
        }
    }

    fn advance_phy(&mut self) {
        if let Phy::Training { remaining, code } = self.phy {
            if remaining <= 1 {
                self.phy = Phy::Up { code };
                self.regs.poke(addr::LINK_SPEED_ACTIVE, code);
                debug!("link trained at code {}", code);
            } else {
                self.phy = Phy::Training {
                    remaining: remaining - 1,
                    code,
                };
            }
        }
    }

    fn check_watchdog(&mut self) {
        if !self.state.is_scanning() {
            return;
        }
        let silent_ns = (self.ticks - self.last_poll_tick) * self.timing.tick_ns;
        if silent_ns > self.options.watchdog_ns {
            warn!("Watchdog expired after {} ns without a register poll", silent_ns);
            self.fault(ErrorCode::Watchdog);
        }
    }

    fn current_frame_number(&self) -> u32 {
        self.frame
            .as_ref()
            .map(|f| f.number)
            .unwrap_or_else(|| self.regs.frame_count())
    }

    /// Raise an error flag; fatal codes force the safe state
    fn fault(&mut self, code: ErrorCode) {
        let event = ErrorEvent::new(code, self.current_frame_number());
        self.regs.raise(code);
        if self.error_log.len() == ERROR_LOG_DEPTH {
            self.error_log.pop_front();
        }
        self.error_log.push_back(event);

        if !code.is_fatal() {
            debug!("warning raised: {}", code);
            return;
        }

        self.stats.fatal_errors += 1;
        error!("Fatal {} at frame {} in {}", code, event.frame_number, self.state.name());
        if code == ErrorCode::Overflow {
            self.fifo_overflow = true;
        }
        if code == ErrorCode::LinkInit {
            self.phy = Phy::Down;
        }
        self.pending_start = false;
        self.transition(ScanEvent::Fault(code));
        self.halt_link();
    }

    /// Gate off, in-flight rows dropped, banks released
    fn halt_link(&mut self) {
        self.gate_enabled = false;
        self.packetizer.clear();
        self.store.reset();
        self.frame = None;
    }

    fn step_fsm(&mut self) {
        match self.state {
            ScanState::Idle => {
                if self.pending_start {
                    self.pending_start = false;
                    self.begin_frame();
                }
            }
            ScanState::Integrate { elapsed_ticks } => {
                let needed = self.frame.as_ref().map(|f| f.integrate_ticks).unwrap_or(1);
                let elapsed_ticks = elapsed_ticks + 1;
                if elapsed_ticks >= needed {
                    self.gate_enabled = false;
                    self.transition(ScanEvent::GateElapsed);
                } else {
                    self.state = ScanState::Integrate { elapsed_ticks };
                }
            }
            ScanState::Readout { row, waited_ticks } => self.read_row(row, waited_ticks),
            ScanState::LineDone { row } => {
                let number = self.current_frame_number();
                self.store.swap();
                let extra_ticks = self.faults.link_stall(number, row).unwrap_or(0);
                let bit_error = self.faults.bit_error(number, row);
                self.packetizer.queue.push_back(Work::Bank { extra_ticks, bit_error });

                if row + 1 < self.params.rows {
                    self.transition(ScanEvent::NextRow);
                } else {
                    self.packetizer
                        .queue
                        .push_back(Work::Marker(LinkPacket::FrameEnd { frame_number: number }));
                    self.transition(ScanEvent::LastRow);
                }
            }
            ScanState::FrameDone => {
                self.stats.frames_completed += 1;
                self.frame_ready = true;
                self.frame = None;
                self.transition(ScanEvent::Rearm);
                if self.mode == ScanMode::Continuous && self.budget != Some(0) {
                    self.pending_start = true;
                }
            }
            ScanState::Error(_) => {}
        }
    }

    fn begin_frame(&mut self) {
        let gate_on = self.regs.peek(addr::GATE_ON);
        let gate_off = self.regs.peek(addr::GATE_OFF);
        if gate_on == 0 {
            warn!("Start refused: gate-on register is zero");
            self.fault(ErrorCode::ConfigInvalid);
            return;
        }

        let number = self.regs.frame_count();
        if !matches!(self.phy, Phy::Up { .. }) || self.faults.link_init(number) {
            self.fault(ErrorCode::LinkInit);
            return;
        }

        let mut pixels = self.source.acquire(number, &self.params);
        if self.faults.sensor_fault(number) {
            pixels.truncate(pixels.len() / 2);
        }
        let mut pixels = match Frame::new(number, self.params.rows, self.params.cols, self.params.bit_depth, pixels) {
            Ok(frame) => frame.into_pixels(),
            Err(e) => {
                error!("Sensor output rejected: {}", e);
                self.fault(ErrorCode::SensorFault);
                return;
            }
        };
        if self.mode == ScanMode::Calibration {
            // no exposure: the dark frame carries no signal
            pixels.iter_mut().for_each(|p| *p = 0);
        }

        let gate_ns = (gate_on as u64 + gate_off as u64) * TIMING_UNIT_NS;
        self.frame = Some(ActiveFrame {
            number,
            pixels,
            integrate_ticks: self.timing.ticks_for(gate_ns),
            stalled_row: None,
        });
        self.regs.set_frame_count(number.wrapping_add(1));
        if let Some(budget) = self.budget.as_mut() {
            *budget = budget.saturating_sub(1);
        }
        self.frame_ready = false;
        self.gate_enabled = self.mode != ScanMode::Calibration;
        self.stats.frames_started += 1;
        self.packetizer
            .queue
            .push_back(Work::Marker(LinkPacket::FrameStart { frame_number: number }));
        self.transition(ScanEvent::Start);
        debug!("frame {} started ({:?})", number, self.mode);
    }

    fn read_row(&mut self, row: usize, waited_ticks: u64) {
        let Some(frame) = self.frame.as_mut() else {
            return;
        };

        if waited_ticks == 0 && frame.stalled_row.is_none() && self.faults.sensor_stall(frame.number, row) {
            frame.stalled_row = Some(row);
        }
        if frame.stalled_row == Some(row) {
            let waited_ticks = waited_ticks + 1;
            if waited_ticks * self.timing.tick_ns > self.timing.readout_timeout_ns() {
                self.fault(ErrorCode::Timeout);
            } else {
                self.state = ScanState::Readout { row, waited_ticks };
            }
            return;
        }

        let start = row * self.params.cols;
        let end = start + self.params.cols;
        match self.store.write_row(row as u16, &frame.pixels[start..end]) {
            Ok(_) => {
                self.transition(ScanEvent::RowCaptured);
            }
            Err(collision) => {
                error!(
                    "Line store collision on bank {} ({:?}) at row {}",
                    collision.bank, collision.state, row
                );
                self.fault(ErrorCode::Overflow);
            }
        }
    }

    fn step_packetizer(&mut self) {
        loop {
            if let Some(draining) = self.packetizer.current.as_mut() {
                if draining.remaining > 1 {
                    draining.remaining -= 1;
                    return;
                }
                let bank = draining.bank;
                let bit_error = draining.bit_error;
                draining.remaining = 1;

                let Some((row, pixels)) = self.store.bank(bank) else {
                    self.packetizer.current = None;
                    continue;
                };
                let mut bytes = LinkPacket::line(row, pixels).encode();
                if bit_error {
                    let mut raw = bytes.to_vec();
                    raw[LINE_HEADER_LEN] ^= 0x01;
                    bytes = Bytes::from(raw);
                }
                if self.options.self_check && !self_check(&bytes) {
                    self.stats.self_check_failures += 1;
                    warn!("Link self-check: CRC mismatch on row {}", row);
                    self.fault(ErrorCode::CrcMismatch);
                }
                if !self.send(bytes) {
                    return;
                }
                self.store.release(bank);
                self.packetizer.current = None;
                self.stats.lines_emitted += 1;
                return;
            }

            match self.packetizer.queue.front() {
                None => return,
                Some(Work::Marker(marker)) => {
                    let bytes = marker.encode();
                    if !self.send(bytes) {
                        return;
                    }
                    self.packetizer.queue.pop_front();
                }
                Some(Work::Bank { .. }) => {
                    let Some(bank) = self.store.take_ready() else {
                        return;
                    };
                    let Some(Work::Bank { extra_ticks, bit_error }) = self.packetizer.queue.pop_front() else {
                        return;
                    };
                    self.packetizer.current = Some(Draining {
                        bank,
                        remaining: TICKS_PER_LINE + extra_ticks,
                        bit_error,
                    });
                }
            }
        }
    }

    /// Push bytes onto the link; `false` when the link is backed up
    fn send(&mut self, bytes: Bytes) -> bool {
        match self.link_tx.try_send(bytes) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.regs.error_flags().contains(ErrorCode::LinkBackpressure.flag()) {
                    self.fault(ErrorCode::LinkBackpressure);
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                // nobody listening; behave like a terminated link
                true
            }
        }
    }

    fn publish_status(&mut self) {
        let mut status = match self.state {
            ScanState::Idle => Status::IDLE,
            ScanState::Error(_) => Status::ERROR,
            _ => Status::SCANNING,
        };
        if self.pending_start {
            status = Status::SCANNING;
        }
        status.set(Status::FRAME_READY, self.frame_ready);
        self.regs.set_status(status);

        let mut link = LinkStatus::empty();
        link.set(LinkStatus::PHY_READY, matches!(self.phy, Phy::Up { .. }));
        link.set(LinkStatus::TX_ACTIVE, self.packetizer.busy());
        link.set(LinkStatus::FIFO_OVERFLOW, self.fifo_overflow);
        self.regs.set_link_status(link);
    }
}

/// Recompute the CRC of an encoded line packet as it leaves the engine
fn self_check(bytes: &[u8]) -> bool {
    if bytes.len() < LINE_HEADER_LEN + CRC_LEN {
        return false;
    }
    let payload = &bytes[LINE_HEADER_LEN..bytes.len() - CRC_LEN];
    let trailer = u16::from_le_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);
    crc16_ccitt(payload) == trailer
}

impl RegisterAccess for AcquisitionEngine {
    fn read(&mut self, address: u8) -> u16 {
        if shared::registers::access(address).is_some() {
            self.last_poll_tick = self.ticks;
        }
        self.regs.read(address)
    }

    fn write(&mut self, address: u8, value: u16) -> WriteOutcome {
        let outcome = self.regs.write(address, value);
        if address == addr::LINK_SPEED_SEL && outcome == WriteOutcome::Accepted {
            self.start_training(value);
        }
        outcome
    }
}
