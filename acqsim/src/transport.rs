/*!
Transport controller: link receiver, network fragmenter and the
polling/recovery state machine.

`Idle -> Configure -> Arm -> Scanning -> Streaming -> Complete`, with
`Error` entered whenever a poll observes a fatal flag. The controller talks
to the device only through [`RegisterAccess`] and polls STATUS and
ERROR_FLAGS once per tick, which also keeps the device watchdog fed.

Recovery is clear-and-retry: write-1-to-clear the flags, soft reset,
confirm IDLE with no fatal flags, then re-arm for the frames still owed.
After three attempts the next fatal observation escalates with the code
that started the episode.
*/

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use shared::network::DEFAULT_MAX_PAYLOAD;
use shared::registers::{addr, Control, ErrorFlags, LinkStatus, Status, DEVICE_ID};
use shared::{
    crc16_ccitt, ErrorCode, ErrorEvent, ErrorReport, LinkDecoder, LinkPacket, LinkStats, NetworkPacket, RegisterAccess, ScanMode,
    Severity, TierParams, TimingParams,
};

use crate::error::{Result, SimError};
use crate::fragmenter::{Fragmenter, RetransmitHistory, DEFAULT_HISTORY_FRAMES};

/// Clear-and-retry cycles before escalation
pub const MAX_RETRIES: u8 = 3;

/// Requests flowing back from the reassembly endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Resend { frame_number: u32, fragments: Vec<u32> },
}

/// Non-blocking notifications to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    Warning { code: ErrorCode, frame_number: u32 },
    RetryAttempt { code: ErrorCode, attempt: u8 },
    Recovered { code: ErrorCode, retries_attempted: u8 },
    Escalated(ErrorReport),
    ConfigRejected(ErrorReport),
    FrameAborted { frame_number: u32 },
    RunFinished { frames: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// Flags and soft reset not yet written
    Clear,
    Confirm { waited_ticks: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Configure,
    Arm { waited_ticks: u64 },
    Scanning,
    Streaming { frame_number: u32 },
    Complete,
    Error { code: ErrorCode, attempt: u8, phase: RecoveryPhase },
}

impl ControllerState {
    pub fn name(&self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Configure => "configure",
            ControllerState::Arm { .. } => "arm",
            ControllerState::Scanning => "scanning",
            ControllerState::Streaming { .. } => "streaming",
            ControllerState::Complete => "complete",
            ControllerState::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub max_payload: usize,
    pub history_frames: usize,
    /// Ticks to wait for IDLE after a clear before the attempt counts as failed
    pub confirm_ticks: u64,
    /// Ticks to wait for the link (or a start) before pushing on
    pub arm_timeout_ticks: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            history_frames: DEFAULT_HISTORY_FRAMES,
            confirm_ticks: 64,
            arm_timeout_ticks: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub polls: u64,
    pub link: LinkStats,
    pub chunks_discarded: u64,
    pub lines_forwarded: u64,
    pub out_of_order_lines: u64,
    pub frames_sent: u64,
    pub frames_aborted: u64,
    pub fragments_sent: u64,
    pub fragments_resent: u64,
    pub resend_requests: u64,
    pub drop_notices: u64,
    pub send_failures: u64,
    pub warnings: u64,
    pub retries: u64,
    pub escalations: u64,
}

pub struct TransportController {
    params: TierParams,
    timing: TimingParams,
    mode: ScanMode,
    config: TransportConfig,
    state: ControllerState,
    link_rx: Receiver<Bytes>,
    net_tx: Sender<Bytes>,
    cmd_rx: Receiver<Command>,
    notify_tx: Sender<Notification>,
    decoder: LinkDecoder,
    fragmenter: Fragmenter,
    history: RetransmitHistory,
    clock_ns: u64,
    budget: Option<u32>,
    frames_done: u32,
    free_running: bool,
    next_row: usize,
    damaged: Option<u32>,
    retries: u8,
    origin: Option<ErrorEvent>,
    stop_requested: bool,
    idle_ticks: u64,
    stats: TransportStats,
}

impl TransportController {
    pub fn new(
        params: TierParams,
        mode: ScanMode,
        config: TransportConfig,
        link_rx: Receiver<Bytes>,
        net_tx: Sender<Bytes>,
        cmd_rx: Receiver<Command>,
        notify_tx: Sender<Notification>,
    ) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            timing: params.timing(),
            mode,
            config,
            state: ControllerState::Idle,
            link_rx,
            net_tx,
            cmd_rx,
            notify_tx,
            decoder: LinkDecoder::new(params.row_bytes()),
            fragmenter: Fragmenter::new(config.max_payload)?,
            history: RetransmitHistory::new(config.history_frames),
            clock_ns: 0,
            budget: None,
            frames_done: 0,
            free_running: false,
            next_row: 0,
            damaged: None,
            retries: 0,
            origin: None,
            stop_requested: false,
            idle_ticks: 0,
            stats: TransportStats::default(),
        })
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn params(&self) -> &TierParams {
        &self.params
    }

    pub fn frames_done(&self) -> u32 {
        self.frames_done
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            link: self.decoder.stats(),
            ..self.stats
        }
    }

    /// Select tier and mode for the next run; rejected outside Idle
    pub fn configure(&mut self, params: TierParams, mode: ScanMode) -> Result<()> {
        if self.state != ControllerState::Idle {
            return Err(SimError::config(format!("cannot reconfigure while {}", self.state.name())));
        }
        params.validate()?;
        self.params = params;
        self.timing = params.timing();
        self.mode = mode;
        self.decoder = LinkDecoder::new(params.row_bytes());
        info!("Transport configured: {}x{} {:?}", params.rows, params.cols, mode);
        Ok(())
    }

    /// Begin a run of `frames` frames; 0 runs until stopped
    pub fn start(&mut self, frames: u32) -> Result<()> {
        if self.state != ControllerState::Idle {
            return Err(SimError::config(format!("start refused while {}", self.state.name())));
        }
        self.budget = (frames > 0).then_some(frames);
        self.frames_done = 0;
        self.retries = 0;
        self.origin = None;
        self.state = ControllerState::Configure;
        info!("Run started: {} frames ({:?})", frames, self.mode);
        Ok(())
    }

    /// Takes effect on the next tick
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    pub fn tick(&mut self, regs: &mut dyn RegisterAccess) {
        self.clock_ns += self.timing.tick_ns;
        self.serve_commands();

        if self.stop_requested {
            self.stop_requested = false;
            self.halt(regs);
        }

        let status = Status::from_bits_truncate(regs.read(addr::STATUS));
        let flags = ErrorFlags::from_bits_truncate(regs.read(addr::ERROR_FLAGS));
        self.stats.polls += 1;

        self.handle_non_fatal(regs, flags);
        if !matches!(self.state, ControllerState::Idle | ControllerState::Error { .. }) {
            if let Some(code) = ErrorCode::first_fatal(flags) {
                self.enter_error(regs, code);
            }
        }

        self.drain_link();

        match self.state {
            ControllerState::Idle | ControllerState::Streaming { .. } => {}
            ControllerState::Configure => self.write_configuration(regs),
            ControllerState::Arm { waited_ticks } => {
                let link = LinkStatus::from_bits_truncate(regs.read(addr::LINK_STATUS));
                if link.contains(LinkStatus::PHY_READY) || waited_ticks >= self.config.arm_timeout_ticks {
                    if !link.contains(LinkStatus::PHY_READY) {
                        warn!("Link not ready after {} ticks, starting anyway", waited_ticks);
                    }
                    regs.write(addr::CONTROL, Control::START.bits());
                    self.idle_ticks = 0;
                    self.state = ControllerState::Scanning;
                } else {
                    self.state = ControllerState::Arm {
                        waited_ticks: waited_ticks + 1,
                    };
                }
            }
            ControllerState::Scanning => {
                if status.contains(Status::IDLE) {
                    self.idle_ticks += 1;
                    if self.idle_ticks > self.config.arm_timeout_ticks {
                        warn!("Device idle while scanning, re-issuing start");
                        regs.write(addr::CONTROL, Control::START.bits());
                        self.idle_ticks = 0;
                    }
                } else {
                    self.idle_ticks = 0;
                }
            }
            ControllerState::Complete => self.next_frame(regs),
            ControllerState::Error { code, attempt, phase } => self.recover(regs, code, attempt, phase, status, flags),
        }
    }

    fn notify(&self, notification: Notification) {
        // the caller may have dropped its receiver; notifications are best effort
        let _ = self.notify_tx.send(notification);
    }

    fn send(&mut self, packet: &NetworkPacket) {
        match self.net_tx.try_send(packet.encode()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.stats.send_failures += 1;
                warn!(
                    "Network queue full, fragment {} of frame {} lost",
                    packet.header.fragment_index, packet.header.frame_number
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.send_failures += 1;
            }
        }
    }

    fn send_drop_notice(&mut self, frame_number: u32) {
        let notice = NetworkPacket::drop_notice(frame_number, self.clock_ns);
        self.stats.drop_notices += 1;
        self.send(&notice);
    }

    fn read_frame_count(regs: &mut dyn RegisterAccess) -> u32 {
        let lo = regs.read(addr::FRAME_COUNT_LO) as u32;
        let hi = regs.read(addr::FRAME_COUNT_HI) as u32;
        (hi << 16) | lo
    }

    fn serve_commands(&mut self) {
        while let Ok(command) = self.cmd_rx.try_recv() {
            match command {
                Command::Resend { frame_number, fragments } => {
                    self.stats.resend_requests += 1;
                    if !self.history.contains(frame_number) {
                        debug!("resend for frame {} outside history, dropping", frame_number);
                        self.send_drop_notice(frame_number);
                        continue;
                    }
                    for index in fragments {
                        let Some(mut packet) = self.history.fragment(frame_number, index).cloned() else {
                            continue;
                        };
                        packet.header.timestamp_ns = self.clock_ns;
                        self.stats.fragments_resent += 1;
                        self.send(&packet);
                    }
                }
            }
        }
    }

    /// Warnings are cleared and surfaced; a refused start ends the run
    fn handle_non_fatal(&mut self, regs: &mut dyn RegisterAccess, flags: ErrorFlags) {
        let non_fatal = flags - ErrorFlags::FATAL;
        if non_fatal.is_empty() {
            return;
        }
        regs.write(addr::ERROR_FLAGS, non_fatal.bits());

        let frame_number = match self.state {
            ControllerState::Streaming { frame_number } => frame_number,
            _ => Self::read_frame_count(regs),
        };
        for code in ErrorCode::from_flags(non_fatal) {
            match code.severity() {
                Severity::Warning => {
                    self.stats.warnings += 1;
                    debug!("warning {} at frame {}", code, frame_number);
                    self.notify(Notification::Warning { code, frame_number });
                }
                _ => {
                    let report = ErrorReport {
                        code,
                        severity: code.severity(),
                        frame_number,
                        retries_attempted: 0,
                    };
                    error!("Device rejected the configuration: {}", report);
                    self.notify(Notification::ConfigRejected(report));
                    if !matches!(self.state, ControllerState::Error { .. }) {
                        self.abandon_current();
                        self.budget = None;
                        self.state = ControllerState::Idle;
                    }
                }
            }
        }
    }

    fn write_configuration(&mut self, regs: &mut dyn RegisterAccess) {
        if regs.read(addr::DEVICE_ID_0) != DEVICE_ID[0] || regs.read(addr::DEVICE_ID_1) != DEVICE_ID[1] {
            let report = ErrorReport {
                code: ErrorCode::ConfigInvalid,
                severity: Severity::Error,
                frame_number: Self::read_frame_count(regs),
                retries_attempted: 0,
            };
            error!("Unexpected device identity, run refused");
            self.notify(Notification::ConfigRejected(report));
            self.state = ControllerState::Idle;
            return;
        }

        let remaining = self.budget.map(|b| b.saturating_sub(self.frames_done));
        let scan_count = match remaining {
            Some(n) if n <= u16::MAX as u32 => n as u16,
            _ => 0,
        };
        self.free_running = self.mode == ScanMode::Continuous && scan_count == 0;

        regs.write(addr::GATE_ON, self.timing.gate_on_units);
        regs.write(addr::GATE_OFF, self.timing.gate_off_units);
        regs.write(addr::SCAN_MODE, self.mode.register_value());
        regs.write(addr::SCAN_COUNT, scan_count);

        let code = self.params.speed_code().unwrap_or(0);
        let link = LinkStatus::from_bits_truncate(regs.read(addr::LINK_STATUS));
        if !link.contains(LinkStatus::PHY_READY) || regs.read(addr::LINK_SPEED_ACTIVE) != code {
            regs.write(addr::LINK_SPEED_SEL, code);
        }
        debug!("configured: scan count {}, speed code {}", scan_count, code);
        self.state = ControllerState::Arm { waited_ticks: 0 };
    }

    fn drain_link(&mut self) {
        while let Ok(chunk) = self.link_rx.try_recv() {
            if matches!(self.state, ControllerState::Idle | ControllerState::Error { .. }) {
                self.stats.chunks_discarded += 1;
                continue;
            }
            self.decoder.push(&chunk);
            while let Some(packet) = self.decoder.next_packet() {
                self.handle_link_packet(packet);
            }
        }
    }

    fn handle_link_packet(&mut self, packet: LinkPacket) {
        match packet {
            LinkPacket::FrameStart { frame_number } => match self.state {
                ControllerState::Scanning | ControllerState::Complete | ControllerState::Streaming { .. } => {
                    if let ControllerState::Streaming { frame_number: previous } = self.state {
                        warn!("Frame {} never ended before frame {}", previous, frame_number);
                        self.abandon_current();
                        self.frames_done += 1;
                    }
                    self.fragmenter.begin(frame_number, self.params.frame_bytes());
                    self.next_row = 0;
                    self.damaged = None;
                    self.state = ControllerState::Streaming { frame_number };
                    debug!("streaming frame {}", frame_number);
                }
                _ => self.stats.chunks_discarded += 1,
            },
            LinkPacket::Line { row, payload, crc } => {
                let ControllerState::Streaming { frame_number } = self.state else {
                    self.stats.chunks_discarded += 1;
                    return;
                };
                if self.damaged == Some(frame_number) {
                    return;
                }
                if crc16_ccitt(&payload) != crc {
                    warn!("Line {} of frame {} failed its CRC, dropping frame", row, frame_number);
                    self.abandon_current();
                    return;
                }
                if row as usize != self.next_row {
                    self.stats.out_of_order_lines += 1;
                    warn!(
                        "Line {} of frame {} out of order (expected {}), dropping frame",
                        row, frame_number, self.next_row
                    );
                    self.abandon_current();
                    return;
                }
                match self.fragmenter.push_row(&payload, self.clock_ns) {
                    Ok(fragments) => {
                        for fragment in &fragments {
                            self.history.record(fragment);
                            self.stats.fragments_sent += 1;
                            self.send(fragment);
                        }
                        self.stats.lines_forwarded += 1;
                        self.next_row += 1;
                    }
                    Err(e) => {
                        warn!("Fragmenter rejected line {}: {}", row, e);
                        self.abandon_current();
                    }
                }
            }
            LinkPacket::FrameEnd { frame_number } => {
                if self.state != (ControllerState::Streaming { frame_number }) {
                    self.stats.chunks_discarded += 1;
                    return;
                }
                if self.damaged != Some(frame_number) && self.fragmenter.in_flight() == Some(frame_number) {
                    warn!("Frame {} ended after {} rows", frame_number, self.next_row);
                    self.abandon_current();
                }
                if self.damaged != Some(frame_number) {
                    self.stats.frames_sent += 1;
                    self.frame_completed();
                }
                self.frames_done += 1;
                self.state = ControllerState::Complete;
            }
        }
    }

    /// Drop the frame in flight and tell the endpoint
    fn abandon_current(&mut self) {
        let ControllerState::Streaming { frame_number } = self.state else {
            return;
        };
        if self.damaged == Some(frame_number) {
            return;
        }
        self.fragmenter.abort();
        self.history.discard(frame_number);
        self.send_drop_notice(frame_number);
        self.damaged = Some(frame_number);
        self.stats.frames_aborted += 1;
        self.notify(Notification::FrameAborted { frame_number });
    }

    fn frame_completed(&mut self) {
        if self.retries > 0 {
            if let Some(origin) = self.origin {
                info!("Recovered from {} after {} retries", origin.code, self.retries);
                self.notify(Notification::Recovered {
                    code: origin.code,
                    retries_attempted: self.retries,
                });
            }
        }
        self.retries = 0;
        self.origin = None;
    }

    fn next_frame(&mut self, regs: &mut dyn RegisterAccess) {
        let finished = self.budget.is_some_and(|b| self.frames_done >= b);
        if finished {
            if self.free_running {
                regs.write(addr::CONTROL, Control::STOP.bits());
            }
            info!("Run finished after {} frames", self.frames_done);
            self.notify(Notification::RunFinished {
                frames: self.frames_done,
            });
            self.budget = None;
            self.state = ControllerState::Idle;
            return;
        }

        if self.mode != ScanMode::Continuous {
            regs.write(addr::CONTROL, Control::START.bits());
        }
        self.idle_ticks = 0;
        self.state = ControllerState::Scanning;
    }

    fn enter_error(&mut self, regs: &mut dyn RegisterAccess, code: ErrorCode) {
        let frame_number = match self.state {
            ControllerState::Streaming { frame_number } => {
                self.abandon_current();
                self.frames_done += 1;
                frame_number
            }
            _ => Self::read_frame_count(regs),
        };
        self.fragmenter.abort();
        self.decoder.reset();
        if self.origin.is_none() {
            self.origin = Some(ErrorEvent::new(code, frame_number));
        }
        error!("Fatal {} observed in {} at frame {}", code, self.state.name(), frame_number);
        self.attempt_recovery(regs, code);
    }

    fn attempt_recovery(&mut self, regs: &mut dyn RegisterAccess, code: ErrorCode) {
        if self.retries >= MAX_RETRIES {
            self.escalate(regs, code);
            return;
        }
        self.retries += 1;
        self.stats.retries += 1;
        warn!("Recovery attempt {}/{} for {}", self.retries, MAX_RETRIES, code);
        self.notify(Notification::RetryAttempt {
            code,
            attempt: self.retries,
        });
        self.state = ControllerState::Error {
            code,
            attempt: self.retries,
            phase: RecoveryPhase::Clear,
        };
    }

    fn escalate(&mut self, regs: &mut dyn RegisterAccess, code: ErrorCode) {
        let origin = self.origin.take().unwrap_or_else(|| ErrorEvent::new(code, 0));
        let report = ErrorReport {
            code: origin.code,
            severity: origin.severity,
            frame_number: origin.frame_number,
            retries_attempted: self.retries,
        };

        let set = regs.read(addr::ERROR_FLAGS);
        regs.write(addr::ERROR_FLAGS, set);
        regs.write(addr::CONTROL, (Control::STOP | Control::SOFT_RESET).bits());

        error!("Escalating: {}", report);
        self.stats.escalations += 1;
        self.notify(Notification::Escalated(report));
        self.retries = 0;
        self.budget = None;
        self.state = ControllerState::Idle;
    }

    fn recover(
        &mut self,
        regs: &mut dyn RegisterAccess,
        code: ErrorCode,
        attempt: u8,
        phase: RecoveryPhase,
        status: Status,
        flags: ErrorFlags,
    ) {
        match phase {
            RecoveryPhase::Clear => {
                regs.write(addr::ERROR_FLAGS, flags.bits());
                regs.write(addr::CONTROL, Control::SOFT_RESET.bits());
                self.state = ControllerState::Error {
                    code,
                    attempt,
                    phase: RecoveryPhase::Confirm { waited_ticks: 0 },
                };
            }
            RecoveryPhase::Confirm { waited_ticks } => {
                if status.contains(Status::IDLE) && !flags.has_fatal() {
                    info!("Clear confirmed after {} (attempt {}), re-arming", code, attempt);
                    self.state = ControllerState::Configure;
                } else if waited_ticks + 1 > self.config.confirm_ticks {
                    warn!("Clear not confirmed within {} ticks", self.config.confirm_ticks);
                    let still = ErrorCode::first_fatal(flags).unwrap_or(code);
                    self.attempt_recovery(regs, still);
                } else {
                    self.state = ControllerState::Error {
                        code,
                        attempt,
                        phase: RecoveryPhase::Confirm {
                            waited_ticks: waited_ticks + 1,
                        },
                    };
                }
            }
        }
    }

    fn halt(&mut self, regs: &mut dyn RegisterAccess) {
        let mut control = Control::STOP;
        if matches!(self.state, ControllerState::Error { .. }) {
            let set = regs.read(addr::ERROR_FLAGS);
            regs.write(addr::ERROR_FLAGS, set);
            control |= Control::SOFT_RESET;
        }
        regs.write(addr::CONTROL, control.bits());

        self.abandon_current();
        self.fragmenter.abort();
        self.decoder.reset();
        self.budget = None;
        self.retries = 0;
        self.origin = None;
        info!("Run stopped in {} after {} frames", self.state.name(), self.frames_done);
        self.state = ControllerState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{AcquisitionEngine, EngineOptions};
    use crate::fault::{FaultKind, FaultSpec};
    use crate::source::TestPattern;
    use crossbeam_channel::{bounded, unbounded};
    use shared::Tier;

    struct Rig {
        engine: AcquisitionEngine,
        controller: TransportController,
        net_rx: Receiver<Bytes>,
        cmd_tx: Sender<Command>,
        notify_rx: Receiver<Notification>,
    }

    fn params() -> TierParams {
        TierParams {
            rows: 8,
            cols: 16,
            target_fps: 1000,
            ..Tier::Minimum.params()
        }
    }

    fn rig(mode: ScanMode, max_payload: usize) -> Rig {
        let params = params();
        let (link_tx, link_rx) = bounded(256);
        let (net_tx, net_rx) = bounded(1024);
        let (cmd_tx, cmd_rx) = bounded(16);
        let (notify_tx, notify_rx) = unbounded();
        let engine = AcquisitionEngine::new(params, EngineOptions::default(), Box::new(TestPattern), link_tx).unwrap();
        let config = TransportConfig {
            max_payload,
            ..TransportConfig::default()
        };
        let controller = TransportController::new(params, mode, config, link_rx, net_tx, cmd_rx, notify_tx).unwrap();
        Rig {
            engine,
            controller,
            net_rx,
            cmd_tx,
            notify_rx,
        }
    }

    impl Rig {
        fn step(&mut self, ticks: usize) {
            for _ in 0..ticks {
                self.engine.tick();
                self.controller.tick(&mut self.engine);
            }
        }

        fn packets(&self) -> Vec<NetworkPacket> {
            self.net_rx
                .try_iter()
                .map(|b| NetworkPacket::decode(b, DEFAULT_MAX_PAYLOAD).unwrap())
                .collect()
        }

        fn notifications(&self) -> Vec<Notification> {
            self.notify_rx.try_iter().collect()
        }
    }

    #[test]
    fn test_single_frame_is_fragmented_in_order() {
        let mut rig = rig(ScanMode::Single, 100);
        rig.controller.start(1).unwrap();
        rig.step(300);

        assert_eq!(rig.controller.state(), ControllerState::Idle);
        let packets = rig.packets();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.header.frame_number == 0 && !p.is_drop()));
        assert!(packets[2].is_last());

        let data: Vec<u8> = packets.iter().flat_map(|p| p.payload.iter().copied()).collect();
        let frame = shared::Frame::from_le_bytes(0, &params(), &data).unwrap();
        assert_eq!(frame.first_mismatch(&TestPattern::expected(0, &params())), None);
        assert!(rig
            .notifications()
            .contains(&Notification::RunFinished { frames: 1 }));
    }

    #[test]
    fn test_single_mode_restarts_each_frame() {
        let mut rig = rig(ScanMode::Single, DEFAULT_MAX_PAYLOAD);
        rig.controller.start(3).unwrap();
        rig.step(1000);

        let frames: Vec<u32> = rig.packets().iter().map(|p| p.header.frame_number).collect();
        assert_eq!(frames, vec![0, 1, 2]);
        assert_eq!(rig.controller.frames_done(), 3);
    }

    #[test]
    fn test_persistent_fault_escalates_after_three_retries() {
        let mut rig = rig(ScanMode::Single, DEFAULT_MAX_PAYLOAD);
        rig.engine.inject_fault(FaultSpec::always(FaultKind::SensorFault));
        rig.controller.start(1).unwrap();
        rig.step(2000);

        let notes = rig.notifications();
        let retries: Vec<u8> = notes
            .iter()
            .filter_map(|n| match n {
                Notification::RetryAttempt { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![1, 2, 3]);

        let escalations: Vec<&ErrorReport> = notes
            .iter()
            .filter_map(|n| match n {
                Notification::Escalated(report) => Some(report),
                _ => None,
            })
            .collect();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].code, ErrorCode::SensorFault);
        assert_eq!(escalations[0].retries_attempted, 3);
        assert_eq!(rig.controller.state(), ControllerState::Idle);
        assert_eq!(rig.engine.state(), crate::scan_fsm::ScanState::Idle);
    }

    #[test]
    fn test_transient_fault_recovers_once() {
        let mut rig = rig(ScanMode::Single, DEFAULT_MAX_PAYLOAD);
        rig.engine.inject_fault(FaultSpec::once(FaultKind::SensorStall { row: 3 }));
        rig.controller.start(2).unwrap();
        rig.step(2000);

        let notes = rig.notifications();
        assert!(notes.contains(&Notification::Recovered {
            code: ErrorCode::Timeout,
            retries_attempted: 1,
        }));
        assert!(!notes.iter().any(|n| matches!(n, Notification::Escalated(_))));

        let packets = rig.packets();
        // frame 0 died mid-stream and still counts against the budget
        assert!(packets.iter().any(|p| p.header.frame_number == 0 && p.is_drop()));
        assert!(packets.iter().any(|p| p.header.frame_number == 1 && p.is_last()));
        assert!(!packets.iter().any(|p| p.header.frame_number == 2));
        assert_eq!(rig.controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_resend_served_from_history() {
        let mut rig = rig(ScanMode::Single, 100);
        rig.controller.start(1).unwrap();
        rig.step(300);
        let _ = rig.packets();

        rig.cmd_tx
            .send(Command::Resend {
                frame_number: 0,
                fragments: vec![1],
            })
            .unwrap();
        rig.cmd_tx
            .send(Command::Resend {
                frame_number: 40,
                fragments: vec![0],
            })
            .unwrap();
        rig.step(1);

        let packets = rig.packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].header.fragment_index, 1);
        assert_eq!(packets[0].payload.len(), 100);
        assert!(packets[1].is_drop());
        assert_eq!(packets[1].header.frame_number, 40);
        assert_eq!(rig.controller.stats().fragments_resent, 1);
    }

    #[test]
    fn test_stop_mid_stream_drops_frame() {
        let mut rig = rig(ScanMode::Continuous, 64);
        rig.controller.start(0).unwrap();
        while !matches!(rig.controller.state(), ControllerState::Streaming { .. }) {
            rig.step(1);
        }
        rig.step(4);
        rig.controller.stop();
        rig.step(2);

        assert_eq!(rig.controller.state(), ControllerState::Idle);
        assert_eq!(rig.engine.state(), crate::scan_fsm::ScanState::Idle);
        assert!(rig.engine.line_store().all_free());
        assert!(rig.packets().last().is_some_and(|p| p.is_drop()));
    }

    #[test]
    fn test_start_and_configure_refused_while_running() {
        let mut rig = rig(ScanMode::Single, DEFAULT_MAX_PAYLOAD);
        rig.controller.start(1).unwrap();
        assert!(rig.controller.start(1).is_err());
        assert!(rig.controller.configure(params(), ScanMode::Continuous).is_err());
    }
}
