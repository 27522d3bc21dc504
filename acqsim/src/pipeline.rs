/*!
Tick-driven pipeline: acquisition engine -> transport controller ->
network impairment -> reassembly endpoint.

Every stage is advanced once per tick in pipeline order, so a run with the
same configuration and seed replays bit for bit. Stages talk only through
single-producer/single-consumer channels; the controller reaches the engine
through the register-access trait.
*/

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::Serialize;
use tracing::{debug, info, warn};

use shared::{ErrorEvent, ErrorReport, ScanMode, TierParams};

use crate::acquisition::{AcquisitionEngine, EngineOptions, EngineStats};
use crate::error::{Result, SimError};
use crate::fault::FaultSpec;
use crate::impairment::{ImpairmentConfig, ImpairmentStats, NetworkImpairment};
use crate::reassembly::{EndpointStats, FrameOutcome, ReassemblyConfig, ReassemblyEndpoint};
use crate::source::PixelSource;
use crate::transport::{Command, ControllerState, Notification, TransportConfig, TransportController, TransportStats};

pub const DEFAULT_LINK_CAPACITY: usize = 4096;
pub const DEFAULT_NET_CAPACITY: usize = 8192;
const COMMAND_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub params: TierParams,
    pub mode: ScanMode,
    pub engine: EngineOptions,
    pub transport: TransportConfig,
    pub reassembly: ReassemblyConfig,
    pub impairment: ImpairmentConfig,
    pub faults: Vec<FaultSpec>,
    pub link_capacity: usize,
    pub net_capacity: usize,
}

impl PipelineConfig {
    pub fn new(params: TierParams, mode: ScanMode) -> Self {
        Self {
            params,
            mode,
            engine: EngineOptions::default(),
            transport: TransportConfig::default(),
            reassembly: ReassemblyConfig::default(),
            impairment: ImpairmentConfig::default(),
            faults: Vec::new(),
            link_capacity: DEFAULT_LINK_CAPACITY,
            net_capacity: DEFAULT_NET_CAPACITY,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.params.validate()?;
        self.impairment.validate()?;
        if self.transport.max_payload != self.reassembly.max_payload {
            return Err(SimError::config(format!(
                "controller payload {} differs from endpoint payload {}",
                self.transport.max_payload, self.reassembly.max_payload
            )));
        }
        if self.link_capacity == 0 || self.net_capacity == 0 {
            return Err(SimError::config("channel capacities must be non-zero"));
        }
        Ok(())
    }
}

/// Summary of one run, printed by the CLI as JSON
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub params: TierParams,
    pub mode: ScanMode,
    pub frames_requested: u32,
    pub first_frame: u32,
    pub frames_started: u32,
    pub frames_delivered: u64,
    pub frames_lost: u64,
    pub ticks: u64,
    pub simulated_ns: u64,
    pub controller_state: &'static str,
    pub engine_state: &'static str,
    pub escalations: Vec<ErrorReport>,
    /// Most recent errors raised by the engine, oldest first
    pub engine_errors: Vec<ErrorEvent>,
    pub engine: EngineStats,
    pub transport: TransportStats,
    pub impairment: ImpairmentStats,
    pub endpoint: EndpointStats,
}

pub struct Pipeline {
    config: PipelineConfig,
    engine: AcquisitionEngine,
    controller: TransportController,
    impairment: NetworkImpairment,
    endpoint: ReassemblyEndpoint,
    wire_rx: Receiver<Bytes>,
    cmd_tx: Sender<Command>,
    notify_rx: Receiver<Notification>,
    events: Vec<Notification>,
    outcomes: Vec<FrameOutcome>,
    ticks: u64,
    clock_ns: u64,
    silence_ticks: u64,
    frames_requested: u32,
    first_frame: u32,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, source: Box<dyn PixelSource>) -> Result<Self> {
        config.validate()?;

        let (link_tx, link_rx) = bounded(config.link_capacity);
        let (net_tx, net_rx) = bounded(config.net_capacity);
        let (wire_tx, wire_rx) = bounded(config.net_capacity);
        let (cmd_tx, cmd_rx) = bounded(COMMAND_CAPACITY);
        let (notify_tx, notify_rx) = unbounded();

        let mut engine = AcquisitionEngine::new(config.params, config.engine, source, link_tx)?;
        for fault in &config.faults {
            engine.inject_fault(*fault);
        }
        let controller = TransportController::new(
            config.params,
            config.mode,
            config.transport,
            link_rx,
            net_tx,
            cmd_rx,
            notify_tx,
        )?;
        let impairment = NetworkImpairment::new(config.impairment, net_rx, wire_tx)?;
        let endpoint = ReassemblyEndpoint::new(config.params, config.reassembly, Some(cmd_tx.clone()))?;

        Ok(Self {
            config,
            engine,
            controller,
            impairment,
            endpoint,
            wire_rx,
            cmd_tx,
            notify_rx,
            events: Vec::new(),
            outcomes: Vec::new(),
            ticks: 0,
            clock_ns: 0,
            silence_ticks: 0,
            frames_requested: 0,
            first_frame: 0,
        })
    }

    pub fn engine(&self) -> &AcquisitionEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut AcquisitionEngine {
        &mut self.engine
    }

    pub fn controller(&self) -> &TransportController {
        &self.controller
    }

    pub fn endpoint(&self) -> &ReassemblyEndpoint {
        &self.endpoint
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Controller notifications seen so far
    pub fn events(&self) -> &[Notification] {
        &self.events
    }

    /// Outcomes collected by [`Pipeline::run_until_idle`] or [`Pipeline::tick`]
    pub fn take_outcomes(&mut self) -> Vec<FrameOutcome> {
        std::mem::take(&mut self.outcomes)
    }

    /// Begin a run of `frames` frames (0 runs until stopped)
    pub fn start(&mut self, frames: u32) -> Result<()> {
        self.first_frame = self.engine.registers().frame_count();
        self.endpoint.expect_from(self.first_frame);
        self.controller.start(frames)?;
        self.frames_requested = frames;
        info!("Pipeline run: {} frames from frame {}", frames, self.first_frame);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.controller.stop();
    }

    /// Swap tiers between runs; the endpoint is rebuilt for the new geometry
    pub fn reconfigure(&mut self, params: TierParams, mode: ScanMode) -> Result<()> {
        if self.controller.state() != ControllerState::Idle {
            return Err(SimError::config("reconfigure requires a stopped pipeline"));
        }
        self.engine.reconfigure(params)?;
        self.controller.configure(params, mode)?;

        self.endpoint = ReassemblyEndpoint::new(params, self.config.reassembly, Some(self.cmd_tx.clone()))?;
        debug!("pipeline reconfigured for {}x{}", params.rows, params.cols);
        self.config.params = params;
        self.config.mode = mode;
        Ok(())
    }

    /// Stop polling the device for `ticks` ticks
    pub fn silence_controller(&mut self, ticks: u64) {
        warn!("Controller silenced for {} ticks", ticks);
        self.silence_ticks = ticks;
    }

    pub fn tick(&mut self) {
        let mut outcomes = std::mem::take(&mut self.outcomes);
        self.tick_with(&mut |outcome| outcomes.push(outcome));
        self.outcomes = outcomes;
    }

    fn tick_with(&mut self, sink: &mut dyn FnMut(FrameOutcome)) {
        self.ticks += 1;
        self.clock_ns += self.engine.timing().tick_ns;

        self.engine.tick();
        if self.silence_ticks > 0 {
            self.silence_ticks -= 1;
        } else {
            self.controller.tick(&mut self.engine);
        }
        self.impairment.pump();

        while let Ok(datagram) = self.wire_rx.try_recv() {
            self.endpoint.on_datagram(datagram, self.clock_ns);
        }
        self.endpoint.service(self.clock_ns);
        while let Some(outcome) = self.endpoint.next_outcome() {
            sink(outcome);
        }
        self.events.extend(self.notify_rx.try_iter());
    }

    fn network_quiet(&self) -> bool {
        self.impairment.held() == 0 && self.wire_rx.is_empty() && self.endpoint.pending() == 0
    }

    /// Run to completion, collecting outcomes
    pub fn run_until_idle(&mut self, max_ticks: u64) -> RunReport {
        let mut outcomes = std::mem::take(&mut self.outcomes);
        let report = self.run_with(max_ticks, |outcome| outcomes.push(outcome));
        self.outcomes = outcomes;
        report
    }

    /// Run to completion, handing each outcome to `sink` as it is released
    pub fn run_with(&mut self, max_ticks: u64, mut sink: impl FnMut(FrameOutcome)) -> RunReport {
        let deadline = self.ticks + max_ticks;

        while self.ticks < deadline && self.controller.state() != ControllerState::Idle {
            self.tick_with(&mut sink);
        }
        if self.controller.state() != ControllerState::Idle {
            warn!("Tick budget exhausted in {}, stopping", self.controller.state().name());
            self.controller.stop();
            self.tick_with(&mut sink);
        }

        // frames that started but never produced a packet are still owed an outcome
        let started = self.engine.registers().frame_count();
        if started > self.first_frame {
            self.endpoint.expect_through(started - 1, self.clock_ns);
        }
        let drain_deadline = self.ticks + max_ticks;
        while self.ticks < drain_deadline && !self.network_quiet() {
            self.tick_with(&mut sink);
        }

        self.impairment.flush();
        while let Ok(datagram) = self.wire_rx.try_recv() {
            self.endpoint.on_datagram(datagram, self.clock_ns);
        }
        self.endpoint.flush();
        while let Some(outcome) = self.endpoint.next_outcome() {
            sink(outcome);
        }
        self.events.extend(self.notify_rx.try_iter());

        let report = self.report();
        info!(
            "Run complete: {} delivered, {} lost, {} ticks",
            report.frames_delivered, report.frames_lost, report.ticks
        );
        report
    }

    pub fn report(&self) -> RunReport {
        let endpoint = self.endpoint.stats();
        RunReport {
            params: self.config.params,
            mode: self.config.mode,
            frames_requested: self.frames_requested,
            first_frame: self.first_frame,
            frames_started: self.engine.registers().frame_count().wrapping_sub(self.first_frame),
            frames_delivered: endpoint.delivered,
            frames_lost: endpoint.lost(),
            ticks: self.ticks,
            simulated_ns: self.clock_ns,
            controller_state: self.controller.state().name(),
            engine_state: self.engine.state().name(),
            escalations: self
                .events
                .iter()
                .filter_map(|event| match event {
                    Notification::Escalated(report) => Some(*report),
                    _ => None,
                })
                .collect(),
            engine_errors: self.engine.error_log().copied().collect(),
            engine: self.engine.stats(),
            transport: self.controller.stats(),
            impairment: self.impairment.stats(),
            endpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultKind, FaultSpec};
    use crate::scan_fsm::ScanState;
    use crate::source::TestPattern;
    use shared::registers::ErrorFlags;
    use shared::{ErrorCode, Tier};

    fn small(rows: usize, cols: usize) -> TierParams {
        TierParams {
            rows,
            cols,
            target_fps: 1000,
            ..Tier::Minimum.params()
        }
    }

    /// Short network timers measured in ticks of `params`
    fn quick_config(params: TierParams, mode: ScanMode, max_payload: usize) -> PipelineConfig {
        let tick_ns = params.timing().tick_ns;
        let mut config = PipelineConfig::new(params, mode);
        config.transport.max_payload = max_payload;
        config.reassembly.max_payload = max_payload;
        config.reassembly.resend_delay_ns = 40 * tick_ns;
        config.reassembly.timeout_ns = 1_000 * tick_ns;
        config
    }

    fn pipeline(config: PipelineConfig) -> Pipeline {
        Pipeline::new(config, Box::new(TestPattern)).unwrap()
    }

    fn check_outcomes(outcomes: &[FrameOutcome], params: &TierParams, first: u32, count: u32) -> (u32, u32) {
        let numbers: Vec<u32> = outcomes.iter().map(FrameOutcome::frame_number).collect();
        let expected: Vec<u32> = (first..first + count).collect();
        assert_eq!(numbers, expected);

        let mut delivered = 0;
        for outcome in outcomes {
            if let FrameOutcome::Delivered(frame) = outcome {
                let reference = TestPattern::expected(frame.number, params);
                assert_eq!(frame.first_mismatch(&reference), None, "frame {}", frame.number);
                delivered += 1;
            }
        }
        (delivered, count - delivered)
    }

    fn retry_attempts(events: &[Notification]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                Notification::RetryAttempt { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_minimum_tier_single_shot() {
        let params = Tier::Minimum.params();
        let mut pipeline = pipeline(PipelineConfig::new(params, ScanMode::Single));
        pipeline.start(1).unwrap();
        let report = pipeline.run_until_idle(20_000);

        let outcomes = pipeline.take_outcomes();
        assert_eq!(outcomes.len(), 1);
        let FrameOutcome::Delivered(frame) = &outcomes[0] else {
            panic!("frame not delivered: {:?}", outcomes[0].frame_number());
        };
        assert_eq!(frame.number, 0);
        assert_eq!(frame.num_pixels(), 1_048_576);
        assert_eq!(frame.first_mismatch(&TestPattern::expected(0, &params)), None);

        assert_eq!(pipeline.engine().registers().error_flags(), ErrorFlags::empty());
        assert_eq!(report.frames_delivered, 1);
        assert_eq!(report.frames_lost, 0);
        assert_eq!(report.transport.fragments_sent, 256);
        assert_eq!(report.controller_state, "idle");
        assert_eq!(report.engine_state, "idle");
    }

    #[test]
    fn test_all_tiers_round_trip() {
        for tier in Tier::ALL {
            let params = TierParams {
                rows: 32,
                cols: 64,
                ..tier.params()
            };
            let mut pipeline = pipeline(quick_config(params, ScanMode::Single, 1000));
            pipeline.start(2).unwrap();
            pipeline.run_until_idle(200_000);
            let (delivered, lost) = check_outcomes(&pipeline.take_outcomes(), &params, 0, 2);
            assert_eq!((delivered, lost), (2, 0), "{:?}", tier);
        }
    }

    #[test]
    fn test_continuous_thousand_frames() {
        let params = small(8, 16);
        let mut pipeline = pipeline(quick_config(params, ScanMode::Continuous, 8192));
        pipeline.start(1000).unwrap();
        let report = pipeline.run_until_idle(500_000);

        let (delivered, lost) = check_outcomes(&pipeline.take_outcomes(), &params, 0, 1000);
        assert_eq!(delivered, 1000);
        assert_eq!(lost, 0);
        assert_eq!(report.frames_started, 1000);
        assert_eq!(report.transport.drop_notices, 0);
        assert!(pipeline.events().contains(&Notification::RunFinished { frames: 1000 }));
    }

    #[test]
    fn test_five_percent_loss_accounted() {
        let params = small(16, 32);
        let mut config = quick_config(params, ScanMode::Continuous, 128);
        config.impairment = ImpairmentConfig {
            loss_rate: 0.05,
            seed: 7,
            ..ImpairmentConfig::default()
        };
        let mut pipeline = pipeline(config);
        pipeline.start(200).unwrap();
        let report = pipeline.run_until_idle(1_000_000);

        let (delivered, lost) = check_outcomes(&pipeline.take_outcomes(), &params, 0, 200);
        assert_eq!(delivered as u64, report.frames_delivered);
        assert_eq!(lost as u64, report.frames_lost);
        assert!(report.impairment.dropped > 0);
        assert!(report.endpoint.resend_requests > 0);
        assert!(report.transport.fragments_resent > 0);
        assert!(delivered > 150, "only {} of 200 delivered", delivered);
    }

    #[test]
    fn test_reordering_alone_delivers_every_frame() {
        let params = small(16, 32);
        let mut config = quick_config(params, ScanMode::Continuous, 100);
        config.impairment = ImpairmentConfig {
            reorder_window: 8,
            seed: 3,
            ..ImpairmentConfig::default()
        };
        let mut pipeline = pipeline(config);
        pipeline.start(100).unwrap();
        let report = pipeline.run_until_idle(1_000_000);

        let (delivered, lost) = check_outcomes(&pipeline.take_outcomes(), &params, 0, 100);
        assert_eq!((delivered, lost), (100, 0));
        assert_eq!(report.frames_delivered, 100);
        assert!(report.impairment.held_back > 0);
        assert_eq!(report.impairment.dropped, 0);
        assert_eq!(report.endpoint.crc_failures, 0);
    }

    #[test]
    fn test_reorder_and_corruption_never_deliver_bad_data() {
        let params = small(16, 32);
        let mut config = quick_config(params, ScanMode::Continuous, 100);
        config.impairment = ImpairmentConfig {
            reorder_window: 8,
            corrupt_rate: 0.02,
            seed: 99,
            ..ImpairmentConfig::default()
        };
        let mut pipeline = pipeline(config);
        pipeline.start(100).unwrap();
        let report = pipeline.run_until_idle(1_000_000);

        let (delivered, lost) = check_outcomes(&pipeline.take_outcomes(), &params, 0, 100);
        assert_eq!((delivered + lost) as u64, report.frames_delivered + report.frames_lost);
        assert!(report.endpoint.crc_failures > 0);
    }

    #[test]
    fn test_persistent_fault_escalates() {
        let params = small(8, 16);
        let mut config = quick_config(params, ScanMode::Continuous, 8192);
        config.faults.push(FaultSpec::always(FaultKind::SensorStall { row: 2 }));
        let mut pipeline = pipeline(config);
        pipeline.start(10).unwrap();
        let report = pipeline.run_until_idle(100_000);

        assert_eq!(retry_attempts(pipeline.events()), vec![1, 2, 3]);
        assert_eq!(report.escalations.len(), 1);
        assert_eq!(report.escalations[0].code, ErrorCode::Timeout);
        assert_eq!(report.escalations[0].frame_number, 0);
        assert_eq!(report.escalations[0].retries_attempted, 3);
        assert!(matches!(pipeline.events().last(), Some(Notification::Escalated(_))));
        let timeouts = report
            .engine_errors
            .iter()
            .filter(|e| e.code == ErrorCode::Timeout)
            .count();
        assert_eq!(timeouts, 4);

        assert_eq!(pipeline.controller().state(), ControllerState::Idle);
        pipeline.tick();
        assert_eq!(pipeline.engine().state(), ScanState::Idle);

        // every started frame died mid-stream and is accounted as lost
        let outcomes = pipeline.take_outcomes();
        assert_eq!(report.frames_started, 4);
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|o| !o.is_delivered()));
    }

    #[test]
    fn test_transient_fault_recovers_and_keeps_numbering() {
        let params = small(8, 16);
        let mut config = quick_config(params, ScanMode::Continuous, 8192);
        config.faults.push(FaultSpec::once(FaultKind::LinkInit).from_frame(3));
        let mut pipeline = pipeline(config);
        pipeline.start(6).unwrap();
        pipeline.run_until_idle(100_000);

        assert_eq!(retry_attempts(pipeline.events()), vec![1]);
        assert!(pipeline.events().contains(&Notification::Recovered {
            code: ErrorCode::LinkInit,
            retries_attempted: 1,
        }));
        // a failed start consumes no frame number
        let (delivered, _) = check_outcomes(&pipeline.take_outcomes(), &params, 0, 6);
        assert_eq!(delivered, 6);
    }

    #[test]
    fn test_watchdog_on_controller_silence() {
        let params = small(8, 16);
        let tick_ns = params.timing().tick_ns;
        let mut config = quick_config(params, ScanMode::Continuous, 8192);
        config.engine.watchdog_ns = 50 * tick_ns;
        let mut pipeline = pipeline(config);
        pipeline.start(8).unwrap();
        for _ in 0..150 {
            pipeline.tick();
        }
        pipeline.silence_controller(80);
        for _ in 0..80 {
            pipeline.tick();
        }
        assert_eq!(pipeline.engine().state(), ScanState::Error(ErrorCode::Watchdog));
        assert!(!pipeline.engine().gate_enabled());

        let report = pipeline.run_until_idle(100_000);
        assert!(pipeline.events().contains(&Notification::Recovered {
            code: ErrorCode::Watchdog,
            retries_attempted: 1,
        }));
        let outcomes = pipeline.take_outcomes();
        let started = report.frames_started;
        assert_eq!(outcomes.len() as u32, started);
        assert_eq!(report.frames_delivered + report.frames_lost, started as u64);
        assert!(report.frames_delivered >= 6);
    }

    #[test]
    fn test_link_bit_error_drops_only_that_frame() {
        let params = small(8, 16);
        let mut config = quick_config(params, ScanMode::Continuous, 8192);
        config
            .faults
            .push(FaultSpec::once(FaultKind::LinkBitError { row: 5 }).from_frame(2));
        let mut pipeline = pipeline(config);
        pipeline.start(5).unwrap();
        pipeline.run_until_idle(100_000);

        let outcomes = pipeline.take_outcomes();
        check_outcomes(&outcomes, &params, 0, 5);
        let lost: Vec<u32> = outcomes
            .iter()
            .filter(|o| !o.is_delivered())
            .map(FrameOutcome::frame_number)
            .collect();
        assert_eq!(lost, vec![2]);
        assert!(pipeline.events().contains(&Notification::Warning {
            code: ErrorCode::CrcMismatch,
            frame_number: 2,
        }));
        assert!(retry_attempts(pipeline.events()).is_empty());
    }

    #[test]
    fn test_stop_releases_everything() {
        let params = small(8, 16);
        let mut pipeline = pipeline(quick_config(params, ScanMode::Continuous, 64));
        pipeline.start(0).unwrap();
        while !matches!(pipeline.controller().state(), ControllerState::Streaming { .. }) {
            pipeline.tick();
        }
        for _ in 0..5 {
            pipeline.tick();
        }
        pipeline.stop();
        pipeline.tick();
        pipeline.tick();
        assert_eq!(pipeline.engine().state(), ScanState::Idle);
        assert!(pipeline.engine().line_store().all_free());
        assert!(!pipeline.engine().link_busy());

        let report = pipeline.run_until_idle(10_000);
        assert_eq!(pipeline.endpoint().slots_in_use(), 0);
        assert_eq!(pipeline.endpoint().pending(), 0);
        assert_eq!(report.frames_delivered + report.frames_lost, report.frames_started as u64);
    }

    #[test]
    fn test_calibration_delivers_dark_frame() {
        let params = small(8, 16);
        let mut pipeline = pipeline(quick_config(params, ScanMode::Calibration, 8192));
        pipeline.start(1).unwrap();
        let report = pipeline.run_until_idle(10_000);

        assert_eq!(report.engine.gate_ticks, 0);
        let outcomes = pipeline.take_outcomes();
        let FrameOutcome::Delivered(frame) = &outcomes[0] else {
            panic!("dark frame not delivered");
        };
        assert!(frame.pixels().iter().all(|&p| p == 0));
    }

    #[test]
    fn test_reconfigure_between_runs() {
        let params = small(8, 16);
        let mut pipeline = pipeline(quick_config(params, ScanMode::Single, 8192));
        pipeline.start(1).unwrap();
        pipeline.run_until_idle(10_000);
        assert_eq!(pipeline.take_outcomes().len(), 1);

        let wider = small(4, 32);
        pipeline.reconfigure(wider, ScanMode::Single).unwrap();
        pipeline.start(1).unwrap();
        pipeline.run_until_idle(10_000);
        let outcomes = pipeline.take_outcomes();
        // numbering continues across the tier change
        check_outcomes(&outcomes, &wider, 1, 1);
    }

    #[test]
    fn test_mismatched_payloads_rejected() {
        let mut config = PipelineConfig::new(small(8, 16), ScanMode::Single);
        config.reassembly.max_payload = 1024;
        assert!(Pipeline::new(config, Box::new(TestPattern)).is_err());
    }
}
