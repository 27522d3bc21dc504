/*!
UDP loopback mode.

The device side (acquisition engine, transport controller and the optional
network impairment) runs on the calling thread and ships every datagram
through a real UDP socket. The host side is two threads, as in a capture
service:

1. UDP receiver: tokio socket, datagrams -> bounded channel
2. Endpoint worker: channel -> reassembly endpoint -> verified outcomes

Resend commands flow back to the controller over a crossbeam channel. The
endpoint's timers run on the wall clock here, not on simulation ticks.
*/

use std::net::UdpSocket as StdUdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use shared::TierParams;

use crate::acquisition::AcquisitionEngine;
use crate::config::UdpConfig;
use crate::error::{Result, SimError};
use crate::impairment::NetworkImpairment;
use crate::pipeline::PipelineConfig;
use crate::reassembly::{EndpointStats, FrameOutcome, ReassemblyEndpoint};
use crate::source::TestPattern;
use crate::transport::{ControllerState, TransportController, TransportStats};

const MAX_DATAGRAM: usize = 65_536;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReceiverStats {
    pub datagrams: u64,
    pub bytes: u64,
    pub channel_drops: u64,
    pub recv_errors: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VerifyStats {
    pub delivered: u64,
    pub lost: u64,
    pub mismatched: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UdpReport {
    pub local_addr: String,
    pub frames_requested: u32,
    pub frames_started: u32,
    pub ticks: u64,
    pub elapsed_ms: u128,
    pub datagrams_sent: u64,
    pub send_errors: u64,
    pub receiver: ReceiverStats,
    pub frames: VerifyStats,
    pub transport: TransportStats,
    pub endpoint: EndpointStats,
}

pub struct UdpLoopback {
    pipeline: PipelineConfig,
    udp: UdpConfig,
    running: Arc<AtomicBool>,
}

impl UdpLoopback {
    pub fn new(pipeline: PipelineConfig, udp: UdpConfig) -> Result<Self> {
        pipeline.validate()?;
        if udp.channel_capacity == 0 {
            return Err(SimError::config("udp channel capacity must be non-zero"));
        }
        Ok(Self {
            pipeline,
            udp,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Clearing the flag stops the run gracefully (wired to Ctrl-C by the CLI)
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Stream `frames` test-pattern frames (0 = until stopped) across the socket
    pub fn run(&self, frames: u32, max_ticks: u64) -> Result<UdpReport> {
        let config = &self.pipeline;
        let started_at = Instant::now();

        let rx_socket = StdUdpSocket::bind((self.udp.bind_addr.as_str(), self.udp.port))?;
        rx_socket.set_nonblocking(true)?;
        socket2::SockRef::from(&rx_socket).set_recv_buffer_size(self.udp.recv_buffer_bytes)?;
        let local_addr = rx_socket.local_addr()?;
        info!("UDP endpoint bound to {}", local_addr);

        let tx_socket = StdUdpSocket::bind((self.udp.bind_addr.as_str(), 0))?;
        socket2::SockRef::from(&tx_socket).set_send_buffer_size(self.udp.recv_buffer_bytes)?;
        tx_socket.connect(local_addr)?;

        let (link_tx, link_rx) = bounded(config.link_capacity);
        let (net_tx, net_rx) = bounded(config.net_capacity);
        let (wire_tx, wire_rx) = bounded(config.net_capacity);
        let (cmd_tx, cmd_rx) = bounded(256);
        let (notify_tx, notify_rx) = unbounded();
        let (data_tx, data_rx) = bounded::<Bytes>(self.udp.channel_capacity);
        let (done_tx, done_rx) = bounded::<u32>(1);

        let mut engine = AcquisitionEngine::new(config.params, config.engine, Box::new(TestPattern), link_tx)?;
        for fault in &config.faults {
            engine.inject_fault(*fault);
        }
        let mut controller = TransportController::new(
            config.params,
            config.mode,
            config.transport,
            link_rx,
            net_tx,
            cmd_rx,
            notify_tx,
        )?;
        let mut impairment = NetworkImpairment::new(config.impairment, net_rx, wire_tx)?;
        let mut endpoint = ReassemblyEndpoint::new(config.params, config.reassembly, Some(cmd_tx))?;

        let first_frame = engine.registers().frame_count();
        endpoint.expect_from(first_frame);

        let endpoint_done = Arc::new(AtomicBool::new(false));
        let receiving = Arc::new(AtomicBool::new(true));

        let receiver_handle = {
            let receiving = Arc::clone(&receiving);
            let timeout = Duration::from_millis(self.udp.recv_timeout_ms);
            thread::spawn(move || -> Result<ReceiverStats> {
                let rt = Runtime::new()?;
                rt.block_on(Self::receiver_task(rx_socket, data_tx, receiving, timeout))
            })
        };

        let worker_handle = {
            let params = config.params;
            let endpoint_done = Arc::clone(&endpoint_done);
            let receiving = Arc::clone(&receiving);
            let linger = Duration::from_nanos(config.reassembly.timeout_ns);
            thread::spawn(move || {
                let frames = Self::endpoint_worker(&mut endpoint, &params, data_rx, done_rx, linger);
                receiving.store(false, Ordering::SeqCst);
                endpoint_done.store(true, Ordering::SeqCst);
                (frames, endpoint.stats())
            })
        };

        controller.start(frames)?;
        let mut ticks = 0u64;
        let mut datagrams_sent = 0u64;
        let mut send_errors = 0u64;
        let mut stop_sent = false;
        let mut reported = false;

        while !endpoint_done.load(Ordering::SeqCst) {
            if !stop_sent && (!self.running.load(Ordering::SeqCst) || ticks >= max_ticks) {
                warn!("Stopping the device after {} ticks", ticks);
                controller.stop();
                stop_sent = true;
            }

            engine.tick();
            controller.tick(&mut engine);
            impairment.pump();
            for datagram in wire_rx.try_iter() {
                match tx_socket.send(&datagram) {
                    Ok(_) => datagrams_sent += 1,
                    Err(e) => {
                        send_errors += 1;
                        debug!("send failed: {}", e);
                    }
                }
            }
            for event in notify_rx.try_iter() {
                debug!("controller: {:?}", event);
            }
            ticks += 1;

            if controller.state() == ControllerState::Idle {
                if !reported {
                    impairment.flush();
                    // a full channel means the worker already has a count
                    let _ = done_tx.try_send(engine.registers().frame_count());
                    reported = true;
                    info!("Device idle after {} ticks, waiting for the endpoint", ticks);
                }
                // only resend requests remain; stop spinning
                thread::sleep(Duration::from_micros(200));
            }
        }

        let receiver = receiver_handle
            .join()
            .map_err(|_| SimError::ThreadPanicked("udp receiver"))??;
        let (frames_stats, endpoint_stats) = worker_handle
            .join()
            .map_err(|_| SimError::ThreadPanicked("endpoint worker"))?;

        let report = UdpReport {
            local_addr: local_addr.to_string(),
            frames_requested: frames,
            frames_started: engine.registers().frame_count().wrapping_sub(first_frame),
            ticks,
            elapsed_ms: started_at.elapsed().as_millis(),
            datagrams_sent,
            send_errors,
            receiver,
            frames: frames_stats,
            transport: controller.stats(),
            endpoint: endpoint_stats,
        };
        info!(
            "UDP run: {} delivered, {} lost, {} mismatched in {} ms",
            report.frames.delivered, report.frames.lost, report.frames.mismatched, report.elapsed_ms
        );
        Ok(report)
    }

    async fn receiver_task(
        socket: StdUdpSocket,
        data_tx: Sender<Bytes>,
        receiving: Arc<AtomicBool>,
        timeout: Duration,
    ) -> Result<ReceiverStats> {
        let socket = UdpSocket::from_std(socket)?;
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let mut stats = ReceiverStats::default();

        while receiving.load(Ordering::SeqCst) {
            match tokio::time::timeout(timeout, socket.recv(&mut buffer)).await {
                Ok(Ok(len)) => {
                    stats.datagrams += 1;
                    stats.bytes += len as u64;
                    if data_tx.try_send(Bytes::copy_from_slice(&buffer[..len])).is_err() {
                        stats.channel_drops += 1;
                        warn!("Endpoint channel full, datagram dropped");
                    }
                }
                Ok(Err(e)) => {
                    stats.recv_errors += 1;
                    error!("UDP receive error: {}", e);
                }
                // timeout: re-check the running flag
                Err(_) => continue,
            }
        }
        debug!("receiver exiting after {} datagrams", stats.datagrams);
        Ok(stats)
    }

    fn endpoint_worker(
        endpoint: &mut ReassemblyEndpoint,
        params: &TierParams,
        data_rx: Receiver<Bytes>,
        done_rx: Receiver<u32>,
        linger: Duration,
    ) -> VerifyStats {
        let clock = Instant::now();
        let mut stats = VerifyStats::default();
        let mut finished_at: Option<Instant> = None;

        loop {
            let now = clock.elapsed().as_nanos() as u64;
            match data_rx.recv_timeout(Duration::from_millis(5)) {
                Ok(datagram) => endpoint.on_datagram(datagram, now),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if let Ok(count) = done_rx.try_recv() {
                if let Some(last) = count.checked_sub(1) {
                    endpoint.expect_through(last, now);
                }
                finished_at = Some(Instant::now());
            }
            endpoint.service(clock.elapsed().as_nanos() as u64);
            Self::drain_outcomes(endpoint, params, &mut stats);

            if let Some(at) = finished_at {
                if endpoint.pending() == 0 && data_rx.is_empty() {
                    break;
                }
                if at.elapsed() > linger {
                    warn!("Endpoint still waiting on {} frames, flushing", endpoint.pending());
                    break;
                }
            }
        }

        endpoint.flush();
        Self::drain_outcomes(endpoint, params, &mut stats);
        stats
    }

    fn drain_outcomes(endpoint: &mut ReassemblyEndpoint, params: &TierParams, stats: &mut VerifyStats) {
        while let Some(outcome) = endpoint.next_outcome() {
            match outcome {
                FrameOutcome::Delivered(frame) => {
                    stats.delivered += 1;
                    if let Some(at) = frame.first_mismatch(&TestPattern::expected(frame.number, params)) {
                        stats.mismatched += 1;
                        error!("Frame {} differs from the test pattern: {:?}", frame.number, at);
                    }
                }
                FrameOutcome::Lost { frame_number, reason, .. } => {
                    stats.lost += 1;
                    warn!("Frame {} lost: {:?}", frame_number, reason);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ScanMode, Tier};

    fn small_config() -> PipelineConfig {
        let params = TierParams {
            rows: 16,
            cols: 32,
            target_fps: 1000,
            ..Tier::Minimum.params()
        };
        let mut config = PipelineConfig::new(params, ScanMode::Continuous);
        config.transport.max_payload = 256;
        config.reassembly.max_payload = 256;
        config.reassembly.timeout_ns = 2_000_000_000;
        config
    }

    #[test]
    fn test_loopback_delivers_every_frame() {
        let loopback = UdpLoopback::new(small_config(), UdpConfig::default()).unwrap();
        let report = loopback.run(20, 1_000_000).unwrap();

        assert_eq!(report.frames_started, 20);
        assert_eq!(report.frames.delivered + report.frames.lost, 20);
        assert_eq!(report.frames.mismatched, 0);
        assert!(report.datagrams_sent >= 20 * 4);
        assert!(report.receiver.datagrams > 0);
    }

    #[test]
    fn test_cleared_flag_stops_free_run() {
        let loopback = UdpLoopback::new(small_config(), UdpConfig::default()).unwrap();
        loopback.running_flag().store(false, Ordering::SeqCst);
        let report = loopback.run(0, 1_000_000).unwrap();

        assert_eq!(report.frames.mismatched, 0);
        assert_eq!(
            report.frames.delivered + report.frames.lost,
            report.frames_started as u64
        );
    }

    #[test]
    fn test_zero_channel_rejected() {
        let udp = UdpConfig {
            channel_capacity: 0,
            ..UdpConfig::default()
        };
        assert!(UdpLoopback::new(small_config(), udp).is_err());
    }
}
