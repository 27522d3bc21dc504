/*!
Golden link traces.

Runs a standalone acquisition engine for one single-shot frame of the test
pattern and captures the exact byte stream it puts on the sensor link, for
comparison against logic-analyzer captures of the hardware.
*/

use bytes::{Bytes, BytesMut};
use crossbeam_channel::bounded;
use tracing::debug;

use shared::registers::{addr, Control, LinkStatus};
use shared::tier::TICKS_PER_LINE;
use shared::{RegisterAccess, ScanMode, TierParams};

use crate::acquisition::{AcquisitionEngine, EngineOptions};
use crate::error::{Result, SimError};
use crate::scan_fsm::ScanState;
use crate::source::TestPattern;

/// Link bytes of frame 0 for `params`, exactly as the engine emits them
pub fn golden_trace(params: TierParams) -> Result<Bytes> {
    params.validate()?;
    let options = EngineOptions::default();
    let (link_tx, link_rx) = bounded(params.rows + 16);
    let mut engine = AcquisitionEngine::new(params, options, Box::new(TestPattern), link_tx)?;

    let timing = params.timing();
    let code = params
        .speed_code()
        .ok_or_else(|| SimError::config(format!("no speed code for {} Mbit/s", params.lane_speed_mbps)))?;
    engine.write(addr::GATE_ON, timing.gate_on_units);
    engine.write(addr::GATE_OFF, timing.gate_off_units);
    engine.write(addr::SCAN_MODE, ScanMode::Single.register_value());
    engine.write(addr::LINK_SPEED_SEL, code);
    while !engine.registers().link_status().contains(LinkStatus::PHY_READY) {
        engine.tick();
    }
    engine.write(addr::CONTROL, Control::START.bits());

    let budget = timing.ticks_for(timing.gate_total_ns()) + 2 * TICKS_PER_LINE * params.rows as u64 + 64;
    let mut stream = BytesMut::with_capacity(params.frame_bytes() + (params.rows + 2) * 8);
    let mut ticks = 0;
    loop {
        engine.read(addr::STATUS);
        engine.tick();
        for chunk in link_rx.try_iter() {
            stream.extend_from_slice(&chunk);
        }
        ticks += 1;

        let done = engine.state() == ScanState::Idle && engine.registers().frame_count() == 1 && !engine.link_busy();
        if done {
            break;
        }
        if let ScanState::Error(code) = engine.state() {
            return Err(SimError::config(format!("trace run faulted with {}", code)));
        }
        if ticks > budget {
            return Err(SimError::config(format!("trace run did not finish in {} ticks", budget)));
        }
    }
    debug!("golden trace: {} bytes in {} ticks", stream.len(), ticks);
    Ok(stream.freeze())
}
