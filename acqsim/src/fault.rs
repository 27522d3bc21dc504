/*!
Fault injection for the acquisition engine.

Each fault drives one of the engine's real detection paths instead of
setting a flag directly: a stalled sensor trips the readout timeout, a
stalled link drain trips the bank-collision overflow, and so on.
*/

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultKind {
    /// Sensor stops delivering pixels at `row` (readout timeout)
    SensorStall { row: usize },
    /// Packetizer holds the bank of `row` for `ticks` extra ticks (overflow)
    LinkStall { row: usize, ticks: u64 },
    /// Source output fails range/length validation (sensor fault)
    SensorFault,
    /// Link training does not complete on start (link init)
    LinkInit,
    /// One payload bit of `row` flips after the CRC was computed
    LinkBitError { row: usize },
}

/// How many times a fault fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persistence {
    Once,
    Times(u32),
    /// Fires on every cycle that reaches it
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSpec {
    #[serde(flatten)]
    pub kind: FaultKind,
    pub persistence: Persistence,
    /// First frame number the fault may fire on
    #[serde(default)]
    pub from_frame: u32,
}

impl FaultSpec {
    pub fn once(kind: FaultKind) -> Self {
        Self {
            kind,
            persistence: Persistence::Once,
            from_frame: 0,
        }
    }

    pub fn always(kind: FaultKind) -> Self {
        Self {
            kind,
            persistence: Persistence::Always,
            from_frame: 0,
        }
    }

    pub fn from_frame(mut self, frame_number: u32) -> Self {
        self.from_frame = frame_number;
        self
    }
}

#[derive(Debug, Clone)]
struct Armed {
    spec: FaultSpec,
    fired: u32,
}

impl Armed {
    fn exhausted(&self) -> bool {
        match self.spec.persistence {
            Persistence::Once => self.fired >= 1,
            Persistence::Times(n) => self.fired >= n,
            Persistence::Always => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    armed: Vec<Armed>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&mut self, spec: FaultSpec) {
        self.armed.push(Armed { spec, fired: 0 });
    }

    pub fn is_empty(&self) -> bool {
        self.armed.iter().all(Armed::exhausted)
    }

    /// Fire the first live fault matching `matches` for `frame_number`
    fn fire(&mut self, frame_number: u32, matches: impl Fn(&FaultKind) -> bool) -> Option<FaultKind> {
        let armed = self
            .armed
            .iter_mut()
            .find(|a| !a.exhausted() && frame_number >= a.spec.from_frame && matches(&a.spec.kind))?;
        armed.fired += 1;
        debug!("fault fired: {:?} on frame {} ({} times)", armed.spec.kind, frame_number, armed.fired);
        Some(armed.spec.kind)
    }

    pub fn sensor_stall(&mut self, frame_number: u32, row: usize) -> bool {
        self.fire(frame_number, |k| matches!(k, FaultKind::SensorStall { row: r } if *r == row))
            .is_some()
    }

    /// Extra drain ticks for the bank holding `row`
    pub fn link_stall(&mut self, frame_number: u32, row: usize) -> Option<u64> {
        match self.fire(frame_number, |k| matches!(k, FaultKind::LinkStall { row: r, .. } if *r == row)) {
            Some(FaultKind::LinkStall { ticks, .. }) => Some(ticks),
            _ => None,
        }
    }

    pub fn sensor_fault(&mut self, frame_number: u32) -> bool {
        self.fire(frame_number, |k| matches!(k, FaultKind::SensorFault)).is_some()
    }

    pub fn link_init(&mut self, frame_number: u32) -> bool {
        self.fire(frame_number, |k| matches!(k, FaultKind::LinkInit)).is_some()
    }

    pub fn bit_error(&mut self, frame_number: u32, row: usize) -> bool {
        self.fire(frame_number, |k| matches!(k, FaultKind::LinkBitError { row: r } if *r == row))
            .is_some()
    }
}
