/*!
# Acquisition Pipeline Simulator

Tick-driven model of the three tiers of the imaging acquisition chain:

- **Acquisition engine** - scan state machine, double-buffered line store
  and link packetizer behind a register file
- **Transport controller** - link decoding, network fragmentation,
  retransmit history and the polling / recovery state machine
- **Reassembly endpoint** - bounded slot arena, per-frame timeouts,
  selective resend requests and ordered frame release

[`pipeline::Pipeline`] wires the tiers together with an optional
[`impairment::NetworkImpairment`] between controller and endpoint;
[`udp::UdpLoopback`] runs the same chain over a real loopback socket.
*/

pub mod acquisition;
pub mod config;
pub mod error;
pub mod fault;
pub mod fragmenter;
pub mod impairment;
pub mod line_store;
pub mod pipeline;
pub mod reassembly;
pub mod scan_fsm;
pub mod source;
pub mod trace;
pub mod transport;
pub mod udp;

pub use acquisition::{AcquisitionEngine, EngineOptions};
pub use config::AppConfig;
pub use error::{Result, SimError};
pub use fault::{FaultKind, FaultSpec, Persistence};
pub use pipeline::{Pipeline, PipelineConfig, RunReport};
pub use reassembly::{FrameOutcome, LossReason, ReassemblyEndpoint};
pub use source::{PixelSource, TestPattern};
pub use transport::{Notification, TransportController};
pub use udp::UdpLoopback;
