/*!
Reassembly endpoint: network receiver, slot arena and timeout handling.

Slots live in a fixed arena indexed by `frame_number % capacity` with linear
probing; buffers are allocated once and zero-filled on reuse. Each slot gets
one deadline in a min-heap keyed by `(deadline, generation, slot)`. Freeing
a slot bumps nothing in the heap: a stale entry is recognised by its
generation and skipped, which makes cancellation free.

Outcomes, delivered or lost, leave the endpoint in strictly increasing
frame order. Frame numbers that were skipped over entirely are tracked as
gaps so the loss is still accounted for.
*/

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};

use bytes::Bytes;
use crossbeam_channel::Sender;
use serde::Serialize;
use tracing::{debug, info, warn};

use shared::network::DEFAULT_MAX_PAYLOAD;
use shared::{Frame, NetworkPacket, ProtocolError, TierParams};

use crate::error::{Result, SimError};
use crate::transport::Command;

pub const DEFAULT_MAX_SLOTS: usize = 8;
pub const DEFAULT_TIMEOUT_NS: u64 = 1_500_000_000;
pub const DEFAULT_RESEND_DELAY_NS: u64 = 20_000_000;
pub const DEFAULT_MAX_RESEND_ROUNDS: u8 = 3;
pub const DEFAULT_MAX_RECOVERABLE_LOSS: f64 = 0.20;

/// Jumps larger than this restart the release sequence instead of opening gaps
const MAX_GAP_SPAN: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReassemblyConfig {
    pub max_slots: usize,
    pub timeout_ns: u64,
    /// Idle time before a slot with holes asks for a resend
    pub resend_delay_ns: u64,
    pub max_resend_rounds: u8,
    /// Missing fraction above which a frame is given up at a resend decision
    pub max_recoverable_loss: f64,
    pub max_payload: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_slots: DEFAULT_MAX_SLOTS,
            timeout_ns: DEFAULT_TIMEOUT_NS,
            resend_delay_ns: DEFAULT_RESEND_DELAY_NS,
            max_resend_rounds: DEFAULT_MAX_RESEND_ROUNDS,
            max_recoverable_loss: DEFAULT_MAX_RECOVERABLE_LOSS,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReason {
    /// Slot deadline passed, or the endpoint was flushed, with holes left
    Timeout,
    ExcessiveLoss,
    SenderDropped,
    Evicted,
    NeverReceived,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Delivered(Frame),
    Lost {
        frame_number: u32,
        reason: LossReason,
        /// Whatever had arrived, zero-filled elsewhere; never a valid frame
        partial: Option<Frame>,
    },
}

impl FrameOutcome {
    pub fn frame_number(&self) -> u32 {
        match self {
            FrameOutcome::Delivered(frame) => frame.number,
            FrameOutcome::Lost { frame_number, .. } => *frame_number,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, FrameOutcome::Delivered(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub datagrams: u64,
    pub crc_failures: u64,
    pub malformed: u64,
    pub duplicates: u64,
    pub late: u64,
    pub resend_requests: u64,
    pub evictions: u64,
    pub delivered: u64,
    pub lost_timeout: u64,
    pub lost_excessive: u64,
    pub lost_dropped: u64,
    pub lost_evicted: u64,
    pub lost_never_received: u64,
}

impl EndpointStats {
    pub fn lost(&self) -> u64 {
        self.lost_timeout + self.lost_excessive + self.lost_dropped + self.lost_evicted + self.lost_never_received
    }

    fn count_loss(&mut self, reason: LossReason) {
        match reason {
            LossReason::Timeout => self.lost_timeout += 1,
            LossReason::ExcessiveLoss => self.lost_excessive += 1,
            LossReason::SenderDropped => self.lost_dropped += 1,
            LossReason::Evicted => self.lost_evicted += 1,
            LossReason::NeverReceived => self.lost_never_received += 1,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    in_use: bool,
    frame_number: u32,
    generation: u64,
    buffer: Vec<u8>,
    received: Vec<bool>,
    received_count: usize,
    last_activity_ns: u64,
    resend_rounds: u8,
}

pub struct ReassemblyEndpoint {
    params: TierParams,
    config: ReassemblyConfig,
    fragment_count: usize,
    slots: Vec<Slot>,
    timeouts: BinaryHeap<Reverse<(u64, u64, usize)>>,
    generation: u64,
    next_release: Option<u32>,
    highest_seen: Option<u32>,
    finished: BTreeMap<u32, FrameOutcome>,
    gaps: BTreeMap<u32, u64>,
    released: VecDeque<FrameOutcome>,
    cmd_tx: Option<Sender<Command>>,
    stats: EndpointStats,
}

impl ReassemblyEndpoint {
    pub fn new(params: TierParams, config: ReassemblyConfig, cmd_tx: Option<Sender<Command>>) -> Result<Self> {
        params.validate()?;
        if config.max_slots == 0 {
            return Err(SimError::config("reassembly needs at least one slot"));
        }
        if config.max_payload == 0 || config.max_payload > u16::MAX as usize {
            return Err(SimError::config(format!("max payload {} out of range", config.max_payload)));
        }
        if !(0.0..=1.0).contains(&config.max_recoverable_loss) {
            return Err(SimError::config(format!(
                "recoverable loss {} outside 0..=1",
                config.max_recoverable_loss
            )));
        }

        let fragment_count = params.frame_bytes().div_ceil(config.max_payload);
        let slots = (0..config.max_slots).map(|_| Slot::default()).collect();
        info!(
            "Reassembly endpoint: {} slots, {} fragments per frame, timeout {} ms",
            config.max_slots,
            fragment_count,
            config.timeout_ns / 1_000_000
        );

        Ok(Self {
            params,
            config,
            fragment_count,
            slots,
            timeouts: BinaryHeap::new(),
            generation: 0,
            next_release: None,
            highest_seen: None,
            finished: BTreeMap::new(),
            gaps: BTreeMap::new(),
            released: VecDeque::new(),
            cmd_tx,
            stats: EndpointStats::default(),
        })
    }

    pub fn stats(&self) -> EndpointStats {
        self.stats
    }

    pub fn fragment_count(&self) -> usize {
        self.fragment_count
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    /// Frames not yet released: open slots, gaps and finished frames waiting on earlier ones
    pub fn pending(&self) -> usize {
        self.slots_in_use() + self.gaps.len() + self.finished.len()
    }

    /// First frame number the caller expects; anything earlier is late
    pub fn expect_from(&mut self, frame_number: u32) {
        self.next_release = Some(frame_number);
        self.highest_seen = frame_number.checked_sub(1);
        debug!("expecting frames from {}", frame_number);
    }

    /// Register frames up to `last` so ones that never show up are reported
    pub fn expect_through(&mut self, last: u32, now_ns: u64) {
        self.note_frame(last, now_ns);
        if self.find(last).is_none() && !self.is_settled(last) {
            self.gaps.entry(last).or_insert(now_ns);
        }
    }

    pub fn next_outcome(&mut self) -> Option<FrameOutcome> {
        self.released.pop_front()
    }

    pub fn on_datagram(&mut self, datagram: Bytes, now_ns: u64) {
        self.stats.datagrams += 1;
        let packet = match NetworkPacket::decode(datagram, self.config.max_payload) {
            Ok(packet) => packet,
            Err(ProtocolError::CrcMismatch { expected, computed }) => {
                self.stats.crc_failures += 1;
                debug!("datagram CRC mismatch (0x{:04X} vs 0x{:04X}), dropped", expected, computed);
                return;
            }
            Err(e) => {
                self.stats.malformed += 1;
                debug!("datagram rejected: {}", e);
                return;
            }
        };

        let frame_number = packet.header.frame_number;
        if self.is_settled(frame_number) {
            self.stats.late += 1;
            return;
        }
        self.note_frame(frame_number, now_ns);

        if packet.is_drop() {
            debug!("sender dropped frame {}", frame_number);
            match self.find(frame_number) {
                Some(idx) => self.finalize(idx, Some(LossReason::SenderDropped)),
                None => self.settle(
                    frame_number,
                    FrameOutcome::Lost {
                        frame_number,
                        reason: LossReason::SenderDropped,
                        partial: None,
                    },
                ),
            }
            return;
        }

        let index = packet.header.fragment_index as usize;
        let offset = index * self.config.max_payload;
        let expected_len = self.params.frame_bytes().saturating_sub(offset).min(self.config.max_payload);
        let last = index + 1 == self.fragment_count;
        if index >= self.fragment_count || packet.payload.len() != expected_len || packet.is_last() != last {
            self.stats.malformed += 1;
            debug!(
                "fragment {} of frame {} does not fit the frame layout ({} bytes)",
                index,
                frame_number,
                packet.payload.len()
            );
            return;
        }

        let idx = match self.find(frame_number) {
            Some(idx) => idx,
            None => self.allocate(frame_number, now_ns),
        };
        let slot = &mut self.slots[idx];
        if slot.received[index] {
            self.stats.duplicates += 1;
            return;
        }
        slot.buffer[offset..offset + expected_len].copy_from_slice(&packet.payload);
        slot.received[index] = true;
        slot.received_count += 1;
        slot.last_activity_ns = now_ns;

        if slot.received_count == self.fragment_count {
            self.finalize(idx, None);
        }
    }

    /// Expire deadlines and make resend decisions
    pub fn service(&mut self, now_ns: u64) {
        while let Some(&Reverse((deadline, generation, idx))) = self.timeouts.peek() {
            if deadline > now_ns {
                break;
            }
            self.timeouts.pop();
            let slot = &self.slots[idx];
            if slot.in_use && slot.generation == generation {
                warn!(
                    "Frame {} timed out with {}/{} fragments",
                    slot.frame_number, slot.received_count, self.fragment_count
                );
                self.finalize(idx, Some(LossReason::Timeout));
            }
        }

        for idx in 0..self.slots.len() {
            let slot = &self.slots[idx];
            if !slot.in_use
                || now_ns.saturating_sub(slot.last_activity_ns) < self.config.resend_delay_ns
                || slot.resend_rounds >= self.config.max_resend_rounds
            {
                continue;
            }

            let missing: Vec<u32> = slot
                .received
                .iter()
                .enumerate()
                .filter(|&(_, &got)| !got)
                .map(|(i, _)| i as u32)
                .collect();
            let fraction = missing.len() as f64 / self.fragment_count as f64;
            if fraction > self.config.max_recoverable_loss {
                debug!(
                    "frame {} missing {:.0}% of its fragments, giving up",
                    slot.frame_number,
                    fraction * 100.0
                );
                self.finalize(idx, Some(LossReason::ExcessiveLoss));
                continue;
            }

            let frame_number = slot.frame_number;
            let slot = &mut self.slots[idx];
            slot.resend_rounds += 1;
            slot.last_activity_ns = now_ns;
            self.stats.resend_requests += 1;
            debug!("requesting {} fragments of frame {}", missing.len(), frame_number);
            if let Some(tx) = &self.cmd_tx {
                let _ = tx.try_send(Command::Resend {
                    frame_number,
                    fragments: missing,
                });
            }
        }

        let expired: Vec<u32> = self
            .gaps
            .iter()
            .filter(|&(_, &noticed)| now_ns.saturating_sub(noticed) >= self.config.resend_delay_ns)
            .map(|(&n, _)| n)
            .collect();
        for frame_number in expired {
            debug!("frame {} never arrived", frame_number);
            self.settle(
                frame_number,
                FrameOutcome::Lost {
                    frame_number,
                    reason: LossReason::NeverReceived,
                    partial: None,
                },
            );
        }
    }

    /// Finalize every open slot and gap; open slots count as timed out
    pub fn flush(&mut self) {
        let mut open: Vec<(u32, usize)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use)
            .map(|(i, s)| (s.frame_number, i))
            .collect();
        open.sort_unstable();
        for (_, idx) in open {
            self.finalize(idx, Some(LossReason::Timeout));
        }

        let gaps: Vec<u32> = self.gaps.keys().copied().collect();
        for frame_number in gaps {
            self.settle(
                frame_number,
                FrameOutcome::Lost {
                    frame_number,
                    reason: LossReason::NeverReceived,
                    partial: None,
                },
            );
        }
        self.timeouts.clear();

        // anything still parked has no predecessor left to wait for
        while let Some((_, outcome)) = self.finished.pop_first() {
            self.next_release = outcome.frame_number().checked_add(1);
            self.released.push_back(outcome);
        }
    }

    fn is_settled(&self, frame_number: u32) -> bool {
        self.next_release.is_some_and(|next| frame_number < next) || self.finished.contains_key(&frame_number)
    }

    fn find(&self, frame_number: u32) -> Option<usize> {
        let capacity = self.slots.len();
        let start = frame_number as usize % capacity;
        (0..capacity)
            .map(|k| (start + k) % capacity)
            .find(|&idx| self.slots[idx].in_use && self.slots[idx].frame_number == frame_number)
    }

    /// Track the highest frame seen and open gaps for anything skipped
    fn note_frame(&mut self, frame_number: u32, now_ns: u64) {
        let next = *self.next_release.get_or_insert(frame_number);
        let from = match self.highest_seen {
            // nothing numbers above the last frame of the sequence
            Some(highest) => match highest.checked_add(1) {
                Some(from) => from,
                None => return,
            },
            None => next,
        };
        if frame_number < from {
            return;
        }

        if frame_number - from > MAX_GAP_SPAN {
            warn!(
                "Frame number jumped from {} to {}, restarting the release sequence",
                from, frame_number
            );
            self.flush();
            self.next_release = Some(frame_number);
        } else {
            for missing in from..frame_number {
                if self.find(missing).is_none() && !self.is_settled(missing) {
                    self.gaps.insert(missing, now_ns);
                }
            }
        }
        self.highest_seen = Some(frame_number);
    }

    fn allocate(&mut self, frame_number: u32, now_ns: u64) -> usize {
        let capacity = self.slots.len();
        let start = frame_number as usize % capacity;
        let free = (0..capacity)
            .map(|k| (start + k) % capacity)
            .find(|&idx| !self.slots[idx].in_use);

        let idx = match free {
            Some(idx) => idx,
            None => {
                let (oldest, idx) = self
                    .slots
                    .iter()
                    .enumerate()
                    .map(|(i, s)| (s.frame_number, i))
                    .min()
                    .unwrap_or((frame_number, start));
                warn!("Slot arena full, evicting frame {} for frame {}", oldest, frame_number);
                self.stats.evictions += 1;
                self.finalize(idx, Some(LossReason::Evicted));
                idx
            }
        };

        self.generation += 1;
        let frame_bytes = self.params.frame_bytes();
        let slot = &mut self.slots[idx];
        slot.in_use = true;
        slot.frame_number = frame_number;
        slot.generation = self.generation;
        slot.buffer.clear();
        slot.buffer.resize(frame_bytes, 0);
        slot.received.clear();
        slot.received.resize(self.fragment_count, false);
        slot.received_count = 0;
        slot.last_activity_ns = now_ns;
        slot.resend_rounds = 0;

        self.timeouts
            .push(Reverse((now_ns + self.config.timeout_ns, self.generation, idx)));
        self.gaps.remove(&frame_number);
        idx
    }

    /// Close a slot; `None` means every fragment arrived
    fn finalize(&mut self, idx: usize, loss: Option<LossReason>) {
        let slot = &mut self.slots[idx];
        slot.in_use = false;
        let frame_number = slot.frame_number;
        let frame = Frame::from_le_bytes(frame_number, &self.params, &slot.buffer);

        let outcome = match (loss, frame) {
            (None, Ok(frame)) => FrameOutcome::Delivered(frame),
            (None, Err(e)) => {
                warn!("Frame {} reassembled but failed validation: {}", frame_number, e);
                FrameOutcome::Lost {
                    frame_number,
                    reason: LossReason::ExcessiveLoss,
                    partial: None,
                }
            }
            (Some(reason), frame) => FrameOutcome::Lost {
                frame_number,
                reason,
                partial: frame.ok(),
            },
        };
        self.settle(frame_number, outcome);
    }

    fn settle(&mut self, frame_number: u32, outcome: FrameOutcome) {
        match &outcome {
            FrameOutcome::Delivered(_) => {
                self.stats.delivered += 1;
                debug!("frame {} complete", frame_number);
            }
            FrameOutcome::Lost { reason, .. } => {
                self.stats.count_loss(*reason);
                info!("Frame {} lost: {:?}", frame_number, reason);
            }
        }
        self.gaps.remove(&frame_number);
        self.finished.insert(frame_number, outcome);

        while let Some(next) = self.next_release {
            let Some(outcome) = self.finished.remove(&next) else {
                break;
            };
            self.released.push_back(outcome);
            self.next_release = next.checked_add(1);
        }
    }
}
