/*!
Network fragmenter and retransmit history of the transport controller.

Rows arrive from the link one at a time; the fragmenter appends them to a
pending buffer and cuts a fragment every time `max_payload` bytes are
available. Only the final fragment of a frame may be short, and it is the
only one flagged LAST. Cut fragments share storage with the pending buffer
(`BytesMut::split_to`), so the history keeps them without copying.
*/

use std::collections::VecDeque;

use bytes::BytesMut;
use serde::Serialize;
use tracing::debug;

use shared::{NetworkPacket, ProtocolError};

use crate::error::{Result, SimError};

/// Frames kept for selective retransmission by default
pub const DEFAULT_HISTORY_FRAMES: usize = 4;

#[derive(Debug)]
struct InFlight {
    frame_number: u32,
    total_bytes: usize,
    received_bytes: usize,
    sent_bytes: usize,
    next_index: u32,
    pending: BytesMut,
}

#[derive(Debug)]
pub struct Fragmenter {
    max_payload: usize,
    current: Option<InFlight>,
}

impl Fragmenter {
    pub fn new(max_payload: usize) -> Result<Self> {
        if max_payload == 0 || max_payload > u16::MAX as usize {
            return Err(SimError::config(format!(
                "max payload {} outside 1..={}",
                max_payload,
                u16::MAX
            )));
        }
        Ok(Self {
            max_payload,
            current: None,
        })
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Fragments needed for a frame of `frame_bytes`
    pub fn fragment_count(&self, frame_bytes: usize) -> usize {
        frame_bytes.div_ceil(self.max_payload)
    }

    pub fn in_flight(&self) -> Option<u32> {
        self.current.as_ref().map(|f| f.frame_number)
    }

    /// Start a new frame; returns the frame it displaced, if any
    pub fn begin(&mut self, frame_number: u32, total_bytes: usize) -> Option<u32> {
        let displaced = self.abort();
        self.current = Some(InFlight {
            frame_number,
            total_bytes,
            received_bytes: 0,
            sent_bytes: 0,
            next_index: 0,
            pending: BytesMut::with_capacity(self.max_payload * 2),
        });
        displaced
    }

    /// Append one row; returns the fragments that became complete
    pub fn push_row(&mut self, row: &[u8], timestamp_ns: u64) -> Result<Vec<NetworkPacket>> {
        let max_payload = self.max_payload;
        let frame = self
            .current
            .as_mut()
            .ok_or_else(|| ProtocolError::invalid_frame("row pushed with no frame in flight"))?;

        if frame.received_bytes + row.len() > frame.total_bytes {
            return Err(ProtocolError::invalid_frame(format!(
                "frame {} overrun: {} + {} bytes exceeds {}",
                frame.frame_number,
                frame.received_bytes,
                row.len(),
                frame.total_bytes
            ))
            .into());
        }
        frame.pending.extend_from_slice(row);
        frame.received_bytes += row.len();

        let mut packets = Vec::new();
        loop {
            let all_in = frame.received_bytes == frame.total_bytes;
            if frame.pending.len() < max_payload && !(all_in && !frame.pending.is_empty()) {
                break;
            }
            let take = frame.pending.len().min(max_payload);
            let payload = frame.pending.split_to(take).freeze();
            frame.sent_bytes += take;
            let last = frame.sent_bytes == frame.total_bytes;
            packets.push(NetworkPacket::data(
                frame.frame_number,
                frame.next_index,
                last,
                payload,
                timestamp_ns,
            ));
            frame.next_index += 1;
        }

        if frame.sent_bytes == frame.total_bytes {
            debug!("frame {} fragmented into {} packets", frame.frame_number, frame.next_index);
            self.current = None;
        }
        Ok(packets)
    }

    /// Abandon the frame in flight
    pub fn abort(&mut self) -> Option<u32> {
        self.current.take().map(|f| f.frame_number)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub frames_recorded: u64,
    pub frames_evicted: u64,
}

/// Bounded per-frame store of sent fragments
#[derive(Debug)]
pub struct RetransmitHistory {
    capacity: usize,
    frames: VecDeque<(u32, Vec<NetworkPacket>)>,
    stats: HistoryStats,
}

impl RetransmitHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            frames: VecDeque::with_capacity(capacity.max(1)),
            stats: HistoryStats::default(),
        }
    }

    pub fn record(&mut self, packet: &NetworkPacket) {
        let frame_number = packet.header.frame_number;
        if let Some((_, fragments)) = self.frames.iter_mut().find(|(n, _)| *n == frame_number) {
            fragments.push(packet.clone());
            return;
        }

        if self.frames.len() == self.capacity {
            if let Some((evicted, _)) = self.frames.pop_front() {
                debug!("history evicted frame {}", evicted);
                self.stats.frames_evicted += 1;
            }
        }
        self.frames.push_back((frame_number, vec![packet.clone()]));
        self.stats.frames_recorded += 1;
    }

    pub fn contains(&self, frame_number: u32) -> bool {
        self.frames.iter().any(|(n, _)| *n == frame_number)
    }

    pub fn fragment(&self, frame_number: u32, index: u32) -> Option<&NetworkPacket> {
        self.frames
            .iter()
            .find(|(n, _)| *n == frame_number)
            .and_then(|(_, fragments)| fragments.iter().find(|p| p.header.fragment_index == index))
    }

    /// Forget a frame that was abandoned mid-stream
    pub fn discard(&mut self, frame_number: u32) {
        self.frames.retain(|(n, _)| *n != frame_number);
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn stats(&self) -> HistoryStats {
        self.stats
    }
}
