/*!
Seeded network impairment between the transport controller and the
reassembly endpoint: packet loss, bounded reordering and single-byte
corruption. The same seed always produces the same damage.
*/

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SimError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpairmentConfig {
    /// Probability that a datagram disappears
    pub loss_rate: f64,
    /// Datagrams held back for shuffling; 0 keeps order
    pub reorder_window: usize,
    /// Probability that one byte of a datagram is flipped
    pub corrupt_rate: f64,
    pub seed: u64,
}

impl Default for ImpairmentConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            reorder_window: 0,
            corrupt_rate: 0.0,
            seed: 0x5EED,
        }
    }
}

impl ImpairmentConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, p) in [("loss_rate", self.loss_rate), ("corrupt_rate", self.corrupt_rate)] {
            if !(0.0..=1.0).contains(&p) {
                return Err(SimError::config(format!("{} {} outside 0..=1", name, p)));
            }
        }
        Ok(())
    }

    pub fn is_clean(&self) -> bool {
        self.loss_rate == 0.0 && self.corrupt_rate == 0.0 && self.reorder_window == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImpairmentStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub corrupted: u64,
    pub held_back: u64,
    pub queue_full: u64,
}

pub struct NetworkImpairment {
    config: ImpairmentConfig,
    rng: StdRng,
    input: Receiver<Bytes>,
    output: Sender<Bytes>,
    held: Vec<Bytes>,
    stats: ImpairmentStats,
}

impl NetworkImpairment {
    pub fn new(config: ImpairmentConfig, input: Receiver<Bytes>, output: Sender<Bytes>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            rng: StdRng::seed_from_u64(config.seed),
            input,
            output,
            held: Vec::with_capacity(config.reorder_window + 1),
            stats: ImpairmentStats::default(),
        })
    }

    pub fn stats(&self) -> ImpairmentStats {
        self.stats
    }

    /// Datagrams currently held back
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Move everything waiting on the input through the impairments
    pub fn pump(&mut self) -> usize {
        let mut moved = 0;
        while let Ok(datagram) = self.input.try_recv() {
            moved += 1;
            if self.config.loss_rate > 0.0 && self.rng.random_bool(self.config.loss_rate) {
                self.stats.dropped += 1;
                continue;
            }
            let datagram = self.maybe_corrupt(datagram);

            if self.config.reorder_window == 0 {
                self.forward(datagram);
                continue;
            }
            self.held.push(datagram);
            self.stats.held_back += 1;
            if self.held.len() > self.config.reorder_window {
                self.release_one();
            }
        }

        // quiet input lets held datagrams trickle out
        if moved == 0 && !self.held.is_empty() {
            self.release_one();
        }
        moved
    }

    /// Release everything still held, in shuffled order
    pub fn flush(&mut self) {
        while !self.held.is_empty() {
            self.release_one();
        }
    }

    fn maybe_corrupt(&mut self, datagram: Bytes) -> Bytes {
        if self.config.corrupt_rate == 0.0 || datagram.is_empty() || !self.rng.random_bool(self.config.corrupt_rate) {
            return datagram;
        }
        let mut raw = datagram.to_vec();
        let at = self.rng.random_range(0..raw.len());
        raw[at] ^= 1 << self.rng.random_range(0..8u32);
        self.stats.corrupted += 1;
        debug!("corrupted byte {} of a {}-byte datagram", at, raw.len());
        Bytes::from(raw)
    }

    fn release_one(&mut self) {
        let pick = self.rng.random_range(0..self.held.len());
        let datagram = self.held.swap_remove(pick);
        self.forward(datagram);
    }

    fn forward(&mut self, datagram: Bytes) {
        match self.output.try_send(datagram) {
            Ok(()) => self.stats.forwarded += 1,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => self.stats.queue_full += 1,
        }
    }
}
