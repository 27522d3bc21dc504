/*!
Double-buffered line store.

Two fixed row buffers. The readout side writes only the *active* bank; the
packetizer reads only a bank that was marked complete and handed off. A
swap is an index flip, never a copy. Writing a bank that has not been
drained yet is a collision and surfaces as the overflow error.
*/

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankState {
    Free,
    /// Filled by readout, waiting for the packetizer
    Ready,
    Draining,
}

/// Attempted write into a bank that is still owned by the drain side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collision {
    pub bank: usize,
    pub state: BankState,
}

#[derive(Debug)]
struct Bank {
    pixels: Vec<u16>,
    row: u16,
    state: BankState,
}

#[derive(Debug)]
pub struct LineStore {
    banks: [Bank; 2],
    active: usize,
    handoff: VecDeque<usize>,
}

impl LineStore {
    pub fn new(cols: usize) -> Self {
        let bank = || Bank {
            pixels: vec![0; cols],
            row: 0,
            state: BankState::Free,
        };
        Self {
            banks: [bank(), bank()],
            active: 0,
            handoff: VecDeque::with_capacity(2),
        }
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn state(&self, bank: usize) -> BankState {
        self.banks[bank].state
    }

    /// Whether the active bank can take the next row
    pub fn writable(&self) -> bool {
        self.banks[self.active].state == BankState::Free
    }

    /// Capture a row into the active bank and mark it complete
    pub fn write_row(&mut self, row: u16, pixels: &[u16]) -> Result<usize, Collision> {
        let index = self.active;
        let bank = &mut self.banks[index];
        if bank.state != BankState::Free {
            return Err(Collision {
                bank: index,
                state: bank.state,
            });
        }

        bank.pixels.copy_from_slice(pixels);
        bank.row = row;
        bank.state = BankState::Ready;
        self.handoff.push_back(index);
        Ok(index)
    }

    /// Flip active and standby
    pub fn swap(&mut self) {
        self.active ^= 1;
    }

    /// Completed banks not yet picked up by the packetizer
    pub fn pending(&self) -> usize {
        self.handoff.len()
    }

    /// Hand the oldest completed bank to the drain side
    pub fn take_ready(&mut self) -> Option<usize> {
        let index = self.handoff.pop_front()?;
        self.banks[index].state = BankState::Draining;
        Some(index)
    }

    /// Row number and pixels of a bank being drained
    pub fn bank(&self, index: usize) -> Option<(u16, &[u16])> {
        let bank = &self.banks[index];
        (bank.state == BankState::Draining).then_some((bank.row, bank.pixels.as_slice()))
    }

    /// Drain finished; the bank may be written again
    pub fn release(&mut self, index: usize) {
        if self.banks[index].state == BankState::Draining {
            self.banks[index].state = BankState::Free;
        }
    }

    /// Drop all in-flight rows (stop or error)
    pub fn reset(&mut self) {
        for bank in &mut self.banks {
            bank.state = BankState::Free;
        }
        self.handoff.clear();
        self.active = 0;
    }

    pub fn all_free(&self) -> bool {
        self.banks.iter().all(|bank| bank.state == BankState::Free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_pong_without_collision() {
        let mut store = LineStore::new(4);
        for row in 0..6u16 {
            let bank = store.write_row(row, &[row; 4]).unwrap();
            assert_eq!(bank, (row % 2) as usize);
            store.swap();
            let draining = store.take_ready().unwrap();
            let (drained_row, pixels) = store.bank(draining).unwrap();
            assert_eq!(drained_row, row);
            assert_eq!(pixels, &[row; 4]);
            store.release(draining);
        }
        assert!(store.all_free());
    }

    #[test]
    fn test_write_while_draining_is_collision() {
        let mut store = LineStore::new(2);
        store.write_row(0, &[1, 2]).unwrap();
        store.swap();
        let first = store.take_ready().unwrap();
        store.write_row(1, &[3, 4]).unwrap();
        store.swap();
        // bank 0 never released
        let err = store.write_row(2, &[5, 6]).unwrap_err();
        assert_eq!(err, Collision { bank: first, state: BankState::Draining });
    }

    #[test]
    fn test_undrained_ready_bank_is_collision() {
        let mut store = LineStore::new(1);
        store.write_row(0, &[1]).unwrap();
        store.swap();
        store.write_row(1, &[2]).unwrap();
        store.swap();
        assert_eq!(store.pending(), 2);
        assert!(!store.writable());
        assert!(store.write_row(2, &[3]).is_err());
    }

    #[test]
    fn test_bank_unreadable_until_handed_off() {
        let mut store = LineStore::new(1);
        store.write_row(0, &[9]).unwrap();
        assert_eq!(store.bank(0), None);
        let index = store.take_ready().unwrap();
        assert_eq!(store.bank(index), Some((0, &[9u16][..])));
    }

    #[test]
    fn test_reset_releases_everything() {
        let mut store = LineStore::new(1);
        store.write_row(0, &[1]).unwrap();
        store.swap();
        store.take_ready();
        store.reset();
        assert!(store.all_free());
        assert_eq!(store.pending(), 0);
        assert_eq!(store.active(), 0);
    }
}
