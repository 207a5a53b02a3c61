//! Sequence / IV store (C3): per-element sequence numbers and the global IV index update
//! state machine (§3, §4.3).

use crate::error::Error;
use crate::time::{iv_dwell, Instant};

/// Maximum value of the 24-bit sequence number.
pub const SEQ_MAX: u32 = 0x00FF_FFFF;

/// Per-element monotonic sequence counter.
///
/// On overflow the element must stop transmitting until a new IV index is negotiated (§3): once
/// [`SequenceCounter::use_next`] returns `Error::Resource`, the only way forward is an IV index
/// update, which resets the counter.
#[derive(Debug, Copy, Clone)]
pub struct SequenceCounter(u32);

impl SequenceCounter {
    pub fn new() -> Self {
        SequenceCounter(0)
    }

    /// Reads the current value without consuming it.
    pub fn get(&self) -> u32 {
        self.0
    }

    /// Sets the counter to an explicit value, e.g. when restoring from NVM.
    pub fn set(&mut self, seq: u32) {
        self.0 = seq & SEQ_MAX;
    }

    /// Reads and increments the counter, saturating at `SEQ_MAX`: once the counter has reached the
    /// maximum, further calls return `Error::Resource` rather than wrapping.
    pub fn use_next(&mut self) -> Result<u32, Error> {
        if self.0 > SEQ_MAX {
            return Err(Error::Resource);
        }
        let seq = self.0;
        if seq == SEQ_MAX {
            self.0 = SEQ_MAX + 1;
        } else {
            self.0 += 1;
        }
        Ok(seq)
    }

    /// Resets the counter to zero, as happens after an IV index update completes.
    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// The two-state IV index update state machine (§3).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IvUpdateState {
    Normal,
    InProgress,
}

/// Owns the global IV index and its update-state machine.
pub struct IvIndexStore {
    iv_index: u32,
    state: IvUpdateState,
    last_transition: Instant,
    sar_tx_in_flight: bool,
    pending_transition: bool,
}

impl IvIndexStore {
    /// Creates a store starting in the `normal` state at the given IV index, as if the last
    /// transition happened at `now` (so the dwell timer starts counting from construction/restore
    /// time).
    pub fn new(iv_index: u32, now: Instant) -> Self {
        IvIndexStore {
            iv_index,
            state: IvUpdateState::Normal,
            last_transition: now,
            sar_tx_in_flight: false,
            pending_transition: false,
        }
    }

    pub fn iv_index(&self) -> u32 {
        self.iv_index
    }

    pub fn state(&self) -> IvUpdateState {
        self.state
    }

    /// The IV index to use for transmission: one less than the current index while `in-progress`
    /// (§4.3: `iv_index_tx_get`).
    pub fn iv_index_tx_get(&self) -> u32 {
        match self.state {
            IvUpdateState::Normal => self.iv_index,
            IvUpdateState::InProgress => self.iv_index.wrapping_sub(1),
        }
    }

    /// Marks that a segmented (SAR) transmit is currently in flight. A requested transition is
    /// deferred until the final ack or timeout (§4.3).
    pub fn set_sar_tx_in_flight(&mut self, in_flight: bool) {
        self.sar_tx_in_flight = in_flight;
    }

    /// Attempts `normal → in-progress` or `in-progress → normal`, per the transit rules.
    ///
    /// If a SAR transmit is in flight, the request is remembered and should be retried via
    /// [`IvIndexStore::retry_pending_transition`] once the transmit finishes.
    pub fn transit(&mut self, target: IvUpdateState, now: Instant) -> Result<(), Error> {
        if self.sar_tx_in_flight {
            self.pending_transition = true;
            return Err(Error::Busy);
        }

        match (self.state, target) {
            (IvUpdateState::Normal, IvUpdateState::InProgress) => {
                if !now.has_elapsed_since(self.last_transition, iv_dwell::min_dwell()) {
                    return Err(Error::Timing);
                }
                self.iv_index = self.iv_index.wrapping_add(1);
                self.state = IvUpdateState::InProgress;
                self.last_transition = now;
                Ok(())
            }
            (IvUpdateState::InProgress, IvUpdateState::Normal) => {
                if !now.has_elapsed_since(self.last_transition, iv_dwell::min_dwell()) {
                    return Err(Error::Timing);
                }
                self.state = IvUpdateState::Normal;
                self.last_transition = now;
                Ok(())
            }
            _ => Err(Error::Already),
        }
    }

    /// Whether the `in-progress` state has exceeded its maximum dwell and must revert to `normal`
    /// regardless of sequence-space pressure (§3).
    pub fn exceeded_max_dwell(&self, now: Instant) -> bool {
        self.state == IvUpdateState::InProgress
            && now.has_elapsed_since(self.last_transition, iv_dwell::max_dwell())
    }

    /// Retries a transition that was deferred because a SAR transmit was in flight.
    pub fn retry_pending_transition(&mut self, now: Instant) -> Result<(), Error> {
        if !self.pending_transition {
            return Ok(());
        }
        let target = match self.state {
            IvUpdateState::Normal => IvUpdateState::InProgress,
            IvUpdateState::InProgress => IvUpdateState::Normal,
        };
        self.pending_transition = false;
        self.transit(target, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_saturates_rather_than_wraps() {
        let mut seq = SequenceCounter::new();
        seq.set(SEQ_MAX);
        assert_eq!(seq.use_next().unwrap(), SEQ_MAX);
        assert_eq!(seq.use_next(), Err(Error::Resource));
    }

    #[test]
    fn transition_requires_dwell() {
        let t0 = Instant::from_raw_micros(0);
        let mut store = IvIndexStore::new(10, t0);
        assert_eq!(
            store.transit(IvUpdateState::InProgress, t0),
            Err(Error::Timing)
        );

        let later = t0 + iv_dwell::min_dwell();
        assert!(store.transit(IvUpdateState::InProgress, later).is_ok());
        assert_eq!(store.iv_index(), 11);
        assert_eq!(store.iv_index_tx_get(), 10);
    }

    #[test]
    fn transition_deferred_during_sar() {
        let t0 = Instant::from_raw_micros(0);
        let mut store = IvIndexStore::new(10, t0);
        store.set_sar_tx_in_flight(true);
        let later = t0 + iv_dwell::min_dwell();
        assert_eq!(
            store.transit(IvUpdateState::InProgress, later),
            Err(Error::Busy)
        );
        store.set_sar_tx_in_flight(false);
        store.retry_pending_transition(later).unwrap();
        assert_eq!(store.state(), IvUpdateState::InProgress);
    }
}
