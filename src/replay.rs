//! Replay cache (C4): the network message cache (NMC) and replay protection list (RPL) (§3, §4.4).

use heapless::consts::U32;
use heapless::Vec;

use crate::utils::iv_seq_greater;

/// Default NMC ring capacity.
pub type DefaultNmcCapacity = U32;
/// Default RPL table capacity.
pub type DefaultRplCapacity = U32;

/// Bounded ring buffer of recently processed `(src, seq)` pairs, for immediate duplicate
/// suppression within a short window.
pub struct Nmc<N: heapless::ArrayLength<(u16, u32)> = DefaultNmcCapacity> {
    entries: Vec<(u16, u32), N>,
    next: usize,
}

impl<N: heapless::ArrayLength<(u16, u32)>> Nmc<N> {
    pub fn new() -> Self {
        Nmc {
            entries: Vec::new(),
            next: 0,
        }
    }

    /// Returns `true` and records `(src, seq)` if not already present (accepted); returns `false`
    /// without modifying the cache if it's a duplicate (§4.4: `nmc_check`).
    pub fn check(&mut self, src: u16, seq: u32) -> bool {
        if self.entries.iter().any(|&(s, q)| s == src && q == seq) {
            return false;
        }

        if self.entries.push((src, seq)).is_err() {
            // Ring is full: overwrite the oldest entry.
            self.entries[self.next] = (src, seq);
            self.next = (self.next + 1) % self.entries.capacity();
        } else if self.entries.len() == self.entries.capacity() {
            self.next = 0;
        }
        true
    }
}

impl<N: heapless::ArrayLength<(u16, u32)>> Default for Nmc<N> {
    fn default() -> Self {
        Self::new()
    }
}

struct RplEntry {
    src: u16,
    seq: u32,
    iv_index: u32,
}

/// `(src, seq, iv_index)` table keyed by `src`, retaining the highest `(iv_index, seq)` pair seen
/// for each source. Rejects any candidate that isn't strictly greater than the stored tuple.
///
/// Bounded; overflow fails closed, i.e. a brand-new `src` is rejected once the table is full rather
/// than evicting an existing entry (§4.4: "RPL overflow fails closed").
pub struct Rpl<N: heapless::ArrayLength<RplEntry> = DefaultRplCapacity> {
    entries: Vec<RplEntry, N>,
}

impl<N: heapless::ArrayLength<RplEntry>> Rpl<N> {
    pub fn new() -> Self {
        Rpl {
            entries: Vec::new(),
        }
    }

    /// Accepts `(src, seq, iv)` iff `(iv, seq) > stored(iv, seq)` for `src`, then records it
    /// (§3 invariant, §4.4: `rpl_check_and_update`).
    pub fn check_and_update(&mut self, src: u16, seq: u32, iv_index: u32) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.src == src) {
            if iv_seq_greater(iv_index, seq, entry.iv_index, entry.seq) {
                entry.seq = seq;
                entry.iv_index = iv_index;
                true
            } else {
                false
            }
        } else {
            self.entries
                .push(RplEntry { src, seq, iv_index })
                .is_ok()
        }
    }

    /// Removes every entry, as happens on `Node::reset()`.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: heapless::ArrayLength<RplEntry>> Default for Rpl<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmc_rejects_exact_duplicate() {
        let mut nmc: Nmc = Nmc::new();
        assert!(nmc.check(1, 100));
        assert!(!nmc.check(1, 100));
        assert!(nmc.check(1, 101));
    }

    #[test]
    fn rpl_requires_strictly_greater() {
        let mut rpl: Rpl = Rpl::new();
        assert!(rpl.check_and_update(1, 10, 0));
        assert!(!rpl.check_and_update(1, 10, 0));
        assert!(!rpl.check_and_update(1, 5, 0));
        assert!(rpl.check_and_update(1, 11, 0));
        assert!(rpl.check_and_update(1, 0, 1));
    }

    #[test]
    fn rpl_overflow_fails_closed() {
        use heapless::consts::U1;
        let mut rpl: Rpl<U1> = Rpl::new();
        assert!(rpl.check_and_update(1, 1, 0));
        assert!(!rpl.check_and_update(2, 1, 0));
    }
}
