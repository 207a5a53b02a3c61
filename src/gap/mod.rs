//! GAP scheduler (C5): arbitrates between scanning and advertising on a single radio, since the
//! two are mutually exclusive on the hardware this stack targets.
//!
//! Like the bearer-layer's host, the scheduler doesn't drive the radio itself — it's polled by
//! [`Scheduler::update`] and returns a [`Cmd`] telling the caller what the radio should be doing
//! until the next call, following the same command pattern the rest of the stack uses to keep
//! radio/timer I/O out of the core state machines.

use heapless::binary_heap::{BinaryHeap, Max};
use heapless::consts::U8;

use crate::error::Error;
use crate::time::{Duration, Instant};

/// Default capacity of the scheduler's action queue.
pub type DefaultActionCapacity = U8;

/// Scan parameters.
#[derive(Debug, Copy, Clone)]
pub struct ScanParams {
    pub interval: Duration,
    pub window: Duration,
}

/// Per-packet advertise duration. `None` means fire-and-forget: the packet is sent once and the
/// action is immediately complete.
pub type AdvertiseDuration = Option<Duration>;

/// An advertise action: the PDU to send and how long to keep sending it.
#[derive(Debug, Copy, Clone)]
pub struct AdvertiseAction {
    pub pdu: [u8; 31],
    pub len: u8,
    pub duration: AdvertiseDuration,
}

enum Action {
    Scan(ScanParams),
    Advertise(AdvertiseAction),
}

/// Orders advertise actions above scan actions, and otherwise preserves insertion order via a
/// monotonically increasing sequence number (§4.5: "back-to-back advertises pop in insertion
/// order").
struct QueuedAction {
    action: Action,
    seq: u32,
}

impl QueuedAction {
    fn rank(&self) -> (u8, core::cmp::Reverse<u32>) {
        let class = match self.action {
            Action::Advertise(_) => 1,
            Action::Scan(_) => 0,
        };
        (class, core::cmp::Reverse(self.seq))
    }
}

impl PartialEq for QueuedAction {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}
impl Eq for QueuedAction {}
impl PartialOrd for QueuedAction {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedAction {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Scheduler run state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    StackInit,
    Ready,
    Scanning,
    Advertising,
}

/// What the radio should be doing until the scheduler is next polled.
#[derive(Debug, Copy, Clone)]
pub enum RadioCmd {
    Idle,
    Scan(ScanParams),
    Advertise(AdvertiseAction),
}

/// Returned by [`Scheduler::update`]: what to do with the radio, and when to call `update` again.
#[must_use]
#[derive(Debug, Copy, Clone)]
pub struct Cmd {
    pub radio: RadioCmd,
    pub next_update: Option<Instant>,
}

/// The cooperative action queue arbitrating between scan and advertise actions on one radio.
pub struct Scheduler<N: heapless::ArrayLength<QueuedAction> = DefaultActionCapacity> {
    state: State,
    queue: BinaryHeap<QueuedAction, N, Max>,
    next_seq: u32,
    has_scan_action: bool,
    continuous_scan: bool,
}

impl<N: heapless::ArrayLength<QueuedAction>> Scheduler<N> {
    /// Creates a scheduler. `continuous_scan` controls whether a scan action is kept running
    /// between advertises, or only (re-)added once the first advertise action arrives (§4.5).
    pub fn new(continuous_scan: bool) -> Self {
        Scheduler {
            state: State::StackInit,
            queue: BinaryHeap::new(),
            next_seq: 0,
            has_scan_action: false,
            continuous_scan,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Transitions out of `stack_init` once the radio collaborator is ready.
    pub fn mark_ready(&mut self) {
        if self.state == State::StackInit {
            self.state = State::Ready;
        }
    }

    fn push(&mut self, action: Action) -> Result<(), Error> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.queue
            .push(QueuedAction { action, seq })
            .map_err(|_| Error::Busy)
    }

    /// Queues a scan action. If continuous scanning is disabled, this is a no-op until the first
    /// advertise action arrives, at which point the scheduler appends one automatically.
    pub fn add_scan(&mut self, params: ScanParams) -> Result<(), Error> {
        self.has_scan_action = true;
        self.push(Action::Scan(params))
    }

    /// Queues an advertise action. If no scan action exists yet, one is appended automatically so
    /// the radio keeps alternating once continuous scanning is not requested directly.
    pub fn add_advertise(&mut self, action: AdvertiseAction) -> Result<(), Error> {
        self.push(Action::Advertise(action))?;
        if !self.has_scan_action && self.continuous_scan {
            // Deliberately not re-entrant: if this fails, the caller still queued its advertise.
            let _ = self.add_scan(ScanParams {
                interval: Duration::from_millis(100),
                window: Duration::from_millis(100),
            });
        }
        Ok(())
    }

    /// Called once the radio reports the current action has completed (advertise finished, or a
    /// scan window elapsed). Pops the next action and returns the resulting [`Cmd`].
    pub fn on_action_complete(&mut self, now: Instant) -> Cmd {
        match self.queue.pop() {
            Some(QueuedAction {
                action: Action::Advertise(adv),
                ..
            }) => {
                self.state = State::Advertising;
                Cmd {
                    radio: RadioCmd::Advertise(adv),
                    next_update: adv.duration.map(|d| now + d),
                }
            }
            Some(QueuedAction {
                action: Action::Scan(params),
                ..
            }) => {
                self.state = State::Scanning;
                Cmd {
                    radio: RadioCmd::Scan(params),
                    next_update: Some(now + params.window),
                }
            }
            None => {
                self.state = State::Ready;
                Cmd {
                    radio: RadioCmd::Idle,
                    next_update: None,
                }
            }
        }
    }

    /// Immediately preempts any running scan to start an advertise: "advertising takes priority
    /// over scanning; starting an advertise action stops any current scan" (§4.5).
    pub fn preempt_with_advertise(&mut self, action: AdvertiseAction, now: Instant) -> Cmd {
        self.state = State::Advertising;
        Cmd {
            radio: RadioCmd::Advertise(action),
            next_update: action.duration.map(|d| now + d),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(len: u8) -> AdvertiseAction {
        AdvertiseAction {
            pdu: [0u8; 31],
            len,
            duration: None,
        }
    }

    #[test]
    fn advertise_outranks_scan() {
        let mut sched: Scheduler = Scheduler::new(false);
        sched
            .add_scan(ScanParams {
                interval: Duration::from_millis(100),
                window: Duration::from_millis(100),
            })
            .unwrap();
        sched.add_advertise(adv(1)).unwrap();

        let now = Instant::from_raw_micros(0);
        let cmd = sched.on_action_complete(now);
        assert!(matches!(cmd.radio, RadioCmd::Advertise(_)));
    }

    #[test]
    fn back_to_back_advertises_are_fifo() {
        let mut sched: Scheduler = Scheduler::new(false);
        sched.add_advertise(adv(1)).unwrap();
        sched.add_advertise(adv(2)).unwrap();

        let now = Instant::from_raw_micros(0);
        let first = sched.on_action_complete(now);
        match first.radio {
            RadioCmd::Advertise(a) => assert_eq!(a.len, 1),
            _ => panic!("expected advertise"),
        }
    }

    #[test]
    fn saturation_is_busy() {
        use heapless::consts::U1;
        let mut sched: Scheduler<U1> = Scheduler::new(false);
        sched.add_advertise(adv(1)).unwrap();
        assert_eq!(sched.add_advertise(adv(2)), Err(Error::Busy));
    }
}
