//! Async mailbox (C15): decouples timer/IRQ callbacks from the main loop.
//!
//! Mirrors [`crate::gap`]'s command-return pattern from the other direction: instead of the main
//! loop telling a real-time collaborator what to do next, a real-time collaborator (a platform
//! timer callback, or the radio's receive IRQ by way of [`crate::bearer::BearerTable`]) posts a
//! tagged [`Event`] into this queue, and the main loop drains it in FIFO order on its own time.
//! No handler invoked while draining may re-enter the drain loop synchronously — doing so would
//! re-enter a borrow of the queue that's already in use.
//!
//! The queue interface itself (`PacketQueue`/`Producer`/`Consumer`) is modeled directly on
//! `rubble::link::queue`: a splittable SPSC queue, here carrying small fixed-size `Event` values
//! instead of raw data-channel PDU bytes, since mailbox messages never need more than a handful
//! of bytes.

use heapless::consts::U8;
use heapless::spsc::{self, MultiCore};

/// Identifies one PB-ADV link, for events scoped to a single link.
pub type LinkId = u8;
/// Identifies one lower-transport TX or RX task, for events scoped to a single task.
pub type TaskId = u8;

/// A tagged message posted into the mailbox by a timer callback or IRQ handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    /// PB-ADV link-open or transaction retry timer fired for the given link (§4.13).
    PbAdvRetry(LinkId),
    /// PB-ADV link idle/retry budget was exhausted; the link is considered lost (§4.13).
    PbAdvLinkLoss(LinkId),
    /// A lower-transport TX task's retry timer fired (§4.9).
    LowerTxRetry(TaskId),
    /// A lower-transport RX task's ack timer fired (interim partial block-ack, §4.9).
    LowerRxAck(TaskId),
    /// A lower-transport RX task's incomplete timer fired (10 s of silence, §4.9).
    LowerRxIncomplete(TaskId),
    /// A lower-transport RX task's post-completion store timer fired, freeing the task (§3).
    LowerRxStoreExpired(TaskId),
    /// The periodic secure-network-beacon / unprovisioned-device-beacon timer fired (§4.12).
    BeaconTick,
    /// The IV index max-dwell timer fired; the store should check `exceeded_max_dwell` (§4.3).
    IvIndexTick,
}

/// Default mailbox capacity.
pub type DefaultMailboxCapacity = U8;

/// A splittable SPSC queue of mailbox [`Event`]s.
///
/// Implementations must hold at least one event. A platform integration supplies its `Config`
/// with a type implementing this trait (typically [`SimpleMailbox`]); the stack never constructs
/// one itself, matching the timer/IRQ collaborator boundary (§6).
pub trait PacketQueue {
    type Producer: Producer;
    type Consumer: Consumer;

    fn split(self) -> (Self::Producer, Self::Consumer);
}

/// The producing (writing) half of a mailbox, used from timer/IRQ context.
pub trait Producer {
    /// Posts `event`. Returns `false` if the queue is full and the event was dropped.
    fn post(&mut self, event: Event) -> bool;
}

/// The consuming (reading) half of a mailbox, drained by the main loop.
pub trait Consumer {
    /// Returns whether at least one event is queued.
    fn has_events(&self) -> bool;

    /// Removes and returns the oldest queued event, if any.
    fn poll(&mut self) -> Option<Event>;
}

/// A simple, fixed-capacity mailbox suitable for single-core or `thumbv6`-class targets.
pub struct SimpleMailbox<N: heapless::ArrayLength<Event> = DefaultMailboxCapacity> {
    inner: spsc::Queue<Event, N, u8, MultiCore>,
}

impl<N: heapless::ArrayLength<Event>> SimpleMailbox<N> {
    pub fn new() -> Self {
        SimpleMailbox {
            inner: spsc::Queue(heapless::i::Queue::u8()),
        }
    }
}

impl<N: heapless::ArrayLength<Event>> Default for SimpleMailbox<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, N: heapless::ArrayLength<Event>> PacketQueue for &'a mut SimpleMailbox<N> {
    type Producer = SimpleProducer<'a, N>;
    type Consumer = SimpleConsumer<'a, N>;

    fn split(self) -> (Self::Producer, Self::Consumer) {
        let (p, c) = self.inner.split();
        (SimpleProducer { inner: p }, SimpleConsumer { inner: c })
    }
}

pub struct SimpleProducer<'a, N: heapless::ArrayLength<Event>> {
    inner: spsc::Producer<'a, Event, N, u8, MultiCore>,
}

impl<'a, N: heapless::ArrayLength<Event>> Producer for SimpleProducer<'a, N> {
    fn post(&mut self, event: Event) -> bool {
        self.inner.enqueue(event).is_ok()
    }
}

pub struct SimpleConsumer<'a, N: heapless::ArrayLength<Event>> {
    inner: spsc::Consumer<'a, Event, N, u8, MultiCore>,
}

impl<'a, N: heapless::ArrayLength<Event>> Consumer for SimpleConsumer<'a, N> {
    fn has_events(&self) -> bool {
        self.inner.ready()
    }

    fn poll(&mut self) -> Option<Event> {
        self.inner.dequeue()
    }
}

/// Runs a conformance suite against a freshly split, empty `(Producer, Consumer)` pair: events
/// drain in FIFO order and an empty queue reports no events. Mirrors the pattern used by
/// [`crate::ecdh::run_tests`] for downstream `PacketQueue` implementors to call from their own
/// `#[test]` functions.
pub fn run_tests(mut producer: impl Producer, mut consumer: impl Consumer) {
    assert!(!consumer.has_events());
    assert_eq!(consumer.poll(), None);

    assert!(producer.post(Event::BeaconTick));
    assert!(producer.post(Event::IvIndexTick));
    assert!(consumer.has_events());

    assert_eq!(consumer.poll(), Some(Event::BeaconTick));
    assert_eq!(consumer.poll(), Some(Event::IvIndexTick));
    assert!(!consumer.has_events());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_mailbox_fifo() {
        let mut mailbox: SimpleMailbox = SimpleMailbox::new();
        let (p, c) = mailbox.split();
        run_tests(p, c);
    }

    #[test]
    fn overflow_is_dropped_not_panicking() {
        use heapless::consts::U1;
        let mut mailbox: SimpleMailbox<U1> = SimpleMailbox::new();
        let (mut p, _c) = mailbox.split();
        assert!(p.post(Event::BeaconTick));
        assert!(!p.post(Event::IvIndexTick));
    }
}
