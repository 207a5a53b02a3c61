//! Stack configuration trait.

use crate::crypto::CryptoProvider;
use crate::ecdh::EcdhProvider;
use crate::mailbox::PacketQueue;
use crate::time::Timer;

/// Trait for transmitting and receiving advertising-channel PDUs.
///
/// This is the hardware collaborator for the bearer layer (C6): an implementor drives an
/// underlying BLE radio (or a GATT proxy connection) in whatever way the platform requires. The
/// stack never touches the radio directly — every interaction goes through this trait, matching
/// the "underlying radio driver ... is out of scope" boundary.
pub trait Radio {
    /// Transmits a single advertising PDU (up to 31 bytes of AD data) on all three advertising
    /// channels.
    fn transmit_adv(&mut self, pdu: &[u8]);
}

/// Non-volatile storage collaborator.
///
/// Covers the persisted state named in the design notes: per-element sequence number, IV index
/// and update-state timestamp, net/app/device key tables, and RPL contents. A write-through policy
/// is acceptable; batched implementations must flush on IV update and provisioning completion.
pub trait Nvm {
    /// Persists `data` under `key`. Implementations may batch this, but must guarantee it has
    /// landed by the time [`Nvm::flush`] returns.
    fn store(&mut self, key: &str, data: &[u8]) -> Result<(), crate::error::Error>;

    /// Loads previously-stored data for `key`, if any.
    fn load<'a>(&self, key: &str, buf: &'a mut [u8]) -> Result<Option<&'a [u8]>, crate::error::Error>;

    /// Forces any batched writes to reach stable storage.
    fn flush(&mut self) -> Result<(), crate::error::Error>;
}

/// Observer seam for provisioning completion, key changes, and IV updates.
///
/// Grounded in the original stack's minimal pub/sub notifier: the application layer learns about
/// these events without polling. The default implementation supplied by [`NoopNotifier`] ignores
/// everything, so wiring this up is opt-in.
pub trait NodeEvents {
    /// Called once the provisioning FSM reaches the `COMPLETE` state.
    fn provisioning_complete(&mut self) {}

    /// Called whenever a net key, app key, or device key is added, updated, or removed.
    fn keys_changed(&mut self) {}

    /// Called whenever the IV index or its update-state changes.
    fn iv_updated(&mut self, iv_index: u32) {
        let _ = iv_index;
    }
}

/// A [`NodeEvents`] implementation that does nothing. Used as the default when a platform doesn't
/// need to observe these events.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopNotifier;

impl NodeEvents for NoopNotifier {}

/// Trait for stack configurations.
///
/// This defines the collaborator types used throughout the layers of the mesh stack: hardware
/// interfaces, cryptographic providers, and the async mailbox queue. Every application supplies a
/// type implementing this trait to [`crate::node::Node`].
pub trait Config {
    /// A time source with microsecond resolution.
    type Timer: Timer;

    /// The advertising-channel radio (or proxy connection) used by the bearer layer.
    type Radio: Radio;

    /// The AES-CCM/AES-CMAC/AES-128 provider used by the crypto adapter (C1).
    type Crypto: CryptoProvider;

    /// The ECDH provider used during provisioning's public key exchange.
    type Ecdh: EcdhProvider;

    /// Non-volatile storage for keys, sequence/IV state, and the replay protection list.
    type Nvm: Nvm;

    /// Observer for provisioning/key/IV events. Use [`NoopNotifier`] if not needed.
    type Events: NodeEvents;

    /// The packet queue used to hand finished PDUs from the real-time bearer callback to the
    /// non-realtime part of the stack (C15).
    type PacketQueue: PacketQueue;
}

pub(crate) type ConfProducer<C> = <<C as Config>::PacketQueue as PacketQueue>::Producer;
pub(crate) type ConfConsumer<C> = <<C as Config>::PacketQueue as PacketQueue>::Consumer;
