//! The core of a Bluetooth Mesh protocol stack: a node that participates in a mesh network as
//! either a provisioning device or a provisioner.
//!
//! The stack is layered the way the Bluetooth Mesh Profile describes it, leaf modules first:
//!
//! * [`crypto`] and [`ecdh`] wrap the primitives (AES-128, AES-CMAC, AES-CCM, ECDH P-256) that
//!   everything above derives keys and authenticates traffic with.
//! * [`keys`] owns the network/application/device key hierarchy and the `k1`..`k4`/`s1`
//!   derivations in [`crypto::derive`].
//! * [`seq`] and [`replay`] hold the per-element sequence counter, the global IV index state
//!   machine, and the two replay caches (NMC, RPL).
//! * [`gap`] arbitrates the single radio between scanning and advertising; [`bearer`] tags
//!   payloads for the advertising and loopback bearers; [`iface`] binds a bearer to a filtered
//!   network interface.
//! * [`network`], [`lower_transport`], [`upper_transport`] and [`access`] are the four message-
//!   pipeline layers, run in that order inbound and mirrored outbound.
//! * [`beacon`] emits unprovisioned-device and secure-network beacons.
//! * [`pb_adv`] and [`provisioning`] carry the eleven-step provisioning exchange over a reliable,
//!   segmented link built on connectionless advertising.
//! * [`mailbox`] decouples timer/IRQ callbacks from the single-threaded main loop; [`time`]
//!   supplies the duration/instant types those timers are scheduled against.
//!
//! [`node`] ties all of the above together behind one facade, [`node::Node`], which is the only
//! type most callers need to hold.
//!
//! This crate is `no_std` and allocation-free: every bounded collection is a [`heapless`]
//! container sized by the [`Config`](config::Config) the node is built with.

#![no_std]

mod utils;

pub mod access;
pub mod address;
pub mod beacon;
pub mod bearer;
pub mod bytes;
pub mod config;
pub mod crypto;
pub mod ecdh;
mod error;
pub mod gap;
pub mod iface;
pub mod keys;
pub mod log;
pub mod lower_transport;
pub mod mailbox;
pub mod network;
pub mod node;
pub mod pb_adv;
pub mod provisioning;
pub mod replay;
pub mod seq;
pub mod shell;
pub mod time;
pub mod upper_transport;
pub mod uuid;

pub use self::error::Error;
pub use self::node::Node;
