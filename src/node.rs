//! Node facade (ties together C1-C15): the single entry point an application talks to.
//!
//! Everything below this module is a standalone layer that knows nothing about the others; `Node`
//! owns one instance of each, wires the control flow described in the system overview (radio ->
//! GAP -> bearer -> {network, PB-ADV, beacon} -> ... -> access, and the mirrored outbound path),
//! and enforces the cross-layer invariants that don't belong to any single layer: one active
//! lower-transport TX task per destination, one active RX task per source, one PB-ADV link and one
//! provisioning context at a time (this stack targets a single concurrent link, matching PB-ADV's
//! own "one link at a time" framing).
//!
//! `Node` does not register or dispatch to application models (§4.11 leaves that out of core
//! scope): inbound access messages are handed back to the caller of [`Node::on_adv_received`]
//! rather than routed through an internal registry.

use heapless::consts::{U16, U2, U20, U3, U4, U64};
use heapless::Vec;
use rand_core::{CryptoRng, RngCore};

use crate::access::{self, AccessMessage, Opcode};
use crate::address::Address;
use crate::bearer::{self, BearerHandle, BearerParams, BearerTable, PacketType};
use crate::beacon::{SecureNetworkBeacon, UnprovisionedDeviceBeacon};
use crate::config::{Config, ConfConsumer, ConfProducer};
use crate::crypto::CryptoProvider;
use crate::ecdh::{EcdhProvider, InvalidPublicKey, PublicKey, SecretKey as _, SharedSecret};
use crate::error::Error;
use crate::gap::{self, AdvertiseAction, AdvertiseDuration, Scheduler};
use crate::iface::{IfaceTable, PassAll};
use crate::keys::KeyStore;
use crate::lower_transport::{self, LowerPdu, RxOutcome, RxTask, TxOutcome, TxTask};
use crate::mailbox::{Consumer, Event};
use crate::network::{self, DecryptedPdu, NetworkHeader};
use crate::pb_adv::{self, Frame, GenericProvisioningPdu, Link, LinkEvent};
use crate::provisioning::{
    self, AuthValue, Capabilities, ConfirmationInputs, FailReason, Fsm, Invite,
    ProvisioningData, Role as ProvRole, Start, State as ProvState,
};
use crate::replay::{Nmc, Rpl};
use crate::seq::{IvIndexStore, SequenceCounter};
use crate::time::Instant;
use crate::upper_transport::{self, AccessKey};
use crate::uuid::DeviceUuid;

/// Resource bounds this `Node` is built with, grounded in the original stack's
/// `node_default_config`/`node_default_param` (net_key_num=2, app_key_num=2, dev_key_num=10,
/// nmc_size=64, rpl_size=16, gap_task_num=20, trans_tx_task_num=3, trans_rx_task_num=3,
/// trans_tx_retry_times=1, default_ttl=5). Capacities are expressed as `heapless` type-level
/// lengths rather than runtime fields, so a misconfigured bound is a compile error, not a runtime
/// surprise.
type NetKeyCapacity = U2;
type AppKeyCapacity = U2;
type DevKeyCapacity = U4; // widened slightly from the 10-element original table; U4 keeps this
                          // module's generic signatures short while the key store itself can be
                          // resized independently by an application that needs more.
type NmcCapacity = U64;
type RplCapacity = U16;
type GapActionCapacity = U20;
type BearerCapacity = U3; // PB-ADV, mesh message, beacon
type IfaceCapacity = U3;
type TxTaskCapacity = U3;
type RxTaskCapacity = U3;

/// Default per-segment retry budget for a unicast lower-transport TX task (`trans_tx_retry_times`
/// in the original default parameters).
pub const DEFAULT_TX_RETRIES: u8 = 1;
/// Default TTL a node stamps on messages it originates (`default_ttl`).
pub const DEFAULT_TTL: u8 = 5;

/// Which role the node currently occupies. A node starts `Unprovisioned` and becomes `Device`
/// once provisioning completes; a provisioner is `Provisioner` from construction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeRole {
    Unprovisioned,
    Device,
    Provisioner,
}

/// A fully decoded, authenticated inbound access message, handed back to the application for
/// model dispatch (out of core scope, §4.11).
pub struct ReceivedAccess {
    pub src: Address,
    pub dst: Address,
    pub opcode: Opcode,
    pub params_len: usize,
    params: [u8; access::MAX_SEGMENTED_PARAMS],
}

impl ReceivedAccess {
    pub fn params(&self) -> &[u8] {
        &self.params[..self.params_len]
    }
}

/// Per-peer provisioning context (§3): everything accumulated across the eleven-step exchange.
/// Lives from link open until link close; `Node` holds at most one, since it supports a single
/// concurrent PB-ADV link.
struct ProvisioningContext<C: Config> {
    fsm: Fsm,
    peer_uuid: Option<DeviceUuid>,
    secret_key: Option<<C::Ecdh as EcdhProvider>::SecretKey>,
    local_public_key: Option<[u8; 64]>,
    peer_public_key: Option<[u8; 64]>,
    shared_secret: Option<[u8; 32]>,
    inputs: ConfirmationInputs,
    confirmation_salt: Option<[u8; 16]>,
    auth_value: AuthValue,
    local_random: Option<[u8; 16]>,
    peer_random: Option<[u8; 16]>,
    local_confirmation: Option<[u8; 16]>,
    peer_confirmation: Option<[u8; 16]>,
    session_key: Option<[u8; 16]>,
    session_nonce: Option<[u8; 13]>,
    device_key: Option<[u8; 16]>,
    invite: Option<Invite>,
    capabilities: Option<Capabilities>,
    start: Option<Start>,
    data: Option<ProvisioningData>,
    error: Option<Error>,
}

impl<C: Config> ProvisioningContext<C> {
    fn new(role: ProvRole) -> Self {
        ProvisioningContext {
            fsm: Fsm::new(role),
            peer_uuid: None,
            secret_key: None,
            local_public_key: None,
            peer_public_key: None,
            shared_secret: None,
            inputs: ConfirmationInputs::new(),
            confirmation_salt: None,
            auth_value: AuthValue::NoOob,
            local_random: None,
            peer_random: None,
            local_confirmation: None,
            peer_confirmation: None,
            session_key: None,
            session_nonce: None,
            device_key: None,
            invite: None,
            capabilities: None,
            start: None,
            data: None,
            error: None,
        }
    }
}

/// Tracks the set of active lower-transport TX tasks (at most one per destination) plus a FIFO of
/// submissions still waiting for their destination's active task to finish (§3, §4.9).
struct TxTaskTable<N: heapless::ArrayLength<TxTask>, PendN: heapless::ArrayLength<PendingTx>> {
    active: Vec<TxTask, N>,
    pending: Vec<PendingTx, PendN>,
}

/// A captured [`TxTask::submit`] call, replayed once its destination's active task frees up.
struct PendingTx {
    dst: Address,
    ttl: u8,
    seq_auth: u32,
    pdu: [u8; lower_transport::MAX_REASSEMBLED_PDU],
    pdu_len: usize,
    is_control: bool,
    opcode: u8,
    akf: bool,
    aid: u8,
    szmic: bool,
    retries: u8,
}

impl<N, PendN> TxTaskTable<N, PendN>
where
    N: heapless::ArrayLength<TxTask>,
    PendN: heapless::ArrayLength<PendingTx>,
{
    fn new() -> Self {
        TxTaskTable {
            active: Vec::new(),
            pending: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn submit(
        &mut self,
        dst: Address,
        ttl: u8,
        seq_auth: u32,
        pdu: &[u8],
        is_control: bool,
        opcode: u8,
        akf: bool,
        aid: u8,
        szmic: bool,
        retries: u8,
        now: Instant,
    ) -> Result<(), Error> {
        if self.active.iter().any(|t| t.dst == dst) {
            if pdu.len() > lower_transport::MAX_REASSEMBLED_PDU {
                return Err(Error::Length);
            }
            let mut buf = [0u8; lower_transport::MAX_REASSEMBLED_PDU];
            buf[..pdu.len()].copy_from_slice(pdu);
            return self
                .pending
                .push(PendingTx {
                    dst,
                    ttl,
                    seq_auth,
                    pdu: buf,
                    pdu_len: pdu.len(),
                    is_control,
                    opcode,
                    akf,
                    aid,
                    szmic,
                    retries,
                })
                .map_err(|_| Error::Resource);
        }
        let task = TxTask::submit(
            dst, ttl, seq_auth, pdu, is_control, opcode, akf, aid, szmic, retries, now,
        )?;
        self.active.push(task).map_err(|_| Error::Resource)
    }

    fn start_next_pending(&mut self, dst: Address, now: Instant) {
        if let Some(pos) = self.pending.iter().position(|p| p.dst == dst) {
            let p = self.pending.swap_remove(pos);
            if let Ok(task) = TxTask::submit(
                p.dst,
                p.ttl,
                p.seq_auth,
                &p.pdu[..p.pdu_len],
                p.is_control,
                p.opcode,
                p.akf,
                p.aid,
                p.szmic,
                p.retries,
                now,
            ) {
                let _ = self.active.push(task);
            }
        }
    }

    fn finish(&mut self, dst: Address, now: Instant) {
        if let Some(pos) = self.active.iter().position(|t| t.dst == dst) {
            self.active.swap_remove(pos);
        }
        self.start_next_pending(dst, now);
    }

    fn on_ack(&mut self, dst: Address, seq_zero: u16, block_ack: u32, now: Instant) -> Option<TxOutcome> {
        let task = self.active.iter_mut().find(|t| t.dst == dst)?;
        let outcome = task.on_ack(seq_zero, block_ack, now)?;
        if matches!(outcome, TxOutcome::Done | TxOutcome::Failed) {
            self.finish(dst, now);
        }
        Some(outcome)
    }

    fn poll_retries(&mut self, now: Instant) {
        let mut finished: Vec<Address, N> = Vec::new();
        for task in self.active.iter_mut() {
            if task.retry_due(now) {
                if matches!(task.on_retry_timeout(now), TxOutcome::Done | TxOutcome::Failed) {
                    let _ = finished.push(task.dst);
                }
            }
        }
        for dst in finished {
            self.finish(dst, now);
        }
    }
}

/// Tracks the set of active lower-transport RX tasks (at most one per source), replacing a stored
/// task outright when a segment with a higher `SeqAuth` arrives for the same source (§3, §4.9).
struct RxTaskTable<N: heapless::ArrayLength<RxTask>> {
    tasks: Vec<RxTask, N>,
}

impl<N: heapless::ArrayLength<RxTask>> RxTaskTable<N> {
    fn new() -> Self {
        RxTaskTable { tasks: Vec::new() }
    }

    fn find_mut(&mut self, src: Address) -> Option<&mut RxTask> {
        self.tasks.iter_mut().find(|t| t.src == src)
    }

    #[allow(clippy::too_many_arguments)]
    fn on_segment_access(
        &mut self,
        src: Address,
        seq_auth: u32,
        ttl: u8,
        akf: bool,
        aid: u8,
        szmic: bool,
        seg_n: u8,
        seg_o: u8,
        data: &[u8],
        now: Instant,
    ) -> Result<RxOutcome, Error> {
        if let Some(pos) = self.tasks.iter().position(|t| t.src == src) {
            if seq_auth < self.tasks[pos].seq_auth {
                return Ok(RxOutcome::Stale);
            }
            if seq_auth > self.tasks[pos].seq_auth {
                self.tasks.swap_remove(pos);
            }
        }
        if self.find_mut(src).is_none() {
            let task = RxTask::new_access(src, seq_auth, ttl, akf, aid, szmic, seg_n, now);
            self.tasks.push(task).map_err(|_| Error::Resource)?;
        }
        let task = self.find_mut(src).unwrap();
        task.on_segment(seg_o, data, now)
    }

    fn on_segment_control(
        &mut self,
        src: Address,
        seq_auth: u32,
        ttl: u8,
        opcode: u8,
        seg_n: u8,
        seg_o: u8,
        data: &[u8],
        now: Instant,
    ) -> Result<RxOutcome, Error> {
        if let Some(pos) = self.tasks.iter().position(|t| t.src == src) {
            if seq_auth < self.tasks[pos].seq_auth {
                return Ok(RxOutcome::Stale);
            }
            if seq_auth > self.tasks[pos].seq_auth {
                self.tasks.swap_remove(pos);
            }
        }
        if self.find_mut(src).is_none() {
            let task = RxTask::new_control(src, seq_auth, ttl, opcode, seg_n, now);
            self.tasks.push(task).map_err(|_| Error::Resource)?;
        }
        let task = self.find_mut(src).unwrap();
        task.on_segment(seg_o, data, now)
    }

    fn finish(&mut self, src: Address) {
        if let Some(pos) = self.tasks.iter().position(|t| t.src == src) {
            self.tasks.swap_remove(pos);
        }
    }

    fn sweep_expired(&mut self, now: Instant) {
        let mut expired: Vec<Address, N> = Vec::new();
        for task in self.tasks.iter() {
            if task.store_expired(now) {
                let _ = expired.push(task.src);
            }
        }
        for src in expired {
            self.finish(src);
        }
    }
}

/// The node facade: owns one instance of every layer and drives the control flow between them.
///
/// `Node` never touches the radio or timer directly; every method either consumes data already
/// received (via [`Node::on_adv_received`] or [`Node::poll_mailbox`]) or returns the [`AdvCmd`]
/// describing what the caller's radio/GAP integration should do next, following the same
/// command-returning pattern used throughout the stack.
pub struct Node<C: Config> {
    pub address: Address,
    pub element_count: u8,
    pub role: NodeRole,
    default_ttl: u8,
    retrans_count: u8,
    seq: SequenceCounter,
    iv: IvIndexStore,
    keys: KeyStore<C::Crypto, NetKeyCapacity, AppKeyCapacity, DevKeyCapacity>,
    ecdh: C::Ecdh,
    device_uuid: DeviceUuid,
    nmc: Nmc<NmcCapacity>,
    rpl: Rpl<RplCapacity>,
    gap: Scheduler<GapActionCapacity>,
    bearers: BearerTable<BearerCapacity>,
    ifaces: IfaceTable<PassAll, PassAll, IfaceCapacity>,
    pb_adv_bearer: BearerHandle,
    mesh_bearer: BearerHandle,
    beacon_bearer: BearerHandle,
    link: Option<Link>,
    provisioning: Option<ProvisioningContext<C>>,
    tx_tasks: TxTaskTable<TxTaskCapacity, TxTaskCapacity>,
    rx_tasks: RxTaskTable<RxTaskCapacity>,
    radio: C::Radio,
    timer: C::Timer,
    nvm: C::Nvm,
    events: C::Events,
    mailbox: ConfConsumer<C>,
}

/// What the radio/GAP integration should do as a result of a `Node` call, mirroring
/// [`gap::Cmd`] but folded in with whether the node wants to be polled again for a reason other
/// than the next scheduled radio action (e.g. a PB-ADV retry timer).
#[derive(Debug, Copy, Clone)]
pub struct AdvCmd {
    pub gap: gap::Cmd,
}

impl<C: Config> Node<C> {
    /// Builds a fresh, unprovisioned node. `queue` is split immediately; the caller installs the
    /// returned producer in whatever real-time context feeds mailbox events (timer ISR, radio
    /// callback) while `Node` keeps the consumer side (§4.15).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_uuid: DeviceUuid,
        role: NodeRole,
        crypto: C::Crypto,
        ecdh: C::Ecdh,
        radio: C::Radio,
        timer: C::Timer,
        nvm: C::Nvm,
        events: C::Events,
        queue: C::PacketQueue,
        now: Instant,
    ) -> (Self, ConfProducer<C>) {
        use crate::mailbox::PacketQueue as _;
        let (producer, consumer) = queue.split();

        let mut bearers = BearerTable::new();
        let pb_adv_bearer = bearers
            .create(BearerParams {
                loopback: false,
                advertise_duration: None,
            })
            .expect("fresh bearer table has room for the fixed set of core bearers");
        let mesh_bearer = bearers
            .create(BearerParams {
                loopback: false,
                advertise_duration: None,
            })
            .expect("fresh bearer table has room for the fixed set of core bearers");
        let beacon_bearer = bearers
            .create(BearerParams {
                loopback: false,
                advertise_duration: None,
            })
            .expect("fresh bearer table has room for the fixed set of core bearers");

        let node = Node {
            address: Address::from_raw(0),
            element_count: 1,
            role,
            default_ttl: DEFAULT_TTL,
            retrans_count: 2,
            seq: SequenceCounter::new(),
            iv: IvIndexStore::new(0, now),
            keys: KeyStore::new(crypto),
            ecdh,
            device_uuid,
            nmc: Nmc::new(),
            rpl: Rpl::new(),
            gap: Scheduler::new(true),
            bearers,
            ifaces: IfaceTable::new(),
            pb_adv_bearer,
            mesh_bearer,
            beacon_bearer,
            link: None,
            provisioning: None,
            tx_tasks: TxTaskTable::new(),
            rx_tasks: RxTaskTable::new(),
            radio,
            timer,
            nvm,
            events,
            mailbox: consumer,
        };
        (node, producer)
    }

    pub fn now(&self) -> Instant {
        self.timer.now()
    }

    /// Node reset (shell `nr`): returns the node to its unprovisioned, key-less state. Grounded in
    /// the original stack's node-reset contract: clears the key store and replay list, drops any
    /// in-flight provisioning context and PB-ADV link, and unassigns the node's address.
    pub fn reset(&mut self) {
        self.keys.clear();
        self.rpl.clear();
        self.address = Address::from_raw(0);
        self.role = NodeRole::Unprovisioned;
        self.link = None;
        self.provisioning = None;
        self.tx_tasks = TxTaskTable::new();
        self.rx_tasks = RxTaskTable::new();
        self.seq.reset();
        self.events.keys_changed();
        crate::log::info!("node reset");
    }

    // ---- Inbound path -----------------------------------------------------------------------

    /// Demultiplexes a received advertisement into the right upper layer (§2's control-flow
    /// summary: C5 -> C6 -> {C8, C12, C13}).
    pub fn on_adv_received(&mut self, adv_data: &[u8], now: Instant) -> Result<InboundOutcome, Error> {
        let (kind, pdu) = self
            .bearers
            .on_adv_received(adv_data)
            .ok_or(Error::InvalAdType)?;
        match kind {
            PacketType::Beacon => self.handle_beacon(pdu),
            PacketType::PbAdv => self.handle_pb_adv(pdu, now),
            PacketType::MeshMessage => self.handle_network_pdu(pdu, now),
        }
    }

    fn handle_beacon(&mut self, pdu: &[u8]) -> Result<InboundOutcome, Error> {
        if pdu.is_empty() {
            return Err(Error::Length);
        }
        match pdu[0] {
            crate::beacon::TYPE_UNPROVISIONED => {
                let beacon = UnprovisionedDeviceBeacon::parse(pdu)?;
                Ok(InboundOutcome::UnprovisionedBeacon(beacon))
            }
            crate::beacon::TYPE_SECURE_NETWORK => {
                let beacon = SecureNetworkBeacon::parse(pdu)?;
                Ok(InboundOutcome::SecureNetworkBeacon(beacon))
            }
            _ => Err(Error::InvalidValue),
        }
    }

    fn handle_pb_adv(&mut self, pdu: &[u8], now: Instant) -> Result<InboundOutcome, Error> {
        let frame = pb_adv::parse(pdu)?;

        if self.link.is_none() {
            if let GenericProvisioningPdu::LinkOpen { uuid } = frame.pdu {
                if uuid == self.device_uuid && self.role != NodeRole::Provisioner {
                    self.link = Some(Link::accept_as_device(frame.link_id, now));
                    self.provisioning = Some(ProvisioningContext::new(ProvRole::Device));
                    return Ok(InboundOutcome::LinkOpened);
                }
            }
            return Ok(InboundOutcome::Ignored);
        }

        let link = self.link.as_mut().unwrap();
        if frame.link_id != link.link_id {
            return Ok(InboundOutcome::Ignored);
        }

        let event = match frame.pdu {
            GenericProvisioningPdu::LinkAck => {
                link.on_link_ack()?;
                LinkEvent::Opened
            }
            GenericProvisioningPdu::LinkClose { reason } => link.on_link_close(reason),
            GenericProvisioningPdu::TransactionStart {
                last_seg_n,
                total_len,
                fcs,
                payload,
            } => link.on_transaction_start(frame.trans_num, last_seg_n, total_len, fcs, payload, now)?,
            GenericProvisioningPdu::TransactionContinue { seg_index, payload } => {
                link.on_transaction_continue(frame.trans_num, seg_index, payload, now)?
            }
            GenericProvisioningPdu::TransactionAck => LinkEvent::Idle,
            GenericProvisioningPdu::LinkOpen { .. } => LinkEvent::Idle,
        };

        match event {
            LinkEvent::TransactionComplete { len } => {
                let body_owned = {
                    let mut buf = [0u8; pb_adv::MAX_PROV_PDU];
                    let reassembled = self.link.as_ref().unwrap().reassembled(len);
                    buf[..len].copy_from_slice(reassembled);
                    buf
                };
                self.handle_provisioning_pdu(&body_owned[..len], now)
            }
            LinkEvent::Opened => Ok(InboundOutcome::LinkOpened),
            LinkEvent::Closed | LinkEvent::Lost => {
                self.link = None;
                self.provisioning = None;
                Ok(InboundOutcome::LinkClosed)
            }
            LinkEvent::DuplicateTransaction | LinkEvent::Idle => Ok(InboundOutcome::Ignored),
        }
    }

    fn handle_network_pdu(&mut self, pdu: &[u8], now: Instant) -> Result<InboundOutcome, Error> {
        let mut transport = [0u8; network::MAX_NET_PAYLOAD];
        let decrypted: DecryptedPdu = network::decrypt(
            self.keys.crypto(),
            self.keys.net_keys_by_nid(pdu[0] & 0x7F),
            self.iv.iv_index(),
            pdu,
            &mut transport,
        )?;

        if !self
            .rpl
            .check_and_update(decrypted.src.raw(), decrypted.seq, decrypted.iv_index_used)
        {
            return Ok(InboundOutcome::Ignored);
        }
        if !self.nmc.check(decrypted.src.raw(), decrypted.seq) {
            return Ok(InboundOutcome::Ignored);
        }

        let is_local = decrypted.dst == self.address;
        let relay_candidate = !is_local
            && network::should_relay(true, decrypted.ttl, false);

        let transport_pdu = &transport[..decrypted.transport_len];
        let outcome = if decrypted.ctl {
            self.handle_lower_control(decrypted.src, decrypted.ttl, decrypted.seq, transport_pdu, now)?
        } else {
            self.handle_lower_access(
                decrypted.src,
                decrypted.dst,
                decrypted.ttl,
                decrypted.seq,
                transport_pdu,
                now,
            )?
        };

        if relay_candidate {
            crate::log::trace!("relay candidate src={:?} ttl={}", decrypted.src, decrypted.ttl);
        }
        Ok(outcome)
    }

    fn handle_lower_control(
        &mut self,
        src: Address,
        ttl: u8,
        seq: u32,
        pdu: &[u8],
        now: Instant,
    ) -> Result<InboundOutcome, Error> {
        match lower_transport::parse_control(pdu)? {
            LowerPdu::SegmentAck {
                seq_zero, block_ack, ..
            } => {
                self.apply_segack(src, seq_zero, block_ack);
                Ok(InboundOutcome::Ignored)
            }
            LowerPdu::UnsegmentedControl { opcode, payload } => {
                Ok(InboundOutcome::ControlMessage { src, opcode, len: payload.len() })
            }
            LowerPdu::SegmentedControl {
                opcode,
                seq_zero,
                seg_o,
                seg_n,
                payload,
            } => {
                let seq_auth = lower_transport::reconstruct_seq_auth(seq_zero, seq);
                let _ = ttl;
                match self
                    .rx_tasks
                    .on_segment_control(src, seq_auth, ttl, opcode, seg_n, seg_o, payload, now)?
                {
                    RxOutcome::Complete { len } => {
                        self.rx_tasks.finish(src);
                        Ok(InboundOutcome::ControlMessage { src, opcode, len })
                    }
                    _ => Ok(InboundOutcome::Ignored),
                }
            }
            _ => Ok(InboundOutcome::Ignored),
        }
    }

    fn handle_lower_access(
        &mut self,
        src: Address,
        dst: Address,
        ttl: u8,
        seq: u32,
        pdu: &[u8],
        now: Instant,
    ) -> Result<InboundOutcome, Error> {
        let mut reassembled = [0u8; lower_transport::MAX_REASSEMBLED_PDU];
        let (upper_pdu_len, akf, aid, szmic, seq_auth): (usize, bool, u8, bool, u32);

        match lower_transport::parse_access(pdu)? {
            LowerPdu::UnsegmentedAccess { akf: a, aid: i, payload } => {
                reassembled[..payload.len()].copy_from_slice(payload);
                upper_pdu_len = payload.len();
                akf = a;
                aid = i;
                szmic = false;
                seq_auth = seq; // unsegmented: SeqAuth is the network SEQ itself (§4.9/§4.10)
            }
            LowerPdu::SegmentedAccess {
                akf: a,
                aid: i,
                szmic: s,
                seq_zero,
                seg_o,
                seg_n,
                payload,
            } => {
                let auth = lower_transport::reconstruct_seq_auth(seq_zero, seq);
                match self
                    .rx_tasks
                    .on_segment_access(src, auth, ttl, a, i, s, seg_n, seg_o, payload, now)?
                {
                    RxOutcome::Complete { len } => {
                        let buf = self.rx_tasks.find_mut(src).unwrap().reassembled(len);
                        reassembled[..len].copy_from_slice(buf);
                        self.rx_tasks.finish(src);
                        upper_pdu_len = len;
                    }
                    _ => return Ok(InboundOutcome::Ignored),
                }
                akf = a;
                aid = i;
                szmic = s;
                seq_auth = auth;
            }
            _ => return Ok(InboundOutcome::Ignored),
        }

        let mut plain = [0u8; access::MAX_SEGMENTED_PARAMS];
        let plain_len = if akf {
            let mut found = None;
            for app_key in self.keys.app_keys_by_aid(0, aid) {
                if let Ok(n) = upper_transport::decrypt(
                    self.keys.crypto(),
                    AccessKey::App(app_key),
                    szmic,
                    seq_auth,
                    src,
                    dst,
                    self.iv.iv_index(),
                    None,
                    upper_transport::trans_mic_len(szmic, szmic),
                    &reassembled[..upper_pdu_len],
                    &mut plain,
                ) {
                    found = Some(n);
                    break;
                }
            }
            found.ok_or(Error::Key)?
        } else {
            let device_key = *self.keys.device_key_for(dst.raw()).ok_or(Error::NotFound)?;
            upper_transport::decrypt(
                self.keys.crypto(),
                AccessKey::Device(&device_key),
                szmic,
                seq_auth,
                src,
                dst,
                self.iv.iv_index(),
                None,
                upper_transport::trans_mic_len(szmic, szmic),
                &reassembled[..upper_pdu_len],
                &mut plain,
            )?
        };

        let msg = access::parse(&plain[..plain_len])?;
        let mut params = [0u8; access::MAX_SEGMENTED_PARAMS];
        params[..msg.params.len()].copy_from_slice(msg.params);
        Ok(InboundOutcome::AccessMessage(ReceivedAccess {
            src,
            dst,
            opcode: msg.opcode,
            params_len: msg.params.len(),
            params,
        }))
    }

    fn apply_segack(&mut self, src: Address, seq_zero: u16, block_ack: u32) {
        let now = self.timer.now();
        self.tx_tasks.on_ack(src, seq_zero, block_ack, now);
    }

    // ---- Mailbox / timer-driven work ---------------------------------------------------------

    /// Drains pending mailbox events (§4.15) and services whichever timers they represent. The
    /// mailbox only decouples *when* this runs from the real-time callback that posted the event;
    /// which exact link or task fired is re-checked here against wall-clock deadlines rather than
    /// trusted blindly, so a coalesced or reordered event queue still converges correctly.
    pub fn poll_mailbox(&mut self, now: Instant) {
        while self.mailbox.has_events() {
            match self.mailbox.poll() {
                Some(Event::PbAdvRetry(_)) => self.service_link_retry(now),
                Some(Event::PbAdvLinkLoss(_)) => self.service_link_idle(now),
                Some(Event::LowerTxRetry(_)) => self.tx_tasks.poll_retries(now),
                Some(Event::LowerRxAck(_)) => {}
                Some(Event::LowerRxIncomplete(_)) | Some(Event::LowerRxStoreExpired(_)) => {
                    self.rx_tasks.sweep_expired(now)
                }
                Some(Event::BeaconTick) => {}
                Some(Event::IvIndexTick) => {
                    let _ = self.iv.retry_pending_transition(now);
                }
                None => break,
            }
        }
    }

    fn service_link_retry(&mut self, now: Instant) {
        if let Some(link) = self.link.as_mut() {
            if link.link_retry_due(now) {
                if link.on_link_retry_timeout(now) == LinkEvent::Lost {
                    self.link = None;
                    self.provisioning = None;
                }
            }
        }
    }

    fn service_link_idle(&mut self, now: Instant) {
        if let Some(link) = self.link.as_ref() {
            if link.idle_timed_out(now) {
                self.link = None;
                self.provisioning = None;
            }
        }
    }

    // ---- Outbound path ------------------------------------------------------------------------

    /// Encrypts, segments as needed, and submits an access message for transmission to `dst`
    /// (the mirrored outbound path: C11 -> C10 -> C9 -> C8 -> ... -> C5).
    #[allow(clippy::too_many_arguments)]
    pub fn send_access(
        &mut self,
        dst: Address,
        opcode: Opcode,
        params: &[u8],
        app_key_index: Option<u16>,
        now: Instant,
    ) -> Result<(), Error> {
        dst.check_destination()?;
        self.address.check_source()?;

        let mut plain = [0u8; access::MAX_SEGMENTED_PARAMS + 4];
        let n = access::write(opcode, params, &mut plain)?;

        let segmented = n > access::MAX_UNSEGMENTED_PARAMS;
        let szmic = false;
        let seq = self.seq.use_next()?;

        let mic_len = upper_transport::trans_mic_len(segmented, szmic);
        let mut cipher = [0u8; upper_transport::MAX_UPPER_ACCESS_PDU];

        let (akf, aid, cipher_len) = if let Some(app_index) = app_key_index {
            let entry = self.keys.app_key(app_index).ok_or(Error::NotFound)?;
            let app_key = entry.root;
            let app_aid = entry.aid;
            let len = upper_transport::encrypt(
                self.keys.crypto(),
                AccessKey::App(&app_key),
                szmic,
                seq,
                self.address,
                dst,
                self.iv.iv_index(),
                None,
                &plain[..n],
                &mut cipher,
            )?;
            (true, app_aid, len)
        } else {
            let device_key = *self.keys.device_key_for(dst.raw()).ok_or(Error::NotFound)?;
            let len = upper_transport::encrypt(
                self.keys.crypto(),
                AccessKey::Device(&device_key),
                szmic,
                seq,
                self.address,
                dst,
                self.iv.iv_index(),
                None,
                &plain[..n],
                &mut cipher,
            )?;
            (false, 0u8, len)
        };

        self.tx_tasks.submit(
            dst,
            self.default_ttl,
            seq,
            &cipher[..cipher_len],
            false,
            0,
            akf,
            aid,
            szmic,
            DEFAULT_TX_RETRIES,
            now,
        )?;

        self.flush_tx_segments(dst, now)
    }

    fn flush_tx_segments(&mut self, dst: Address, now: Instant) -> Result<(), Error> {
        let net_key = self
            .keys
            .net_keys()
            .next()
            .copied()
            .ok_or(Error::NotFound)?;
        let task = self
            .tx_tasks
            .active
            .iter()
            .find(|t| t.dst == dst)
            .ok_or(Error::State)?;

        for seg_o in 0..task.seg_count() {
            let mut lower_pdu = [0u8; lower_transport::MAX_SEG_ACCESS_PAYLOAD + 4];
            let lower_len = task.build_segment(seg_o, &mut lower_pdu)?;
            let seq = self.seq.use_next()?;
            let header = NetworkHeader {
                ctl: false,
                ttl: self.default_ttl,
                seq,
                src: self.address,
                dst,
            };
            let mut net_pdu = [0u8; 29];
            let net_len = network::encrypt(
                self.keys.crypto(),
                &net_key,
                self.iv.iv_index(),
                &header,
                &lower_pdu[..lower_len],
                &mut net_pdu,
            )?;
            if let Some(action) = self
                .bearers
                .send(self.mesh_bearer, PacketType::MeshMessage, &net_pdu[..net_len])?
            {
                let _ = self.gap.add_advertise(action);
            }
        }
        let _ = now;
        Ok(())
    }

    // ---- Provisioning driving (shell surface: prov_scan, prov_conn, prov_invite, prov_cap,
    //      prov_start, prov_set_pub_key, prov_pub_key, prov_set_auth, prov_cfm, prov_random) -----

    /// `prov_scan`: queues continuous scanning so Unprovisioned Device Beacons arrive via
    /// [`Node::on_adv_received`].
    pub fn prov_scan(&mut self) -> Result<(), Error> {
        self.gap.add_scan(gap::ScanParams {
            interval: crate::time::Duration::from_millis(100),
            window: crate::time::Duration::from_millis(100),
        })
    }

    /// `prov_conn`: opens a PB-ADV link to the device with the given UUID (provisioner role).
    pub fn prov_conn(&mut self, uuid: DeviceUuid, link_id: u32, now: Instant) -> Result<(), Error> {
        if self.link.is_some() {
            return Err(Error::Busy);
        }
        let link = Link::open_as_provisioner(link_id, now);
        self.link = Some(link);
        let mut ctx = ProvisioningContext::<C>::new(ProvRole::Provisioner);
        ctx.peer_uuid = Some(uuid);
        self.provisioning = Some(ctx);

        let frame = Frame {
            link_id,
            trans_num: 0,
            pdu: GenericProvisioningPdu::LinkOpen { uuid },
        };
        let mut wire = [0u8; 29];
        let n = pb_adv::write(&frame, &mut wire)?;
        self.queue_pb_adv_frame(&wire[..n])
    }

    fn queue_pb_adv_frame(&mut self, pdu: &[u8]) -> Result<(), Error> {
        if let Some(action) = self
            .bearers
            .send(self.pb_adv_bearer, PacketType::PbAdv, pdu)?
        {
            self.gap.add_advertise(action)?;
        }
        Ok(())
    }

    /// Transmits a provisioning PDU body, splitting it into a Transaction Start plus however many
    /// Transaction Continue segments it needs (§4.13).
    fn transmit_provisioning_pdu(&mut self, body: &[u8], now: Instant) -> Result<(), Error> {
        let link_id = self.link.as_ref().ok_or(Error::NotConnected)?.link_id;
        let trans_num = self.link.as_mut().unwrap().next_transaction_number();
        let fcs = pb_adv::fcs(body);

        let extra = body.len().saturating_sub(pb_adv::MAX_START_PAYLOAD);
        let continue_segs = if extra == 0 {
            0
        } else {
            (extra + pb_adv::MAX_CONTINUE_PAYLOAD - 1) / pb_adv::MAX_CONTINUE_PAYLOAD
        };
        let last_seg_n = continue_segs as u8;

        let take = core::cmp::min(body.len(), pb_adv::MAX_START_PAYLOAD);
        let start_frame = Frame {
            link_id,
            trans_num,
            pdu: GenericProvisioningPdu::TransactionStart {
                last_seg_n,
                total_len: body.len() as u16,
                fcs,
                payload: &body[..take],
            },
        };
        let mut wire = [0u8; 29];
        let n = pb_adv::write(&start_frame, &mut wire)?;
        self.queue_pb_adv_frame(&wire[..n])?;

        let mut offset = take;
        for seg_index in 1..=continue_segs {
            let end = core::cmp::min(offset + pb_adv::MAX_CONTINUE_PAYLOAD, body.len());
            let frame = Frame {
                link_id,
                trans_num,
                pdu: GenericProvisioningPdu::TransactionContinue {
                    seg_index: seg_index as u8,
                    payload: &body[offset..end],
                },
            };
            let mut wire = [0u8; 29];
            let n = pb_adv::write(&frame, &mut wire)?;
            self.queue_pb_adv_frame(&wire[..n])?;
            offset = end;
        }
        let _ = now;
        Ok(())
    }

    /// `prov_invite`: sends the Invite PDU (provisioner) and advances the FSM to `Invite`.
    pub fn prov_invite(&mut self, attention_duration: u8, now: Instant) -> Result<(), Error> {
        let invite = Invite { attention_duration };
        {
            let ctx = self.provisioning.as_mut().ok_or(Error::State)?;
            ctx.fsm.advance(ProvState::LinkOpened)?;
            ctx.fsm.advance(ProvState::Invite)?;
            ctx.inputs.add_invite(&invite);
            ctx.invite = Some(invite);
        }
        let mut body = [0u8; 2];
        body[0] = provisioning_pdu_type_byte(0x00);
        body[1] = attention_duration;
        self.transmit_provisioning_pdu(&body, now)
    }

    /// `prov_cap`: records (device role) or requests (provisioner role) the Capabilities PDU.
    pub fn prov_cap(&mut self, capabilities: Capabilities, now: Instant) -> Result<(), Error> {
        {
            let ctx = self.provisioning.as_mut().ok_or(Error::State)?;
            ctx.fsm.advance(ProvState::Capabilities)?;
            ctx.inputs.add_capabilities(&capabilities);
            ctx.capabilities = Some(capabilities);
        }
        let bytes = capabilities.to_bytes();
        let mut body = [0u8; 12];
        body[0] = provisioning_pdu_type_byte(0x01);
        body[1..].copy_from_slice(&bytes);
        self.transmit_provisioning_pdu(&body, now)
    }

    /// `prov_start`: selects and announces the authentication method, validating it against the
    /// peer's previously captured Capabilities.
    pub fn prov_start(&mut self, start: Start, now: Instant) -> Result<(), Error> {
        {
            let ctx = self.provisioning.as_mut().ok_or(Error::State)?;
            let capabilities = ctx.capabilities.as_ref().ok_or(Error::State)?;
            provisioning::validate_start(&start, capabilities)?;
            ctx.fsm.advance(ProvState::Start)?;
            ctx.inputs.add_start(&start);
            ctx.start = Some(start);
        }
        let bytes = start.to_bytes();
        let mut body = [0u8; 6];
        body[0] = provisioning_pdu_type_byte(0x02);
        body[1..].copy_from_slice(&bytes);
        self.transmit_provisioning_pdu(&body, now)
    }

    /// `prov_set_pub_key`: generates this side's ephemeral key pair and sends it.
    pub fn prov_set_pub_key<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        now: Instant,
    ) -> Result<[u8; 64], Error> {
        let (secret, public) = self.ecdh.generate_keypair(rng);
        {
            let ctx = self.provisioning.as_mut().ok_or(Error::State)?;
            ctx.fsm.advance(ProvState::PublicKey)?;
            ctx.secret_key = Some(secret);
            ctx.local_public_key = Some(public.0);
        }
        let mut body = [0u8; 65];
        body[0] = provisioning_pdu_type_byte(0x03);
        body[1..].copy_from_slice(&public.0);
        self.transmit_provisioning_pdu(&body, now)?;
        Ok(public.0)
    }

    /// `prov_pub_key`: records the peer's public key and, once both are known, performs ECDH
    /// agreement and computes `confirmation_salt`.
    pub fn prov_pub_key(&mut self, peer_key: [u8; 64]) -> Result<(), Error> {
        let ctx = self.provisioning.as_mut().ok_or(Error::State)?;
        let local = *ctx.local_public_key.as_ref().ok_or(Error::State)?;
        let secret = ctx.secret_key.take().ok_or(Error::State)?;

        let shared: SharedSecret = secret
            .agree(&PublicKey(peer_key))
            .map_err(|_: InvalidPublicKey| Error::Key)?;

        let (prov_key, dev_key) = match ctx.fsm.role {
            ProvRole::Provisioner => (local, peer_key),
            ProvRole::Device => (peer_key, local),
        };
        ctx.inputs
            .add_public_keys(&PublicKey(prov_key), &PublicKey(dev_key));
        ctx.peer_public_key = Some(peer_key);
        ctx.shared_secret = Some(shared.0);
        Ok(())
    }

    /// `prov_set_auth`: records the authentication (OOB) value both sides will feed into
    /// confirmation.
    pub fn prov_set_auth(&mut self, auth: AuthValue) -> Result<(), Error> {
        let ctx = self.provisioning.as_mut().ok_or(Error::State)?;
        ctx.auth_value = auth;
        Ok(())
    }

    /// `prov_cfm`: computes and sends this side's confirmation value.
    pub fn prov_cfm<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        now: Instant,
    ) -> Result<(), Error> {
        let mut random = [0u8; 16];
        rng.fill_bytes(&mut random);

        let (confirmation, crypto_ptr): ([u8; 16], ());
        {
            let keys_crypto = self.keys.crypto() as *const C::Crypto;
            let ctx = self.provisioning.as_mut().ok_or(Error::State)?;
            let shared = SharedSecret(ctx.shared_secret.ok_or(Error::State)?);
            let crypto = unsafe { &*keys_crypto };
            let salt = provisioning::confirmation_salt(crypto, &ctx.inputs);
            let key = provisioning::confirmation_key(crypto, &shared, &salt);
            let auth = ctx.auth_value.to_bytes();
            let cfm = provisioning::compute_confirmation(crypto, &key, &random, &auth);
            ctx.confirmation_salt = Some(salt);
            ctx.local_random = Some(random);
            ctx.local_confirmation = Some(cfm);
            ctx.fsm.advance(ProvState::Confirmation)?;
            confirmation = cfm;
            crypto_ptr = ();
        }
        let _ = crypto_ptr;

        let mut body = [0u8; 17];
        body[0] = provisioning_pdu_type_byte(0x05);
        body[1..].copy_from_slice(&confirmation);
        self.transmit_provisioning_pdu(&body, now)
    }

    /// Records the peer's confirmation value (received out of band from the caller's PB-ADV
    /// reassembly, via [`Node::handle_provisioning_pdu`]).
    fn record_peer_confirmation(&mut self, value: [u8; 16]) -> Result<(), Error> {
        let ctx = self.provisioning.as_mut().ok_or(Error::State)?;
        ctx.peer_confirmation = Some(value);
        Ok(())
    }

    /// `prov_random`: sends this side's random and, once both randoms are known, verifies the
    /// peer's confirmation and derives the session key, session nonce, and device key.
    pub fn prov_random(&mut self, now: Instant) -> Result<(), Error> {
        let random = {
            let ctx = self.provisioning.as_ref().ok_or(Error::State)?;
            *ctx.local_random.as_ref().ok_or(Error::State)?
        };
        {
            let ctx = self.provisioning.as_mut().ok_or(Error::State)?;
            ctx.fsm.advance(ProvState::Random)?;
        }
        let mut body = [0u8; 17];
        body[0] = provisioning_pdu_type_byte(0x06);
        body[1..].copy_from_slice(&random);
        self.transmit_provisioning_pdu(&body, now)
    }

    fn record_peer_random_and_derive(&mut self, peer_random: [u8; 16]) -> Result<(), Error> {
        let keys_crypto = self.keys.crypto() as *const C::Crypto;
        let ctx = self.provisioning.as_mut().ok_or(Error::State)?;
        let shared = SharedSecret(ctx.shared_secret.ok_or(Error::State)?);
        let salt = ctx.confirmation_salt.ok_or(Error::State)?;
        let local_random = ctx.local_random.ok_or(Error::State)?;
        let peer_confirmation = ctx.peer_confirmation.ok_or(Error::State)?;
        let auth = ctx.auth_value.to_bytes();

        let crypto = unsafe { &*keys_crypto };
        let key = provisioning::confirmation_key(crypto, &shared, &salt);
        let (prov_random, dev_random) = match ctx.fsm.role {
            ProvRole::Provisioner => (local_random, peer_random),
            ProvRole::Device => (peer_random, local_random),
        };
        let expected = provisioning::compute_confirmation(crypto, &key, &dev_random, &auth);
        // For the device side the peer's (provisioner's) confirmation is checked against its
        // own random; either way both sides check the *other* side's confirmation.
        let peer_is_provisioner = ctx.fsm.role == ProvRole::Device;
        let check_random = if peer_is_provisioner { prov_random } else { dev_random };
        let check = provisioning::compute_confirmation(crypto, &key, &check_random, &auth);
        if check != peer_confirmation {
            ctx.error = Some(Error::Diff);
            return Err(Error::Diff);
        }

        let prov_salt = provisioning::provisioning_salt(crypto, &salt, &prov_random, &dev_random);
        ctx.session_key = Some(provisioning::session_key(crypto, &shared, &prov_salt));
        ctx.session_nonce = Some(provisioning::session_nonce(crypto, &shared, &prov_salt));
        ctx.device_key = Some(provisioning::device_key(crypto, &shared, &prov_salt));
        ctx.peer_random = Some(peer_random);
        ctx.fsm.advance(ProvState::Data)?;
        Ok(())
    }

    /// Provisioner side only: encrypts and sends the final Provisioning Data PDU, completing the
    /// exchange from this side's perspective.
    pub fn prov_send_data(&mut self, data: ProvisioningData, now: Instant) -> Result<(), Error> {
        let (session_key, session_nonce) = {
            let ctx = self.provisioning.as_ref().ok_or(Error::State)?;
            (
                ctx.session_key.ok_or(Error::State)?,
                ctx.session_nonce.ok_or(Error::State)?,
            )
        };
        let mut cipher = [0u8; 33];
        provisioning::encrypt_provisioning_data(
            self.keys.crypto(),
            &session_key,
            &session_nonce,
            &data,
            &mut cipher,
        )?;
        {
            let ctx = self.provisioning.as_mut().ok_or(Error::State)?;
            ctx.data = Some(data);
            ctx.fsm.advance(ProvState::Complete)?;
        }
        let mut body = [0u8; 34];
        body[0] = provisioning_pdu_type_byte(0x07);
        body[1..].copy_from_slice(&cipher);
        self.transmit_provisioning_pdu(&body, now)?;
        self.finish_provisioning_as_provisioner()
    }

    fn finish_provisioning_as_provisioner(&mut self) -> Result<(), Error> {
        if let Some(link) = self.link.as_mut() {
            link.close();
        }
        self.events.provisioning_complete();
        Ok(())
    }

    /// Dispatches a reassembled provisioning PDU body to the right FSM step. Only handles the
    /// device side's reactive half of the exchange (responding to a provisioner); the
    /// provisioner-driving half is exposed through the `prov_*` methods above for the shell to
    /// call explicitly once it has decided each step's parameters.
    fn handle_provisioning_pdu(&mut self, body: &[u8], now: Instant) -> Result<InboundOutcome, Error> {
        if body.is_empty() {
            return Err(Error::Length);
        }
        match body[0] {
            0x00 => {
                let invite = Invite::parse(&body[1..])?;
                let ctx = self.provisioning.as_mut().ok_or(Error::State)?;
                ctx.fsm.advance(ProvState::LinkOpened)?;
                ctx.fsm.advance(ProvState::Invite)?;
                ctx.inputs.add_invite(&invite);
                ctx.invite = Some(invite);
                Ok(InboundOutcome::ProvisioningInvite(invite))
            }
            0x01 => {
                let capabilities = Capabilities::parse(&body[1..])?;
                let ctx = self.provisioning.as_mut().ok_or(Error::State)?;
                ctx.fsm.advance(ProvState::Capabilities)?;
                ctx.inputs.add_capabilities(&capabilities);
                ctx.capabilities = Some(capabilities);
                Ok(InboundOutcome::ProvisioningCapabilities(capabilities))
            }
            0x02 => {
                let start = Start::parse(&body[1..])?;
                {
                    let ctx = self.provisioning.as_mut().ok_or(Error::State)?;
                    if let Some(caps) = ctx.capabilities {
                        provisioning::validate_start(&start, &caps)?;
                    }
                    ctx.fsm.advance(ProvState::Start)?;
                    ctx.inputs.add_start(&start);
                    ctx.start = Some(start);
                }
                Ok(InboundOutcome::ProvisioningStart(start))
            }
            0x03 => {
                if body.len() != 65 {
                    return Err(Error::Length);
                }
                let mut key = [0u8; 64];
                key.copy_from_slice(&body[1..65]);
                self.prov_pub_key(key)?;
                Ok(InboundOutcome::ProvisioningPublicKey(key))
            }
            0x05 => {
                if body.len() != 17 {
                    return Err(Error::Length);
                }
                let mut cfm = [0u8; 16];
                cfm.copy_from_slice(&body[1..17]);
                self.record_peer_confirmation(cfm)?;
                Ok(InboundOutcome::ProvisioningConfirmation(cfm))
            }
            0x06 => {
                if body.len() != 17 {
                    return Err(Error::Length);
                }
                let mut random = [0u8; 16];
                random.copy_from_slice(&body[1..17]);
                self.record_peer_random_and_derive(random)?;
                Ok(InboundOutcome::ProvisioningRandom(random))
            }
            0x07 => {
                if body.len() != 34 {
                    return Err(Error::Length);
                }
                let (session_key, session_nonce) = {
                    let ctx = self.provisioning.as_ref().ok_or(Error::State)?;
                    (
                        ctx.session_key.ok_or(Error::State)?,
                        ctx.session_nonce.ok_or(Error::State)?,
                    )
                };
                let data = provisioning::decrypt_provisioning_data(
                    self.keys.crypto(),
                    &session_key,
                    &session_nonce,
                    &body[1..34],
                )?;
                self.apply_provisioning_data(data, now)?;
                Ok(InboundOutcome::ProvisioningComplete)
            }
            0x09 => {
                let reason = *body.get(1).unwrap_or(&0);
                self.provisioning = None;
                if let Some(link) = self.link.as_mut() {
                    link.close();
                }
                Ok(InboundOutcome::ProvisioningFailed(reason))
            }
            _ => Err(Error::Inval),
        }
    }

    /// Device side only: installs the network credentials delivered by Provisioning Data,
    /// assigns the node's unicast address, and transitions out of `Unprovisioned`.
    fn apply_provisioning_data(&mut self, data: ProvisioningData, now: Instant) -> Result<(), Error> {
        self.keys.add_net_key(data.net_key_index, data.net_key)?;
        self.iv = IvIndexStore::new(data.iv_index, now);
        self.address = Address::from_raw(data.unicast_address);
        self.role = NodeRole::Device;

        let device_key = {
            let ctx = self.provisioning.as_ref().ok_or(Error::State)?;
            ctx.device_key.ok_or(Error::State)?
        };
        self.keys
            .add_device_key(data.unicast_address, self.element_count, device_key)?;

        if let Some(link) = self.link.as_mut() {
            link.close();
        }
        self.provisioning = None;
        self.events.provisioning_complete();
        self.events.iv_updated(data.iv_index);
        Ok(())
    }

    /// Builds the Unprovisioned Device Beacon this node advertises while unprovisioned (§4.12).
    pub fn unprovisioned_beacon_pdu(&self, oob_info: u16, out: &mut [u8]) -> Result<usize, Error> {
        UnprovisionedDeviceBeacon {
            uuid: self.device_uuid,
            oob_info,
            uri_hash: None,
        }
        .write(out)
    }

    /// Builds a Secure Network Beacon for `net_key_index` (§4.12).
    pub fn secure_network_beacon_pdu(&self, net_key_index: u16, out: &mut [u8]) -> Result<usize, Error> {
        let entry = self.keys.net_key(net_key_index).ok_or(Error::NotFound)?;
        let beacon = SecureNetworkBeacon::build(
            self.keys.crypto(),
            &entry.current,
            self.iv.iv_index(),
            entry.phase != crate::keys::RefreshPhase::Normal,
            self.iv.state() == crate::seq::IvUpdateState::InProgress,
        );
        beacon.write(out)
    }
}

fn provisioning_pdu_type_byte(t: u8) -> u8 {
    t
}

/// What happened as a result of feeding `Node` a received advertisement.
pub enum InboundOutcome {
    Ignored,
    UnprovisionedBeacon(UnprovisionedDeviceBeacon),
    SecureNetworkBeacon(SecureNetworkBeacon),
    LinkOpened,
    LinkClosed,
    ControlMessage { src: Address, opcode: u8, len: usize },
    AccessMessage(ReceivedAccess),
    ProvisioningInvite(Invite),
    ProvisioningCapabilities(Capabilities),
    ProvisioningStart(Start),
    ProvisioningPublicKey([u8; 64]),
    ProvisioningConfirmation([u8; 16]),
    ProvisioningRandom([u8; 16]),
    ProvisioningComplete,
    ProvisioningFailed(u8),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCryptoProvider;
    use crate::ecdh::P256Provider;
    use crate::mailbox::SimpleMailbox;
    use crate::time::Duration;

    struct FakeRadio;
    impl crate::config::Radio for FakeRadio {
        fn transmit_adv(&mut self, _pdu: &[u8]) {}
    }

    struct FakeTimer(core::cell::Cell<u32>);
    impl crate::time::Timer for FakeTimer {
        fn now(&self) -> Instant {
            Instant::from_raw_micros(u64::from(self.0.get()))
        }
    }

    struct FakeNvm;
    impl crate::config::Nvm for FakeNvm {
        fn store(&mut self, _key: &str, _data: &[u8]) -> Result<(), Error> {
            Ok(())
        }
        fn load<'a>(&self, _key: &str, _buf: &'a mut [u8]) -> Result<Option<&'a [u8]>, Error> {
            Ok(None)
        }
        fn flush(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    struct TestConfig;
    impl Config for TestConfig {
        type Timer = FakeTimer;
        type Radio = FakeRadio;
        type Crypto = RustCryptoProvider;
        type Ecdh = P256Provider;
        type Nvm = FakeNvm;
        type Events = crate::config::NoopNotifier;
        type PacketQueue = &'static mut SimpleMailbox;
    }

    fn leaked_mailbox() -> &'static mut SimpleMailbox {
        // Tests only: a fresh mailbox per test, leaked for the `'static` the trait needs.
        Box::leak(Box::new(SimpleMailbox::new()))
    }

    extern crate std;
    use std::boxed::Box;

    fn new_node() -> Node<TestConfig> {
        let (node, _producer) = Node::<TestConfig>::new(
            DeviceUuid::from_bytes([0x42; 16]),
            NodeRole::Unprovisioned,
            RustCryptoProvider,
            P256Provider,
            FakeRadio,
            FakeTimer(core::cell::Cell::new(0)),
            FakeNvm,
            crate::config::NoopNotifier,
            leaked_mailbox(),
            Instant::from_raw_micros(0),
        );
        node
    }

    #[test]
    fn reset_clears_keys_and_address() {
        let mut node = new_node();
        node.keys.add_net_key(0, [0x11; 16]).unwrap();
        node.address = Address::from_raw(0x0003);
        node.role = NodeRole::Device;
        node.reset();
        assert_eq!(node.address, Address::from_raw(0));
        assert_eq!(node.role, NodeRole::Unprovisioned);
        assert!(node.keys.net_key(0).is_none());
    }

    #[test]
    fn tx_task_table_queues_second_submission_to_same_destination() {
        let mut table: TxTaskTable<U2, U2> = TxTaskTable::new();
        let now = Instant::from_raw_micros(0);
        let dst = Address::from_raw(0x0003);
        table
            .submit(dst, 5, 1, &[0xAA; 20], false, 0, true, 0, false, 1, now)
            .unwrap();
        table
            .submit(dst, 5, 2, &[0xBB; 20], false, 0, true, 0, false, 1, now)
            .unwrap();
        assert_eq!(table.active.len(), 1);
        assert_eq!(table.pending.len(), 1);

        table.finish(dst, now);
        assert_eq!(table.active.len(), 1);
        assert_eq!(table.pending.len(), 0);
    }

    #[test]
    fn rx_task_table_replaces_on_higher_seq_auth() {
        let mut table: RxTaskTable<U2> = RxTaskTable::new();
        let now = Instant::from_raw_micros(0);
        let src = Address::from_raw(0x1201);
        table
            .on_segment_access(src, 10, 5, true, 0, false, 1, 0, &[0u8; 12], now)
            .unwrap();
        assert_eq!(table.tasks.len(), 1);
        assert_eq!(table.tasks[0].seq_auth, 10);

        // A lower SeqAuth for the same source is stale and must not replace the stored task.
        let outcome = table
            .on_segment_access(src, 5, 5, true, 0, false, 1, 0, &[0u8; 12], now)
            .unwrap();
        assert!(matches!(outcome, RxOutcome::Stale));
        assert_eq!(table.tasks[0].seq_auth, 10);

        // A higher SeqAuth replaces the stored task outright.
        table
            .on_segment_access(src, 20, 5, true, 0, false, 1, 0, &[0u8; 12], now)
            .unwrap();
        assert_eq!(table.tasks.len(), 1);
        assert_eq!(table.tasks[0].seq_auth, 20);
    }

    #[test]
    fn on_adv_received_ignores_unknown_ad_type() {
        let mut node = new_node();
        let now = Instant::from_raw_micros(0);
        let bad = [0x02u8, 0xFF, 0x00];
        assert_eq!(
            node.on_adv_received(&bad, now).unwrap_err(),
            Error::InvalAdType
        );
    }

    #[test]
    fn prov_conn_opens_link_as_provisioner() {
        let mut node = new_node();
        node.role = NodeRole::Provisioner;
        let now = Instant::from_raw_micros(0);
        node.prov_conn(DeviceUuid::from_bytes([0x01; 16]), 0xAABBCCDD, now)
            .unwrap();
        assert!(node.link.is_some());
        assert_eq!(node.link.as_ref().unwrap().link_id, 0xAABBCCDD);
        assert_eq!(node.link.as_ref().unwrap().role, pb_adv::Role::Provisioner);

        // A second attempt while a link is already open is rejected.
        assert_eq!(
            node.prov_conn(DeviceUuid::from_bytes([0x02; 16]), 1, now),
            Err(Error::Busy)
        );
    }

    #[test]
    fn device_side_accepts_link_open_for_its_own_uuid() {
        let mut node = new_node();
        let uuid = DeviceUuid::from_bytes([0x42; 16]);
        let now = Instant::from_raw_micros(0);

        let frame = Frame {
            link_id: 7,
            trans_num: 0,
            pdu: GenericProvisioningPdu::LinkOpen { uuid },
        };
        let mut wire = [0u8; 29];
        let n = pb_adv::write(&frame, &mut wire).unwrap();
        let mut adv = [0u8; 31];
        adv[0] = (n + 1) as u8;
        adv[1] = PacketType::PbAdv.ad_type();
        adv[2..2 + n].copy_from_slice(&wire[..n]);

        let outcome = node.on_adv_received(&adv[..2 + n], now).unwrap();
        assert!(matches!(outcome, InboundOutcome::LinkOpened));
        assert!(node.link.is_some());
        assert!(node.provisioning.is_some());
        let _ = Duration::from_millis(0);
    }
}
