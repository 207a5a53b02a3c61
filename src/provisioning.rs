//! Provisioning (C14): the shared state machine, confirmation/session-key derivation, and
//! Provisioning Data encryption that turn an unprovisioned device into a node (§4.14).
//!
//! This module is transport-agnostic: it consumes and produces provisioning PDU bodies (the
//! reassembled payloads [`crate::pb_adv`] hands up) and never touches link IDs or transaction
//! numbers itself.

use crate::crypto::derive::{k1, s1};
use crate::crypto::CryptoProvider;
use crate::ecdh::{PublicKey, SharedSecret};
use crate::error::Error;

/// Provisioning PDU type byte, the first octet of every provisioning PDU body (§4.14).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PduType {
    Invite,
    Capabilities,
    Start,
    PublicKey,
    InputComplete,
    Confirmation,
    Random,
    Data,
    Complete,
    Failed,
}

impl PduType {
    fn from_byte(b: u8) -> Result<Self, Error> {
        Ok(match b {
            0x00 => PduType::Invite,
            0x01 => PduType::Capabilities,
            0x02 => PduType::Start,
            0x03 => PduType::PublicKey,
            0x04 => PduType::InputComplete,
            0x05 => PduType::Confirmation,
            0x06 => PduType::Random,
            0x07 => PduType::Data,
            0x08 => PduType::Complete,
            0x09 => PduType::Failed,
            _ => return Err(Error::Inval),
        })
    }

    fn byte(&self) -> u8 {
        match self {
            PduType::Invite => 0x00,
            PduType::Capabilities => 0x01,
            PduType::Start => 0x02,
            PduType::PublicKey => 0x03,
            PduType::InputComplete => 0x04,
            PduType::Confirmation => 0x05,
            PduType::Random => 0x06,
            PduType::Data => 0x07,
            PduType::Complete => 0x08,
            PduType::Failed => 0x09,
        }
    }
}

/// Provisioning Invite PDU: `attention_duration` in seconds.
#[derive(Debug, Copy, Clone)]
pub struct Invite {
    pub attention_duration: u8,
}

impl Invite {
    pub fn to_bytes(&self) -> [u8; 1] {
        [self.attention_duration]
    }

    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() != 1 {
            return Err(Error::Length);
        }
        Ok(Invite {
            attention_duration: payload[0],
        })
    }
}

/// Provisioning Capabilities PDU (11 octets): what the device supports.
#[derive(Debug, Copy, Clone)]
pub struct Capabilities {
    pub number_of_elements: u8,
    pub algorithms: u16,
    pub public_key_type: u8,
    pub static_oob_type: u8,
    pub output_oob_size: u8,
    pub output_oob_action: u16,
    pub input_oob_size: u8,
    pub input_oob_action: u16,
}

impl Capabilities {
    pub fn to_bytes(&self) -> [u8; 11] {
        let a = self.algorithms.to_be_bytes();
        let ooa = self.output_oob_action.to_be_bytes();
        let ioa = self.input_oob_action.to_be_bytes();
        [
            self.number_of_elements,
            a[0],
            a[1],
            self.public_key_type,
            self.static_oob_type,
            self.output_oob_size,
            ooa[0],
            ooa[1],
            self.input_oob_size,
            ioa[0],
            ioa[1],
        ]
    }

    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() != 11 {
            return Err(Error::Length);
        }
        Ok(Capabilities {
            number_of_elements: payload[0],
            algorithms: u16::from_be_bytes([payload[1], payload[2]]),
            public_key_type: payload[3],
            static_oob_type: payload[4],
            output_oob_size: payload[5],
            output_oob_action: u16::from_be_bytes([payload[6], payload[7]]),
            input_oob_size: payload[8],
            input_oob_action: u16::from_be_bytes([payload[9], payload[10]]),
        })
    }
}

/// Provisioning Start PDU (5 octets): the algorithm and OOB method the provisioner selected.
#[derive(Debug, Copy, Clone)]
pub struct Start {
    pub algorithm: u8,
    pub public_key: u8,
    pub authentication_method: u8,
    pub authentication_action: u8,
    pub authentication_size: u8,
}

impl Start {
    pub fn to_bytes(&self) -> [u8; 5] {
        [
            self.algorithm,
            self.public_key,
            self.authentication_method,
            self.authentication_action,
            self.authentication_size,
        ]
    }

    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() != 5 {
            return Err(Error::Length);
        }
        Ok(Start {
            algorithm: payload[0],
            public_key: payload[1],
            authentication_method: payload[2],
            authentication_action: payload[3],
            authentication_size: payload[4],
        })
    }
}

/// Validates a Start PDU against the Capabilities the device previously advertised, per the
/// authentication-method combination rules (§4.14): static OOB requires the device to have
/// advertised it; output/input OOB require a nonzero size and a method the device's action bitmap
/// actually lists.
pub fn validate_start(start: &Start, capabilities: &Capabilities) -> Result<(), Error> {
    if start.algorithm != 0x00 {
        return Err(Error::Inval);
    }
    match start.authentication_method {
        0x00 => {
            if start.authentication_action != 0 || start.authentication_size != 0 {
                return Err(Error::Inval);
            }
        }
        0x01 => {
            if capabilities.static_oob_type & 0x01 == 0 {
                return Err(Error::Inval);
            }
        }
        0x02 => {
            if capabilities.output_oob_action & (1 << start.authentication_action) == 0
                || start.authentication_size == 0
                || start.authentication_size > capabilities.output_oob_size
            {
                return Err(Error::Inval);
            }
        }
        0x03 => {
            if capabilities.input_oob_action & (1 << start.authentication_action) == 0
                || start.authentication_size == 0
                || start.authentication_size > capabilities.input_oob_size
            {
                return Err(Error::Inval);
            }
        }
        _ => return Err(Error::Inval),
    }
    Ok(())
}

/// The authentication value (OOB data) both sides feed into confirmation, encoded to the fixed
/// 16-octet form the confirmation computation requires (§4.14): numeric values are zero-padded on
/// the left, byte strings are zero-padded on the right.
#[derive(Debug, Copy, Clone)]
pub enum AuthValue {
    NoOob,
    Static([u8; 16]),
    Numeric(u32),
    Alphanumeric([u8; 8]),
}

impl AuthValue {
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        match self {
            AuthValue::NoOob => {}
            AuthValue::Static(bytes) => out = *bytes,
            AuthValue::Numeric(n) => out[12..16].copy_from_slice(&n.to_be_bytes()),
            AuthValue::Alphanumeric(bytes) => out[..8].copy_from_slice(bytes),
        }
        out
    }
}

/// Accumulates `ConfirmationInputs = Invite ‖ Capabilities ‖ Start ‖ ProvisionerPubKey ‖
/// DevicePubKey` (145 octets total) as each PDU is exchanged, so `confirmation_salt` can be
/// computed once the public keys are known without re-deriving earlier fields.
pub struct ConfirmationInputs {
    buf: [u8; 145],
    filled: usize,
}

impl ConfirmationInputs {
    pub fn new() -> Self {
        ConfirmationInputs {
            buf: [0u8; 145],
            filled: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf[self.filled..self.filled + bytes.len()].copy_from_slice(bytes);
        self.filled += bytes.len();
    }

    pub fn add_invite(&mut self, invite: &Invite) {
        self.push(&invite.to_bytes());
    }

    pub fn add_capabilities(&mut self, capabilities: &Capabilities) {
        self.push(&capabilities.to_bytes());
    }

    pub fn add_start(&mut self, start: &Start) {
        self.push(&start.to_bytes());
    }

    pub fn add_public_keys(&mut self, provisioner: &PublicKey, device: &PublicKey) {
        self.push(&provisioner.0);
        self.push(&device.0);
    }

    /// Must be called only once all five fields have been added.
    pub fn finish(&self) -> &[u8; 145] {
        debug_assert_eq!(self.filled, 145);
        &self.buf
    }
}

impl Default for ConfirmationInputs {
    fn default() -> Self {
        Self::new()
    }
}

/// `confirmation_salt = s1(confirmation_inputs)`.
pub fn confirmation_salt(crypto: &impl CryptoProvider, inputs: &ConfirmationInputs) -> [u8; 16] {
    s1(crypto, inputs.finish())
}

/// `confirmation_key = k1(shared_secret, confirmation_salt, "prck")`.
pub fn confirmation_key(
    crypto: &impl CryptoProvider,
    shared_secret: &SharedSecret,
    salt: &[u8; 16],
) -> [u8; 16] {
    k1(crypto, &shared_secret.0, salt, b"prck")
}

/// `confirmation = AES-CMAC(confirmation_key, random ‖ auth_value)`.
pub fn compute_confirmation(
    crypto: &impl CryptoProvider,
    key: &[u8; 16],
    random: &[u8; 16],
    auth_value: &[u8; 16],
) -> [u8; 16] {
    let mut msg = [0u8; 32];
    msg[..16].copy_from_slice(random);
    msg[16..].copy_from_slice(auth_value);
    crypto.aes_cmac(key, &msg)
}

/// `provisioning_salt = s1(confirmation_salt ‖ random_provisioner ‖ random_device)`.
pub fn provisioning_salt(
    crypto: &impl CryptoProvider,
    salt: &[u8; 16],
    random_provisioner: &[u8; 16],
    random_device: &[u8; 16],
) -> [u8; 16] {
    let mut msg = [0u8; 48];
    msg[..16].copy_from_slice(salt);
    msg[16..32].copy_from_slice(random_provisioner);
    msg[32..].copy_from_slice(random_device);
    s1(crypto, &msg)
}

/// `session_key = k1(shared_secret, provisioning_salt, "prsk")`.
pub fn session_key(
    crypto: &impl CryptoProvider,
    shared_secret: &SharedSecret,
    salt: &[u8; 16],
) -> [u8; 16] {
    k1(crypto, &shared_secret.0, salt, b"prsk")
}

/// `session_nonce` is the last 13 octets of `k1(shared_secret, provisioning_salt, "prsn")`.
pub fn session_nonce(
    crypto: &impl CryptoProvider,
    shared_secret: &SharedSecret,
    salt: &[u8; 16],
) -> [u8; 13] {
    let full = k1(crypto, &shared_secret.0, salt, b"prsn");
    let mut out = [0u8; 13];
    out.copy_from_slice(&full[3..16]);
    out
}

/// `device_key = k1(shared_secret, provisioning_salt, "prdk")`.
pub fn device_key(
    crypto: &impl CryptoProvider,
    shared_secret: &SharedSecret,
    salt: &[u8; 16],
) -> [u8; 16] {
    k1(crypto, &shared_secret.0, salt, b"prdk")
}

/// Provisioning Data: the net key, key index, flags, IV index, and unicast address handed to a
/// newly provisioned device (25 octets before encryption).
#[derive(Debug, Copy, Clone)]
pub struct ProvisioningData {
    pub net_key: [u8; 16],
    pub net_key_index: u16,
    pub flags: u8,
    pub iv_index: u32,
    pub unicast_address: u16,
}

const PROVISIONING_DATA_LEN: usize = 25;
pub const PROVISIONING_DATA_MIC_LEN: usize = 8;

impl ProvisioningData {
    fn to_bytes(&self) -> [u8; PROVISIONING_DATA_LEN] {
        let mut out = [0u8; PROVISIONING_DATA_LEN];
        out[..16].copy_from_slice(&self.net_key);
        out[16..18].copy_from_slice(&self.net_key_index.to_be_bytes());
        out[18] = self.flags;
        out[19..23].copy_from_slice(&self.iv_index.to_be_bytes());
        out[23..25].copy_from_slice(&self.unicast_address.to_be_bytes());
        out
    }

    fn from_bytes(bytes: &[u8; PROVISIONING_DATA_LEN]) -> Self {
        let mut net_key = [0u8; 16];
        net_key.copy_from_slice(&bytes[..16]);
        ProvisioningData {
            net_key,
            net_key_index: u16::from_be_bytes([bytes[16], bytes[17]]),
            flags: bytes[18],
            iv_index: u32::from_be_bytes([bytes[19], bytes[20], bytes[21], bytes[22]]),
            unicast_address: u16::from_be_bytes([bytes[23], bytes[24]]),
        }
    }
}

/// Encrypts `data` under `session_key`/`session_nonce`, writing `ciphertext ‖ MIC` (33 octets) to
/// `out`.
pub fn encrypt_provisioning_data(
    crypto: &impl CryptoProvider,
    session_key: &[u8; 16],
    session_nonce: &[u8; 13],
    data: &ProvisioningData,
    out: &mut [u8],
) -> Result<usize, Error> {
    crypto.aes_ccm_encrypt(
        session_key,
        session_nonce,
        &[],
        &data.to_bytes(),
        PROVISIONING_DATA_MIC_LEN,
        out,
    )
}

/// Decrypts and authenticates a 33-octet `ciphertext ‖ MIC` Provisioning Data PDU.
pub fn decrypt_provisioning_data(
    crypto: &impl CryptoProvider,
    session_key: &[u8; 16],
    session_nonce: &[u8; 13],
    ciphertext: &[u8],
) -> Result<ProvisioningData, Error> {
    let mut plain = [0u8; PROVISIONING_DATA_LEN];
    let n = crypto.aes_ccm_decrypt(
        session_key,
        session_nonce,
        &[],
        ciphertext,
        PROVISIONING_DATA_MIC_LEN,
        &mut plain,
    )?;
    if n != PROVISIONING_DATA_LEN {
        return Err(Error::Length);
    }
    Ok(ProvisioningData::from_bytes(&plain))
}

/// Reason code carried by a Provisioning Failed PDU (§4.14).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailReason {
    InvalidPdu,
    InvalidFormat,
    UnexpectedPdu,
    ConfirmationFailed,
    OutOfResources,
    DecryptionFailed,
    UnexpectedError,
    CannotAssignAddresses,
}

impl FailReason {
    pub fn byte(&self) -> u8 {
        match self {
            FailReason::InvalidPdu => 0x01,
            FailReason::InvalidFormat => 0x02,
            FailReason::UnexpectedPdu => 0x03,
            FailReason::ConfirmationFailed => 0x04,
            FailReason::OutOfResources => 0x05,
            FailReason::DecryptionFailed => 0x06,
            FailReason::UnexpectedError => 0x07,
            FailReason::CannotAssignAddresses => 0x08,
        }
    }
}

/// Which end of the exchange a state machine instance drives: the transition table is the same
/// shape for both, but a provisioner drives steps the device only responds to (and vice versa).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Provisioner,
    Device,
}

/// Provisioning FSM state (§4.14). `Failed` is reachable from any state at or past `Invite`;
/// `LinkClosing` drains any state once the link itself is being torn down.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    LinkOpening,
    LinkOpened,
    Invite,
    Capabilities,
    Start,
    PublicKey,
    InputComplete,
    Confirmation,
    Random,
    Data,
    Complete,
    Failed,
    LinkClosing,
}

impl State {
    fn rank(&self) -> u8 {
        match self {
            State::Idle => 0,
            State::LinkOpening => 1,
            State::LinkOpened => 2,
            State::Invite => 3,
            State::Capabilities => 4,
            State::Start => 5,
            State::PublicKey => 6,
            State::InputComplete => 7,
            State::Confirmation => 8,
            State::Random => 9,
            State::Data => 10,
            State::Complete => 11,
            State::Failed => 12,
            State::LinkClosing => 13,
        }
    }
}

/// Drives state transitions without owning any key material itself; callers compute confirmation
/// and session keys with the free functions above and call [`Fsm::advance`] once each step's
/// cryptographic checks (if any) have passed.
pub struct Fsm {
    pub role: Role,
    pub state: State,
}

impl Fsm {
    pub fn new(role: Role) -> Self {
        Fsm {
            role,
            state: State::Idle,
        }
    }

    /// Attempts to move to `next`, rejecting any transition that isn't the next step in the
    /// canonical sequence, a jump to `Failed` from `Invite` or later, or a jump to `LinkClosing`
    /// from anywhere.
    pub fn advance(&mut self, next: State) -> Result<(), Error> {
        let allowed = match next {
            State::LinkClosing => true,
            State::Failed => self.state.rank() >= State::Invite.rank(),
            _ => next.rank() == self.state.rank() + 1,
        };
        if !allowed {
            return Err(Error::State);
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCryptoProvider;
    use crate::ecdh::{EcdhProvider, P256Provider, SecretKey};
    use rand_core::{CryptoRng, RngCore};

    struct FixedRng(u8);
    impl RngCore for FixedRng {
        fn next_u32(&mut self) -> u32 {
            rand_core::impls::next_u32_via_fill(self)
        }
        fn next_u64(&mut self) -> u64 {
            rand_core::impls::next_u64_via_fill(self)
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(self.0);
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }
    impl CryptoRng for FixedRng {}

    #[test]
    fn auth_value_encodes_numeric_right_justified() {
        let v = AuthValue::Numeric(0x1234).to_bytes();
        assert_eq!(&v[12..], &[0x00, 0x00, 0x12, 0x34]);
        assert_eq!(&v[..12], &[0u8; 12]);
    }

    #[test]
    fn start_validation_rejects_unsupported_static_oob() {
        let caps = Capabilities {
            number_of_elements: 1,
            algorithms: 0x0001,
            public_key_type: 0,
            static_oob_type: 0x00,
            output_oob_size: 0,
            output_oob_action: 0,
            input_oob_size: 0,
            input_oob_action: 0,
        };
        let start = Start {
            algorithm: 0x00,
            public_key: 0x00,
            authentication_method: 0x01,
            authentication_action: 0,
            authentication_size: 0,
        };
        assert_eq!(validate_start(&start, &caps).unwrap_err(), Error::Inval);
    }

    #[test]
    fn start_validation_accepts_matching_output_oob() {
        let caps = Capabilities {
            number_of_elements: 1,
            algorithms: 0x0001,
            public_key_type: 0,
            static_oob_type: 0,
            output_oob_size: 4,
            output_oob_action: 0b0000_0100,
            input_oob_size: 0,
            input_oob_action: 0,
        };
        let start = Start {
            algorithm: 0x00,
            public_key: 0x00,
            authentication_method: 0x02,
            authentication_action: 2,
            authentication_size: 4,
        };
        validate_start(&start, &caps).unwrap();
    }

    #[test]
    fn fsm_rejects_skipping_a_state() {
        let mut fsm = Fsm::new(Role::Provisioner);
        fsm.advance(State::LinkOpening).unwrap();
        assert_eq!(fsm.advance(State::Invite).unwrap_err(), Error::State);
    }

    #[test]
    fn fsm_allows_failure_from_invite_onward_but_not_before() {
        let mut fsm = Fsm::new(Role::Device);
        assert_eq!(fsm.advance(State::Failed).unwrap_err(), Error::State);
        fsm.advance(State::LinkOpening).unwrap();
        fsm.advance(State::LinkOpened).unwrap();
        fsm.advance(State::Invite).unwrap();
        fsm.advance(State::Failed).unwrap();
    }

    #[test]
    fn confirmation_and_session_keys_match_between_both_sides() {
        let crypto = RustCryptoProvider;
        let mut provisioner_ecdh = P256Provider;
        let mut device_ecdh = P256Provider;
        let (prov_secret, prov_pub) = provisioner_ecdh.generate_keypair(&mut FixedRng(0x11));
        let (dev_secret, dev_pub) = device_ecdh.generate_keypair(&mut FixedRng(0x22));

        let shared_a = prov_secret.agree(&dev_pub).unwrap();
        let shared_b = dev_secret.agree(&prov_pub).unwrap();
        assert_eq!(shared_a.0, shared_b.0);

        let invite = Invite {
            attention_duration: 5,
        };
        let caps = Capabilities {
            number_of_elements: 1,
            algorithms: 0x0001,
            public_key_type: 0,
            static_oob_type: 0,
            output_oob_size: 0,
            output_oob_action: 0,
            input_oob_size: 0,
            input_oob_action: 0,
        };
        let start = Start {
            algorithm: 0,
            public_key: 0,
            authentication_method: 0,
            authentication_action: 0,
            authentication_size: 0,
        };

        let mut inputs_a = ConfirmationInputs::new();
        inputs_a.add_invite(&invite);
        inputs_a.add_capabilities(&caps);
        inputs_a.add_start(&start);
        inputs_a.add_public_keys(&prov_pub, &dev_pub);
        let salt_a = confirmation_salt(&crypto, &inputs_a);

        let mut inputs_b = ConfirmationInputs::new();
        inputs_b.add_invite(&invite);
        inputs_b.add_capabilities(&caps);
        inputs_b.add_start(&start);
        inputs_b.add_public_keys(&prov_pub, &dev_pub);
        let salt_b = confirmation_salt(&crypto, &inputs_b);
        assert_eq!(salt_a, salt_b);

        let auth = AuthValue::NoOob.to_bytes();
        let random_provisioner = [0x01u8; 16];
        let random_device = [0x02u8; 16];

        let key_a = confirmation_key(&crypto, &shared_a, &salt_a);
        let key_b = confirmation_key(&crypto, &shared_b, &salt_b);
        assert_eq!(key_a, key_b);

        let confirmation_provisioner = compute_confirmation(&crypto, &key_a, &random_provisioner, &auth);
        let confirmation_device = compute_confirmation(&crypto, &key_b, &random_device, &auth);
        assert_ne!(confirmation_provisioner, confirmation_device);

        let p_salt_a = provisioning_salt(&crypto, &salt_a, &random_provisioner, &random_device);
        let p_salt_b = provisioning_salt(&crypto, &salt_b, &random_provisioner, &random_device);
        assert_eq!(p_salt_a, p_salt_b);

        let sk_a = session_key(&crypto, &shared_a, &p_salt_a);
        let sk_b = session_key(&crypto, &shared_b, &p_salt_b);
        assert_eq!(sk_a, sk_b);

        let sn_a = session_nonce(&crypto, &shared_a, &p_salt_a);
        let sn_b = session_nonce(&crypto, &shared_b, &p_salt_b);
        assert_eq!(sn_a, sn_b);

        let dk_a = device_key(&crypto, &shared_a, &p_salt_a);
        let dk_b = device_key(&crypto, &shared_b, &p_salt_b);
        assert_eq!(dk_a, dk_b);
    }

    #[test]
    fn provisioning_data_round_trips() {
        let crypto = RustCryptoProvider;
        let session_key = [0x55u8; 16];
        let session_nonce = [0x01u8; 13];
        let data = ProvisioningData {
            net_key: [0x77u8; 16],
            net_key_index: 3,
            flags: 0,
            iv_index: 0x00000001,
            unicast_address: 0x0003,
        };
        let mut out = [0u8; 64];
        let n = encrypt_provisioning_data(&crypto, &session_key, &session_nonce, &data, &mut out).unwrap();
        assert_eq!(n, PROVISIONING_DATA_MIC_LEN + 25);

        let decoded = decrypt_provisioning_data(&crypto, &session_key, &session_nonce, &out[..n]).unwrap();
        assert_eq!(decoded.net_key, data.net_key);
        assert_eq!(decoded.unicast_address, data.unicast_address);
    }

    #[test]
    fn pdu_type_round_trips() {
        for b in 0x00..=0x09u8 {
            let ty = PduType::from_byte(b).unwrap();
            assert_eq!(ty.byte(), b);
        }
        assert!(PduType::from_byte(0x0A).is_err());
    }
}
