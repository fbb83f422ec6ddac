//! BR/EDR pairing state machines
//!
//! Secure Simple Pairing runs as reactions to HCI events: the IO capability exchange picks the
//! association model, the user (through the [`PairingDelegate`]) settles the confirmation, and
//! the Controller finishes with a link key. Legacy (pre-SSP) PIN pairing is the fallback; its
//! PIN code request can arrive before the ACL connection completes, so legacy state may predate
//! the connection and is handed over when the connection exists.
//!
//! The pairing phases are a sum type; each transition consumes the current phase and produces
//! the next. A phase that stalls longer than [`PAIRING_TIMEOUT`] fails pairing and the manager
//! disconnects the link.
//!
//! [`PairingDelegate`]: crate::PairingDelegate

use crate::peer::{LinkKey, PeerCache};
use crate::{
    select_association_model, AssociationModel, BrEdrSecurityMode, PeerId, SharedDelegate,
};
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use bluejay_core::dispatch::{Dispatcher, TaskId};
use bluejay_core::errors::{Error, HostError};
use bluejay_core::security::SecurityLevel;
use bluejay_core::BluetoothDeviceAddress;
use bluejay_hci::command_channel::CommandChannel;
use bluejay_hci::commands::link_control::{
    AuthenticationRequested, IoCapabilityRequestReply, LinkKeyRequestNegativeReply,
    LinkKeyRequestReply, PinCodeRequestNegativeReply, PinCodeRequestReply, SetConnectionEncryption,
    UserConfirmationRequestNegativeReply, UserConfirmationRequestReply,
    UserPasskeyRequestNegativeReply, UserPasskeyRequestReply,
};
use bluejay_hci::commands::CommandParameter;
use bluejay_hci::events::{
    EncryptionEnabled, IoCapability, IoCapabilityResponseData, LinkKeyType,
};
use bluejay_hci::ConnectionHandle;
use core::cell::RefCell;
use core::time::Duration;

/// Inactivity budget of one pairing phase
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Authentication requirements octet: MITM protection required, general bonding
const AUTH_REQUIREMENTS_MITM_BONDING: u8 = 0x05;

/// Authentication requirements octet: no MITM protection, general bonding
const AUTH_REQUIREMENTS_BONDING: u8 = 0x04;

type PairCallback = Box<dyn FnOnce(Result<(), HostError>)>;

/// Listener installed by the connection manager for the outcome of pairing
pub(crate) type CompletionListener = Box<dyn FnMut(Result<(LinkKey, SecurityLevel), Error>)>;

/// The discrete phases of pairing
enum Phase {
    Idle,
    /// We sent Authentication Requested; the Controller will ask for our IO capability
    InitiatorWaitIoCapRequest,
    /// IO capabilities are moving; ours sent when `replied`, the peer's held outside the phase
    CapabilityExchange { initiator: bool, replied: bool },
    /// The association model is running through the delegate and the peer
    WaitUserInput { model: AssociationModel },
    WaitPairingComplete { model: AssociationModel },
    WaitLinkKey,
    /// Initiator side: the link key exists, authentication has yet to complete
    InitiatorWaitAuthComplete { link_key: LinkKey },
    WaitEncryption { link_key: LinkKey },
    /// Legacy pairing: the PIN went in, the combination key is coming
    LegacyWaitLinkKey,
    Failed(Error),
}

pub(crate) struct PairingStateManager {
    command_channel: CommandChannel,
    dispatcher: Dispatcher,
    cache: PeerCache,
    delegate: SharedDelegate,
    peer_id: PeerId,
    address: BluetoothDeviceAddress,
    handle: ConnectionHandle,
    local_iocap: IoCapability,
    security_mode: BrEdrSecurityMode,
    initiator: bool,
    phase: Phase,
    peer_capability: Option<IoCapabilityResponseData>,
    pair_callbacks: Vec<PairCallback>,
    completion_listener: Option<CompletionListener>,
    /// Bumped on every phase transition so stale timeout tasks no-op
    epoch: Rc<RefCell<u64>>,
    timeout: Option<TaskId>,
    timeout_handler: Rc<dyn Fn()>,
}

impl PairingStateManager {
    /// Create the pairing state for a new connection
    ///
    /// `legacy_in_progress` carries over legacy pairing state that was created when a PIN code
    /// request arrived before the connection complete event.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        command_channel: CommandChannel,
        dispatcher: Dispatcher,
        cache: PeerCache,
        delegate: SharedDelegate,
        peer_id: PeerId,
        address: BluetoothDeviceAddress,
        handle: ConnectionHandle,
        local_iocap: IoCapability,
        security_mode: BrEdrSecurityMode,
        legacy_in_progress: bool,
        timeout_handler: Rc<dyn Fn()>,
    ) -> Self {
        let mut manager = PairingStateManager {
            command_channel,
            dispatcher,
            cache,
            delegate,
            peer_id,
            address,
            handle,
            local_iocap,
            security_mode,
            initiator: false,
            phase: Phase::Idle,
            peer_capability: None,
            pair_callbacks: Vec::new(),
            completion_listener: None,
            epoch: Rc::new(RefCell::new(0)),
            timeout: None,
            timeout_handler,
        };

        if legacy_in_progress {
            manager.transition(Phase::LegacyWaitLinkKey);
        }

        manager
    }

    pub(crate) fn set_completion_listener(&mut self, listener: CompletionListener) {
        self.completion_listener = Some(listener);
    }

    /// Check if pairing is running
    pub(crate) fn is_pairing(&self) -> bool {
        !matches!(self.phase, Phase::Idle | Phase::Failed(_))
    }

    fn mitm_preferred(&self) -> bool {
        self.local_iocap != IoCapability::NoInputNoOutput
    }

    fn transition(&mut self, phase: Phase) {
        *self.epoch.borrow_mut() += 1;

        if let Some(task) = self.timeout.take() {
            self.dispatcher.cancel(task);
        }

        let arm = !matches!(phase, Phase::Idle | Phase::Failed(_));

        self.phase = phase;

        if arm {
            let epoch = self.epoch.clone();
            let expected = *epoch.borrow();
            let handler = self.timeout_handler.clone();

            self.timeout = Some(self.dispatcher.post_after(PAIRING_TIMEOUT, move || {
                if *epoch.borrow() == expected {
                    handler();
                }
            }));
        }
    }

    /// Start pairing as the initiator
    pub(crate) fn initiate(&mut self, callback: PairCallback) {
        self.pair_callbacks.push(callback);

        if self.is_pairing() {
            return;
        }

        self.initiator = true;

        log::info!("(GAP) initiating pairing with {}", self.address);

        self.command_channel.send_command_expect_status(
            AuthenticationRequested {
                connection_handle: self.handle,
            }
            .into_packet(),
            Box::new(|_| ()),
        );

        self.transition(Phase::InitiatorWaitIoCapRequest);
    }

    /// Abort pairing locally
    pub(crate) fn abort(&mut self, reason: Error) {
        self.fail(reason);
    }

    fn fail(&mut self, reason: Error) {
        log::warn!("(GAP) pairing with {} failed: {}", self.address, reason);

        self.transition(Phase::Failed(reason));

        self.delegate.on_pairing_complete(self.peer_id, false);

        for callback in self.pair_callbacks.drain(..) {
            callback(Err(HostError::PairingFailed(reason)));
        }

        if let Some(listener) = self.completion_listener.as_mut() {
            listener(Err(reason));
        }
    }

    fn succeed(&mut self, link_key: LinkKey, level: SecurityLevel) {
        self.transition(Phase::Idle);

        self.delegate.on_pairing_complete(self.peer_id, true);

        for callback in self.pair_callbacks.drain(..) {
            callback(Ok(()));
        }

        if let Some(listener) = self.completion_listener.as_mut() {
            listener(Ok((link_key, level)));
        }
    }

    /// The Controller wants our IO capability
    pub(crate) fn on_io_capability_request(&mut self) {
        // Secure Connections only hosts never fall back to a weaker association
        let requirements = if self.mitm_preferred()
            || self.security_mode == BrEdrSecurityMode::SecureConnectionsOnly
        {
            AUTH_REQUIREMENTS_MITM_BONDING
        } else {
            AUTH_REQUIREMENTS_BONDING
        };

        self.command_channel.send_command(
            IoCapabilityRequestReply {
                address: self.address,
                io_capability: self.local_iocap,
                oob_data_present: false,
                authentication_requirements: requirements,
            }
            .into_packet(),
            Box::new(|_| ()),
        );

        let initiator = matches!(self.phase, Phase::InitiatorWaitIoCapRequest) || self.initiator;

        self.advance_capability_exchange(initiator, true);
    }

    /// The peer's IO capability arrived
    pub(crate) fn on_io_capability_response(&mut self, data: &IoCapabilityResponseData) {
        self.peer_capability = Some(*data);

        let (initiator, replied) = match self.phase {
            Phase::CapabilityExchange { initiator, replied } => (initiator, replied),
            Phase::InitiatorWaitIoCapRequest => (true, false),
            _ => (self.initiator, false),
        };

        self.advance_capability_exchange(initiator, replied);
    }

    /// Move through the capability exchange once both halves are known
    fn advance_capability_exchange(&mut self, initiator: bool, replied: bool) {
        self.initiator = initiator;

        let peer_capability = self.peer_capability;

        match (peer_capability, replied) {
            (Some(peer), true) => {
                let model = select_association_model(
                    self.local_iocap,
                    peer.io_capability,
                    self.mitm_preferred(),
                    peer.mitm_required(),
                );

                log::info!("(GAP) pairing with {} via {:?}", self.address, model);

                self.transition(Phase::WaitUserInput { model });
            }
            _ => self.transition(Phase::CapabilityExchange { initiator, replied }),
        }
    }

    /// The Controller wants user confirmation (numeric comparison or just works)
    pub(crate) fn on_user_confirmation_request(&mut self, numeric_value: u32) {
        let model = match self.phase {
            Phase::WaitUserInput { model } => model,
            _ => {
                self.negative_confirmation();

                return;
            }
        };

        let comparison = match model {
            AssociationModel::NumericComparison => Some(numeric_value),
            _ => None,
        };

        let command_channel = self.command_channel.clone();
        let address = self.address;

        self.delegate.confirm_pairing(
            self.peer_id,
            comparison,
            Box::new(move |accepted| {
                if accepted {
                    command_channel.send_command(
                        UserConfirmationRequestReply { address }.into_packet(),
                        Box::new(|_| ()),
                    );
                } else {
                    command_channel.send_command(
                        UserConfirmationRequestNegativeReply { address }.into_packet(),
                        Box::new(|_| ()),
                    );
                }
            }),
        );

        self.transition(Phase::WaitPairingComplete { model });
    }

    fn negative_confirmation(&mut self) {
        self.command_channel.send_command(
            UserConfirmationRequestNegativeReply {
                address: self.address,
            }
            .into_packet(),
            Box::new(|_| ()),
        );
    }

    /// The Controller wants the passkey shown by the peer
    pub(crate) fn on_user_passkey_request(&mut self) {
        let model = match self.phase {
            Phase::WaitUserInput { model } => model,
            _ => AssociationModel::PasskeyEntryInput,
        };

        let command_channel = self.command_channel.clone();
        let address = self.address;

        self.delegate.request_passkey(
            self.peer_id,
            Box::new(move |passkey| match passkey {
                Some(passkey) => command_channel.send_command(
                    UserPasskeyRequestReply { address, passkey }.into_packet(),
                    Box::new(|_| ()),
                ),
                None => command_channel.send_command(
                    UserPasskeyRequestNegativeReply { address }.into_packet(),
                    Box::new(|_| ()),
                ),
            }),
        );

        self.transition(Phase::WaitPairingComplete { model });
    }

    /// The Controller is displaying a passkey through us
    pub(crate) fn on_user_passkey_notification(&mut self, passkey: u32) {
        self.delegate.display_passkey(self.peer_id, passkey);

        let model = match self.phase {
            Phase::WaitUserInput { model } => model,
            _ => AssociationModel::PasskeyEntryDisplay,
        };

        self.transition(Phase::WaitPairingComplete { model });
    }

    /// The Controller wants a stored link key
    pub(crate) fn on_link_key_request(&mut self) {
        let stored = self
            .cache
            .find_by_id(self.peer_id)
            .and_then(|peer| peer.bond.bredr_link_key);

        let acceptable = stored.map(|key| self.key_meets_policy(&key)).unwrap_or(false);

        match (stored, acceptable) {
            (Some(key), true) => {
                self.command_channel.send_command(
                    LinkKeyRequestReply {
                        address: self.address,
                        link_key: key.value,
                    }
                    .into_packet(),
                    Box::new(|_| ()),
                );
            }
            _ => {
                self.command_channel.send_command(
                    LinkKeyRequestNegativeReply {
                        address: self.address,
                    }
                    .into_packet(),
                    Box::new(|_| ()),
                );
            }
        }
    }

    fn key_meets_policy(&self, key: &LinkKey) -> bool {
        match self.security_mode {
            BrEdrSecurityMode::Mode4 => true,
            BrEdrSecurityMode::SecureConnectionsOnly => key.is_authenticated_secure_connections(),
        }
    }

    /// The Controller wants a PIN code (legacy pairing)
    pub(crate) fn on_pin_code_request(&mut self) {
        let command_channel = self.command_channel.clone();
        let address = self.address;

        self.delegate.request_pin_code(
            self.peer_id,
            Box::new(move |pin| match pin {
                Some(pin_code) if (1..=16).contains(&pin_code.len()) => command_channel.send_command(
                    PinCodeRequestReply { address, pin_code }.into_packet(),
                    Box::new(|_| ()),
                ),
                _ => command_channel.send_command(
                    PinCodeRequestNegativeReply { address }.into_packet(),
                    Box::new(|_| ()),
                ),
            }),
        );

        self.transition(Phase::LegacyWaitLinkKey);
    }

    /// Simple pairing finished in the Controller
    pub(crate) fn on_simple_pairing_complete(&mut self, status: Error) {
        match status.into_result() {
            Ok(()) => self.transition(Phase::WaitLinkKey),
            Err(error) => self.fail(error),
        }
    }

    /// A new link key exists
    pub(crate) fn on_link_key_notification(&mut self, value: [u8; 16], key_type: LinkKeyType) {
        if matches!(self.phase, Phase::LegacyWaitLinkKey) {
            self.on_legacy_link_key(value, key_type);

            return;
        }

        let key = LinkKey { value, key_type };

        if !self.key_meets_policy(&key) {
            log::warn!(
                "(GAP) rejecting {:?} link key under the secure connections only policy",
                key_type
            );

            self.fail(Error::AuthenticationFailure);

            return;
        }

        let peer_id = self.peer_id;

        self.cache.store_bond(peer_id, |bond| bond.bredr_link_key = Some(key));

        if self.initiator {
            // authentication completes on our side, then we enable encryption
            self.transition(Phase::InitiatorWaitAuthComplete { link_key: key });
        } else {
            self.transition(Phase::WaitEncryption { link_key: key });
        }
    }

    /// Authentication finished (initiator side)
    pub(crate) fn on_authentication_complete(&mut self, status: Error) {
        if let Err(error) = status.into_result() {
            self.fail(error);

            return;
        }

        let link_key = match &self.phase {
            Phase::InitiatorWaitAuthComplete { link_key } => *link_key,
            // authentication with an already stored key; no new pairing ran
            _ => match self
                .cache
                .find_by_id(self.peer_id)
                .and_then(|peer| peer.bond.bredr_link_key)
            {
                Some(key) => key,
                None => return,
            },
        };

        self.command_channel.send_command_expect_status(
            SetConnectionEncryption {
                connection_handle: self.handle,
                encryption_enable: true,
            }
            .into_packet(),
            Box::new(|_| ()),
        );

        self.transition(Phase::WaitEncryption { link_key });
    }

    /// The link encryption changed
    pub(crate) fn on_encryption_change(&mut self, status: Error, enabled: EncryptionEnabled) {
        if let Err(error) = status.into_result() {
            if self.is_pairing() {
                self.fail(error);
            }

            return;
        }

        if !enabled.is_on() {
            return;
        }

        let link_key = match &self.phase {
            Phase::WaitEncryption { link_key } => *link_key,
            Phase::LegacyWaitLinkKey | Phase::WaitLinkKey => return,
            _ => {
                // encryption with a stored key outside a pairing procedure
                match self
                    .cache
                    .find_by_id(self.peer_id)
                    .and_then(|peer| peer.bond.bredr_link_key)
                {
                    Some(key) => key,
                    None => return,
                }
            }
        };

        let level = security_level_of(&link_key);

        log::info!("(GAP) link with {} encrypted at {}", self.address, level);

        self.succeed(link_key, level);
    }

    /// Legacy pairing produced its combination key
    pub(crate) fn on_legacy_link_key(&mut self, value: [u8; 16], key_type: LinkKeyType) {
        let key = LinkKey { value, key_type };

        if self.security_mode == BrEdrSecurityMode::SecureConnectionsOnly {
            self.fail(Error::AuthenticationFailure);

            return;
        }

        let peer_id = self.peer_id;

        self.cache.store_bond(peer_id, |bond| bond.bredr_link_key = Some(key));

        self.transition(Phase::WaitEncryption { link_key: key });
    }
}

/// The security level a link key provides once the link is encrypted
pub(crate) fn security_level_of(key: &LinkKey) -> SecurityLevel {
    if key.is_authenticated_secure_connections() {
        SecurityLevel::AuthenticatedSecureConnections
    } else if key.key_type.is_authenticated() {
        SecurityLevel::Authenticated
    } else {
        SecurityLevel::Encrypted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_levels() {
        let combination = LinkKey {
            value: [0; 16],
            key_type: LinkKeyType::Combination,
        };

        let p192 = LinkKey {
            value: [0; 16],
            key_type: LinkKeyType::AuthenticatedCombinationP192,
        };

        let p256 = LinkKey {
            value: [0; 16],
            key_type: LinkKeyType::AuthenticatedCombinationP256,
        };

        assert_eq!(SecurityLevel::Encrypted, security_level_of(&combination));
        assert_eq!(SecurityLevel::Authenticated, security_level_of(&p192));
        assert_eq!(
            SecurityLevel::AuthenticatedSecureConnections,
            security_level_of(&p256)
        );
    }
}
